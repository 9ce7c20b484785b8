//! Lifecycle error types.

use std::time::Duration;

use thiserror::Error;

/// Errors from resolving or terminating a cloud node.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("unable to resolve node ip {ip} to an instance id: {source}")]
    Lookup {
        ip: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("found no reservations for ip: {ip}")]
    NoReservations { ip: String },

    #[error("found no instances under reservation for ip: {ip}")]
    NoInstances { ip: String },

    #[error("failed to terminate instance {instance_id}: {source}")]
    Terminate {
        instance_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to describe status of instance {instance_id}: {source}")]
    StatusQuery {
        instance_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("timeout reached after {timeout:?} while confirming the termination of instance {instance_id}")]
    Timeout {
        instance_id: String,
        timeout: Duration,
    },

    #[error("confirmation of instance {instance_id} termination cancelled")]
    Cancelled { instance_id: String },
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;
