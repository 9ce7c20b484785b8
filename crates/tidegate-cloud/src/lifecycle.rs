//! Node lifecycle manager — resolve a node to its instance and terminate it,
//! confirming with the provider before returning.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info};

use tidegate_core::{ConfigError, TidegateConfig};
use tidegate_metrics::CounterRegistry;

use crate::error::{LifecycleError, LifecycleResult};
use crate::provider::ComputeApi;

/// Longest the confirmation loop will wait, whatever the policy says.
const MAX_CONFIRMATION_WAIT: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// Timing of the termination confirmation loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationPolicy {
    /// Time between status queries. The first query happens one interval
    /// after the terminate request.
    pub poll_interval: Duration,
    /// Overall deadline for confirmation, measured from the terminate request.
    pub timeout: Duration,
}

impl TerminationPolicy {
    pub fn new(poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            // A zero interval would spin on the provider.
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            timeout,
        }
    }

    /// Policy from the `[termination]` config table.
    pub fn from_config(config: &TidegateConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(config.poll_interval()?, config.termination_timeout()?))
    }
}

impl Default for TerminationPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_secs(3 * 60))
    }
}

/// Removes compute nodes through a `ComputeApi`.
///
/// Holds no per-call mutable state, so one instance can drive concurrent
/// terminations of different instances.
#[derive(Clone)]
pub struct NodeLifecycle {
    api: Arc<dyn ComputeApi>,
    policy: TerminationPolicy,
    metrics: CounterRegistry,
}

impl NodeLifecycle {
    pub fn new(api: Arc<dyn ComputeApi>, metrics: CounterRegistry) -> Self {
        Self {
            api,
            policy: TerminationPolicy::default(),
            metrics,
        }
    }

    pub fn with_policy(mut self, policy: TerminationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> TerminationPolicy {
        self.policy
    }

    /// Translate a node's private IP to its instance id.
    ///
    /// The first instance of the first reservation wins when the provider
    /// returns several.
    pub async fn resolve_instance(&self, ip: &str) -> LifecycleResult<String> {
        let reservations = self
            .api
            .describe_instances_by_private_ip(ip)
            .await
            .map_err(|source| LifecycleError::Lookup {
                ip: ip.to_string(),
                source,
            })?;

        let Some(reservation) = reservations.first() else {
            return Err(LifecycleError::NoReservations { ip: ip.to_string() });
        };
        let Some(instance) = reservation.instances.first() else {
            return Err(LifecycleError::NoInstances { ip: ip.to_string() });
        };

        debug!(%ip, instance_id = %instance.instance_id, region = %self.api.region(), "resolved node");
        Ok(instance.instance_id.clone())
    }

    /// Terminate an instance and wait until the provider reports it gone.
    pub async fn terminate_and_confirm(&self, instance_id: &str) -> LifecycleResult<()> {
        self.terminate(instance_id, None).await
    }

    /// As `terminate_and_confirm`, abandoning confirmation with
    /// `LifecycleError::Cancelled` once `shutdown` becomes `true`.
    pub async fn terminate_and_confirm_with_shutdown(
        &self,
        instance_id: &str,
        shutdown: watch::Receiver<bool>,
    ) -> LifecycleResult<()> {
        self.terminate(instance_id, Some(shutdown)).await
    }

    /// Resolve `ip` and terminate the instance behind it.
    pub async fn remove_node(&self, ip: &str) -> LifecycleResult<String> {
        let instance_id = self.resolve_instance(ip).await?;
        self.terminate_and_confirm(&instance_id).await?;
        Ok(instance_id)
    }

    async fn terminate(
        &self,
        instance_id: &str,
        mut shutdown: Option<watch::Receiver<bool>>,
    ) -> LifecycleResult<()> {
        info!(%instance_id, region = %self.api.region(), "terminating instance");
        self.api
            .terminate_instances(&[instance_id.to_string()])
            .await
            .map_err(|source| LifecycleError::Terminate {
                instance_id: instance_id.to_string(),
                source,
            })?;

        info!(%instance_id, "confirming termination of instance");

        let start = Instant::now();
        let timeout = self.policy.timeout.min(MAX_CONFIRMATION_WAIT);
        let poll_interval = self
            .policy
            .poll_interval
            .clamp(Duration::from_millis(1), MAX_CONFIRMATION_WAIT);
        let deadline = start + timeout;
        let mut next_poll = start + poll_interval;

        loop {
            // A poll due exactly at the deadline still runs.
            if next_poll > deadline {
                let err = tokio::select! {
                    _ = sleep_until(deadline) => {
                        error!(%instance_id, timeout = ?self.policy.timeout, "termination confirmation timed out");
                        LifecycleError::Timeout {
                            instance_id: instance_id.to_string(),
                            timeout: self.policy.timeout,
                        }
                    }
                    _ = shutdown_signalled(&mut shutdown) => cancelled(instance_id),
                };
                return Err(err);
            }

            tokio::select! {
                _ = sleep_until(next_poll) => {}
                _ = shutdown_signalled(&mut shutdown) => {
                    return Err(cancelled(instance_id));
                }
            }

            let statuses = self
                .api
                .describe_instance_status(instance_id)
                .await
                .map_err(|source| {
                    error!(%instance_id, error = %source, "failed to describe instance status");
                    LifecycleError::StatusQuery {
                        instance_id: instance_id.to_string(),
                        source,
                    }
                })?;

            match statuses.first() {
                Some(status) if status.is_terminated() => {
                    info!(%instance_id, "confirmed termination of instance");
                    self.metrics.incr_counter(
                        &["cluster", self.api.provider(), "instance_terminations"],
                        1,
                    );
                    return Ok(());
                }
                Some(status) => {
                    debug!(%instance_id, state = %status.state, "instance not yet terminated");
                }
                None => {
                    debug!(%instance_id, "instance status not yet visible");
                }
            }

            next_poll += poll_interval;
        }
    }
}

fn cancelled(instance_id: &str) -> LifecycleError {
    info!(%instance_id, "termination confirmation cancelled");
    LifecycleError::Cancelled {
        instance_id: instance_id.to_string(),
    }
}

/// Resolves once shutdown is signalled. Never resolves without a receiver
/// or after the sender is dropped.
async fn shutdown_signalled(shutdown: &mut Option<watch::Receiver<bool>>) {
    if let Some(rx) = shutdown {
        let signalled = rx.wait_for(|stop| *stop).await.is_ok();
        if signalled {
            return;
        }
    }
    std::future::pending::<()>().await
}
