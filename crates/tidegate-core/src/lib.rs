//! tidegate-core — shared types for the Tidegate scaling control loop.
//!
//! Holds the persisted `ScalingState` record, the `WorkerPool` descriptor,
//! the `FailureMessage` alert payload, and the `Notifier` seam used to hand
//! alerts to an external transport. Configuration is parsed from TOML.

pub mod config;
pub mod notify;
pub mod types;

pub use config::{ConfigError, TidegateConfig};
pub use notify::{ChannelNotifier, LogNotifier, Notifier};
pub use types::*;
