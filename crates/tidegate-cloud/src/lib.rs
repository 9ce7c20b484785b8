//! tidegate-cloud — safe removal of cloud compute nodes during scale-in.
//!
//! # Termination protocol
//!
//! ```text
//! Issued ──► Polling ──┬──► Terminated    (status == "terminated", counter +1)
//!              ▲   │   ├──► TimedOut      (deadline passed, default 3m)
//!              └───┘   ├──► ConfirmError  (status query failed)
//!          every 10s   └──► Cancelled     (shutdown signalled)
//! ```
//!
//! The terminate request is never retried; a failed confirmation is
//! reported to the caller, which feeds it into the failsafe failure count.
//!
//! The provider itself is behind the `ComputeApi` trait, constructed per
//! region with its own credentials and shared by reference.

pub mod error;
pub mod lifecycle;
pub mod provider;

pub use error::{LifecycleError, LifecycleResult};
pub use lifecycle::{NodeLifecycle, TerminationPolicy};
pub use provider::{ComputeApi, Instance, InstanceStatus, Reservation};
