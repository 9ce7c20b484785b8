//! tidegate-state — typed access to persisted scaling state.
//!
//! Every read and write of a `ScalingState` record goes through
//! `StateStoreClient`. The client is backend-agnostic: production uses the
//! Consul key/value HTTP API (`ConsulKv`), tests use `MemoryKv`.
//!
//! # Policy
//!
//! ```text
//! read_state     fail-open: errors are logged, the caller's state is left as-is
//! persist_state  fail-loud: errors are returned, never retried
//! persist_state_if  conditional write on the store's modify index
//! ```
//!
//! Values are JSON-encoded `ScalingState` records.

pub mod consul;
pub mod error;
pub mod kv;
pub mod store;

pub use consul::ConsulKv;
pub use error::{StateError, StateResult};
pub use kv::{KvBackend, KvEntry, MemoryKv};
pub use store::{ReadStatus, StateStoreClient};
