//! Domain types shared by every Tidegate component.
//!
//! `ScalingState` is the one record persisted to the coordination store.
//! Everything else here is either configuration-owned (`WorkerPool`) or
//! ephemeral (`FailureMessage`).

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

// ── Resource kinds ────────────────────────────────────────────────

/// The kind of scalable resource a `ScalingState` tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    /// A pool of cluster worker nodes.
    #[default]
    Cluster,
    /// A scheduled job group.
    Job,
}

impl ResourceType {
    /// Path segment used under `<root>/state/` for this kind.
    pub fn path_segment(&self) -> &'static str {
        match self {
            ResourceType::Cluster => "nodes",
            ResourceType::Job => "jobs",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Cluster => "cluster",
            ResourceType::Job => "job",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the coordination-store key for a resource's scaling state.
///
/// Layout: `<key_root>/state/<kind segment>/<name>`.
pub fn state_path(key_root: &str, resource_type: ResourceType, name: &str) -> String {
    format!(
        "{}/state/{}/{}",
        key_root.trim_end_matches('/'),
        resource_type.path_segment(),
        name
    )
}

// ── Scaling state ─────────────────────────────────────────────────

/// Durable scaling health of one resource.
///
/// Created zero-valued at the start of a cycle, populated from the store,
/// mutated in place by the failsafe breaker, and only ever persisted by an
/// explicit store write. `last_updated` is stamped by the write path.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingState {
    pub resource_type: ResourceType,
    pub resource_name: String,
    /// Store key this record lives under. Derived by the caller.
    pub state_path: String,
    /// Consecutive unresolved scaling failures.
    pub failure_count: u32,
    /// When set, automated scaling is suspended for this resource.
    pub failsafe_mode: bool,
    /// Unix timestamp (seconds) of the last successful persist.
    pub last_updated: u64,
}

impl ScalingState {
    /// A zero-valued state for the given resource with its key pre-set.
    pub fn new(
        key_root: &str,
        resource_type: ResourceType,
        resource_name: impl Into<String>,
    ) -> Self {
        let resource_name = resource_name.into();
        Self {
            state_path: state_path(key_root, resource_type, &resource_name),
            resource_type,
            resource_name,
            ..Default::default()
        }
    }

    /// Zero-valued state for a worker pool.
    pub fn for_pool(key_root: &str, pool: &WorkerPool) -> Self {
        Self::new(key_root, ResourceType::Cluster, pool.name.clone())
    }
}

// ── Worker pool ───────────────────────────────────────────────────

/// Static descriptor of a scalable group of cluster nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPool {
    pub name: String,
    /// Consecutive failures tolerated before the breaker trips (inclusive).
    pub retry_threshold: u32,
    /// Provider region the pool's instances live in.
    pub region: String,
    /// Provider tag, used in metric labels (e.g. "aws").
    pub provider: String,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, retry_threshold: u32) -> Self {
        Self {
            name: name.into(),
            retry_threshold,
            region: "us-east-1".to_string(),
            provider: "aws".to_string(),
        }
    }
}

// ── Alerts ────────────────────────────────────────────────────────

/// Payload handed to the notification transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureMessage {
    /// Correlation id used to deduplicate alerts about one incident.
    pub alert_uid: String,
    pub resource_id: String,
    pub resource_type: ResourceType,
}

impl FailureMessage {
    pub fn new(
        alert_uid: impl Into<String>,
        resource_id: impl Into<String>,
        resource_type: ResourceType,
    ) -> Self {
        Self {
            alert_uid: alert_uid.into(),
            resource_id: resource_id.into(),
            resource_type,
        }
    }

    /// Alert keyed on the state path, so repeated alerts for the same
    /// resource share a uid.
    pub fn for_state(state: &ScalingState) -> Self {
        Self::new(
            state.state_path.clone(),
            state.resource_name.clone(),
            state.resource_type,
        )
    }
}

/// Current unix time in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
