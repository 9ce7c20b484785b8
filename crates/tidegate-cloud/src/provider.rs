//! Compute provider seam.
//!
//! Implementations own their region, credentials, and request signing.
//! Construct one per region and share it by reference.

use async_trait::async_trait;

/// A group of instances launched together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub reservation_id: String,
    pub instances: Vec<Instance>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub instance_id: String,
    pub private_ip: Option<String>,
}

/// Lifecycle state of one instance as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceStatus {
    pub instance_id: String,
    /// Provider state name: "pending", "running", "shutting-down", "terminated", ...
    pub state: String,
}

impl InstanceStatus {
    pub fn is_terminated(&self) -> bool {
        self.state == "terminated"
    }
}

#[async_trait]
pub trait ComputeApi: Send + Sync {
    /// Provider tag used in metric labels, e.g. "aws".
    fn provider(&self) -> &str;

    fn region(&self) -> &str;

    /// Instances whose private address is `ip`.
    async fn describe_instances_by_private_ip(&self, ip: &str) -> anyhow::Result<Vec<Reservation>>;

    /// Request termination of exactly these instances.
    async fn terminate_instances(&self, instance_ids: &[String]) -> anyhow::Result<()>;

    /// Current status of an instance, including non-running ones.
    async fn describe_instance_status(&self, instance_id: &str) -> anyhow::Result<Vec<InstanceStatus>>;
}
