//! ScalingController — drives scaling cycles for every configured pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use tidegate_cloud::{ComputeApi, LifecycleError, NodeLifecycle, TerminationPolicy};
use tidegate_core::{ConfigError, FailureMessage, ScalingState, TidegateConfig, WorkerPool};
use tidegate_metrics::CounterRegistry;
use tidegate_failsafe::Failsafe;
use tidegate_state::{ReadStatus, StateStoreClient};

/// What the planner wants done to a pool this cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleDecision {
    NoChange,
    /// Add this many nodes.
    ScaleOut(u32),
    /// Remove the nodes at these private IPs.
    ScaleIn(Vec<String>),
}

/// Decides and performs capacity changes the controller doesn't own.
#[async_trait]
pub trait ScalingPlanner: Send + Sync {
    async fn plan(&self, pool: &WorkerPool) -> anyhow::Result<ScaleDecision>;

    async fn scale_out(&self, pool: &WorkerPool, count: u32) -> anyhow::Result<()>;
}

/// Result of one pool's cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// State could not be read and stale reads pause the pool.
    Skipped,
    /// The failsafe breaker is (or just became) tripped.
    Blocked,
    /// The planner failed; nothing was attempted.
    PlanningFailed,
    NoChange,
    Scaled,
    /// A scaling action failed; `failure_count` is the in-memory count after
    /// recording it.
    Failed { failure_count: u32 },
    /// Shutdown arrived while confirming a termination.
    Cancelled,
}

/// Bounded re-read/re-write attempts when a conditional write conflicts.
const MAX_CONFLICT_RETRIES: u32 = 3;

const DEFAULT_SCALING_INTERVAL: Duration = Duration::from_secs(10);

pub struct ScalingController {
    pools: Vec<WorkerPool>,
    key_root: String,
    store: StateStoreClient,
    failsafe: Failsafe,
    planner: Arc<dyn ScalingPlanner>,
    /// Node lifecycle managers by region.
    lifecycles: HashMap<String, NodeLifecycle>,
    /// Applied to lifecycles built by `with_compute`.
    termination: TerminationPolicy,
    interval: Duration,
    pause_on_stale_state: bool,
}

impl ScalingController {
    pub fn new(
        pools: Vec<WorkerPool>,
        key_root: impl Into<String>,
        store: StateStoreClient,
        failsafe: Failsafe,
        planner: Arc<dyn ScalingPlanner>,
    ) -> Self {
        Self {
            pools,
            key_root: key_root.into(),
            store,
            failsafe,
            planner,
            lifecycles: HashMap::new(),
            termination: TerminationPolicy::default(),
            interval: DEFAULT_SCALING_INTERVAL,
            pause_on_stale_state: false,
        }
    }

    /// Controller for the configured pools, cycle interval, termination
    /// timing, and stale-state policy. Providers are added with
    /// `with_compute`.
    pub fn from_config(
        config: &TidegateConfig,
        store: StateStoreClient,
        failsafe: Failsafe,
        planner: Arc<dyn ScalingPlanner>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(
            Self::new(config.pools(), &config.consul.key_root, store, failsafe, planner)
                .with_interval(config.scaling_interval()?)
                .with_termination_policy(TerminationPolicy::from_config(config)?)
                .with_pause_on_stale_state(config.pause_on_stale_state),
        )
    }

    /// Register the lifecycle manager used for pools in `region`.
    pub fn with_lifecycle(mut self, region: impl Into<String>, lifecycle: NodeLifecycle) -> Self {
        let region = region.into();
        let policy = lifecycle.policy();
        info!(
            %region,
            poll_interval = ?policy.poll_interval,
            timeout = ?policy.timeout,
            "node lifecycle registered"
        );
        self.lifecycles.insert(region, lifecycle);
        self
    }

    /// Register a provider for its region, removing nodes under the
    /// controller's termination policy.
    pub fn with_compute(self, api: Arc<dyn ComputeApi>, metrics: CounterRegistry) -> Self {
        let region = api.region().to_string();
        let lifecycle = NodeLifecycle::new(api, metrics).with_policy(self.termination);
        self.with_lifecycle(region, lifecycle)
    }

    pub fn with_termination_policy(mut self, policy: TerminationPolicy) -> Self {
        self.termination = policy;
        self
    }

    /// Time between rounds of `run`.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_pause_on_stale_state(mut self, pause: bool) -> Self {
        self.pause_on_stale_state = pause;
        self
    }

    pub fn pools(&self) -> &[WorkerPool] {
        &self.pools
    }

    /// Run one cycle for `pool`.
    pub async fn run_cycle(&self, pool: &WorkerPool) -> CycleOutcome {
        self.cycle(pool, None).await
    }

    /// Run one cycle for every pool concurrently. Outcomes are sorted by pool name.
    pub async fn run_all(self: &Arc<Self>) -> Vec<(String, CycleOutcome)> {
        self.run_all_with_shutdown(None).await
    }

    async fn run_all_with_shutdown(
        self: &Arc<Self>,
        shutdown: Option<watch::Receiver<bool>>,
    ) -> Vec<(String, CycleOutcome)> {
        let mut set = JoinSet::new();
        for pool in self.pools().to_vec() {
            let this = Arc::clone(self);
            let shutdown = shutdown.clone();
            set.spawn(async move {
                let outcome = this.cycle(&pool, shutdown).await;
                (pool.name, outcome)
            });
        }

        let mut outcomes = Vec::with_capacity(self.pools.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(error = %e, "scaling cycle task failed"),
            }
        }
        outcomes.sort_by(|a, b| a.0.cmp(&b.0));
        outcomes
    }

    /// Run a round of cycles every interval until `shutdown` flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval = ?self.interval,
            pools = self.pools().len(),
            "scaling controller started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    let outcomes = self.run_all_with_shutdown(Some(shutdown.clone())).await;
                    debug!(?outcomes, "scaling cycle complete");
                }
                _ = shutdown.changed() => {
                    info!("scaling controller shutting down");
                    break;
                }
            }
        }
    }

    async fn cycle(
        &self,
        pool: &WorkerPool,
        shutdown: Option<watch::Receiver<bool>>,
    ) -> CycleOutcome {
        let mut state = ScalingState::for_pool(&self.key_root, pool);
        let status = self.store.read_state(&mut state, true).await;

        if status.is_stale() && self.pause_on_stale_state {
            warn!(pool = %pool.name, ?status, "scaling state unavailable, pausing pool this cycle");
            return CycleOutcome::Skipped;
        }

        let msg = FailureMessage::for_state(&state);
        if !self
            .failsafe
            .check(&mut state, pool.retry_threshold, &msg)
            .await
        {
            return CycleOutcome::Blocked;
        }

        let decision = match self.planner.plan(pool).await {
            Ok(decision) => decision,
            Err(e) => {
                error!(pool = %pool.name, error = %e, "scaling plan failed");
                return CycleOutcome::PlanningFailed;
            }
        };

        let result = match decision {
            ScaleDecision::NoChange => {
                debug!(pool = %pool.name, "no scaling required");
                return CycleOutcome::NoChange;
            }
            ScaleDecision::ScaleOut(count) => {
                info!(pool = %pool.name, count, "scaling out");
                self.planner.scale_out(pool, count).await
            }
            ScaleDecision::ScaleIn(ips) => {
                info!(pool = %pool.name, nodes = ips.len(), "scaling in");
                match self.scale_in(pool, &ips, shutdown).await {
                    Err(ScaleInError::Cancelled) => return CycleOutcome::Cancelled,
                    other => other.map_err(anyhow::Error::from),
                }
            }
        };

        match result {
            Ok(()) => {
                if state.failure_count > 0 {
                    self.update_state(&mut state, status, |s| s.failure_count = 0)
                        .await;
                }
                CycleOutcome::Scaled
            }
            Err(e) => {
                error!(pool = %pool.name, error = %e, "scaling action failed");
                self.update_state(&mut state, status, |s| {
                    s.failure_count = s.failure_count.saturating_add(1)
                })
                .await;
                CycleOutcome::Failed {
                    failure_count: state.failure_count,
                }
            }
        }
    }

    /// Remove nodes one at a time, stopping at the first failure.
    async fn scale_in(
        &self,
        pool: &WorkerPool,
        ips: &[String],
        shutdown: Option<watch::Receiver<bool>>,
    ) -> Result<(), ScaleInError> {
        let lifecycle = self
            .lifecycles
            .get(&pool.region)
            .ok_or_else(|| ScaleInError::NoProvider(pool.region.clone()))?;

        for ip in ips {
            let instance_id = lifecycle.resolve_instance(ip).await?;
            let confirmed = match &shutdown {
                Some(rx) => {
                    lifecycle
                        .terminate_and_confirm_with_shutdown(&instance_id, rx.clone())
                        .await
                }
                None => lifecycle.terminate_and_confirm(&instance_id).await,
            };
            match confirmed {
                Ok(()) => info!(pool = %pool.name, %ip, %instance_id, "node removed"),
                Err(LifecycleError::Cancelled { .. }) => return Err(ScaleInError::Cancelled),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Apply `mutate` and write conditionally against the version last read.
    ///
    /// On conflict the record is re-read and `mutate` re-applied to the fresh
    /// copy, a bounded number of times. A corrupt record is overwritten.
    /// Failures are logged; `state` always ends up holding the last attempt.
    async fn update_state<F>(&self, state: &mut ScalingState, read: ReadStatus, mutate: F)
    where
        F: Fn(&mut ScalingState) + Send + Sync,
    {
        let mut base = state.clone();
        let mut expected = match read {
            // The initial record was just written; pick up its version.
            ReadStatus::Initialized => self.store.read_state(&mut base, false).await.version(),
            other => other.version(),
        };

        for attempt in 0..=MAX_CONFLICT_RETRIES {
            let mut next = base.clone();
            mutate(&mut next);
            let result = self.store.persist_state_if(&mut next, expected).await;
            *state = next;

            match result {
                Ok(()) => {
                    debug!(
                        state_path = %state.state_path,
                        failure_count = state.failure_count,
                        "scaling state updated"
                    );
                    return;
                }
                Err(e) if e.is_conflict() && attempt < MAX_CONFLICT_RETRIES => {
                    warn!(
                        state_path = %state.state_path,
                        attempt,
                        "scaling state changed concurrently, re-reading"
                    );
                    match self.store.read_state(&mut base, false).await {
                        ReadStatus::Corrupt => {
                            if let Err(e) = self.store.persist_state(state).await {
                                error!(state_path = %state.state_path, error = %e, "failed to overwrite corrupt scaling state");
                            }
                            return;
                        }
                        ReadStatus::Unavailable => {
                            error!(state_path = %state.state_path, "scaling state unreadable, abandoning update");
                            return;
                        }
                        fresh => expected = fresh.version(),
                    }
                }
                Err(e) => {
                    error!(
                        state_path = %state.state_path,
                        error = %e,
                        "failed to persist scaling state"
                    );
                    return;
                }
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum ScaleInError {
    #[error("no compute provider registered for region {0}")]
    NoProvider(String),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("shutdown requested during scale-in")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidegate_core::ChannelNotifier;
    use tidegate_state::{KvBackend, MemoryKv};

    const ROOT: &str = "tidegate/config";

    struct StaticPlanner(ScaleDecision);

    #[async_trait]
    impl ScalingPlanner for StaticPlanner {
        async fn plan(&self, _pool: &WorkerPool) -> anyhow::Result<ScaleDecision> {
            Ok(self.0.clone())
        }

        async fn scale_out(&self, _pool: &WorkerPool, _count: u32) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn controller(kv: &MemoryKv, decision: ScaleDecision) -> (ScalingController, WorkerPool) {
        let store = StateStoreClient::new(Arc::new(kv.clone()));
        let (notifier, _alerts) = ChannelNotifier::new();
        let failsafe = Failsafe::new(store.clone(), Arc::new(notifier));
        let pool = WorkerPool::new("example-group", 3);
        let controller = ScalingController::new(
            vec![pool.clone()],
            ROOT,
            store,
            failsafe,
            Arc::new(StaticPlanner(decision)),
        );
        (controller, pool)
    }

    async fn stored(kv: &MemoryKv, pool: &WorkerPool) -> ScalingState {
        let mut state = ScalingState::for_pool(ROOT, pool);
        StateStoreClient::new(Arc::new(kv.clone()))
            .read_state(&mut state, false)
            .await;
        state
    }

    #[tokio::test]
    async fn update_after_initialization_needs_no_retry() {
        let kv = MemoryKv::new();
        let (ctl, pool) = controller(&kv, ScaleDecision::NoChange);

        let mut state = ScalingState::for_pool(ROOT, &pool);
        let status = ctl.store.read_state(&mut state, true).await;
        assert_eq!(status, ReadStatus::Initialized);

        ctl.update_state(&mut state, status, |s| s.failure_count += 1)
            .await;
        assert_eq!(state.failure_count, 1);
        assert_eq!(stored(&kv, &pool).await.failure_count, 1);
    }

    #[tokio::test]
    async fn update_reapplies_on_top_of_concurrent_write() {
        let kv = MemoryKv::new();
        let (ctl, pool) = controller(&kv, ScaleDecision::NoChange);

        let mut state = ScalingState::for_pool(ROOT, &pool);
        ctl.store.persist_state(&mut state).await.unwrap();
        let status = ctl.store.read_state(&mut state, false).await;

        let mut theirs = ScalingState::for_pool(ROOT, &pool);
        theirs.failure_count = 5;
        ctl.store.persist_state(&mut theirs).await.unwrap();

        ctl.update_state(&mut state, status, |s| s.failure_count += 1)
            .await;
        assert_eq!(state.failure_count, 6);
        assert_eq!(stored(&kv, &pool).await.failure_count, 6);
    }

    #[tokio::test]
    async fn update_overwrites_corrupt_record() {
        let kv = MemoryKv::new();
        let (ctl, pool) = controller(&kv, ScaleDecision::NoChange);

        let mut state = ScalingState::for_pool(ROOT, &pool);
        kv.put(&state.state_path, b"{garbage".to_vec()).await.unwrap();
        let status = ctl.store.read_state(&mut state, true).await;
        assert_eq!(status, ReadStatus::Corrupt);

        ctl.update_state(&mut state, status, |s| s.failure_count += 1)
            .await;
        assert_eq!(state.failure_count, 1);
        assert_eq!(stored(&kv, &pool).await.failure_count, 1);
    }

    #[tokio::test]
    async fn update_with_store_down_keeps_in_memory_count() {
        let kv = MemoryKv::new();
        let (ctl, pool) = controller(&kv, ScaleDecision::NoChange);

        let mut state = ScalingState::for_pool(ROOT, &pool);
        state.failure_count = 2;
        kv.set_unavailable(true);

        ctl.update_state(&mut state, ReadStatus::Unavailable, |s| {
            s.failure_count += 1
        })
        .await;
        assert_eq!(state.failure_count, 3);
    }

    #[tokio::test]
    async fn scale_in_without_provider_for_region_counts_as_failure() {
        let kv = MemoryKv::new();
        let (ctl, pool) = controller(&kv, ScaleDecision::ScaleIn(vec!["10.0.0.7".into()]));

        assert_eq!(
            ctl.run_cycle(&pool).await,
            CycleOutcome::Failed { failure_count: 1 }
        );
        assert_eq!(stored(&kv, &pool).await.failure_count, 1);
    }

    /// Stores a saturated failure count for the pool while planning, then
    /// asks for a scale-in no provider can serve.
    struct SaturatingPlanner(StateStoreClient);

    #[async_trait]
    impl ScalingPlanner for SaturatingPlanner {
        async fn plan(&self, pool: &WorkerPool) -> anyhow::Result<ScaleDecision> {
            let mut theirs = ScalingState::for_pool(ROOT, pool);
            theirs.failure_count = u32::MAX;
            self.0.persist_state(&mut theirs).await?;
            Ok(ScaleDecision::ScaleIn(vec!["10.0.0.7".into()]))
        }

        async fn scale_out(&self, _pool: &WorkerPool, _count: u32) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn failure_increment_saturates() {
        let kv = MemoryKv::new();
        let store = StateStoreClient::new(Arc::new(kv.clone()));
        let (notifier, _alerts) = ChannelNotifier::new();
        let pool = WorkerPool::new("example-group", 3);
        let ctl = ScalingController::new(
            vec![pool.clone()],
            ROOT,
            store.clone(),
            Failsafe::new(store.clone(), Arc::new(notifier)),
            Arc::new(SaturatingPlanner(store)),
        );

        assert_eq!(
            ctl.run_cycle(&pool).await,
            CycleOutcome::Failed {
                failure_count: u32::MAX
            }
        );
        assert_eq!(stored(&kv, &pool).await.failure_count, u32::MAX);
    }

    struct IdleCompute;

    #[async_trait]
    impl ComputeApi for IdleCompute {
        fn provider(&self) -> &str {
            "aws"
        }

        fn region(&self) -> &str {
            "us-west-2"
        }

        async fn describe_instances_by_private_ip(
            &self,
            _ip: &str,
        ) -> anyhow::Result<Vec<tidegate_cloud::Reservation>> {
            Ok(Vec::new())
        }

        async fn terminate_instances(&self, _ids: &[String]) -> anyhow::Result<()> {
            Ok(())
        }

        async fn describe_instance_status(
            &self,
            _instance_id: &str,
        ) -> anyhow::Result<Vec<tidegate_cloud::InstanceStatus>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn from_config_applies_loop_settings() {
        let config: TidegateConfig = toml::from_str(
            r#"
region = "us-west-2"
cluster_scaling_interval = "30s"
pause_on_stale_state = true

[consul]
key_root = "scaling/prod"

[termination]
poll_interval = "5s"
timeout = "1m"

[[worker_pool]]
name = "general"

[[worker_pool]]
name = "gpu"
retry_threshold = 5
region = "eu-west-1"
"#,
        )
        .unwrap();

        let kv = MemoryKv::new();
        let store = StateStoreClient::new(Arc::new(kv));
        let (notifier, _alerts) = ChannelNotifier::new();
        let failsafe = Failsafe::new(store.clone(), Arc::new(notifier));
        let ctl = ScalingController::from_config(
            &config,
            store,
            failsafe,
            Arc::new(StaticPlanner(ScaleDecision::NoChange)),
        )
        .unwrap()
        .with_compute(Arc::new(IdleCompute), CounterRegistry::new());

        assert_eq!(ctl.key_root, "scaling/prod");
        assert_eq!(ctl.interval, Duration::from_secs(30));
        assert!(ctl.pause_on_stale_state);

        let names: Vec<_> = ctl.pools().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["general", "gpu"]);
        assert_eq!(ctl.pools()[0].region, "us-west-2");
        assert_eq!(ctl.pools()[1].retry_threshold, 5);

        let policy = ctl.lifecycles["us-west-2"].policy();
        assert_eq!(policy.poll_interval, Duration::from_secs(5));
        assert_eq!(policy.timeout, Duration::from_secs(60));
    }

    #[test]
    fn from_config_rejects_bad_interval() {
        let mut config = TidegateConfig::default();
        config.cluster_scaling_interval = "every so often".to_string();

        let store = StateStoreClient::new(Arc::new(MemoryKv::new()));
        let (notifier, _alerts) = ChannelNotifier::new();
        let failsafe = Failsafe::new(store.clone(), Arc::new(notifier));
        let result = ScalingController::from_config(
            &config,
            store,
            failsafe,
            Arc::new(StaticPlanner(ScaleDecision::NoChange)),
        );
        assert!(matches!(
            result,
            Err(ConfigError::InvalidDuration {
                key: "cluster_scaling_interval",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn no_change_leaves_record_alone() {
        let kv = MemoryKv::new();
        let (ctl, pool) = controller(&kv, ScaleDecision::NoChange);

        assert_eq!(ctl.run_cycle(&pool).await, CycleOutcome::NoChange);
        let state = stored(&kv, &pool).await;
        assert_eq!(state.failure_count, 0);
        assert!(!state.failsafe_mode);
    }
}
