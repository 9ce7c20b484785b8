//! Failsafe circuit breaker over a resource's `ScalingState`.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use tidegate_core::{FailureMessage, Notifier, ScalingState};
use tidegate_state::StateStoreClient;

/// What the gate decides for a state, before any side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Scaling may proceed.
    Permit,
    /// Failure count reached the threshold; the breaker must trip now.
    Trip,
    /// The breaker is already tripped.
    Blocked,
}

impl GateDecision {
    /// Pure evaluation of the gate. The threshold is inclusive.
    pub fn evaluate(state: &ScalingState, threshold: u32) -> Self {
        if state.failsafe_mode {
            GateDecision::Blocked
        } else if state.failure_count >= threshold {
            GateDecision::Trip
        } else {
            GateDecision::Permit
        }
    }
}

/// The breaker, bound to the store and notifier it reports through.
#[derive(Clone)]
pub struct Failsafe {
    store: StateStoreClient,
    notifier: Arc<dyn Notifier>,
}

impl Failsafe {
    pub fn new(store: StateStoreClient, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    /// Gate check; must run before every automated scaling attempt.
    ///
    /// Returns `true` when scaling is permitted. On a trip the state is
    /// flipped to failsafe, persisted, and `msg` is dispatched. Store errors
    /// are logged; the in-memory decision stands.
    pub async fn check(
        &self,
        state: &mut ScalingState,
        threshold: u32,
        msg: &FailureMessage,
    ) -> bool {
        match GateDecision::evaluate(state, threshold) {
            GateDecision::Permit => true,
            GateDecision::Blocked => {
                debug!(
                    state_path = %state.state_path,
                    "failsafe mode enabled, skipping scaling"
                );
                false
            }
            GateDecision::Trip => {
                state.failsafe_mode = true;
                warn!(
                    state_path = %state.state_path,
                    failure_count = state.failure_count,
                    threshold,
                    "failure threshold reached, enabling failsafe mode"
                );
                self.persist_and_notify(state, msg).await;
                false
            }
        }
    }

    /// Administrative override of the breaker.
    ///
    /// Disabling also clears the failure count. Always persists and notifies;
    /// store errors are logged, not raised.
    pub async fn set_mode(&self, state: &mut ScalingState, enabled: bool, msg: &FailureMessage) {
        state.failsafe_mode = enabled;
        if !enabled {
            state.failure_count = 0;
        }

        info!(
            state_path = %state.state_path,
            enabled,
            failure_count = state.failure_count,
            "failsafe mode set administratively"
        );
        self.persist_and_notify(state, msg).await;
    }

    async fn persist_and_notify(&self, state: &mut ScalingState, msg: &FailureMessage) {
        if let Err(e) = self.store.persist_state(state).await {
            error!(
                state_path = %state.state_path,
                error = %e,
                "failed to persist failsafe state"
            );
        }
        self.notifier.notify(msg);
    }
}
