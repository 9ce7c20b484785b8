//! StateStoreClient — typed reads and writes of `ScalingState` records.
//!
//! Reads fail open so a scaling cycle can always make progress; writes fail
//! loud so a lost failure-count update never goes unnoticed.

use std::sync::Arc;

use tracing::{debug, error};

use tidegate_core::{ScalingState, epoch_secs};

use crate::error::{StateError, StateResult};
use crate::kv::KvBackend;

/// Outcome of `read_state`, surfaced so callers can tell a healthy record
/// from a best-effort default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// A record was found and decoded into the state.
    Loaded { version: u64 },
    /// No record exists and none was written.
    Missing,
    /// No record existed; the caller's state was written as the initial one.
    Initialized,
    /// The store could not be reached. State left unmodified.
    Unavailable,
    /// A record exists but could not be decoded. State left unmodified.
    Corrupt,
}

impl ReadStatus {
    /// True when the state passed in is not backed by a readable record.
    pub fn is_stale(&self) -> bool {
        matches!(self, ReadStatus::Unavailable | ReadStatus::Corrupt)
    }

    /// Version token to hand to `persist_state_if`, if known.
    ///
    /// `None` for `Missing` means "expect the key to be absent".
    pub fn version(&self) -> Option<u64> {
        match self {
            ReadStatus::Loaded { version } => Some(*version),
            _ => None,
        }
    }
}

/// Client for scaling state persisted in the coordination store.
#[derive(Clone)]
pub struct StateStoreClient {
    backend: Arc<dyn KvBackend>,
}

impl StateStoreClient {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    /// Populate `state` in place from the record at `state.state_path`.
    ///
    /// Never fails: a store error or an undecodable record leaves `state`
    /// untouched. When the key is absent and `initialize_if_missing` is
    /// set, the current `state` is written as the initial record.
    pub async fn read_state(
        &self,
        state: &mut ScalingState,
        initialize_if_missing: bool,
    ) -> ReadStatus {
        debug!(state_path = %state.state_path, "reading scaling state");

        let entry = match self.backend.get(&state.state_path).await {
            Ok(entry) => entry,
            Err(e) => {
                error!(
                    state_path = %state.state_path,
                    error = %e,
                    "failed to read scaling state, continuing with current state"
                );
                return ReadStatus::Unavailable;
            }
        };

        let Some(entry) = entry else {
            debug!(state_path = %state.state_path, "no scaling state present");
            if !initialize_if_missing {
                return ReadStatus::Missing;
            }

            debug!(state_path = %state.state_path, "writing initial scaling state");
            // Create-only, so a record written concurrently by another
            // process is not clobbered by our zero value.
            return match self.persist_state_if(state, None).await {
                Ok(()) => ReadStatus::Initialized,
                Err(e) => {
                    error!(
                        state_path = %state.state_path,
                        error = %e,
                        "failed to write initial scaling state"
                    );
                    ReadStatus::Missing
                }
            };
        };

        match serde_json::from_slice::<ScalingState>(&entry.value) {
            Ok(decoded) => {
                *state = decoded;
                debug!(
                    state_path = %state.state_path,
                    last_updated = state.last_updated,
                    version = entry.modify_index,
                    "loaded scaling state"
                );
                ReadStatus::Loaded {
                    version: entry.modify_index,
                }
            }
            Err(e) => {
                error!(
                    state_path = %state.state_path,
                    error = %e,
                    "failed to decode scaling state, continuing with current state"
                );
                ReadStatus::Corrupt
            }
        }
    }

    /// Stamp `last_updated` and overwrite the record at `state.state_path`.
    ///
    /// Last writer wins. Not retried.
    pub async fn persist_state(&self, state: &mut ScalingState) -> StateResult<()> {
        let value = stamp_and_encode(state)?;
        self.backend.put(&state.state_path, value).await?;
        debug!(state_path = %state.state_path, "scaling state stored");
        Ok(())
    }

    /// Like `persist_state`, but only applies if the record's version still
    /// equals `expected` (`None` = the key must not exist yet).
    ///
    /// A rejected write is `StateError::VersionConflict`; re-read and retry.
    pub async fn persist_state_if(
        &self,
        state: &mut ScalingState,
        expected: Option<u64>,
    ) -> StateResult<()> {
        let value = stamp_and_encode(state)?;
        let applied = self
            .backend
            .put_cas(&state.state_path, value, expected.unwrap_or(0))
            .await?;
        if !applied {
            return Err(StateError::VersionConflict {
                key: state.state_path.clone(),
                expected,
            });
        }
        debug!(state_path = %state.state_path, ?expected, "scaling state stored conditionally");
        Ok(())
    }
}

fn stamp_and_encode(state: &mut ScalingState) -> StateResult<Vec<u8>> {
    state.last_updated = epoch_secs();
    serde_json::to_vec(state).map_err(|e| StateError::Serialize(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use tidegate_core::ResourceType;

    const ROOT: &str = "tidegate/config";

    fn client() -> (StateStoreClient, MemoryKv) {
        let kv = MemoryKv::new();
        (StateStoreClient::new(Arc::new(kv.clone())), kv)
    }

    fn pool_state(name: &str) -> ScalingState {
        ScalingState::new(ROOT, ResourceType::Cluster, name)
    }

    #[tokio::test]
    async fn persist_then_read_round_trips() {
        let (store, _) = client();

        let mut expected = pool_state("example-pool");
        expected.failure_count = 2;
        expected.failsafe_mode = true;

        let before = epoch_secs();
        store.persist_state(&mut expected).await.unwrap();

        let mut returned = ScalingState {
            state_path: expected.state_path.clone(),
            ..Default::default()
        };
        let status = store.read_state(&mut returned, true).await;

        assert!(matches!(status, ReadStatus::Loaded { .. }));
        assert!(returned.last_updated >= before);
        assert_eq!(returned, expected);
    }

    #[tokio::test]
    async fn missing_key_without_init_leaves_state_untouched() {
        let (store, kv) = client();

        let mut state = pool_state("nothing-here");
        state.failure_count = 7;
        let original = state.clone();

        let status = store.read_state(&mut state, false).await;
        assert_eq!(status, ReadStatus::Missing);
        assert_eq!(state, original);
        assert!(kv.get(&state.state_path).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_key_with_init_writes_initial_record() {
        let (store, _) = client();

        let mut state = pool_state("fresh-pool");
        state.failure_count = 1;
        let status = store.read_state(&mut state, true).await;
        assert_eq!(status, ReadStatus::Initialized);

        let mut reread = pool_state("fresh-pool");
        let status = store.read_state(&mut reread, false).await;
        assert!(matches!(status, ReadStatus::Loaded { .. }));
        assert_eq!(reread, state);
    }

    #[tokio::test]
    async fn unavailable_store_fails_open() {
        let (store, kv) = client();
        kv.set_unavailable(true);

        let mut state = pool_state("pool");
        let original = state.clone();
        let status = store.read_state(&mut state, true).await;

        assert_eq!(status, ReadStatus::Unavailable);
        assert!(status.is_stale());
        assert_eq!(state, original);
    }

    #[tokio::test]
    async fn corrupt_record_fails_open() {
        let (store, kv) = client();
        let mut state = pool_state("pool");
        kv.put(&state.state_path, b"not json".to_vec()).await.unwrap();

        let original = state.clone();
        let status = store.read_state(&mut state, true).await;

        assert_eq!(status, ReadStatus::Corrupt);
        assert_eq!(state, original);
    }

    #[tokio::test]
    async fn persist_fails_loud() {
        let (store, kv) = client();
        kv.set_unavailable(true);

        let mut state = pool_state("pool");
        let err = store.persist_state(&mut state).await.unwrap_err();
        assert!(matches!(err, StateError::Request(_)));
    }

    #[tokio::test]
    async fn persist_overwrites_unconditionally() {
        let (store, _) = client();

        let mut first = pool_state("pool");
        first.failure_count = 5;
        store.persist_state(&mut first).await.unwrap();

        let mut second = pool_state("pool");
        store.persist_state(&mut second).await.unwrap();

        let mut reread = pool_state("pool");
        store.read_state(&mut reread, false).await;
        assert_eq!(reread.failure_count, 0);
    }

    #[tokio::test]
    async fn conditional_persist_detects_concurrent_writer() {
        let (store, _) = client();

        let mut mine = pool_state("pool");
        store.persist_state(&mut mine).await.unwrap();
        let version = store.read_state(&mut mine, false).await.version();
        assert!(version.is_some());

        // Another process updates the record after our read.
        let mut theirs = pool_state("pool");
        theirs.failure_count = 3;
        store.persist_state(&mut theirs).await.unwrap();

        mine.failure_count += 1;
        let err = store.persist_state_if(&mut mine, version).await.unwrap_err();
        assert!(err.is_conflict());

        // Re-read, re-decide, re-write.
        let version = store.read_state(&mut mine, false).await.version();
        assert_eq!(mine.failure_count, 3);
        mine.failure_count += 1;
        store.persist_state_if(&mut mine, version).await.unwrap();

        let mut reread = pool_state("pool");
        store.read_state(&mut reread, false).await;
        assert_eq!(reread.failure_count, 4);
    }

    #[tokio::test]
    async fn conditional_create_rejects_existing_key() {
        let (store, _) = client();
        let mut state = pool_state("pool");
        store.persist_state(&mut state).await.unwrap();

        let err = store.persist_state_if(&mut state, None).await.unwrap_err();
        assert!(matches!(
            err,
            StateError::VersionConflict { expected: None, .. }
        ));
    }
}
