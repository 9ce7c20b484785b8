//! Key/value backend seam.
//!
//! A backend stores opaque byte values under string keys and exposes a
//! monotonically increasing modify index per key, which the conditional
//! write path uses as its version token.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{StateError, StateResult};

/// A value read from the store together with its version token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub value: Vec<u8>,
    /// Store index at which this key was last modified.
    pub modify_index: u64,
}

#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Fetch a key. `Ok(None)` means the key is absent.
    async fn get(&self, key: &str) -> StateResult<Option<KvEntry>>;

    /// Unconditionally overwrite a key.
    async fn put(&self, key: &str, value: Vec<u8>) -> StateResult<()>;

    /// Write only if the key's modify index still equals `index`
    /// (`0` = only if absent). Returns whether the write was applied.
    async fn put_cas(&self, key: &str, value: Vec<u8>, index: u64) -> StateResult<bool>;
}

/// In-process backend with Consul-like index semantics.
#[derive(Clone, Default)]
pub struct MemoryKv {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    entries: Mutex<HashMap<String, KvEntry>>,
    last_index: Mutex<u64>,
    unavailable: AtomicBool,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a store outage: every call fails with a request error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> StateResult<()> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(StateError::Request("store unavailable".to_string()));
        }
        Ok(())
    }

    fn next_index(&self) -> u64 {
        let mut last = self
            .inner
            .last_index
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *last += 1;
        *last
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, KvEntry>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl KvBackend for MemoryKv {
    async fn get(&self, key: &str) -> StateResult<Option<KvEntry>> {
        self.check_available()?;
        Ok(self.entries().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> StateResult<()> {
        self.check_available()?;
        let modify_index = self.next_index();
        self.entries()
            .insert(key.to_string(), KvEntry { value, modify_index });
        Ok(())
    }

    async fn put_cas(&self, key: &str, value: Vec<u8>, index: u64) -> StateResult<bool> {
        self.check_available()?;
        let mut entries = self.entries();
        let current = entries.get(key).map(|e| e.modify_index).unwrap_or(0);
        if current != index {
            return Ok(false);
        }
        let modify_index = self.next_index();
        entries.insert(key.to_string(), KvEntry { value, modify_index });
        Ok(true)
    }
}
