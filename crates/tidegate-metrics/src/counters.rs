//! Counter registry — monotonically increasing counters keyed by a label path.
//!
//! Increments on an existing counter only take the read lock; the write
//! lock is taken once per new path.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::trace;

/// Shared set of named counters. Cheap to clone.
#[derive(Clone, Default)]
pub struct CounterRegistry {
    counters: Arc<RwLock<BTreeMap<Vec<String>, AtomicU64>>>,
}

impl CounterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `n` to the counter at `path`, creating it at zero if absent.
    pub fn incr_counter(&self, path: &[&str], n: u64) {
        let key: Vec<String> = path.iter().map(|s| s.to_string()).collect();

        {
            let counters = self.counters.read().unwrap_or_else(|p| p.into_inner());
            if let Some(c) = counters.get(&key) {
                c.fetch_add(n, Ordering::Relaxed);
                trace!(counter = %key.join("."), n, "counter incremented");
                return;
            }
        }

        let mut counters = self.counters.write().unwrap_or_else(|p| p.into_inner());
        counters
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(n, Ordering::Relaxed);
    }

    /// Current value of the counter at `path` (zero if never incremented).
    pub fn get(&self, path: &[&str]) -> u64 {
        let key: Vec<String> = path.iter().map(|s| s.to_string()).collect();
        self.counters
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}
