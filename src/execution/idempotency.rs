//! Idempotency store for order placement.
//!
//! Maps idempotency keys to their first result so a retry returns the
//! original outcome instead of placing a second order. Entries expire after
//! a TTL; the optional persisted mirror for crash recovery lives behind the
//! repository boundary and is out of scope here.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::domain::{ExecutionResult, IdempotencyKey};

pub struct IdempotencyStore {
    entries: DashMap<IdempotencyKey, (ExecutionResult, Instant)>,
    ttl: Duration,
}

impl IdempotencyStore {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Default 10-minute TTL.
    #[must_use]
    pub fn with_default_ttl() -> Self {
        Self::new(Duration::from_secs(600))
    }

    /// The stored result for a key, if it has not expired.
    #[must_use]
    pub fn get(&self, key: &IdempotencyKey) -> Option<ExecutionResult> {
        let entry = self.entries.get(key)?;
        let (result, stored_at) = entry.value();
        if stored_at.elapsed() >= self.ttl {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(result.clone())
    }

    /// Store the first result for a key. Later stores for the same key are
    /// ignored so every caller observes the original outcome.
    pub fn put(&self, key: IdempotencyKey, result: ExecutionResult) {
        self.entries
            .entry(key)
            .or_insert_with(|| (result, Instant::now()));
        self.purge_expired();
    }

    fn purge_expired(&self) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, (_, stored_at)| stored_at.elapsed() < ttl);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
