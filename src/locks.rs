//! Per-key advisory locks.
//!
//! Appending a merge and validating an undo both read the merge chain of a
//! target page and then act on it. Both run while holding the lock for
//! `(organization, target page)` so a second merge on the same page cannot
//! slip in between the read and the write.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockKey = (String, String);

/// Map of lazily created async mutexes keyed by `(org, page)`.
#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<LockKey, Arc<AsyncMutex<()>>>>,
}

/// Holds one or more page locks until dropped.
pub struct PageGuard {
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, org: &str, page: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        // Drop entries nobody else holds a handle to.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry((org.to_string(), page.to_string()))
            .or_default()
            .clone()
    }

    /// Lock a single page.
    pub async fn lock(&self, org: &str, page: &str) -> PageGuard {
        let guard = self.handle(org, page).lock_owned().await;
        PageGuard {
            _guards: vec![guard],
        }
    }

    /// Lock several pages, always in sorted order so two callers locking
    /// overlapping sets cannot deadlock.
    pub async fn lock_many(&self, org: &str, pages: &[&str]) -> PageGuard {
        let mut sorted: Vec<&str> = pages.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let mut guards = Vec::with_capacity(sorted.len());
        for page in sorted {
            guards.push(self.handle(org, page).lock_owned().await);
        }
        PageGuard { _guards: guards }
    }

    /// Number of live lock entries.
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
