//! Per-concept merge locks.
//!
//! Merges and rollbacks take a lock on every concept id they touch. Ids are
//! always locked in sorted order, so two operations over overlapping ids
//! cannot deadlock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

/// Registry of per-id async locks.
#[derive(Default)]
pub struct MergeLocks {
    locks: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

/// Held locks; released on drop.
pub struct MergeGuard {
    ids: Vec<Uuid>,
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl MergeGuard {
    pub fn ids(&self) -> &[Uuid] {
        &self.ids
    }
}

impl MergeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock every id in `ids` (duplicates collapse), waiting as needed.
    pub async fn acquire(&self, ids: &[Uuid]) -> MergeGuard {
        let mut sorted = ids.to_vec();
        sorted.sort();
        sorted.dedup();

        let handles: Vec<Arc<AsyncMutex<()>>> = {
            let mut locks = match self.locks.lock() {
                Ok(l) => l,
                Err(poisoned) => poisoned.into_inner(),
            };
            // Drop idle entries so the map does not grow with the corpus.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            sorted
                .iter()
                .map(|id| locks.entry(*id).or_default().clone())
                .collect()
        };

        let mut guards = Vec::with_capacity(handles.len());
        for handle in handles {
            guards.push(handle.lock_owned().await);
        }
        MergeGuard {
            ids: sorted,
            _guards: guards,
        }
    }

    /// Number of ids currently tracked.
    pub fn tracked(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }
}
