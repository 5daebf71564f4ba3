//! In-memory implementations of every collaborator trait.
//!
//! Used by the engine's tests and by embedded deployments that do not run
//! PostgreSQL or Redis. Each store supports failure injection so callers can
//! exercise degraded and partial-failure paths.

mod cache;
mod graph;
mod repos;
mod vectors;

use std::collections::HashSet;
use std::sync::Mutex;

use concord_core::{Error, Result};

pub use cache::MemoryCache;
pub use graph::MemoryGraphStore;
pub use repos::{MemoryDeferredRepository, MemoryMergeAuditRepository, MemoryProposalRepository};
pub use vectors::InMemoryVectorIndex;

/// Named operations that should fail on their next calls.
#[derive(Debug, Default)]
pub(crate) struct FailureSwitch {
    ops: Mutex<HashSet<String>>,
    unavailable: Mutex<bool>,
}

impl FailureSwitch {
    pub(crate) fn fail_on(&self, op: &str) {
        if let Ok(mut ops) = self.ops.lock() {
            ops.insert(op.to_string());
        }
    }

    pub(crate) fn clear(&self) {
        if let Ok(mut ops) = self.ops.lock() {
            ops.clear();
        }
        if let Ok(mut flag) = self.unavailable.lock() {
            *flag = false;
        }
    }

    pub(crate) fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut flag) = self.unavailable.lock() {
            *flag = unavailable;
        }
    }

    /// Err when the store is marked unavailable or `op` is set to fail.
    pub(crate) fn check(&self, op: &str, error: impl FnOnce(String) -> Error) -> Result<()> {
        if self.unavailable.lock().map(|f| *f).unwrap_or(false) {
            return Err(Error::Unavailable(format!("store unavailable during {}", op)));
        }
        let failing = self
            .ops
            .lock()
            .map(|ops| ops.contains(op))
            .unwrap_or(false);
        if failing {
            return Err(error(format!("injected failure in {}", op)));
        }
        Ok(())
    }
}
