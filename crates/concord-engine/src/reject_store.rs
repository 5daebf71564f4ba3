//! Negative cache of rejected pairs.
//!
//! An entry only counts while both concepts still carry the fingerprints they
//! had when the pair was rejected. A mismatch deletes the entry, so a concept
//! whose name, aliases or definition changed is scored again.

use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tracing::{debug, warn};
use uuid::Uuid;

use concord_core::{CanonicalConcept, KeyValueCache, PairId, RejectEntry};

use crate::score_cache::{cache_key, concept_pattern};

const KIND: &str = "reject";

/// Concurrent writes during bulk insertion.
const BULK_CONCURRENCY: usize = 16;

/// Build a reject entry with the current fingerprints of both concepts.
pub fn reject_entry(
    a: &CanonicalConcept,
    b: &CanonicalConcept,
    score: f32,
    reason: impl Into<String>,
) -> RejectEntry {
    let pair_id = PairId::new(a.id, b.id);
    let (low, high) = if a.id == pair_id.low() { (a, b) } else { (b, a) };
    RejectEntry {
        pair_id,
        score,
        fingerprint_a: low.fingerprint(),
        fingerprint_b: high.fingerprint(),
        reason: reason.into(),
        rejected_at: Utc::now(),
    }
}

/// Tenant-scoped reject store over a key-value cache.
#[derive(Clone)]
pub struct RejectStore {
    cache: Option<Arc<dyn KeyValueCache>>,
    tenant_id: String,
    ttl_secs: u64,
}

impl RejectStore {
    pub fn new(cache: Option<Arc<dyn KeyValueCache>>, tenant_id: impl Into<String>, ttl_secs: u64) -> Self {
        Self {
            cache,
            tenant_id: tenant_id.into(),
            ttl_secs,
        }
    }

    /// Whether the pair is rejected at these fingerprints.
    ///
    /// `fingerprint_a` belongs to `pair_id.low()`, `fingerprint_b` to
    /// `pair_id.high()`. A stale entry is deleted and reported as not
    /// rejected; a cache failure also reads as not rejected.
    pub async fn is_rejected(&self, pair_id: &PairId, fingerprint_a: &str, fingerprint_b: &str) -> bool {
        let Some(cache) = self.cache.as_ref() else {
            return false;
        };
        let key = cache_key(&self.tenant_id, KIND, pair_id);
        let raw = match cache.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return false,
            Err(e) => {
                warn!(subsystem = "cache", pair_id = %pair_id, error = %e, "Reject store read failed, treating as miss");
                return false;
            }
        };
        let fresh = match serde_json::from_str::<RejectEntry>(&raw) {
            Ok(entry) => {
                entry.pair_id == *pair_id
                    && entry.fingerprint_a == fingerprint_a
                    && entry.fingerprint_b == fingerprint_b
            }
            Err(_) => false,
        };
        if !fresh {
            debug!(pair_id = %pair_id, "Reject entry is stale, invalidating");
            if let Err(e) = cache.delete(&key).await {
                warn!(subsystem = "cache", pair_id = %pair_id, error = %e, "Failed to delete stale reject entry");
            }
        }
        fresh
    }

    /// [`is_rejected`](Self::is_rejected) with the concepts' current fingerprints.
    pub async fn is_rejected_pair(&self, a: &CanonicalConcept, b: &CanonicalConcept) -> bool {
        let pair_id = PairId::new(a.id, b.id);
        let (low, high) = if a.id == pair_id.low() { (a, b) } else { (b, a) };
        self.is_rejected(&pair_id, &low.fingerprint(), &high.fingerprint())
            .await
    }

    /// Store one entry. Returns false when the cache refused the write.
    pub async fn insert(&self, entry: &RejectEntry) -> bool {
        let Some(cache) = self.cache.as_ref() else {
            return false;
        };
        let value = match serde_json::to_string(entry) {
            Ok(v) => v,
            Err(e) => {
                warn!(pair_id = %entry.pair_id, error = %e, "Failed to encode reject entry");
                return false;
            }
        };
        let key = cache_key(&self.tenant_id, KIND, &entry.pair_id);
        match cache.set_ex(&key, &value, self.ttl_secs).await {
            Ok(()) => true,
            Err(e) => {
                warn!(subsystem = "cache", pair_id = %entry.pair_id, error = %e, "Reject store write failed");
                false
            }
        }
    }

    /// Store many entries; returns how many were written.
    pub async fn insert_many(&self, entries: &[RejectEntry]) -> usize {
        if self.cache.is_none() || entries.is_empty() {
            return 0;
        }
        stream::iter(entries)
            .map(|entry| self.insert(entry))
            .buffer_unordered(BULK_CONCURRENCY)
            .filter(|written| futures::future::ready(*written))
            .count()
            .await
    }

    pub async fn get(&self, pair_id: &PairId) -> Option<RejectEntry> {
        let cache = self.cache.as_ref()?;
        let key = cache_key(&self.tenant_id, KIND, pair_id);
        match cache.get(&key).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(subsystem = "cache", pair_id = %pair_id, error = %e, "Reject store read failed");
                None
            }
        }
    }

    /// Drop every entry whose pair contains `concept_id`. Fired for both
    /// concepts of every merge and rollback.
    pub async fn invalidate_concept(&self, concept_id: Uuid) -> u64 {
        let Some(cache) = self.cache.as_ref() else {
            return 0;
        };
        let pattern = concept_pattern(&self.tenant_id, KIND, concept_id);
        match cache.delete_pattern(&pattern).await {
            Ok(n) => n,
            Err(e) => {
                warn!(subsystem = "cache", concept_id = %concept_id, error = %e, "Reject store invalidation failed");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::ConceptType;
    use concord_db::memory::MemoryCache;

    fn store() -> (RejectStore, Arc<MemoryCache>) {
        let cache = Arc::new(MemoryCache::new());
        (RejectStore::new(Some(cache.clone()), "t", 3600), cache)
    }

    fn pair() -> (CanonicalConcept, CanonicalConcept) {
        (
            CanonicalConcept::new("t", "SAP S/4HANA", ConceptType::Product),
            CanonicalConcept::new("t", "SAP HANA", ConceptType::Product),
        )
    }

    #[tokio::test]
    async fn test_rejected_while_fingerprints_match() {
        let (store, _) = store();
        let (a, b) = pair();
        assert!(!store.is_rejected_pair(&a, &b).await);
        assert!(store.insert(&reject_entry(&a, &b, 0.4, "below_threshold")).await);
        assert!(store.is_rejected_pair(&a, &b).await);
        assert!(store.is_rejected_pair(&b, &a).await);
    }

    #[tokio::test]
    async fn test_fingerprint_change_invalidates_entry() {
        let (store, cache) = store();
        let (a, b) = pair();
        store.insert(&reject_entry(&a, &b, 0.4, "below_threshold")).await;

        let changed = a.clone().with_aliases(["S4"]);
        assert!(!store.is_rejected_pair(&changed, &b).await);
        // The stale entry is gone, so the old fingerprints no longer match either.
        assert!(!store.is_rejected_pair(&a, &b).await);
        assert!(cache.keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_insert_many_and_invalidate_concept() {
        let (store, _) = store();
        let (a, b) = pair();
        let c = CanonicalConcept::new("t", "SAP BW", ConceptType::Product);
        let written = store
            .insert_many(&[reject_entry(&a, &b, 0.3, "x"), reject_entry(&a, &c, 0.2, "x")])
            .await;
        assert_eq!(written, 2);
        assert_eq!(store.invalidate_concept(a.id).await, 2);
        assert!(store.get(&PairId::new(b.id, a.id)).await.is_none());
    }

    #[tokio::test]
    async fn test_cache_failure_reads_as_not_rejected() {
        let (store, cache) = store();
        let (a, b) = pair();
        store.insert(&reject_entry(&a, &b, 0.4, "x")).await;
        cache.set_failing(true);
        assert!(!store.is_rejected_pair(&a, &b).await);
        assert!(!store.insert(&reject_entry(&a, &b, 0.4, "x")).await);
    }
}
