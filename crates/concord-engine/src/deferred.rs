//! Deferred candidate queue.
//!
//! DEFER outcomes are kept with a fixed lifetime and rescored when new
//! evidence arrives. The queue is bounded per tenant: when it overflows, the
//! oldest entries are evicted and handed back to the caller, which records
//! them as rejects. Reevaluation never extends an entry's lifetime.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use concord_core::defaults::{DEFER_MAX_QUEUE, DEFER_TTL_SECS, REEVAL_BATCH_LIMIT, REEVAL_EVERY_DOCS};
use concord_core::{
    DeferredMergeCandidate, DeferredRepository, Error, EvidenceCounters, MergeCandidate, PairId,
    Result,
};

use crate::config::env_or;

/// Upper bound on the entry lifetime (100 years).
const MAX_TTL_SECS: u64 = 100 * 365 * 86_400;

/// Reject reason for entries evicted by queue overflow.
pub const REASON_QUEUE_OVERFLOW: &str = "queue_overflow";

/// Reject reason for entries that reached their TTL.
pub const REASON_DEFER_EXPIRED: &str = "defer_expired";

/// Deferred queue configuration.
#[derive(Debug, Clone)]
pub struct DeferredConfig {
    /// Entry lifetime in seconds.
    pub ttl_secs: u64,
    /// Maximum pending entries per tenant.
    pub max_queue: usize,
    /// Reevaluate after this many newly ingested documents.
    pub reeval_every_docs: u64,
    /// Entries processed per reevaluation run.
    pub batch_limit: usize,
}

impl Default for DeferredConfig {
    fn default() -> Self {
        Self {
            ttl_secs: DEFER_TTL_SECS,
            max_queue: DEFER_MAX_QUEUE,
            reeval_every_docs: REEVAL_EVERY_DOCS,
            batch_limit: REEVAL_BATCH_LIMIT,
        }
    }
}

impl DeferredConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `CONCORD_DEFER_TTL_SECS` | `2592000` | Deferred entry lifetime |
    /// | `CONCORD_DEFER_MAX_QUEUE` | `5000` | Pending entries per tenant |
    /// | `CONCORD_REEVAL_EVERY_DOCS` | `50` | Documents between reevaluations |
    /// | `CONCORD_REEVAL_BATCH_LIMIT` | `500` | Entries per reevaluation run |
    pub fn from_env() -> Self {
        Self {
            ttl_secs: env_or("CONCORD_DEFER_TTL_SECS", DEFER_TTL_SECS),
            max_queue: env_or("CONCORD_DEFER_MAX_QUEUE", DEFER_MAX_QUEUE),
            reeval_every_docs: env_or("CONCORD_REEVAL_EVERY_DOCS", REEVAL_EVERY_DOCS),
            batch_limit: env_or("CONCORD_REEVAL_BATCH_LIMIT", REEVAL_BATCH_LIMIT),
        }
    }

    pub fn with_ttl_secs(mut self, secs: u64) -> Self {
        self.ttl_secs = secs;
        self
    }

    pub fn with_max_queue(mut self, max: usize) -> Self {
        self.max_queue = max;
        self
    }

    pub fn with_reeval_every_docs(mut self, docs: u64) -> Self {
        self.reeval_every_docs = docs;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.ttl_secs == 0 || self.max_queue == 0 || self.reeval_every_docs == 0 || self.batch_limit == 0 {
            return Err(Error::Config(
                "deferred ttl, queue size, reevaluation interval and batch limit must be non-zero"
                    .to_string(),
            ));
        }
        Ok(())
    }

    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.ttl_secs.min(MAX_TTL_SECS) as i64)
    }
}

/// What happened when a candidate was deferred.
#[derive(Debug, Clone, Default)]
pub struct DeferOutcome {
    /// A new entry was created (false: an existing one was refreshed).
    pub inserted: bool,
    /// Oldest entries evicted to keep the queue bounded.
    pub evicted: Vec<DeferredMergeCandidate>,
}

/// Tenant-scoped deferred queue plus the ingestion counter that triggers
/// reevaluation.
pub struct DeferredStore {
    repo: Arc<dyn DeferredRepository>,
    tenant_id: String,
    config: DeferredConfig,
    docs_since_reeval: AtomicU64,
}

impl DeferredStore {
    pub fn new(repo: Arc<dyn DeferredRepository>, tenant_id: impl Into<String>, config: DeferredConfig) -> Self {
        Self {
            repo,
            tenant_id: tenant_id.into(),
            config,
            docs_since_reeval: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &DeferredConfig {
        &self.config
    }

    /// Persist a DEFER outcome, then enforce the queue bound. Deferring a
    /// pair that is already queued counts as another evaluation.
    #[instrument(skip(self, candidate, evidence), fields(subsystem = "engine", component = "deferred", op = "defer", tenant_id = %self.tenant_id, pair_id = %candidate.pair_id))]
    pub async fn defer(
        &self,
        candidate: &MergeCandidate,
        evidence: EvidenceCounters,
        now: DateTime<Utc>,
    ) -> Result<DeferOutcome> {
        let entry = DeferredMergeCandidate::from_candidate(
            self.tenant_id.clone(),
            candidate,
            evidence,
            now,
            self.config.ttl(),
        );
        let inserted = self.repo.upsert(&entry).await?;
        let evicted = if inserted {
            self.enforce_bound().await?
        } else {
            Vec::new()
        };
        Ok(DeferOutcome { inserted, evicted })
    }

    /// Evict the oldest pending entries beyond `max_queue`.
    pub async fn enforce_bound(&self) -> Result<Vec<DeferredMergeCandidate>> {
        let pending = self.repo.count_pending(&self.tenant_id).await?;
        let excess = pending - self.config.max_queue as i64;
        if excess <= 0 {
            return Ok(Vec::new());
        }
        let oldest = self.repo.oldest_pending(&self.tenant_id, excess as usize).await?;
        let mut evicted = Vec::with_capacity(oldest.len());
        for entry in oldest {
            if self.repo.delete(&self.tenant_id, &entry.pair_id).await? {
                evicted.push(entry);
            }
        }
        info!(
            tenant_id = %self.tenant_id,
            evicted = evicted.len(),
            max_queue = self.config.max_queue,
            "Deferred queue full, evicted oldest entries"
        );
        Ok(evicted)
    }

    /// Write back an entry that is still deferred after rescoring. Its
    /// lifetime is unchanged.
    pub async fn record_reevaluation(
        &self,
        entry: &DeferredMergeCandidate,
        candidate: &MergeCandidate,
        evidence: EvidenceCounters,
        now: DateTime<Utc>,
    ) -> Result<DeferredMergeCandidate> {
        let mut updated = entry.clone();
        updated.signals = candidate.signals.clone();
        updated.score = candidate.score;
        updated.evidence = evidence;
        updated.last_evaluated_at = now;
        updated.evaluation_count += 1;
        self.repo.upsert(&updated).await?;
        Ok(updated)
    }

    pub async fn get(&self, pair_id: &PairId) -> Result<Option<DeferredMergeCandidate>> {
        self.repo.get(&self.tenant_id, pair_id).await
    }

    pub async fn remove(&self, pair_id: &PairId) -> Result<bool> {
        self.repo.delete(&self.tenant_id, pair_id).await
    }

    pub async fn remove_for_concept(&self, concept_id: Uuid) -> Result<u64> {
        self.repo.delete_for_concept(&self.tenant_id, concept_id).await
    }

    pub async fn pending(
        &self,
        now: DateTime<Utc>,
        min_docs: Option<i64>,
        limit: usize,
    ) -> Result<Vec<DeferredMergeCandidate>> {
        self.repo
            .list_pending(&self.tenant_id, now, min_docs, limit)
            .await
    }

    /// Remove and return every expired entry.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<DeferredMergeCandidate>> {
        let purged = self.repo.purge_expired(&self.tenant_id, now).await?;
        if !purged.is_empty() {
            debug!(tenant_id = %self.tenant_id, result_count = purged.len(), "Purged expired deferred entries");
        }
        Ok(purged)
    }

    pub async fn count_pending(&self) -> Result<i64> {
        self.repo.count_pending(&self.tenant_id).await
    }

    /// Count newly ingested documents. Returns true (and resets the counter)
    /// once the reevaluation interval is reached.
    pub fn record_documents(&self, n: u64) -> bool {
        let interval = self.config.reeval_every_docs.max(1);
        let total = self.docs_since_reeval.fetch_add(n, Ordering::SeqCst) + n;
        if total < interval {
            return false;
        }
        // Only the caller that observes the crossing resets the counter.
        self.docs_since_reeval
            .compare_exchange(total, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn documents_since_reevaluation(&self) -> u64 {
        self.docs_since_reeval.load(Ordering::SeqCst)
    }
}
