use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use concord_core::{
    DeferredMergeCandidate, DeferredRepository, DeferredStatus, Error, MergeAuditRepository,
    MergeCounts, MergeProposal, MergeResult, PairId, ProposalCounts, ProposalRepository, Result,
    RollbackRecord,
};

use super::FailureSwitch;

// =============================================================================
// DEFERRED
// =============================================================================

/// In-memory [`DeferredRepository`].
#[derive(Default)]
pub struct MemoryDeferredRepository {
    entries: RwLock<HashMap<(String, PairId), DeferredMergeCandidate>>,
    failures: FailureSwitch,
}

impl MemoryDeferredRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, op: &str) {
        self.failures.fail_on(op);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.failures.set_unavailable(unavailable);
    }

    pub fn clear_failures(&self) {
        self.failures.clear();
    }

    fn check(&self, op: &str) -> Result<()> {
        self.failures.check(op, Error::Internal)
    }

    fn key(tenant_id: &str, pair_id: &PairId) -> (String, PairId) {
        (tenant_id.to_string(), *pair_id)
    }
}

#[async_trait]
impl DeferredRepository for MemoryDeferredRepository {
    async fn upsert(&self, entry: &DeferredMergeCandidate) -> Result<bool> {
        self.check("upsert")?;
        let mut entries = self.entries.write().await;
        let key = Self::key(&entry.tenant_id, &entry.pair_id);
        match entries.get_mut(&key) {
            Some(existing) => {
                let created_at = existing.created_at;
                let expires_at = existing.expires_at;
                let evaluation_count = entry.evaluation_count.max(existing.evaluation_count + 1);
                *existing = entry.clone();
                existing.created_at = created_at;
                existing.expires_at = expires_at;
                existing.evaluation_count = evaluation_count;
                Ok(false)
            }
            None => {
                entries.insert(key, entry.clone());
                Ok(true)
            }
        }
    }

    async fn get(
        &self,
        tenant_id: &str,
        pair_id: &PairId,
    ) -> Result<Option<DeferredMergeCandidate>> {
        self.check("get")?;
        Ok(self
            .entries
            .read()
            .await
            .get(&Self::key(tenant_id, pair_id))
            .cloned())
    }

    async fn delete(&self, tenant_id: &str, pair_id: &PairId) -> Result<bool> {
        self.check("delete")?;
        Ok(self
            .entries
            .write()
            .await
            .remove(&Self::key(tenant_id, pair_id))
            .is_some())
    }

    async fn delete_for_concept(&self, tenant_id: &str, concept_id: Uuid) -> Result<u64> {
        self.check("delete_for_concept")?;
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|(tenant, pair), _| !(tenant == tenant_id && pair.contains(concept_id)));
        Ok((before - entries.len()) as u64)
    }

    async fn count_pending(&self, tenant_id: &str) -> Result<i64> {
        self.check("count_pending")?;
        Ok(self
            .entries
            .read()
            .await
            .values()
            .filter(|e| e.tenant_id == tenant_id && e.status == DeferredStatus::Pending)
            .count() as i64)
    }

    async fn oldest_pending(
        &self,
        tenant_id: &str,
        limit: usize,
    ) -> Result<Vec<DeferredMergeCandidate>> {
        self.check("oldest_pending")?;
        let entries = self.entries.read().await;
        let mut out: Vec<DeferredMergeCandidate> = entries
            .values()
            .filter(|e| e.tenant_id == tenant_id && e.status == DeferredStatus::Pending)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.pair_id.cmp(&b.pair_id)));
        out.truncate(limit);
        Ok(out)
    }

    async fn list_pending(
        &self,
        tenant_id: &str,
        now: DateTime<Utc>,
        min_docs: Option<i64>,
        limit: usize,
    ) -> Result<Vec<DeferredMergeCandidate>> {
        self.check("list_pending")?;
        let entries = self.entries.read().await;
        let mut out: Vec<DeferredMergeCandidate> = entries
            .values()
            .filter(|e| {
                e.tenant_id == tenant_id
                    && e.status == DeferredStatus::Pending
                    && !e.is_expired(now)
                    && min_docs.map_or(true, |min| e.evidence.combined() >= min)
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.last_evaluated_at
                .cmp(&b.last_evaluated_at)
                .then(a.pair_id.cmp(&b.pair_id))
        });
        out.truncate(limit);
        Ok(out)
    }

    async fn purge_expired(
        &self,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<DeferredMergeCandidate>> {
        self.check("purge_expired")?;
        let mut entries = self.entries.write().await;
        let expired: Vec<(String, PairId)> = entries
            .iter()
            .filter(|((tenant, _), e)| tenant == tenant_id && e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        let mut purged: Vec<DeferredMergeCandidate> =
            expired.iter().filter_map(|k| entries.remove(k)).collect();
        purged.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.pair_id.cmp(&b.pair_id)));
        Ok(purged)
    }
}

// =============================================================================
// PROPOSALS
// =============================================================================

/// In-memory [`ProposalRepository`].
#[derive(Default)]
pub struct MemoryProposalRepository {
    proposals: RwLock<HashMap<Uuid, MergeProposal>>,
    failures: FailureSwitch,
}

impl MemoryProposalRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, op: &str) {
        self.failures.fail_on(op);
    }

    pub fn clear_failures(&self) {
        self.failures.clear();
    }
}

#[async_trait]
impl ProposalRepository for MemoryProposalRepository {
    async fn insert(&self, proposal: &MergeProposal) -> Result<()> {
        self.failures.check("insert", Error::Internal)?;
        let mut proposals = self.proposals.write().await;
        proposals.retain(|_, p| {
            !(p.tenant_id == proposal.tenant_id && p.pair_id == proposal.pair_id && !p.applied)
        });
        proposals.insert(proposal.id, proposal.clone());
        Ok(())
    }

    async fn get(&self, tenant_id: &str, id: Uuid) -> Result<Option<MergeProposal>> {
        self.failures.check("get", Error::Internal)?;
        Ok(self
            .proposals
            .read()
            .await
            .get(&id)
            .filter(|p| p.tenant_id == tenant_id)
            .cloned())
    }

    async fn list_pending(&self, tenant_id: &str, limit: usize) -> Result<Vec<MergeProposal>> {
        self.failures.check("list_pending", Error::Internal)?;
        let proposals = self.proposals.read().await;
        let mut out: Vec<MergeProposal> = proposals
            .values()
            .filter(|p| p.tenant_id == tenant_id && !p.applied)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.id.cmp(&b.id)));
        out.truncate(limit);
        Ok(out)
    }

    async fn mark_applied(
        &self,
        tenant_id: &str,
        id: Uuid,
        applied_by: &str,
        applied_at: DateTime<Utc>,
        merge_id: Uuid,
    ) -> Result<()> {
        self.failures.check("mark_applied", Error::Internal)?;
        let mut proposals = self.proposals.write().await;
        let proposal = proposals
            .get_mut(&id)
            .filter(|p| p.tenant_id == tenant_id && !p.applied)
            .ok_or_else(|| Error::NotFound(format!("pending proposal {}", id)))?;
        proposal.applied = true;
        proposal.applied_by = Some(applied_by.to_string());
        proposal.applied_at = Some(applied_at);
        proposal.merge_id = Some(merge_id);
        Ok(())
    }

    async fn counts(&self, tenant_id: &str) -> Result<ProposalCounts> {
        self.failures.check("counts", Error::Internal)?;
        let proposals = self.proposals.read().await;
        let mut counts = ProposalCounts::default();
        for p in proposals.values().filter(|p| p.tenant_id == tenant_id) {
            counts.total += 1;
            if p.applied {
                counts.applied += 1;
            } else {
                counts.pending += 1;
            }
        }
        Ok(counts)
    }
}

// =============================================================================
// MERGE AUDIT
// =============================================================================

#[derive(Default)]
struct AuditState {
    merges: Vec<MergeResult>,
    rollbacks: HashMap<Uuid, RollbackRecord>,
}

/// In-memory [`MergeAuditRepository`]. Records are append-only.
#[derive(Default)]
pub struct MemoryMergeAuditRepository {
    state: RwLock<AuditState>,
    failures: FailureSwitch,
}

impl MemoryMergeAuditRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, op: &str) {
        self.failures.fail_on(op);
    }

    pub fn clear_failures(&self) {
        self.failures.clear();
    }
}

fn newest_first(a: &MergeResult, b: &MergeResult) -> std::cmp::Ordering {
    b.executed_at
        .cmp(&a.executed_at)
        .then(b.merge_id.cmp(&a.merge_id))
}

#[async_trait]
impl MergeAuditRepository for MemoryMergeAuditRepository {
    async fn record_merge(&self, result: &MergeResult) -> Result<()> {
        self.failures.check("record_merge", Error::Internal)?;
        let mut state = self.state.write().await;
        if state.merges.iter().any(|m| m.merge_id == result.merge_id) {
            return Err(Error::InvalidState(format!(
                "merge {} already recorded",
                result.merge_id
            )));
        }
        state.merges.push(result.clone());
        Ok(())
    }

    async fn get_merge(&self, tenant_id: &str, merge_id: Uuid) -> Result<Option<MergeResult>> {
        self.failures.check("get_merge", Error::Internal)?;
        let state = self.state.read().await;
        Ok(state
            .merges
            .iter()
            .find(|m| m.tenant_id == tenant_id && m.merge_id == merge_id)
            .cloned())
    }

    async fn latest_merge_touching(
        &self,
        tenant_id: &str,
        concept_id: Uuid,
    ) -> Result<Option<MergeResult>> {
        self.failures.check("latest_merge_touching", Error::Internal)?;
        let state = self.state.read().await;
        Ok(state
            .merges
            .iter()
            .filter(|m| {
                m.tenant_id == tenant_id
                    && m.success
                    && m.involves(concept_id)
                    && !state.rollbacks.contains_key(&m.merge_id)
            })
            .min_by(|a, b| newest_first(a, b))
            .cloned())
    }

    async fn merge_history(&self, tenant_id: &str, concept_id: Uuid) -> Result<Vec<MergeResult>> {
        self.failures.check("merge_history", Error::Internal)?;
        let state = self.state.read().await;
        let mut out: Vec<MergeResult> = state
            .merges
            .iter()
            .filter(|m| m.tenant_id == tenant_id && m.involves(concept_id))
            .cloned()
            .collect();
        out.sort_by(newest_first);
        Ok(out)
    }

    async fn record_rollback(&self, record: &RollbackRecord) -> Result<()> {
        self.failures.check("record_rollback", Error::Internal)?;
        let mut state = self.state.write().await;
        if state.rollbacks.contains_key(&record.merge_id) {
            return Err(Error::InvalidState(format!(
                "merge {} already rolled back",
                record.merge_id
            )));
        }
        state.rollbacks.insert(record.merge_id, record.clone());
        Ok(())
    }

    async fn get_rollback(
        &self,
        tenant_id: &str,
        merge_id: Uuid,
    ) -> Result<Option<RollbackRecord>> {
        self.failures.check("get_rollback", Error::Internal)?;
        let state = self.state.read().await;
        Ok(state
            .rollbacks
            .get(&merge_id)
            .filter(|r| r.tenant_id == tenant_id)
            .cloned())
    }

    async fn counts(&self, tenant_id: &str) -> Result<MergeCounts> {
        self.failures.check("counts", Error::Internal)?;
        let state = self.state.read().await;
        let mut counts = MergeCounts::default();
        for m in state.merges.iter().filter(|m| m.tenant_id == tenant_id) {
            if m.success {
                counts.succeeded += 1;
            } else {
                counts.failed += 1;
            }
        }
        counts.rolled_back = state
            .rollbacks
            .values()
            .filter(|r| r.tenant_id == tenant_id)
            .count() as i64;
        Ok(counts)
    }
}
