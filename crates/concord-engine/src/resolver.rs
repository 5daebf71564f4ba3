//! Identity resolver: merge execution and rollback.
//!
//! A merge folds the merged concept into the survivor in five ordered steps:
//! aliases, relations, claims, status, cache invalidation. Every redirected
//! edge and claim carries a provenance tag for the merge, and self-loop edges
//! are snapshotted before deletion, so the merge can be undone exactly.
//!
//! If a graph step fails, the steps already applied are compensated and the
//! failed [`MergeResult`] is written to the audit log; both concepts are left
//! as they were. Merge chains are flattened on write: concepts that pointed
//! at the merged concept are re-pointed to the survivor, so every merged
//! concept resolves to an active one in a single hop.
//!
//! A merged concept's vector is dropped from the index so blocking stops
//! offering it as a neighbour; rollback leaves re-indexing to the caller.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use concord_core::{
    merge_aliases, CanonicalConcept, ConceptStatus, Error, GraphStore, MergeAuditRepository,
    MergeCandidate, MergeResult, MergeStep, MergeTrigger, Result, RollbackRecord,
    SignalBreakdown, VectorIndex,
};

use crate::deferred::DeferredStore;
use crate::locks::MergeLocks;
use crate::reject_store::RejectStore;
use crate::score_cache::ScoreCache;

/// A merge to execute.
#[derive(Debug, Clone)]
pub struct MergeRequest {
    pub id_a: Uuid,
    pub id_b: Uuid,
    pub trigger: MergeTrigger,
    pub reason: String,
    pub score: f32,
    pub signals: Option<SignalBreakdown>,
}

impl MergeRequest {
    pub fn from_candidate(candidate: &MergeCandidate, trigger: MergeTrigger, reason: impl Into<String>) -> Self {
        Self {
            id_a: candidate.id_a,
            id_b: candidate.id_b,
            trigger,
            reason: reason.into(),
            score: candidate.score,
            signals: Some(candidate.signals.clone()),
        }
    }

    /// Operator-requested merge without scores.
    pub fn manual(id_a: Uuid, id_b: Uuid, reason: impl Into<String>) -> Self {
        Self {
            id_a,
            id_b,
            trigger: MergeTrigger::Manual,
            reason: reason.into(),
            score: 1.0,
            signals: None,
        }
    }
}

/// Inputs to survivor selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SurvivorStats {
    pub relations: i64,
    pub documents: i64,
}

/// `Less` when `a` should survive over `b`.
///
/// More relations wins, then more documents, then earlier creation, then the
/// longer name. The id decides a complete tie.
pub fn survivor_order(
    a: &CanonicalConcept,
    a_stats: SurvivorStats,
    b: &CanonicalConcept,
    b_stats: SurvivorStats,
) -> Ordering {
    b_stats
        .relations
        .cmp(&a_stats.relations)
        .then_with(|| b_stats.documents.cmp(&a_stats.documents))
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| {
            b.canonical_name
                .chars()
                .count()
                .cmp(&a.canonical_name.chars().count())
        })
        .then_with(|| a.id.cmp(&b.id))
}

/// Whether a merge can be rolled back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackEligibility {
    Eligible,
    NotFound,
    /// The merge never completed.
    Failed,
    AlreadyRolledBack,
    /// A later merge touched the survivor.
    Superseded,
    /// The graph no longer matches the merge record.
    Diverged,
}

impl RollbackEligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, RollbackEligibility::Eligible)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RollbackEligibility::Eligible => "eligible",
            RollbackEligibility::NotFound => "not_found",
            RollbackEligibility::Failed => "failed",
            RollbackEligibility::AlreadyRolledBack => "already_rolled_back",
            RollbackEligibility::Superseded => "superseded",
            RollbackEligibility::Diverged => "diverged",
        }
    }
}

impl fmt::Display for RollbackEligibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Working state of one merge.
struct MergeState {
    survivor: CanonicalConcept,
    merged: CanonicalConcept,
    result: MergeResult,
    status_set: bool,
}

const GRAPH_STEPS: [MergeStep; 4] = [
    MergeStep::Aliases,
    MergeStep::Relations,
    MergeStep::Claims,
    MergeStep::Status,
];

/// Executes and undoes merges for one tenant.
pub struct IdentityResolver {
    tenant_id: String,
    graph: Arc<dyn GraphStore>,
    audit: Arc<dyn MergeAuditRepository>,
    score_cache: ScoreCache,
    rejects: RejectStore,
    deferred: Option<Arc<DeferredStore>>,
    vectors: Option<Arc<dyn VectorIndex>>,
    locks: Arc<MergeLocks>,
}

impl IdentityResolver {
    pub fn new(
        tenant_id: impl Into<String>,
        graph: Arc<dyn GraphStore>,
        audit: Arc<dyn MergeAuditRepository>,
        score_cache: ScoreCache,
        rejects: RejectStore,
        locks: Arc<MergeLocks>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            graph,
            audit,
            score_cache,
            rejects,
            deferred: None,
            vectors: None,
            locks,
        }
    }

    /// Drop deferred entries of merged concepts during cache invalidation.
    pub fn with_deferred(mut self, deferred: Arc<DeferredStore>) -> Self {
        self.deferred = Some(deferred);
        self
    }

    pub fn with_vectors(mut self, vectors: Option<Arc<dyn VectorIndex>>) -> Self {
        self.vectors = vectors;
        self
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    async fn load(&self, id: Uuid) -> Result<CanonicalConcept> {
        self.graph
            .get_concept(&self.tenant_id, id)
            .await?
            .ok_or(Error::ConceptNotFound(id))
    }

    async fn survivor_stats(&self, id: Uuid) -> Result<SurvivorStats> {
        let (relations, documents) = tokio::try_join!(
            self.graph.count_relations(&self.tenant_id, id),
            self.graph.document_count(&self.tenant_id, id)
        )?;
        Ok(SurvivorStats {
            relations,
            documents,
        })
    }

    /// Execute a merge.
    ///
    /// Returns `Ok` with `success == false` when a step failed and was
    /// compensated, or when a concept was no longer active. Returns `Err` for
    /// missing concepts, an unreachable store, or a failed audit write.
    #[instrument(skip(self, request), fields(subsystem = "engine", component = "resolver", op = "merge", tenant_id = %self.tenant_id, merge_id = tracing::field::Empty))]
    pub async fn merge(&self, request: MergeRequest) -> Result<MergeResult> {
        if request.id_a == request.id_b {
            return Err(Error::InvalidInput(format!(
                "cannot merge concept {} with itself",
                request.id_a
            )));
        }
        let _guard = self.locks.acquire(&[request.id_a, request.id_b]).await;

        let (a, b) = tokio::try_join!(self.load(request.id_a), self.load(request.id_b))?;

        if !a.is_active() || !b.is_active() {
            let inactive = if a.is_active() { b.id } else { a.id };
            let mut result = MergeResult::pending(
                self.tenant_id.clone(),
                a.id,
                b.id,
                request.trigger,
                request.reason,
                request.score,
                request.signals,
            );
            result.error = Some(format!("concept {} is not active", inactive));
            tracing::Span::current().record("merge_id", tracing::field::display(result.merge_id));
            warn!(concept_id = %inactive, "Merge refused, concept is not active");
            self.audit.record_merge(&result).await?;
            return Ok(result);
        }

        let (a_stats, b_stats) = tokio::try_join!(self.survivor_stats(a.id), self.survivor_stats(b.id))?;
        let (survivor, merged) = match survivor_order(&a, a_stats, &b, b_stats) {
            Ordering::Greater => (b, a),
            _ => (a, b),
        };

        let result = MergeResult::pending(
            self.tenant_id.clone(),
            survivor.id,
            merged.id,
            request.trigger,
            request.reason,
            request.score,
            request.signals,
        );
        tracing::Span::current().record("merge_id", tracing::field::display(result.merge_id));
        let mut state = MergeState {
            survivor,
            merged,
            result,
            status_set: false,
        };

        for (k, step) in GRAPH_STEPS.iter().copied().enumerate() {
            if let Err(e) = self.apply_step(step, &mut state).await {
                error!(step = %step, error = %e, "Merge step failed, compensating");
                state.result.failed_step = Some(step);
                let mut message = format!("{} failed: {}", step, e);
                if let Err(comp) = self.compensate(&GRAPH_STEPS[..=k], &state).await {
                    message.push_str(&format!("; compensation failed: {}", comp));
                }
                state.result.error = Some(message);
                if e.is_store_unreachable() {
                    if let Err(audit_err) = self.audit.record_merge(&state.result).await {
                        warn!(error = %audit_err, "Failed to record failed merge");
                    }
                    return Err(e);
                }
                self.audit.record_merge(&state.result).await?;
                return Ok(state.result);
            }
        }

        self.invalidate_caches(state.survivor.id, state.merged.id).await;
        state.result.success = true;
        state.result.executed_at = Utc::now();

        if let Err(e) = self.audit.record_merge(&state.result).await {
            error!(error = %e, "Failed to record merge, compensating");
            if let Err(comp) = self.compensate(&GRAPH_STEPS, &state).await {
                error!(error = %comp, "Compensation after audit failure failed");
            }
            return Err(e);
        }
        self.drop_vector(state.merged.id).await;

        info!(
            survivor_id = %state.result.survivor_id,
            merged_id = %state.result.merged_id,
            trigger = state.result.trigger.as_str(),
            aliases_added = state.result.aliases_added.len(),
            relations_redirected = state.result.relations_redirected,
            relations_dropped = state.result.dropped_relations.len(),
            claims_redirected = state.result.claims_redirected,
            repointed = state.result.repointed.len(),
            score = state.result.score,
            "Merge executed"
        );
        Ok(state.result)
    }

    async fn apply_step(&self, step: MergeStep, state: &mut MergeState) -> Result<()> {
        let tenant = self.tenant_id.as_str();
        let survivor_id = state.survivor.id;
        let merged_id = state.merged.id;
        let merge_id = state.result.merge_id;
        match step {
            MergeStep::Aliases => {
                let mut additions = vec![state.merged.canonical_name.clone()];
                additions.extend(state.merged.aliases.iter().cloned());
                let merged_aliases = merge_aliases(
                    &state.survivor.canonical_name,
                    &state.survivor.aliases,
                    &additions,
                );
                let added: Vec<String> = merged_aliases
                    .iter()
                    .filter(|alias| !state.survivor.aliases.contains(alias))
                    .cloned()
                    .collect();
                self.graph.set_aliases(tenant, survivor_id, &merged_aliases).await?;
                state.result.aliases_added = added;
            }
            MergeStep::Relations => {
                let redirect = self
                    .graph
                    .redirect_relations(tenant, merged_id, survivor_id, merge_id)
                    .await?;
                state.result.relations_redirected = redirect.redirected;
                state.result.dropped_relations = redirect.dropped;
            }
            MergeStep::Claims => {
                state.result.claims_redirected = self
                    .graph
                    .redirect_claims(tenant, merged_id, survivor_id, merge_id)
                    .await?;
            }
            MergeStep::Status => {
                let children = self.graph.list_merged_into(tenant, merged_id).await?;
                if !children.is_empty() {
                    self.graph
                        .repoint_merged_into(tenant, &children, survivor_id)
                        .await?;
                    state.result.repointed = children;
                }
                self.graph
                    .set_status(
                        tenant,
                        merged_id,
                        ConceptStatus::Merged,
                        Some(survivor_id),
                        Some(Utc::now()),
                    )
                    .await?;
                state.status_set = true;
            }
            MergeStep::CacheInvalidation => {
                self.invalidate_caches(survivor_id, merged_id).await;
            }
        }
        debug!(step = %step, "Merge step applied");
        Ok(())
    }

    /// Undo `steps` in reverse order. Every step is attempted; the first
    /// error is returned.
    async fn compensate(&self, steps: &[MergeStep], state: &MergeState) -> Result<()> {
        let tenant = self.tenant_id.as_str();
        let mut first_error: Option<Error> = None;
        let mut note = |step: MergeStep, res: Result<()>| {
            if let Err(e) = res {
                error!(step = %step, error = %e, "Compensation step failed");
                first_error.get_or_insert(e);
            }
        };

        for step in steps.iter().rev().copied() {
            match step {
                MergeStep::Status => {
                    if !state.result.repointed.is_empty() {
                        let res = self
                            .graph
                            .repoint_merged_into(tenant, &state.result.repointed, state.merged.id)
                            .await
                            .map(|_| ());
                        note(step, res);
                    }
                    if state.status_set {
                        let res = self
                            .graph
                            .set_status(tenant, state.merged.id, ConceptStatus::Active, None, None)
                            .await;
                        note(step, res);
                    }
                }
                MergeStep::Claims => {
                    let res = self
                        .graph
                        .restore_claims(tenant, state.result.merge_id)
                        .await
                        .map(|_| ());
                    note(step, res);
                }
                MergeStep::Relations => {
                    let res = self
                        .graph
                        .restore_relations(tenant, state.result.merge_id)
                        .await
                        .map(|_| ());
                    note(step, res);
                    for relation in &state.result.dropped_relations {
                        let res = self.graph.insert_relation(relation).await;
                        note(step, res);
                    }
                }
                MergeStep::Aliases => {
                    let res = self
                        .graph
                        .set_aliases(tenant, state.survivor.id, &state.survivor.aliases)
                        .await;
                    note(step, res);
                }
                MergeStep::CacheInvalidation => {}
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Drop cached scores and rejects for both concepts, and deferred
    /// entries of the merged one. Failures only log.
    async fn invalidate_caches(&self, survivor_id: Uuid, merged_id: Uuid) {
        let mut removed = 0;
        for id in [survivor_id, merged_id] {
            removed += self.score_cache.invalidate_concept(id).await;
            removed += self.rejects.invalidate_concept(id).await;
        }
        if let Some(deferred) = &self.deferred {
            match deferred.remove_for_concept(merged_id).await {
                Ok(n) => removed += n,
                Err(e) => warn!(concept_id = %merged_id, error = %e, "Failed to drop deferred entries of merged concept"),
            }
        }
        debug!(removed, "Caches invalidated");
    }

    async fn drop_vector(&self, concept_id: Uuid) {
        let Some(vectors) = &self.vectors else {
            return;
        };
        if let Err(e) = vectors.remove(&self.tenant_id, concept_id).await {
            warn!(concept_id = %concept_id, error = %e, "Failed to drop vector of merged concept");
        }
    }

    /// Whether `merge_id` can be rolled back now.
    pub async fn rollback_eligibility(&self, merge_id: Uuid) -> Result<RollbackEligibility> {
        Ok(self.check_rollback(merge_id).await?.0)
    }

    async fn check_rollback(&self, merge_id: Uuid) -> Result<(RollbackEligibility, Option<MergeResult>)> {
        let Some(merge) = self.audit.get_merge(&self.tenant_id, merge_id).await? else {
            return Ok((RollbackEligibility::NotFound, None));
        };
        if !merge.success {
            return Ok((RollbackEligibility::Failed, Some(merge)));
        }
        if self.audit.get_rollback(&self.tenant_id, merge_id).await?.is_some() {
            return Ok((RollbackEligibility::AlreadyRolledBack, Some(merge)));
        }
        let latest = self
            .audit
            .latest_merge_touching(&self.tenant_id, merge.survivor_id)
            .await?;
        if latest.map(|m| m.merge_id) != Some(merge_id) {
            return Ok((RollbackEligibility::Superseded, Some(merge)));
        }
        let concepts = self
            .graph
            .get_concepts(&self.tenant_id, &[merge.survivor_id, merge.merged_id])
            .await?;
        let survivor_active = concepts
            .iter()
            .any(|c| c.id == merge.survivor_id && c.is_active());
        let merged_points_back = concepts.iter().any(|c| {
            c.id == merge.merged_id
                && c.status == ConceptStatus::Merged
                && c.merged_into == Some(merge.survivor_id)
        });
        if !survivor_active || !merged_points_back {
            return Ok((RollbackEligibility::Diverged, Some(merge)));
        }
        Ok((RollbackEligibility::Eligible, Some(merge)))
    }

    /// Undo a merge. The original merge record stays; a [`RollbackRecord`]
    /// is written next to it.
    #[instrument(skip(self), fields(subsystem = "engine", component = "resolver", op = "rollback", tenant_id = %self.tenant_id, merge_id = %merge_id))]
    pub async fn rollback(&self, merge_id: Uuid, rolled_back_by: Option<&str>) -> Result<RollbackRecord> {
        let Some(peek) = self.audit.get_merge(&self.tenant_id, merge_id).await? else {
            return Err(Error::NotFound(format!("merge {}", merge_id)));
        };
        let _guard = self.locks.acquire(&[peek.survivor_id, peek.merged_id]).await;

        let (eligibility, merge) = self.check_rollback(merge_id).await?;
        let merge = match (eligibility, merge) {
            (RollbackEligibility::Eligible, Some(merge)) => merge,
            (RollbackEligibility::NotFound, _) | (_, None) => {
                return Err(Error::NotFound(format!("merge {}", merge_id)))
            }
            (other, Some(_)) => {
                return Err(Error::InvalidState(format!(
                    "merge {} cannot be rolled back: {}",
                    merge_id, other
                )))
            }
        };
        let tenant = self.tenant_id.as_str();

        let survivor = self.load(merge.survivor_id).await?;
        let remaining: Vec<String> = survivor
            .aliases
            .iter()
            .filter(|alias| !merge.aliases_added.contains(alias))
            .cloned()
            .collect();
        let aliases_removed: Vec<String> = survivor
            .aliases
            .iter()
            .filter(|alias| merge.aliases_added.contains(alias))
            .cloned()
            .collect();
        self.graph.set_aliases(tenant, survivor.id, &remaining).await?;

        let mut relations_restored = self.graph.restore_relations(tenant, merge_id).await?;
        for relation in &merge.dropped_relations {
            self.graph.insert_relation(relation).await?;
            relations_restored += 1;
        }
        let claims_restored = self.graph.restore_claims(tenant, merge_id).await?;

        let repointed_restored = if merge.repointed.is_empty() {
            0
        } else {
            self.graph
                .repoint_merged_into(tenant, &merge.repointed, merge.merged_id)
                .await?
        };
        self.graph
            .set_status(tenant, merge.merged_id, ConceptStatus::Active, None, None)
            .await?;

        for id in [merge.survivor_id, merge.merged_id] {
            self.score_cache.invalidate_concept(id).await;
            self.rejects.invalidate_concept(id).await;
        }

        let record = RollbackRecord {
            id: concord_core::new_v7(),
            merge_id,
            tenant_id: self.tenant_id.clone(),
            survivor_id: merge.survivor_id,
            merged_id: merge.merged_id,
            aliases_removed,
            relations_restored,
            claims_restored,
            repointed_restored,
            rolled_back_by: rolled_back_by.map(str::to_string),
            rolled_back_at: Utc::now(),
        };
        self.audit.record_rollback(&record).await?;
        info!(
            survivor_id = %record.survivor_id,
            merged_id = %record.merged_id,
            relations_restored,
            claims_restored,
            "Merge rolled back"
        );
        Ok(record)
    }

    /// The active concept `id` resolves to: itself, or its survivor.
    pub async fn resolve_root(&self, id: Uuid) -> Result<CanonicalConcept> {
        let concept = self.load(id).await?;
        let Some(target) = concept.merged_into else {
            if concept.status == ConceptStatus::Merged {
                return Err(Error::InvalidState(format!(
                    "merged concept {} has no merged_into pointer",
                    id
                )));
            }
            return Ok(concept);
        };
        let root = self.load(target).await?;
        if !root.is_active() {
            return Err(Error::InvalidState(format!(
                "concept {} resolves through {} which is not active",
                id, target
            )));
        }
        Ok(root)
    }

    /// Merges involving a concept, newest first.
    pub async fn merge_history(&self, concept_id: Uuid) -> Result<Vec<MergeResult>> {
        self.audit.merge_history(&self.tenant_id, concept_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::ConceptType;

    fn stats(relations: i64, documents: i64) -> SurvivorStats {
        SurvivorStats {
            relations,
            documents,
        }
    }

    #[test]
    fn test_survivor_prefers_relations_then_documents() {
        let now = Utc::now();
        let a = CanonicalConcept::new("t", "GDPR", ConceptType::Regulation).with_created_at(now);
        let b = CanonicalConcept::new("t", "General Data Protection Regulation", ConceptType::Regulation)
            .with_created_at(now);
        assert_eq!(survivor_order(&a, stats(3, 0), &b, stats(1, 9)), Ordering::Less);
        assert_eq!(survivor_order(&a, stats(1, 2), &b, stats(1, 9)), Ordering::Greater);
    }

    #[test]
    fn test_survivor_tie_breaks_on_age_then_name_length() {
        let now = Utc::now();
        let short = CanonicalConcept::new("t", "GDPR", ConceptType::Regulation).with_created_at(now);
        let long = CanonicalConcept::new(
            "t",
            "General Data Protection Regulation (GDPR)",
            ConceptType::Regulation,
        )
        .with_created_at(now);
        assert_eq!(
            survivor_order(&short, stats(0, 0), &long, stats(0, 0)),
            Ordering::Greater
        );

        let older = short.clone().with_created_at(now - chrono::Duration::days(1));
        assert_eq!(
            survivor_order(&older, stats(0, 0), &long, stats(0, 0)),
            Ordering::Less
        );
    }

    #[test]
    fn test_eligibility_labels() {
        assert!(RollbackEligibility::Eligible.is_eligible());
        assert!(!RollbackEligibility::Superseded.is_eligible());
        assert_eq!(RollbackEligibility::AlreadyRolledBack.to_string(), "already_rolled_back");
    }
}
