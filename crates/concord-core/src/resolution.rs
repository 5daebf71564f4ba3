//! Resolution records: signal breakdowns, candidates, deferred entries,
//! proposals, merge audit and cache entries.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::concept::{ConceptStats, ConceptType, Relation};
use crate::defaults::{
    COMBINED_LEXICAL_WEIGHT, COMBINED_SEMANTIC_WEIGHT, COMBINED_TYPE_WEIGHT,
    DECISIVE_LEXICAL_SCORE, RANKING_LEXICAL_WEIGHT, RANKING_SEMANTIC_WEIGHT, RANKING_TYPE_WEIGHT,
};
use crate::ids::PairId;

// =============================================================================
// SIGNALS
// =============================================================================

/// Named similarity signals for one pair, each in [0, 1].
///
/// Semantic signals are optional: `None` means the backend was unavailable or
/// the signal was skipped, which is different from a measured 0.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalBreakdown {
    /// 1.0 when the names match after normalization.
    pub exact_match: f32,
    /// 1.0 when one name is the acronym of the other.
    pub acronym_match: f32,
    /// Jaccard overlap of the two name sets (name plus aliases).
    pub alias_overlap: f32,
    /// Cosine similarity of the two embeddings.
    pub embedding_similarity: Option<f32>,
    /// Pairwise cross-encoder relevance.
    pub cross_encoder_score: Option<f32>,
    pub type_compatibility: f32,
    /// Raw string similarity of the canonical names.
    pub lexical_similarity: f32,
    /// No semantic signal was available; the score is lexical-only.
    #[serde(default)]
    pub degraded: bool,
    /// The cross-encoder was not called because lexical evidence was decisive.
    #[serde(default)]
    pub cross_encoder_skipped: bool,
}

impl SignalBreakdown {
    /// Strongest lexical signal.
    pub fn lexical_component(&self) -> f32 {
        self.exact_match
            .max(self.acronym_match)
            .max(self.alias_overlap)
            .max(self.lexical_similarity)
    }

    /// Mean of the available semantic signals.
    pub fn semantic_component(&self) -> Option<f32> {
        let signals: Vec<f32> = [self.embedding_similarity, self.cross_encoder_score]
            .into_iter()
            .flatten()
            .collect();
        if signals.is_empty() {
            None
        } else {
            Some(signals.iter().sum::<f32>() / signals.len() as f32)
        }
    }

    /// Semantic component, or 0 when no semantic signal exists.
    pub fn semantic_or_zero(&self) -> f32 {
        self.semantic_component().unwrap_or(0.0)
    }

    /// Exact or acronym match.
    pub fn is_decisive_lexical(&self) -> bool {
        self.exact_match >= 1.0 || self.acronym_match >= 1.0
    }

    /// Aggregate score used by the decision policies.
    ///
    /// `0.45 * semantic + 0.35 * lexical + 0.20 * type`. Without semantic
    /// signals the lexical and type weights are re-normalized. Decisive
    /// lexical evidence floors the result at `0.95 * type_compatibility`.
    pub fn combined_score(&self) -> f32 {
        let weighted = weighted(
            self.semantic_component(),
            self.lexical_component(),
            self.type_compatibility,
            COMBINED_SEMANTIC_WEIGHT,
            COMBINED_LEXICAL_WEIGHT,
            COMBINED_TYPE_WEIGHT,
        );
        let floored = if self.is_decisive_lexical() {
            weighted.max(DECISIVE_LEXICAL_SCORE * self.type_compatibility)
        } else {
            weighted
        };
        floored.clamp(0.0, 1.0)
    }

    /// Ranking-only score used to order neighbours during corpus pruning.
    pub fn ranking_score(&self) -> f32 {
        weighted(
            self.semantic_component(),
            self.lexical_component(),
            self.type_compatibility,
            RANKING_SEMANTIC_WEIGHT,
            RANKING_LEXICAL_WEIGHT,
            RANKING_TYPE_WEIGHT,
        )
        .clamp(0.0, 1.0)
    }
}

fn weighted(
    semantic: Option<f32>,
    lexical: f32,
    type_compat: f32,
    w_semantic: f32,
    w_lexical: f32,
    w_type: f32,
) -> f32 {
    match semantic {
        Some(s) => w_semantic * s + w_lexical * lexical + w_type * type_compat,
        None => (w_lexical * lexical + w_type * type_compat) / (w_lexical + w_type),
    }
}

// =============================================================================
// DECISIONS
// =============================================================================

/// Outcome of routing a scored pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Merge without review.
    Auto,
    /// Keep and rescore when more evidence arrives.
    Defer,
    /// Queue for manual review.
    Propose,
    /// Not the same entity.
    Reject,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Auto => "auto",
            Decision::Defer => "defer",
            Decision::Propose => "propose",
            Decision::Reject => "reject",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A scored pair awaiting a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeCandidate {
    pub pair_id: PairId,
    pub id_a: Uuid,
    pub id_b: Uuid,
    /// Type of `id_a`; the type whose thresholds apply.
    pub concept_type: ConceptType,
    pub signals: SignalBreakdown,
    pub score: f32,
}

impl MergeCandidate {
    pub fn new(id_a: Uuid, id_b: Uuid, concept_type: ConceptType, signals: SignalBreakdown) -> Self {
        let score = signals.combined_score();
        Self {
            pair_id: PairId::new(id_a, id_b),
            id_a,
            id_b,
            concept_type,
            signals,
            score,
        }
    }
}

/// Live document evidence for a pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceCounters {
    pub doc_count_a: i64,
    pub doc_count_b: i64,
    pub shared_doc_count: i64,
}

impl EvidenceCounters {
    /// Documents mentioning either concept, counting shared documents once.
    pub fn combined(&self) -> i64 {
        (self.doc_count_a + self.doc_count_b - self.shared_doc_count).max(0)
    }
}

// =============================================================================
// DEFERRED CANDIDATES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferredStatus {
    #[default]
    Pending,
    Expired,
}

impl DeferredStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeferredStatus::Pending => "pending",
            DeferredStatus::Expired => "expired",
        }
    }
}

impl FromStr for DeferredStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeferredStatus::Pending),
            "expired" => Ok(DeferredStatus::Expired),
            other => Err(format!("unknown deferred status: {}", other)),
        }
    }
}

/// A DEFER outcome kept for rescoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredMergeCandidate {
    pub tenant_id: String,
    pub pair_id: PairId,
    pub id_a: Uuid,
    pub id_b: Uuid,
    pub concept_type: ConceptType,
    pub signals: SignalBreakdown,
    pub score: f32,
    pub evidence: EvidenceCounters,
    pub created_at: DateTime<Utc>,
    pub last_evaluated_at: DateTime<Utc>,
    pub evaluation_count: i32,
    pub expires_at: DateTime<Utc>,
    pub status: DeferredStatus,
}

impl DeferredMergeCandidate {
    /// Build a fresh entry for a deferred candidate.
    pub fn from_candidate(
        tenant_id: impl Into<String>,
        candidate: &MergeCandidate,
        evidence: EvidenceCounters,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            pair_id: candidate.pair_id,
            id_a: candidate.id_a,
            id_b: candidate.id_b,
            concept_type: candidate.concept_type,
            signals: candidate.signals.clone(),
            score: candidate.score,
            evidence,
            created_at: now,
            last_evaluated_at: now,
            evaluation_count: 1,
            expires_at: now + ttl,
            status: DeferredStatus::Pending,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

// =============================================================================
// PROPOSALS
// =============================================================================

/// Corpus-run candidate awaiting manual approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeProposal {
    pub id: Uuid,
    pub tenant_id: String,
    pub pair_id: PairId,
    pub id_a: Uuid,
    pub id_b: Uuid,
    pub concept_type: ConceptType,
    pub signals: SignalBreakdown,
    pub score: f32,
    pub decision_reason: String,
    pub applied: bool,
    pub applied_by: Option<String>,
    pub applied_at: Option<DateTime<Utc>>,
    pub merge_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl MergeProposal {
    pub fn from_candidate(
        tenant_id: impl Into<String>,
        candidate: &MergeCandidate,
        decision_reason: impl Into<String>,
    ) -> Self {
        Self {
            id: crate::ids::new_v7(),
            tenant_id: tenant_id.into(),
            pair_id: candidate.pair_id,
            id_a: candidate.id_a,
            id_b: candidate.id_b,
            concept_type: candidate.concept_type,
            signals: candidate.signals.clone(),
            score: candidate.score,
            decision_reason: decision_reason.into(),
            applied: false,
            applied_by: None,
            applied_at: None,
            merge_id: None,
            created_at: Utc::now(),
        }
    }

    /// The stored pair as a candidate, for re-execution.
    pub fn to_candidate(&self) -> MergeCandidate {
        MergeCandidate {
            pair_id: self.pair_id,
            id_a: self.id_a,
            id_b: self.id_b,
            concept_type: self.concept_type,
            signals: self.signals.clone(),
            score: self.score,
        }
    }
}

/// Proposal queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalCounts {
    pub total: i64,
    pub pending: i64,
    pub applied: i64,
}

// =============================================================================
// MERGE AUDIT
// =============================================================================

/// What caused a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeTrigger {
    Incremental,
    Corpus,
    Reevaluation,
    Proposal,
    Manual,
}

impl MergeTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeTrigger::Incremental => "incremental",
            MergeTrigger::Corpus => "corpus",
            MergeTrigger::Reevaluation => "reevaluation",
            MergeTrigger::Proposal => "proposal",
            MergeTrigger::Manual => "manual",
        }
    }
}

impl FromStr for MergeTrigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incremental" => Ok(MergeTrigger::Incremental),
            "corpus" => Ok(MergeTrigger::Corpus),
            "reevaluation" => Ok(MergeTrigger::Reevaluation),
            "proposal" => Ok(MergeTrigger::Proposal),
            "manual" => Ok(MergeTrigger::Manual),
            other => Err(format!("unknown merge trigger: {}", other)),
        }
    }
}

/// Ordered steps of a merge. Each can fail independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStep {
    Aliases,
    Relations,
    Claims,
    Status,
    CacheInvalidation,
}

impl MergeStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStep::Aliases => "aliases",
            MergeStep::Relations => "relations",
            MergeStep::Claims => "claims",
            MergeStep::Status => "status",
            MergeStep::CacheInvalidation => "cache_invalidation",
        }
    }
}

impl fmt::Display for MergeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Audit record of one merge attempt. Never modified after it is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeResult {
    pub merge_id: Uuid,
    pub tenant_id: String,
    pub survivor_id: Uuid,
    pub merged_id: Uuid,
    pub trigger: MergeTrigger,
    pub reason: String,
    pub score: f32,
    pub signals: Option<SignalBreakdown>,
    /// Aliases appended to the survivor (rollback removes exactly these).
    pub aliases_added: Vec<String>,
    pub relations_redirected: u64,
    /// Edges deleted because they would have become self-loops.
    pub dropped_relations: Vec<Relation>,
    pub claims_redirected: u64,
    /// Concepts whose `merged_into` was re-pointed from the merged concept to
    /// the survivor.
    pub repointed: Vec<Uuid>,
    pub success: bool,
    pub failed_step: Option<MergeStep>,
    pub error: Option<String>,
    pub executed_at: DateTime<Utc>,
}

impl MergeResult {
    /// Start a record for a merge about to run.
    pub fn pending(
        tenant_id: impl Into<String>,
        survivor_id: Uuid,
        merged_id: Uuid,
        trigger: MergeTrigger,
        reason: impl Into<String>,
        score: f32,
        signals: Option<SignalBreakdown>,
    ) -> Self {
        Self {
            merge_id: crate::ids::new_v7(),
            tenant_id: tenant_id.into(),
            survivor_id,
            merged_id,
            trigger,
            reason: reason.into(),
            score,
            signals,
            aliases_added: Vec::new(),
            relations_redirected: 0,
            dropped_relations: Vec::new(),
            claims_redirected: 0,
            repointed: Vec::new(),
            success: false,
            failed_step: None,
            error: None,
            executed_at: Utc::now(),
        }
    }

    pub fn pair_id(&self) -> PairId {
        PairId::new(self.survivor_id, self.merged_id)
    }

    pub fn aliases_migrated(&self) -> usize {
        self.aliases_added.len()
    }

    pub fn involves(&self, concept_id: Uuid) -> bool {
        self.survivor_id == concept_id || self.merged_id == concept_id
    }
}

/// Record of an undone merge, stored next to the untouched merge record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackRecord {
    pub id: Uuid,
    pub merge_id: Uuid,
    pub tenant_id: String,
    pub survivor_id: Uuid,
    pub merged_id: Uuid,
    pub aliases_removed: Vec<String>,
    pub relations_restored: u64,
    pub claims_restored: u64,
    pub repointed_restored: u64,
    pub rolled_back_by: Option<String>,
    pub rolled_back_at: DateTime<Utc>,
}

/// Merge audit counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeCounts {
    pub succeeded: i64,
    pub failed: i64,
    pub rolled_back: i64,
}

/// Aggregate counters for operator dashboards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolutionStats {
    pub tenant_id: String,
    pub concepts: ConceptStats,
    pub proposals: ProposalCounts,
    pub merges: MergeCounts,
    pub deferred_pending: i64,
}

// =============================================================================
// CACHE ENTRIES
// =============================================================================

/// Negative cache entry for a rejected pair.
///
/// `fingerprint_a` belongs to `pair_id.low()` and `fingerprint_b` to
/// `pair_id.high()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectEntry {
    pub pair_id: PairId,
    pub score: f32,
    pub fingerprint_a: String,
    pub fingerprint_b: String,
    pub reason: String,
    pub rejected_at: DateTime<Utc>,
}

/// Positive cache entry for a scored pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreCacheEntry {
    pub pair_id: PairId,
    pub score: f32,
    pub signals: SignalBreakdown,
    pub cached_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signals(lexical: f32, semantic: Option<f32>, type_compat: f32) -> SignalBreakdown {
        SignalBreakdown {
            lexical_similarity: lexical,
            embedding_similarity: semantic,
            type_compatibility: type_compat,
            degraded: semantic.is_none(),
            ..Default::default()
        }
    }

    #[test]
    fn test_combined_score_weights() {
        let s = signals(0.8, Some(0.6), 1.0);
        let expected = 0.45 * 0.6 + 0.35 * 0.8 + 0.20 * 1.0;
        assert!((s.combined_score() - expected).abs() < 1e-6);
    }

    #[test]
    fn test_combined_score_renormalizes_without_semantics() {
        let s = signals(0.8, None, 1.0);
        let expected = (0.35 * 0.8 + 0.20 * 1.0) / 0.55;
        assert!((s.combined_score() - expected).abs() < 1e-6);
        assert!(s.semantic_component().is_none());
    }

    #[test]
    fn test_semantic_component_is_mean_of_available() {
        let mut s = signals(0.0, Some(0.6), 1.0);
        s.cross_encoder_score = Some(0.8);
        assert!((s.semantic_component().unwrap() - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_decisive_lexical_floor_scales_with_type() {
        let mut s = signals(0.3, Some(0.2), 1.0);
        s.acronym_match = 1.0;
        assert!((s.combined_score() - 0.95).abs() < 1e-6);

        s.type_compatibility = 0.5;
        assert!(s.combined_score() < 0.9);
    }

    #[test]
    fn test_ranking_score_weights() {
        let s = signals(0.8, Some(0.6), 1.0);
        let expected = 0.50 * 0.6 + 0.35 * 0.8 + 0.15 * 1.0;
        assert!((s.ranking_score() - expected).abs() < 1e-6);
    }

    #[test]
    fn test_evidence_combined_counts_shared_once() {
        let e = EvidenceCounters {
            doc_count_a: 3,
            doc_count_b: 2,
            shared_doc_count: 1,
        };
        assert_eq!(e.combined(), 4);
    }

    #[test]
    fn test_deferred_entry_serde_preserves_signals() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut s = signals(0.7, Some(0.9), 1.0);
        s.alias_overlap = 0.25;
        let candidate = MergeCandidate::new(a, b, ConceptType::Standard, s);
        let evidence = EvidenceCounters {
            doc_count_a: 5,
            doc_count_b: 7,
            shared_doc_count: 2,
        };
        let entry = DeferredMergeCandidate::from_candidate(
            "t",
            &candidate,
            evidence,
            Utc::now(),
            chrono::Duration::days(30),
        );
        let json = serde_json::to_string(&entry).unwrap();
        let back: DeferredMergeCandidate = serde_json::from_str(&json).unwrap();
        assert_eq!(back.signals, entry.signals);
        assert_eq!(back.evidence, evidence);
        assert_eq!(back.pair_id, PairId::new(b, a));
    }

    #[test]
    fn test_deferred_expiry() {
        let now = Utc::now();
        let candidate = MergeCandidate::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            ConceptType::Other,
            SignalBreakdown::default(),
        );
        let entry = DeferredMergeCandidate::from_candidate(
            "t",
            &candidate,
            EvidenceCounters::default(),
            now,
            chrono::Duration::seconds(10),
        );
        assert!(!entry.is_expired(now));
        assert!(entry.is_expired(now + chrono::Duration::seconds(10)));
    }

    #[test]
    fn test_merge_step_order() {
        assert!(MergeStep::Aliases < MergeStep::Relations);
        assert!(MergeStep::Status < MergeStep::CacheInvalidation);
    }
}
