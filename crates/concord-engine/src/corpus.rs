//! Corpus-scale pruning and decision v2.
//!
//! Batch runs score every blocked pair, then prune to each concept's Top-K
//! neighbours by ranking score and keep only mutual-best pairs (or pairs
//! whose lexical evidence is near-identical). Survivors are classified by a
//! two-gate policy: reject gates first, then ascending AUTO triggers, then
//! PROPOSE triggers. Anything unclassified is rejected. PROPOSE outcomes are
//! capped per run by a budget.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use serde::Serialize;
use uuid::Uuid;

use concord_core::defaults::{
    CORPUS_LEXICAL_BYPASS, CORPUS_MIN_TYPE_COMPATIBILITY, CORPUS_TOP_K, PROPOSAL_BUDGET,
    V2_AUTO_COMBINED, V2_AUTO_COMBINED_LEXICAL_GUARD, V2_AUTO_COMBINED_SEMANTIC_GUARD,
    V2_AUTO_JOINT_LEXICAL, V2_AUTO_JOINT_SEMANTIC, V2_AUTO_LEXICAL, V2_LEXICAL_FLOOR,
    V2_PROPOSE_COMBINED, V2_PROPOSE_LEXICAL, V2_PROPOSE_LEXICAL_SEMANTIC_GUARD,
    V2_SEMANTIC_FLOOR,
};
use concord_core::{Decision, Error, MergeCandidate, PairId, Result, SignalBreakdown};

use crate::config::env_or;

/// Corpus run configuration.
#[derive(Debug, Clone)]
pub struct CorpusConfig {
    /// Neighbours kept per concept.
    pub top_k: usize,
    /// Hard floor on type compatibility.
    pub min_type_compatibility: f32,
    /// Lexical component above which mutual-best is not required.
    pub lexical_bypass: f32,
    /// PROPOSE outcomes kept per run.
    pub proposal_budget: usize,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            top_k: CORPUS_TOP_K,
            min_type_compatibility: CORPUS_MIN_TYPE_COMPATIBILITY,
            lexical_bypass: CORPUS_LEXICAL_BYPASS,
            proposal_budget: PROPOSAL_BUDGET,
        }
    }
}

impl CorpusConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `CONCORD_CORPUS_TOP_K` | `5` | Neighbours kept per concept |
    /// | `CONCORD_PROPOSAL_BUDGET` | `200` | Proposals kept per run |
    pub fn from_env() -> Self {
        Self {
            top_k: env_or("CONCORD_CORPUS_TOP_K", CORPUS_TOP_K),
            proposal_budget: env_or("CONCORD_PROPOSAL_BUDGET", PROPOSAL_BUDGET),
            ..Self::default()
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_proposal_budget(mut self, budget: usize) -> Self {
        self.proposal_budget = budget;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.top_k == 0 || self.proposal_budget == 0 {
            return Err(Error::Config(
                "corpus top_k and proposal budget must be non-zero".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_type_compatibility)
            || !(0.0..=1.0).contains(&self.lexical_bypass)
        {
            return Err(Error::Config(
                "corpus type floor and lexical bypass must be in [0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

/// Pruning counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PruneStats {
    pub input: usize,
    pub below_type_floor: usize,
    pub not_mutual_best: usize,
    /// Kept only because of the lexical bypass.
    pub bypassed: usize,
    pub kept: usize,
}

fn by_rank(a: &MergeCandidate, b: &MergeCandidate) -> Ordering {
    b.signals
        .ranking_score()
        .partial_cmp(&a.signals.ranking_score())
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.pair_id.cmp(&b.pair_id))
}

/// Keep pairs that clear the type floor and are mutual Top-K neighbours,
/// or whose lexical component reaches the bypass threshold.
///
/// Exact-name pairs are never dropped for type, so decision v2 can escalate
/// them to review instead.
pub fn prune(candidates: Vec<MergeCandidate>, config: &CorpusConfig) -> (Vec<MergeCandidate>, PruneStats) {
    let mut stats = PruneStats {
        input: candidates.len(),
        ..Default::default()
    };
    let (eligible, below): (Vec<MergeCandidate>, Vec<MergeCandidate>) =
        candidates.into_iter().partition(|c| {
            c.signals.type_compatibility >= config.min_type_compatibility
                || c.signals.exact_match >= 1.0
        });
    stats.below_type_floor = below.len();

    let mut neighbours: HashMap<Uuid, Vec<&MergeCandidate>> = HashMap::new();
    for c in &eligible {
        neighbours.entry(c.id_a).or_default().push(c);
        neighbours.entry(c.id_b).or_default().push(c);
    }
    let mut top: HashMap<Uuid, HashSet<PairId>> = HashMap::with_capacity(neighbours.len());
    for (id, mut list) in neighbours {
        list.sort_by(|a, b| by_rank(a, b));
        top.insert(id, list.iter().take(config.top_k).map(|c| c.pair_id).collect());
    }
    let in_top = |id: &Uuid, pair: &PairId| top.get(id).is_some_and(|s| s.contains(pair));

    let mut kept = Vec::with_capacity(eligible.len());
    for c in eligible {
        let mutual = in_top(&c.id_a, &c.pair_id) && in_top(&c.id_b, &c.pair_id);
        if mutual {
            kept.push(c);
        } else if c.signals.lexical_component() >= config.lexical_bypass {
            stats.bypassed += 1;
            kept.push(c);
        } else {
            stats.not_mutual_best += 1;
        }
    }
    kept.sort_by(by_rank);
    stats.kept = kept.len();
    (kept, stats)
}

/// Classify a pruned pair. Returns the decision and the name of the rule
/// that fired.
///
/// A lexical-only breakdown never merges automatically: an AUTO outcome is
/// held at PROPOSE for review.
pub fn decide_v2(signals: &SignalBreakdown, min_type_compatibility: f32) -> (Decision, &'static str) {
    match classify(signals, min_type_compatibility) {
        (Decision::Auto, _) if signals.degraded => (Decision::Propose, "degraded_no_semantic"),
        outcome => outcome,
    }
}

fn classify(signals: &SignalBreakdown, min_type_compatibility: f32) -> (Decision, &'static str) {
    let lexical = signals.lexical_component();
    let semantic = signals.semantic_or_zero();
    let combined = signals.combined_score();

    // Reject gates
    if signals.type_compatibility < min_type_compatibility {
        return if signals.exact_match >= 1.0 {
            (Decision::Propose, "exact_name_incompatible_types")
        } else {
            (Decision::Reject, "incompatible_types")
        };
    }
    if lexical < V2_LEXICAL_FLOOR && semantic < V2_SEMANTIC_FLOOR {
        return (Decision::Reject, "weak_lexical_and_semantic");
    }

    // AUTO triggers, ascending
    if lexical >= V2_AUTO_LEXICAL {
        return (Decision::Auto, "near_identical_lexical");
    }
    if lexical >= V2_AUTO_JOINT_LEXICAL && semantic >= V2_AUTO_JOINT_SEMANTIC {
        return (Decision::Auto, "strong_lexical_and_semantic");
    }
    if combined >= V2_AUTO_COMBINED
        && lexical >= V2_AUTO_COMBINED_LEXICAL_GUARD
        && semantic >= V2_AUTO_COMBINED_SEMANTIC_GUARD
    {
        return (Decision::Auto, "high_combined_guarded");
    }

    // PROPOSE triggers
    if lexical >= V2_PROPOSE_LEXICAL && semantic >= V2_PROPOSE_LEXICAL_SEMANTIC_GUARD {
        return (Decision::Propose, "strong_lexical");
    }
    if combined >= V2_PROPOSE_COMBINED {
        return (Decision::Propose, "high_combined");
    }

    (Decision::Reject, "unclassified")
}

/// Keep the `budget` highest-scoring proposals (ties by pair id). Returns
/// the kept proposals and how many were dropped.
pub fn apply_budget<T>(mut proposals: Vec<T>, budget: usize, key: impl Fn(&T) -> (f32, PairId)) -> (Vec<T>, usize) {
    proposals.sort_by(|a, b| {
        let (sa, pa) = key(a);
        let (sb, pb) = key(b);
        sb.partial_cmp(&sa)
            .unwrap_or(Ordering::Equal)
            .then_with(|| pa.cmp(&pb))
    });
    let dropped = proposals.len().saturating_sub(budget);
    proposals.truncate(budget);
    (proposals, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::ConceptType;

    fn signals(lexical: f32, semantic: Option<f32>, type_compat: f32) -> SignalBreakdown {
        SignalBreakdown {
            lexical_similarity: lexical,
            embedding_similarity: semantic,
            type_compatibility: type_compat,
            ..Default::default()
        }
    }

    fn cand(a: Uuid, b: Uuid, lexical: f32, semantic: f32) -> MergeCandidate {
        MergeCandidate::new(a, b, ConceptType::Technology, signals(lexical, Some(semantic), 1.0))
    }

    #[test]
    fn test_reject_gates_fire_first() {
        let (d, why) = decide_v2(&signals(0.99, Some(0.99), 0.1), 0.5);
        assert_eq!((d, why), (Decision::Reject, "incompatible_types"));

        let mut exact = signals(1.0, Some(0.9), 0.1);
        exact.exact_match = 1.0;
        assert_eq!(decide_v2(&exact, 0.5).0, Decision::Propose);

        assert_eq!(decide_v2(&signals(0.4, Some(0.5), 1.0), 0.5).1, "weak_lexical_and_semantic");
    }

    #[test]
    fn test_auto_triggers() {
        assert_eq!(decide_v2(&signals(0.98, None, 1.0), 0.5).1, "near_identical_lexical");
        assert_eq!(decide_v2(&signals(0.91, Some(0.92), 1.0), 0.5).1, "strong_lexical_and_semantic");
        // combined = 0.45 + 0.35 * 0.75 + 0.2 = 0.9125: below the combined AUTO trigger.
        assert_ne!(decide_v2(&signals(0.75, Some(1.0), 1.0), 0.5).0, Decision::Auto);
    }

    #[test]
    fn test_degraded_breakdown_is_held_for_review() {
        // "ISO 27001" vs "ISO 27002" scored without embeddings.
        let mut degraded = signals(0.98, None, 1.0);
        degraded.degraded = true;
        assert_eq!(decide_v2(&degraded, 0.5), (Decision::Propose, "degraded_no_semantic"));

        // Reject gates still apply.
        let mut weak = signals(0.3, None, 1.0);
        weak.degraded = true;
        assert_eq!(decide_v2(&weak, 0.5).0, Decision::Reject);
    }

    #[test]
    fn test_propose_triggers_and_default_reject() {
        assert_eq!(decide_v2(&signals(0.86, Some(0.72), 1.0), 0.5), (Decision::Propose, "strong_lexical"));
        // combined = 0.45 * 0.95 + 0.35 * 0.6 + 0.2 = 0.8375
        assert_eq!(decide_v2(&signals(0.6, Some(0.95), 1.0), 0.5), (Decision::Reject, "unclassified"));
        // combined = 0.45 * 0.98 + 0.35 * 0.7 + 0.2 = 0.886
        assert_eq!(decide_v2(&signals(0.7, Some(0.98), 1.0), 0.5), (Decision::Propose, "high_combined"));
    }

    #[test]
    fn test_prune_keeps_mutual_best_only() {
        let ids: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        let hub = ids[0];
        // Every spoke's best neighbour is the hub, but the hub keeps only its top 1.
        let candidates = vec![
            cand(hub, ids[1], 0.80, 0.90),
            cand(hub, ids[2], 0.70, 0.80),
            cand(hub, ids[3], 0.60, 0.70),
        ];
        let config = CorpusConfig::default().with_top_k(1);
        let (kept, stats) = prune(candidates, &config);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].pair_id, PairId::new(hub, ids[1]));
        assert_eq!(stats.not_mutual_best, 2);
    }

    #[test]
    fn test_prune_lexical_bypass_and_type_floor() {
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        let near_identical = cand(ids[0], ids[2], 0.95, 0.10);
        let incompatible = MergeCandidate::new(
            ids[1],
            ids[2],
            ConceptType::Person,
            signals(0.9, Some(0.9), 0.1),
        );
        let config = CorpusConfig::default().with_top_k(1);
        let (kept, stats) = prune(
            vec![cand(ids[0], ids[1], 0.9, 0.95), near_identical.clone(), incompatible],
            &config,
        );
        assert_eq!(stats.below_type_floor, 1);
        assert_eq!(stats.bypassed, 1);
        assert!(kept.iter().any(|c| c.pair_id == near_identical.pair_id));
    }

    #[test]
    fn test_budget_keeps_top_scores_deterministically() {
        let a = Uuid::new_v4();
        let proposals: Vec<MergeCandidate> = (0..5)
            .map(|i| cand(a, Uuid::new_v4(), 0.5 + i as f32 * 0.05, 0.9))
            .collect();
        let best = proposals[4].pair_id;
        let (kept, dropped) = apply_budget(proposals, 2, |c| (c.score, c.pair_id));
        assert_eq!(kept.len(), 2);
        assert_eq!(dropped, 3);
        assert_eq!(kept[0].pair_id, best);
        assert!(kept[0].score >= kept[1].score);
    }
}
