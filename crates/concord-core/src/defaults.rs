//! Centralized default constants for concord.
//!
//! **This module is the single source of truth** for shared default values.
//! Thresholds elsewhere are calibrated against the weight constants below, so
//! changing a weight means re-calibrating the threshold tables with it.

// =============================================================================
// SCORING WEIGHTS
// =============================================================================

/// Semantic share of the combined similarity score.
pub const COMBINED_SEMANTIC_WEIGHT: f32 = 0.45;

/// Lexical share of the combined similarity score.
pub const COMBINED_LEXICAL_WEIGHT: f32 = 0.35;

/// Type-compatibility share of the combined similarity score.
pub const COMBINED_TYPE_WEIGHT: f32 = 0.20;

/// Semantic share of the ranking score used only for corpus pruning.
pub const RANKING_SEMANTIC_WEIGHT: f32 = 0.50;

/// Lexical share of the ranking score used only for corpus pruning.
pub const RANKING_LEXICAL_WEIGHT: f32 = 0.35;

/// Type-compatibility share of the ranking score used only for corpus pruning.
pub const RANKING_TYPE_WEIGHT: f32 = 0.15;

/// Aggregate floor when the names match exactly after normalization or by acronym.
///
/// Multiplied by type compatibility, so decisive lexical evidence never
/// lifts a cross-type pair on its own.
pub const DECISIVE_LEXICAL_SCORE: f32 = 0.95;

// =============================================================================
// TYPE COMPATIBILITY
// =============================================================================

/// Compatibility for type combinations absent from the compatibility table.
pub const DEFAULT_TYPE_COMPATIBILITY: f32 = 0.1;

/// Compatibility of the `other` escape type against any type.
pub const OTHER_TYPE_COMPATIBILITY: f32 = 0.5;

/// Minimum compatibility for blocking to pair two concepts at all.
pub const BLOCKING_MIN_TYPE_COMPATIBILITY: f32 = 0.5;

// =============================================================================
// BLOCKING
// =============================================================================

/// Default nearest-neighbour count per concept.
pub const BLOCKING_TOP_K: usize = 10;

/// Neighbour counts for types that differ from [`BLOCKING_TOP_K`]. Short
/// person and place names crowd the neighbourhood with unrelated hits;
/// products and technologies carry many legitimate version variants.
pub const BLOCKING_TYPE_TOP_K: [(crate::ConceptType, usize); 4] = [
    (crate::ConceptType::Person, 5),
    (crate::ConceptType::Location, 5),
    (crate::ConceptType::Product, 15),
    (crate::ConceptType::Technology, 15),
];

/// Minimum cosine similarity for a vector neighbour to become a candidate.
pub const BLOCKING_MIN_VECTOR_SIMILARITY: f32 = 0.75;

/// Characters of the lexical key used by the prefix index.
pub const BLOCKING_PREFIX_LEN: usize = 5;

/// Buckets larger than this are skipped (they carry no discriminating signal).
pub const BLOCKING_MAX_BUCKET_SIZE: usize = 50;

/// Keys longer than this are not expanded into edit-distance variants.
pub const BLOCKING_MAX_EDIT_KEY_LEN: usize = 40;

// =============================================================================
// CORPUS PRUNING AND DECISION V2
// =============================================================================

/// Neighbours kept per concept when pruning a corpus run.
pub const CORPUS_TOP_K: usize = 5;

/// Hard floor on type compatibility for corpus pairs.
pub const CORPUS_MIN_TYPE_COMPATIBILITY: f32 = 0.5;

/// Lexical score above which a pair bypasses the mutual-best requirement.
pub const CORPUS_LEXICAL_BYPASS: f32 = 0.92;

/// Lexical floor for the joint reject gate.
pub const V2_LEXICAL_FLOOR: f32 = 0.50;

/// Semantic floor for the joint reject gate.
pub const V2_SEMANTIC_FLOOR: f32 = 0.60;

/// Near-identical lexical trigger for AUTO.
pub const V2_AUTO_LEXICAL: f32 = 0.97;

/// Joint lexical trigger for AUTO.
pub const V2_AUTO_JOINT_LEXICAL: f32 = 0.90;

/// Joint semantic trigger for AUTO.
pub const V2_AUTO_JOINT_SEMANTIC: f32 = 0.90;

/// Combined-score trigger for AUTO.
pub const V2_AUTO_COMBINED: f32 = 0.95;

/// Per-signal lexical guard on the combined AUTO trigger.
pub const V2_AUTO_COMBINED_LEXICAL_GUARD: f32 = 0.70;

/// Per-signal semantic guard on the combined AUTO trigger.
pub const V2_AUTO_COMBINED_SEMANTIC_GUARD: f32 = 0.85;

/// Lexical trigger for PROPOSE.
pub const V2_PROPOSE_LEXICAL: f32 = 0.85;

/// Semantic guard on the lexical PROPOSE trigger.
pub const V2_PROPOSE_LEXICAL_SEMANTIC_GUARD: f32 = 0.70;

/// Combined-score trigger for PROPOSE.
pub const V2_PROPOSE_COMBINED: f32 = 0.85;

/// Maximum PROPOSE_ONLY candidates kept per corpus run.
pub const PROPOSAL_BUDGET: usize = 200;

// =============================================================================
// CACHES
// =============================================================================

/// Score cache TTL in seconds (6 hours).
pub const SCORE_CACHE_TTL_SECS: u64 = 6 * 60 * 60;

/// Reject store TTL in seconds (90 days).
pub const REJECT_TTL_SECS: u64 = 90 * 24 * 60 * 60;

/// Key prefix shared by every cache entry.
pub const CACHE_KEY_PREFIX: &str = "concord";

// =============================================================================
// DEFERRED QUEUE
// =============================================================================

/// Deferred candidate lifetime in seconds (30 days).
pub const DEFER_TTL_SECS: u64 = 30 * 24 * 60 * 60;

/// Maximum pending deferred candidates per tenant.
pub const DEFER_MAX_QUEUE: usize = 5_000;

/// Run reevaluation after this many newly ingested documents.
pub const REEVAL_EVERY_DOCS: u64 = 50;

/// Maximum deferred candidates processed per reevaluation batch.
pub const REEVAL_BATCH_LIMIT: usize = 500;

// =============================================================================
// LLM GATE
// =============================================================================

/// Pairs per gate request.
pub const GATE_BATCH_SIZE: usize = 10;

/// Concurrent gate requests in flight.
pub const GATE_MAX_CONCURRENCY: usize = 2;

/// DISTINCT verdicts at or above this confidence block auto-merge.
pub const GATE_DISTINCT_BLOCK_CONFIDENCE: f32 = 0.8;

/// MERGE verdicts below this confidence lose AUTO eligibility.
pub const GATE_MERGE_CONFIRM_CONFIDENCE: f32 = 0.7;

/// Confidence of the verdict used when the gate cannot answer.
pub const GATE_FAIL_SAFE_CONFIDENCE: f32 = 0.5;

/// Timeout for one gate batch in seconds.
pub const GATE_TIMEOUT_SECS: u64 = 60;

// =============================================================================
// CONCURRENCY AND TIMEOUTS
// =============================================================================

/// Concurrent pair scorings per run.
pub const SCORING_CONCURRENCY: usize = 8;

/// Timeout for embedding, vector search and cross-encoder calls in seconds.
pub const EXTERNAL_TIMEOUT_SECS: u64 = 15;

/// Maximum error messages kept in a run report.
pub const ERROR_SAMPLE_LIMIT: usize = 10;

// =============================================================================
// INFERENCE
// =============================================================================

/// Default Ollama base URL.
pub const OLLAMA_URL: &str = "http://127.0.0.1:11434";

/// Default embedding model name (Ollama).
pub const EMBED_MODEL: &str = "nomic-embed-text";

/// Default embedding vector dimension for nomic-embed-text.
pub const EMBED_DIMENSION: usize = 768;

/// Default generation model used by the semantic gate.
pub const GEN_MODEL: &str = "qwen2.5:7b-instruct";

/// Timeout for embedding requests in seconds.
pub const EMBED_TIMEOUT_SECS: u64 = 30;

/// Timeout for generation requests in seconds.
pub const GEN_TIMEOUT_SECS: u64 = 120;

/// Generation or embedding slower than this logs a slow-operation warning.
pub const SLOW_CALL_MS: u64 = 5_000;

// =============================================================================
// TENANCY
// =============================================================================

/// Tenant used when none is given.
pub const DEFAULT_TENANT: &str = "default";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combined_weights_sum_to_one() {
        let sum = COMBINED_SEMANTIC_WEIGHT + COMBINED_LEXICAL_WEIGHT + COMBINED_TYPE_WEIGHT;
        assert!((sum - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_ranking_weights_sum_to_one() {
        let sum = RANKING_SEMANTIC_WEIGHT + RANKING_LEXICAL_WEIGHT + RANKING_TYPE_WEIGHT;
        assert!((sum - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_auto_triggers_ascend() {
        assert!(V2_AUTO_JOINT_LEXICAL < V2_AUTO_LEXICAL);
        assert!(V2_PROPOSE_LEXICAL < V2_AUTO_JOINT_LEXICAL);
        assert!(V2_PROPOSE_COMBINED < V2_AUTO_COMBINED);
    }

    #[test]
    fn test_gate_thresholds_are_probabilities() {
        for t in [
            GATE_DISTINCT_BLOCK_CONFIDENCE,
            GATE_MERGE_CONFIRM_CONFIDENCE,
            GATE_FAIL_SAFE_CONFIDENCE,
        ] {
            assert!((0.0..=1.0).contains(&t));
        }
        // The fail-safe verdict must never confirm an auto-merge.
        assert!(GATE_FAIL_SAFE_CONFIDENCE < GATE_MERGE_CONFIRM_CONFIDENCE);
    }

    #[test]
    fn test_reject_ttl_outlives_score_ttl() {
        assert!(REJECT_TTL_SECS > SCORE_CACHE_TTL_SECS);
    }
}
