//! Structured logging schema and field name constants for concord.
//!
//! All crates use these constants for consistent structured logging fields,
//! so log aggregation can query a pair or a merge across every subsystem.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Run aborted, store unreachable, merge compensation failed |
//! | WARN  | Degraded path taken (lexical-only scoring, cache miss on failure, gate fail-safe) |
//! | INFO  | Run summaries, executed merges and rollbacks |
//! | DEBUG | Per-pair decisions, intermediate scores, config choices |
//! | TRACE | Per-bucket blocking detail, per-neighbour vector hits |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "engine", "db", "cache", "inference", "cli"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "blocking", "scorer", "router", "reevaluator", "resolver", "gate"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "find_candidates", "score_pair", "merge", "rollback", "reevaluate"
pub const OPERATION: &str = "op";

/// Tenant the operation runs for.
pub const TENANT_ID: &str = "tenant_id";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Order-independent pair identifier ("min|max").
pub const PAIR_ID: &str = "pair_id";

/// Concept UUID being operated on.
pub const CONCEPT_ID: &str = "concept_id";

/// Merge audit record UUID.
pub const MERGE_ID: &str = "merge_id";

/// Merge proposal UUID.
pub const PROPOSAL_ID: &str = "proposal_id";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Number of items returned or processed.
pub const RESULT_COUNT: &str = "result_count";

/// Number of candidate pairs.
pub const CANDIDATE_COUNT: &str = "candidate_count";

/// Aggregate similarity score.
pub const SCORE: &str = "score";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Routed decision (auto, defer, propose, reject).
pub const DECISION: &str = "decision";

/// Whether scoring fell back to lexical-only signals.
pub const DEGRADED: &str = "degraded";

/// Boolean success/failure indicator.
pub const SUCCESS: &str = "success";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";

/// Slow operation threshold exceeded.
pub const SLOW: &str = "slow";
