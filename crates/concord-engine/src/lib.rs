//! # concord-engine
//!
//! Entity resolution and merge engine for concord.
//!
//! This crate provides:
//! - Candidate blocking (lexical buckets plus vector neighbours)
//! - Pair scoring with score and reject caches
//! - Per-type threshold routing with safety conditions
//! - Corpus pruning, decision v2 and proposal budgets
//! - The optional LLM gate
//! - The bounded deferred queue and its reevaluation
//! - Merge execution with compensation, audit and rollback
//!
//! [`ResolutionEngine`] ties these together for one tenant.

pub mod blocking;
pub mod cancel;
pub mod config;
pub mod corpus;
pub mod deferred;
pub mod gate;
pub mod locks;
pub mod merge_store;
pub mod pipeline;
pub mod reject_store;
pub mod report;
pub mod resolver;
pub mod router;
pub mod score_cache;
pub mod scorer;

pub use blocking::{BlockingConfig, BlockingOutput, CandidateFinder};
pub use cancel::{CancelHandle, CancelSignal};
pub use config::{EngineConfig, EngineMode};
pub use corpus::{apply_budget, decide_v2, prune, CorpusConfig, PruneStats};
pub use deferred::{DeferOutcome, DeferredConfig, DeferredStore};
pub use gate::{GateConfig, GateEffect, LlmGate};
pub use locks::{MergeGuard, MergeLocks};
pub use merge_store::MergeStore;
pub use pipeline::{PipelineContext, ReevaluateOptions, ResolutionEngine};
pub use reject_store::{reject_entry, RejectStore};
pub use report::{ErrorSample, RunReport};
pub use resolver::{
    survivor_order, IdentityResolver, MergeRequest, RollbackEligibility, SurvivorStats,
};
pub use router::{route, RouteDecision, SafetyCondition, SafetyContext, ThresholdTable, TypeThresholds};
pub use score_cache::ScoreCache;
pub use scorer::{lexical_signals, PairScorer, ScoreOptions, ScoredPair};
