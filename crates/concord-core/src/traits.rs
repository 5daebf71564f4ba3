//! Collaborator traits for the resolution engine.
//!
//! The engine talks to its graph store, vector index, cache and inference
//! endpoints only through these traits, so concrete backends (PostgreSQL,
//! Redis, Ollama, in-memory) are chosen when the pipeline context is built.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::concept::{CanonicalConcept, Claim, ConceptStats, ConceptStatus, ConceptType, Relation};
use crate::error::Result;
use crate::ids::PairId;
use crate::resolution::{
    DeferredMergeCandidate, MergeCounts, MergeProposal, MergeResult, ProposalCounts,
    RollbackRecord,
};

// =============================================================================
// GRAPH STORE
// =============================================================================

/// Outcome of redirecting a concept's edges onto another concept.
#[derive(Debug, Clone, Default)]
pub struct RelationRedirect {
    /// Edges whose endpoint was rewritten.
    pub redirected: u64,
    /// Edges deleted because they would have become self-loops, as they were
    /// before the merge.
    pub dropped: Vec<Relation>,
}

/// Transactional property graph holding concepts, edges, claims and
/// document mentions.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Create indexes on id and type. Idempotent.
    async fn ensure_indexes(&self) -> Result<()>;

    /// Insert or replace a concept by id.
    async fn upsert_concept(&self, concept: &CanonicalConcept) -> Result<()>;

    /// Fetch one concept.
    async fn get_concept(&self, tenant_id: &str, id: Uuid) -> Result<Option<CanonicalConcept>>;

    /// Fetch several concepts; missing ids are skipped.
    async fn get_concepts(&self, tenant_id: &str, ids: &[Uuid]) -> Result<Vec<CanonicalConcept>>;

    /// Active concepts of the given types (all types when `types` is empty).
    async fn list_active_concepts(
        &self,
        tenant_id: &str,
        types: &[ConceptType],
    ) -> Result<Vec<CanonicalConcept>>;

    /// Replace a concept's alias list.
    async fn set_aliases(&self, tenant_id: &str, id: Uuid, aliases: &[String]) -> Result<()>;

    /// Update status and merge pointer together.
    async fn set_status(
        &self,
        tenant_id: &str,
        id: Uuid,
        status: ConceptStatus,
        merged_into: Option<Uuid>,
        merged_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Ids of concepts whose `merged_into` is `target`.
    async fn list_merged_into(&self, tenant_id: &str, target: Uuid) -> Result<Vec<Uuid>>;

    /// Point `merged_into` of the given concepts at `target`.
    async fn repoint_merged_into(&self, tenant_id: &str, ids: &[Uuid], target: Uuid)
        -> Result<u64>;

    /// Outgoing and incoming edges of a concept.
    async fn relations_of(&self, tenant_id: &str, id: Uuid) -> Result<Vec<Relation>>;

    /// Number of edges touching a concept.
    async fn count_relations(&self, tenant_id: &str, id: Uuid) -> Result<i64>;

    async fn insert_relation(&self, relation: &Relation) -> Result<()>;

    async fn delete_relation(&self, tenant_id: &str, id: Uuid) -> Result<()>;

    /// Rewrite every edge endpoint `from` to `to`, pushing a provenance tag
    /// for `merge_id`. Edges that would become self-loops are deleted and
    /// returned.
    async fn redirect_relations(
        &self,
        tenant_id: &str,
        from: Uuid,
        to: Uuid,
        merge_id: Uuid,
    ) -> Result<RelationRedirect>;

    /// Undo `redirect_relations` for one merge by popping its provenance tags.
    async fn restore_relations(&self, tenant_id: &str, merge_id: Uuid) -> Result<u64>;

    async fn insert_claim(&self, claim: &Claim) -> Result<()>;

    /// Claims referencing a concept as subject or object.
    async fn claims_of(&self, tenant_id: &str, id: Uuid) -> Result<Vec<Claim>>;

    /// Rewrite claim subject/object `from` to `to`, pushing a provenance tag.
    async fn redirect_claims(&self, tenant_id: &str, from: Uuid, to: Uuid, merge_id: Uuid)
        -> Result<u64>;

    /// Undo `redirect_claims` for one merge.
    async fn restore_claims(&self, tenant_id: &str, merge_id: Uuid) -> Result<u64>;

    /// Record that a document mentions a concept. Idempotent.
    async fn add_document_mention(&self, tenant_id: &str, concept_id: Uuid, document_id: Uuid)
        -> Result<()>;

    /// Distinct documents mentioning a concept.
    async fn document_count(&self, tenant_id: &str, id: Uuid) -> Result<i64>;

    /// Distinct documents mentioning both concepts.
    async fn shared_document_count(&self, tenant_id: &str, a: Uuid, b: Uuid) -> Result<i64>;

    async fn concept_stats(&self, tenant_id: &str) -> Result<ConceptStats>;
}

// =============================================================================
// VECTOR INDEX
// =============================================================================

/// One nearest-neighbour hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorHit {
    pub concept_id: Uuid,
    pub concept_type: ConceptType,
    /// Cosine similarity in [0, 1].
    pub similarity: f32,
}

/// Nearest-neighbour index over concept embeddings.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(
        &self,
        tenant_id: &str,
        concept_id: Uuid,
        concept_type: ConceptType,
        vector: &[f32],
    ) -> Result<()>;

    async fn get_vector(&self, tenant_id: &str, concept_id: Uuid) -> Result<Option<Vec<f32>>>;

    /// Up to `top_k` neighbours of `vector`, best first, restricted to the
    /// tenant and (when non-empty) the given types.
    async fn search(
        &self,
        tenant_id: &str,
        vector: &[f32],
        types: &[ConceptType],
        top_k: usize,
    ) -> Result<Vec<VectorHit>>;

    async fn remove(&self, tenant_id: &str, concept_id: Uuid) -> Result<()>;
}

// =============================================================================
// KEY-VALUE CACHE
// =============================================================================

/// Key-value cache with expiry and pattern deletion.
#[async_trait]
pub trait KeyValueCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Atomically set a value with a TTL.
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Delete every key matching a glob pattern. Returns the number deleted.
    async fn delete_pattern(&self, pattern: &str) -> Result<u64>;
}

// =============================================================================
// INFERENCE TRAITS
// =============================================================================

/// Backend for generating text embeddings.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Generate embeddings for the given texts, one vector per text.
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Expected dimension of embedding vectors.
    fn dimension(&self) -> usize;

    fn model_name(&self) -> &str;
}

/// Backend for text generation (LLM).
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Generate text given a prompt.
    async fn generate(&self, prompt: &str) -> Result<String>;

    /// Generate text with system context.
    async fn generate_with_system(&self, system: &str, prompt: &str) -> Result<String>;

    fn model_name(&self) -> &str;
}

/// Pairwise relevance scorer that encodes both texts jointly.
#[async_trait]
pub trait CrossEncoder: Send + Sync {
    /// Relevance of `a` and `b` in [0, 1].
    async fn score(&self, a: &str, b: &str) -> Result<f32>;

    fn model_name(&self) -> &str;
}

// =============================================================================
// RESOLUTION REPOSITORIES
// =============================================================================

/// Persistence for deferred candidates.
#[async_trait]
pub trait DeferredRepository: Send + Sync {
    /// Insert a new entry, or update an existing one in place. An update
    /// keeps the stored `created_at` and `expires_at`, and the stored
    /// `evaluation_count` never goes backwards: it becomes the larger of the
    /// incoming count and the stored count plus one. Returns true on insert.
    async fn upsert(&self, entry: &DeferredMergeCandidate) -> Result<bool>;

    async fn get(&self, tenant_id: &str, pair_id: &PairId)
        -> Result<Option<DeferredMergeCandidate>>;

    async fn delete(&self, tenant_id: &str, pair_id: &PairId) -> Result<bool>;

    /// Delete every entry involving a concept.
    async fn delete_for_concept(&self, tenant_id: &str, concept_id: Uuid) -> Result<u64>;

    async fn count_pending(&self, tenant_id: &str) -> Result<i64>;

    /// Oldest pending entries by `created_at`.
    async fn oldest_pending(&self, tenant_id: &str, limit: usize)
        -> Result<Vec<DeferredMergeCandidate>>;

    /// Pending, unexpired entries, oldest evaluation first, optionally only
    /// those whose stored combined document count is at least `min_docs`.
    async fn list_pending(
        &self,
        tenant_id: &str,
        now: DateTime<Utc>,
        min_docs: Option<i64>,
        limit: usize,
    ) -> Result<Vec<DeferredMergeCandidate>>;

    /// Delete and return every entry with `expires_at <= now`.
    async fn purge_expired(&self, tenant_id: &str, now: DateTime<Utc>)
        -> Result<Vec<DeferredMergeCandidate>>;
}

/// Persistence for corpus-run merge proposals.
#[async_trait]
pub trait ProposalRepository: Send + Sync {
    /// Insert a proposal. A pending proposal for the same pair is replaced.
    async fn insert(&self, proposal: &MergeProposal) -> Result<()>;

    async fn get(&self, tenant_id: &str, id: Uuid) -> Result<Option<MergeProposal>>;

    /// Pending proposals, highest score first.
    async fn list_pending(&self, tenant_id: &str, limit: usize) -> Result<Vec<MergeProposal>>;

    async fn mark_applied(
        &self,
        tenant_id: &str,
        id: Uuid,
        applied_by: &str,
        applied_at: DateTime<Utc>,
        merge_id: Uuid,
    ) -> Result<()>;

    async fn counts(&self, tenant_id: &str) -> Result<ProposalCounts>;
}

/// Append-only merge and rollback audit log.
#[async_trait]
pub trait MergeAuditRepository: Send + Sync {
    async fn record_merge(&self, result: &MergeResult) -> Result<()>;

    async fn get_merge(&self, tenant_id: &str, merge_id: Uuid) -> Result<Option<MergeResult>>;

    /// Most recent successful, not rolled back merge whose survivor or merged
    /// concept is `concept_id`.
    async fn latest_merge_touching(&self, tenant_id: &str, concept_id: Uuid)
        -> Result<Option<MergeResult>>;

    /// Every merge attempt involving a concept, newest first.
    async fn merge_history(&self, tenant_id: &str, concept_id: Uuid) -> Result<Vec<MergeResult>>;

    async fn record_rollback(&self, record: &RollbackRecord) -> Result<()>;

    async fn get_rollback(&self, tenant_id: &str, merge_id: Uuid)
        -> Result<Option<RollbackRecord>>;

    async fn counts(&self, tenant_id: &str) -> Result<MergeCounts>;
}
