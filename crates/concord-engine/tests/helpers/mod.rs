//! Test helpers for engine integration tests.
//!
//! Wires a [`ResolutionEngine`] over the in-memory stores so tests can
//! inspect and fault the stores directly.

#![allow(dead_code)]

use std::sync::Arc;

use concord_db::{
    CanonicalConcept, ConceptType, InMemoryVectorIndex, MemoryCache, MemoryDeferredRepository,
    MemoryGraphStore, MemoryMergeAuditRepository, MemoryProposalRepository,
};
use concord_engine::{EngineConfig, PipelineContext, ResolutionEngine};

pub const TENANT: &str = "acme";

/// In-memory stores shared by an engine and the test body.
pub struct Harness {
    pub graph: Arc<MemoryGraphStore>,
    pub vectors: Arc<InMemoryVectorIndex>,
    pub cache: Arc<MemoryCache>,
    pub deferred: Arc<MemoryDeferredRepository>,
    pub proposals: Arc<MemoryProposalRepository>,
    pub audit: Arc<MemoryMergeAuditRepository>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            graph: Arc::new(MemoryGraphStore::new()),
            vectors: Arc::new(InMemoryVectorIndex::new()),
            cache: Arc::new(MemoryCache::new()),
            deferred: Arc::new(MemoryDeferredRepository::new()),
            proposals: Arc::new(MemoryProposalRepository::new()),
            audit: Arc::new(MemoryMergeAuditRepository::new()),
        }
    }

    /// Stores plus the key-value cache; no vectors or model backends.
    pub fn context(&self) -> PipelineContext {
        PipelineContext::new(
            self.graph.clone(),
            self.deferred.clone(),
            self.proposals.clone(),
            self.audit.clone(),
        )
        .with_cache(self.cache.clone())
    }

    pub fn engine(&self, ctx: PipelineContext, config: EngineConfig) -> ResolutionEngine {
        ResolutionEngine::new(ctx, config).expect("valid engine config")
    }
}

pub fn config() -> EngineConfig {
    EngineConfig::default().with_tenant(TENANT)
}

pub fn concept(name: &str, concept_type: ConceptType) -> CanonicalConcept {
    CanonicalConcept::new(TENANT, name, concept_type)
}

/// Unit vector along one axis.
pub fn axis(i: usize) -> Vec<f32> {
    let mut v = vec![0.0; 4];
    v[i] = 1.0;
    v
}
