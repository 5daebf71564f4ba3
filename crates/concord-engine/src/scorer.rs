//! Multi-signal pair scoring.
//!
//! Lexical signals are computed in-process. The embedding signal comes from
//! the vector index (or a fresh embedding), and the cross-encoder signal from
//! the cross-encoder backend, each under a timeout. When neither semantic
//! signal is available the breakdown is flagged `degraded` and the combined
//! score is re-normalized over the lexical and type weights.
//!
//! Exact or acronym matches are decisive on their own, so the cross-encoder
//! is skipped for them.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use concord_core::lexical::{
    acronym_match, alias_overlap, cosine_similarity, exact_normalized_match, string_similarity,
};
use concord_core::{
    type_compatibility, CanonicalConcept, CrossEncoder, EmbeddingBackend, MergeCandidate, PairId,
    SignalBreakdown, VectorIndex,
};

use crate::score_cache::ScoreCache;

/// Per-call scoring options.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreOptions {
    /// Skip the score cache and stored vectors; used when the underlying text
    /// may have changed since the last score.
    pub bypass_cache: bool,
}

impl ScoreOptions {
    pub fn fresh() -> Self {
        Self { bypass_cache: true }
    }
}

/// A scored candidate and where its signals came from.
#[derive(Debug, Clone)]
pub struct ScoredPair {
    pub candidate: MergeCandidate,
    pub from_cache: bool,
}

/// Signals that need no external call.
pub fn lexical_signals(a: &CanonicalConcept, b: &CanonicalConcept) -> SignalBreakdown {
    let exact = exact_normalized_match(&a.canonical_name, &b.canonical_name);
    SignalBreakdown {
        exact_match: if exact { 1.0 } else { 0.0 },
        acronym_match: acronym_match(&a.canonical_name, &b.canonical_name),
        alias_overlap: alias_overlap(&a.all_names(), &b.all_names()),
        embedding_similarity: None,
        cross_encoder_score: None,
        type_compatibility: type_compatibility(a.concept_type, b.concept_type),
        lexical_similarity: string_similarity(&a.canonical_name, &b.canonical_name),
        degraded: false,
        cross_encoder_skipped: false,
    }
}

/// Scores candidate pairs, consulting and refreshing the score cache.
pub struct PairScorer {
    embedder: Option<Arc<dyn EmbeddingBackend>>,
    cross_encoder: Option<Arc<dyn CrossEncoder>>,
    vectors: Option<Arc<dyn VectorIndex>>,
    cache: ScoreCache,
    tenant_id: String,
    call_timeout: Duration,
}

impl PairScorer {
    pub fn new(
        tenant_id: impl Into<String>,
        cache: ScoreCache,
        call_timeout: Duration,
    ) -> Self {
        Self {
            embedder: None,
            cross_encoder: None,
            vectors: None,
            cache,
            tenant_id: tenant_id.into(),
            call_timeout,
        }
    }

    pub fn with_embedder(mut self, embedder: Option<Arc<dyn EmbeddingBackend>>) -> Self {
        self.embedder = embedder;
        self
    }

    pub fn with_cross_encoder(mut self, cross_encoder: Option<Arc<dyn CrossEncoder>>) -> Self {
        self.cross_encoder = cross_encoder;
        self
    }

    pub fn with_vectors(mut self, vectors: Option<Arc<dyn VectorIndex>>) -> Self {
        self.vectors = vectors;
        self
    }

    /// Score one pair. Never fails: unavailable backends degrade the result.
    ///
    /// The returned candidate is ordered by pair id, so `id_a` is always
    /// `pair_id.low()` and the type that applies is that concept's type.
    #[instrument(skip(self, a, b), fields(subsystem = "engine", component = "scorer", op = "score_pair", pair_id = tracing::field::Empty, score = tracing::field::Empty, degraded = tracing::field::Empty))]
    pub async fn score(
        &self,
        a: &CanonicalConcept,
        b: &CanonicalConcept,
        options: ScoreOptions,
    ) -> ScoredPair {
        let pair_id = PairId::new(a.id, b.id);
        let (a, b) = if a.id == pair_id.low() { (a, b) } else { (b, a) };
        let span = tracing::Span::current();
        span.record("pair_id", tracing::field::display(&pair_id));

        if !options.bypass_cache {
            if let Some(entry) = self.cache.get(&pair_id).await {
                let candidate = MergeCandidate::new(a.id, b.id, a.concept_type, entry.signals);
                span.record("score", candidate.score);
                return ScoredPair {
                    candidate,
                    from_cache: true,
                };
            }
        }

        let mut signals = lexical_signals(a, b);
        let decisive = signals.is_decisive_lexical();

        let (embedding, cross) = tokio::join!(
            self.embedding_similarity(a, b, options.bypass_cache),
            async {
                if decisive {
                    None
                } else {
                    self.cross_encoder_score(a, b).await
                }
            }
        );
        signals.embedding_similarity = embedding;
        signals.cross_encoder_score = cross;
        signals.cross_encoder_skipped = decisive && self.cross_encoder.is_some();
        signals.degraded = embedding.is_none() && cross.is_none();

        let candidate = MergeCandidate::new(a.id, b.id, a.concept_type, signals);
        span.record("score", candidate.score);
        span.record("degraded", candidate.signals.degraded);
        debug!(
            lexical = candidate.signals.lexical_component(),
            semantic = ?candidate.signals.semantic_component(),
            "Scored pair"
        );
        // A lexical-only score would outlive the backend outage.
        if !candidate.signals.degraded {
            self.cache
                .put(&pair_id, candidate.score, &candidate.signals)
                .await;
        }
        ScoredPair {
            candidate,
            from_cache: false,
        }
    }

    async fn embedding_similarity(
        &self,
        a: &CanonicalConcept,
        b: &CanonicalConcept,
        fresh: bool,
    ) -> Option<f32> {
        let (va, vb) = tokio::join!(self.embedding_for(a, fresh), self.embedding_for(b, fresh));
        Some(cosine_similarity(&va?, &vb?))
    }

    /// Stored vector, or a fresh embedding written back to the index.
    async fn embedding_for(&self, concept: &CanonicalConcept, fresh: bool) -> Option<Vec<f32>> {
        if !fresh {
            if let Some(vectors) = &self.vectors {
                match timeout(self.call_timeout, vectors.get_vector(&self.tenant_id, concept.id)).await {
                    Ok(Ok(Some(v))) => return Some(v),
                    Ok(Ok(None)) => {}
                    Ok(Err(e)) => {
                        warn!(concept_id = %concept.id, error = %e, "Vector lookup failed, embedding directly")
                    }
                    Err(_) => warn!(concept_id = %concept.id, "Vector lookup timed out, embedding directly"),
                }
            }
        }

        let embedder = self.embedder.as_ref()?;
        let texts = vec![concept.embedding_text()];
        let vector = match timeout(self.call_timeout, embedder.embed_texts(&texts)).await {
            Ok(Ok(mut out)) if !out.is_empty() => out.swap_remove(0),
            Ok(Ok(_)) => {
                warn!(concept_id = %concept.id, "Embedding backend returned no vector, scoring degraded");
                return None;
            }
            Ok(Err(e)) => {
                warn!(concept_id = %concept.id, error = %e, "Embedding unavailable, scoring degraded");
                return None;
            }
            Err(_) => {
                warn!(concept_id = %concept.id, "Embedding timed out, scoring degraded");
                return None;
            }
        };

        if let Some(vectors) = &self.vectors {
            let upsert = vectors.upsert(&self.tenant_id, concept.id, concept.concept_type, &vector);
            match timeout(self.call_timeout, upsert).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(concept_id = %concept.id, error = %e, "Could not store fresh embedding")
                }
                Err(_) => debug!(concept_id = %concept.id, "Storing fresh embedding timed out"),
            }
        }
        Some(vector)
    }

    async fn cross_encoder_score(&self, a: &CanonicalConcept, b: &CanonicalConcept) -> Option<f32> {
        let encoder = self.cross_encoder.as_ref()?;
        let (ta, tb) = (a.embedding_text(), b.embedding_text());
        match timeout(self.call_timeout, encoder.score(&ta, &tb)).await {
            Ok(Ok(score)) => Some(score.clamp(0.0, 1.0)),
            Ok(Err(e)) => {
                warn!(error = %e, "Cross-encoder unavailable, signal dropped");
                None
            }
            Err(_) => {
                warn!("Cross-encoder timed out, signal dropped");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::ConceptType;
    use concord_inference::mock::{HashingEmbedder, ScriptedCrossEncoder};

    fn scorer() -> PairScorer {
        PairScorer::new("t", ScoreCache::disabled("t"), Duration::from_secs(1))
    }

    #[test]
    fn test_lexical_signals_for_acronym_pair() {
        let a = CanonicalConcept::new("t", "GDPR", ConceptType::Regulation);
        let b = CanonicalConcept::new(
            "t",
            "General Data Protection Regulation (GDPR)",
            ConceptType::Regulation,
        );
        let s = lexical_signals(&a, &b);
        assert_eq!(s.acronym_match, 1.0);
        assert_eq!(s.exact_match, 0.0);
        assert_eq!(s.type_compatibility, 1.0);
        assert!(s.lexical_similarity < 0.7);
        assert!(s.is_decisive_lexical());
    }

    #[tokio::test]
    async fn test_no_backends_is_degraded() {
        let a = CanonicalConcept::new("t", "Kubernetes", ConceptType::Technology);
        let b = CanonicalConcept::new("t", "Kubernetes Engine", ConceptType::Technology);
        let scored = scorer().score(&a, &b, ScoreOptions::default()).await;
        assert!(scored.candidate.signals.degraded);
        assert!(scored.candidate.signals.semantic_component().is_none());
        assert!(!scored.from_cache);
    }

    #[tokio::test]
    async fn test_decisive_lexical_skips_cross_encoder() {
        let cross = Arc::new(ScriptedCrossEncoder::new(0.1));
        let s = scorer().with_cross_encoder(Some(cross.clone()));
        let a = CanonicalConcept::new("t", "ISO/IEC 27001", ConceptType::Standard);
        let b = CanonicalConcept::new("t", "ISO IEC 27001", ConceptType::Standard);
        let scored = s.score(&a, &b, ScoreOptions::default()).await;
        assert_eq!(cross.call_count(), 0);
        assert!(scored.candidate.signals.cross_encoder_skipped);
        assert!(scored.candidate.score >= 0.95);
    }

    #[tokio::test]
    async fn test_semantic_signals_and_ordering() {
        let embedder = Arc::new(
            HashingEmbedder::new(4)
                .with_vector("Churn (metric)", vec![1.0, 0.0, 0.0, 0.0])
                .with_vector("Attrition (metric)", vec![1.0, 0.0, 0.0, 0.0]),
        );
        let cross = Arc::new(ScriptedCrossEncoder::new(0.6));
        let s = scorer()
            .with_embedder(Some(embedder))
            .with_cross_encoder(Some(cross.clone()));
        let a = CanonicalConcept::new("t", "Churn", ConceptType::Metric);
        let b = CanonicalConcept::new("t", "Attrition", ConceptType::Metric);

        let scored = s.score(&b, &a, ScoreOptions::default()).await;
        let c = &scored.candidate;
        assert_eq!(c.id_a, c.pair_id.low());
        assert_eq!(c.signals.embedding_similarity, Some(1.0));
        assert_eq!(c.signals.cross_encoder_score, Some(0.6));
        assert!(!c.signals.degraded);
        assert!((c.signals.semantic_component().unwrap() - 0.8).abs() < 1e-6);
        assert_eq!(cross.call_count(), 1);
    }

    #[tokio::test]
    async fn test_backend_failure_degrades_instead_of_failing() {
        let embedder = Arc::new(HashingEmbedder::new(8));
        embedder.set_failing(true);
        let cross = Arc::new(ScriptedCrossEncoder::new(0.9));
        cross.set_failing(true);
        let s = scorer()
            .with_embedder(Some(embedder))
            .with_cross_encoder(Some(cross));
        let a = CanonicalConcept::new("t", "Churn", ConceptType::Metric);
        let b = CanonicalConcept::new("t", "Attrition", ConceptType::Metric);
        let scored = s.score(&a, &b, ScoreOptions::default()).await;
        assert!(scored.candidate.signals.degraded);
        assert!(scored.candidate.signals.embedding_similarity.is_none());
    }

    #[tokio::test]
    async fn test_degraded_score_is_not_cached() {
        let cache = ScoreCache::new(Some(Arc::new(concord_db::MemoryCache::new())), "t", 3600);
        let embedder = Arc::new(HashingEmbedder::new(4));
        embedder.set_failing(true);
        let s = PairScorer::new("t", cache.clone(), Duration::from_secs(1))
            .with_embedder(Some(embedder.clone()));
        let a = CanonicalConcept::new("t", "Churn", ConceptType::Metric);
        let b = CanonicalConcept::new("t", "Attrition", ConceptType::Metric);

        let outage = s.score(&a, &b, ScoreOptions::default()).await;
        assert!(outage.candidate.signals.degraded);
        assert!(cache.get(&outage.candidate.pair_id).await.is_none());

        // Once the embedder recovers the pair is rescored with semantics.
        embedder.set_failing(false);
        let recovered = s.score(&a, &b, ScoreOptions::default()).await;
        assert!(!recovered.from_cache);
        assert!(!recovered.candidate.signals.degraded);
        assert!(recovered.candidate.signals.embedding_similarity.is_some());

        let cached = s.score(&a, &b, ScoreOptions::default()).await;
        assert!(cached.from_cache);
        assert!(!cached.candidate.signals.degraded);
    }
}
