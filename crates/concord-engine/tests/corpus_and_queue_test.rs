//! Corpus runs, the proposal queue and deferred-queue housekeeping.

mod helpers;

use std::sync::Arc;

use chrono::{Duration, Utc};
use concord_db::{
    CanonicalConcept, ConceptType, DeferredMergeCandidate, DeferredRepository, Error,
    EvidenceCounters, GraphStore, MergeCandidate, PairId, SignalBreakdown,
};
use concord_engine::{
    CancelSignal, CorpusConfig, DeferredConfig, PipelineContext, ReevaluateOptions,
    ResolutionEngine,
};
use concord_inference::mock::{HashingEmbedder, ScriptedCrossEncoder};

use helpers::{axis, concept, config, Harness, TENANT};

/// Three disjoint technology pairs that decision v2 sends to review: strong
/// lexical overlap, semantic 0.875.
fn review_pairs() -> Vec<(CanonicalConcept, CanonicalConcept)> {
    [
        ("Kubernetes", "Kubernetes Engine"),
        ("Terraform", "Terraform Cloud"),
        ("Prometheus", "Prometheus Server"),
    ]
    .into_iter()
    .map(|(a, b)| (concept(a, ConceptType::Technology), concept(b, ConceptType::Technology)))
    .collect()
}

fn review_context(h: &Harness, pairs: &[(CanonicalConcept, CanonicalConcept)]) -> PipelineContext {
    let embedder = HashingEmbedder::new(4);
    for (a, b) in pairs {
        embedder.set_vector(a.embedding_text(), axis(2));
        embedder.set_vector(b.embedding_text(), axis(2));
    }
    h.context()
        .with_embedder(Arc::new(embedder))
        .with_cross_encoder(Arc::new(ScriptedCrossEncoder::new(0.75)))
}

async fn corpus_engine(h: &Harness, budget: usize) -> (ResolutionEngine, Vec<(CanonicalConcept, CanonicalConcept)>) {
    let pairs = review_pairs();
    let engine = h.engine(
        review_context(h, &pairs),
        config().with_corpus(CorpusConfig::default().with_proposal_budget(budget)),
    );
    let all: Vec<CanonicalConcept> = pairs.iter().flat_map(|(a, b)| [a.clone(), b.clone()]).collect();
    engine.index_concepts(&all).await.unwrap();
    (engine, pairs)
}

#[tokio::test]
async fn test_corpus_run_respects_proposal_budget() {
    let h = Harness::new();
    let (engine, _) = corpus_engine(&h, 1).await;

    let report = engine.run_corpus(false, &CancelSignal::never()).await.unwrap();
    assert_eq!(report.candidates, 3);
    assert_eq!(report.pruned, 0);
    assert_eq!((report.proposed, report.budget_dropped), (1, 2));
    assert_eq!(report.merged, 0);

    let pending = engine.pending_proposals(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].decision_reason, "strong_lexical");
}

#[tokio::test]
async fn test_dry_run_writes_nothing() {
    let h = Harness::new();
    let (engine, _) = corpus_engine(&h, 10).await;

    let report = engine.run_corpus(true, &CancelSignal::never()).await.unwrap();
    assert!(report.dry_run);
    assert_eq!(report.proposed, 3);
    assert!(engine.pending_proposals(10).await.unwrap().is_empty());
    assert_eq!(h.graph.list_active_concepts(TENANT, &[]).await.unwrap().len(), 6);
}

#[tokio::test]
async fn test_cancelled_run_stops_before_executing() {
    let h = Harness::new();
    let (engine, _) = corpus_engine(&h, 10).await;
    let (handle, signal) = CancelSignal::new();
    handle.cancel();

    let report = engine.run_corpus(false, &signal).await.unwrap();
    assert!(report.cancelled);
    assert_eq!((report.scored, report.proposed, report.merged), (0, 0, 0));
    assert!(engine.pending_proposals(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_applying_a_proposal_merges_once() {
    let h = Harness::new();
    let (engine, pairs) = corpus_engine(&h, 10).await;
    engine.run_corpus(false, &CancelSignal::never()).await.unwrap();

    let pending = engine.pending_proposals(10).await.unwrap();
    assert_eq!(pending.len(), 3);
    let proposal = &pending[0];
    let result = engine.apply_proposal(proposal.id, "alice").await.unwrap();
    assert!(result.success);
    assert!(pairs
        .iter()
        .any(|(a, b)| PairId::new(a.id, b.id) == proposal.pair_id));

    let err = engine.apply_proposal(proposal.id, "bob").await.unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
    let err = engine.apply_proposal(uuid::Uuid::new_v4(), "bob").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    let stats = engine.stats().await.unwrap();
    assert_eq!((stats.proposals.pending, stats.proposals.applied), (2, 1));
    assert_eq!(stats.merges.succeeded, 1);

    // The next corpus run does not see the merged concept.
    let report = engine.run_corpus(true, &CancelSignal::never()).await.unwrap();
    assert_eq!(report.candidates, 2);
}

fn deferred_entry(a: &CanonicalConcept, b: &CanonicalConcept, created: chrono::DateTime<Utc>, ttl: Duration) -> DeferredMergeCandidate {
    let signals = SignalBreakdown {
        lexical_similarity: 0.9,
        type_compatibility: 1.0,
        ..Default::default()
    };
    let candidate = MergeCandidate::new(a.id, b.id, a.concept_type, signals);
    DeferredMergeCandidate::from_candidate(TENANT, &candidate, EvidenceCounters::default(), created, ttl)
}

#[tokio::test]
async fn test_expired_entries_become_rejects() {
    let h = Harness::new();
    let engine = h.engine(h.context(), config());
    let a = concept("Acme Corp", ConceptType::Organization);
    let b = concept("Acme Corporation", ConceptType::Organization);
    engine.index_concepts(&[a.clone(), b.clone()]).await.unwrap();
    h.deferred
        .upsert(&deferred_entry(&a, &b, Utc::now() - Duration::days(2), Duration::days(1)))
        .await
        .unwrap();

    let report = engine
        .reevaluate_deferred(ReevaluateOptions::default(), &CancelSignal::never())
        .await
        .unwrap();
    assert_eq!((report.expired, report.candidates), (1, 0));
    let entry = engine
        .reject_store()
        .get(&PairId::new(a.id, b.id))
        .await
        .expect("expired pair rejected");
    assert_eq!(entry.reason, "defer_expired");
    assert_eq!(engine.deferred_store().count_pending().await.unwrap(), 0);
}

#[tokio::test]
async fn test_full_queue_evicts_oldest_into_rejects() {
    let h = Harness::new();
    let k8s = concept("Kubernetes", ConceptType::Technology);
    let gke = concept("Kubernetes Engine", ConceptType::Technology);
    let old_a = concept("Acme Corp", ConceptType::Organization);
    let old_b = concept("Acme Corporation", ConceptType::Organization);
    let embedder = HashingEmbedder::new(4)
        .with_vector(k8s.embedding_text(), axis(1))
        .with_vector(gke.embedding_text(), axis(1));
    let engine = h.engine(
        h.context()
            .with_embedder(Arc::new(embedder))
            .with_cross_encoder(Arc::new(ScriptedCrossEncoder::new(0.40))),
        config().with_deferred(DeferredConfig::default().with_max_queue(1)),
    );
    engine
        .index_concepts(&[k8s.clone(), gke.clone(), old_a.clone(), old_b.clone()])
        .await
        .unwrap();
    h.deferred
        .upsert(&deferred_entry(&old_a, &old_b, Utc::now() - Duration::hours(1), Duration::days(30)))
        .await
        .unwrap();

    let report = engine
        .resolve_concept(k8s.id, &CancelSignal::never())
        .await
        .unwrap();
    assert_eq!((report.deferred, report.evicted), (1, 1));
    assert_eq!(engine.deferred_store().count_pending().await.unwrap(), 1);
    assert!(engine
        .deferred_store()
        .get(&PairId::new(k8s.id, gke.id))
        .await
        .unwrap()
        .is_some());
    let entry = engine
        .reject_store()
        .get(&PairId::new(old_a.id, old_b.id))
        .await
        .expect("evicted pair rejected");
    assert_eq!(entry.reason, "queue_overflow");
}

#[tokio::test]
async fn test_reevaluation_drops_entries_for_merged_concepts() {
    let h = Harness::new();
    let engine = h.engine(h.context(), config());
    let a = concept("Acme Corp", ConceptType::Organization);
    let b = concept("Acme Corporation", ConceptType::Organization);
    let c = concept("Acme Holdings", ConceptType::Organization);
    engine.index_concepts(&[a.clone(), b.clone(), c.clone()]).await.unwrap();
    h.deferred
        .upsert(&deferred_entry(&a, &c, Utc::now(), Duration::days(30)))
        .await
        .unwrap();
    h.graph
        .set_status(TENANT, c.id, concord_db::ConceptStatus::Merged, Some(b.id), Some(Utc::now()))
        .await
        .unwrap();

    let report = engine
        .reevaluate_deferred(ReevaluateOptions::default(), &CancelSignal::never())
        .await
        .unwrap();
    assert_eq!((report.candidates, report.skipped_inactive), (1, 1));
    assert_eq!(report.scored, 0);
    assert_eq!(engine.deferred_store().count_pending().await.unwrap(), 0);
}
