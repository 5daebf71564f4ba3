//! PostgreSQL store integration tests.
//!
//! Each test runs in its own schema (see `concord_db::test_fixtures`).
//! Requires a PostgreSQL server with pgvector at `DATABASE_URL`.

use chrono::{Duration, Utc};
use concord_db::test_fixtures::TestDatabase;
use concord_db::{
    CanonicalConcept, ConceptStatus, ConceptType, DeferredMergeCandidate, DeferredRepository,
    EvidenceCounters, GraphStore, MergeAuditRepository, MergeCandidate, MergeResult, MergeTrigger,
    Relation, SignalBreakdown, VectorIndex,
};
use uuid::Uuid;

fn concept(name: &str) -> CanonicalConcept {
    CanonicalConcept::new("acme", name, ConceptType::Standard)
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL with pgvector
async fn test_concept_upsert_is_idempotent() {
    let test_db = TestDatabase::new().await;
    let graph = &test_db.db.graph;

    let c = concept("ISO 27001").with_aliases(["ISO/IEC 27001"]);
    graph.upsert_concept(&c).await.unwrap();
    graph.upsert_concept(&c).await.unwrap();

    let active = graph
        .list_active_concepts("acme", &[ConceptType::Standard])
        .await
        .unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].aliases, vec!["ISO/IEC 27001".to_string()]);
    assert!(graph.get_concept("other", c.id).await.unwrap().is_none());

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL with pgvector
async fn test_redirect_and_restore_relations() {
    let test_db = TestDatabase::new().await;
    let graph = &test_db.db.graph;

    let a = concept("ISO 27001");
    let b = concept("ISO/IEC 27001");
    let c = concept("SOC 2");
    for x in [&a, &b, &c] {
        graph.upsert_concept(x).await.unwrap();
    }
    let b_to_c = Relation::new("acme", b.id, c.id, "related_to");
    let a_to_b = Relation::new("acme", a.id, b.id, "same_family");
    graph.insert_relation(&b_to_c).await.unwrap();
    graph.insert_relation(&a_to_b).await.unwrap();

    let merge_id = Uuid::now_v7();
    let outcome = graph
        .redirect_relations("acme", b.id, a.id, merge_id)
        .await
        .unwrap();
    assert_eq!(outcome.redirected, 1);
    assert_eq!(outcome.dropped.len(), 1);
    assert_eq!(outcome.dropped[0].id, a_to_b.id);
    assert_eq!(graph.count_relations("acme", b.id).await.unwrap(), 0);

    let restored = graph.restore_relations("acme", merge_id).await.unwrap();
    assert_eq!(restored, 1);
    let edges = graph.relations_of("acme", b.id).await.unwrap();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].source_id, b.id);
    assert!(edges[0].provenance.is_empty());

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL with pgvector
async fn test_status_constraint_rejects_dangling_pointer() {
    let test_db = TestDatabase::new().await;
    let graph = &test_db.db.graph;

    let a = concept("NIST CSF");
    graph.upsert_concept(&a).await.unwrap();
    let result = graph
        .set_status("acme", a.id, ConceptStatus::Merged, None, None)
        .await;
    assert!(result.is_err(), "merged status without pointer must fail");

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL with pgvector
async fn test_deferred_roundtrip_keeps_signals_and_expiry() {
    let test_db = TestDatabase::new().await;
    let repo = &test_db.db.deferred;

    let signals = SignalBreakdown {
        lexical_similarity: 0.82,
        embedding_similarity: Some(0.88),
        type_compatibility: 1.0,
        ..Default::default()
    };
    let candidate = MergeCandidate::new(
        Uuid::new_v4(),
        Uuid::new_v4(),
        ConceptType::Organization,
        signals.clone(),
    );
    let now = Utc::now();
    let entry = DeferredMergeCandidate::from_candidate(
        "acme",
        &candidate,
        EvidenceCounters {
            doc_count_a: 2,
            doc_count_b: 1,
            shared_doc_count: 0,
        },
        now,
        Duration::days(30),
    );
    assert!(repo.upsert(&entry).await.unwrap());

    let mut again = entry.clone();
    again.evaluation_count = 2;
    again.expires_at = now + Duration::days(60);
    assert!(!repo.upsert(&again).await.unwrap());

    let stored = repo.get("acme", &entry.pair_id).await.unwrap().unwrap();
    assert_eq!(stored.signals, signals);
    assert_eq!(stored.evaluation_count, 2);
    assert_eq!(
        stored.expires_at.timestamp_micros(),
        entry.expires_at.timestamp_micros()
    );

    // Re-deferring with a fresh entry still counts up.
    assert!(!repo.upsert(&entry).await.unwrap());
    let stored = repo.get("acme", &entry.pair_id).await.unwrap().unwrap();
    assert_eq!(stored.evaluation_count, 3);

    let purged = repo
        .purge_expired("acme", now + Duration::days(31))
        .await
        .unwrap();
    assert_eq!(purged.len(), 1);
    assert_eq!(repo.count_pending("acme").await.unwrap(), 0);

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL with pgvector
async fn test_merge_audit_history() {
    let test_db = TestDatabase::new().await;
    let audit = &test_db.db.audit;

    let survivor = Uuid::now_v7();
    let mut result = MergeResult::pending(
        "acme",
        survivor,
        Uuid::now_v7(),
        MergeTrigger::Manual,
        "operator request",
        1.0,
        None,
    );
    result.success = true;
    result.aliases_added = vec!["ACME Corp".to_string()];
    audit.record_merge(&result).await.unwrap();

    let latest = audit
        .latest_merge_touching("acme", survivor)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.merge_id, result.merge_id);
    assert_eq!(latest.aliases_added, result.aliases_added);
    assert_eq!(audit.counts("acme").await.unwrap().succeeded, 1);

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL with pgvector
async fn test_vector_search_is_tenant_scoped() {
    let test_db = TestDatabase::new().await;
    let graph = &test_db.db.graph;
    let vectors = &test_db.db.vectors;

    let a = concept("GDPR");
    graph.upsert_concept(&a).await.unwrap();
    let mut v = vec![0.0f32; 768];
    v[0] = 1.0;
    vectors
        .upsert("acme", a.id, ConceptType::Standard, &v)
        .await
        .unwrap();

    let hits = vectors.search("acme", &v, &[], 5).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert!(hits[0].similarity > 0.99);
    assert!(vectors.search("other", &v, &[], 5).await.unwrap().is_empty());

    test_db.cleanup().await;
}
