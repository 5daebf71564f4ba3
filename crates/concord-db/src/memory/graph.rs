use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use concord_core::{
    CanonicalConcept, Claim, ConceptStats, ConceptStatus, ConceptType, Error, GraphStore,
    Relation, RelationRedirect, Result,
};

use super::FailureSwitch;

#[derive(Default)]
struct GraphState {
    concepts: HashMap<Uuid, CanonicalConcept>,
    // Keyed by v7 ids, so iteration follows insertion time.
    relations: BTreeMap<Uuid, Relation>,
    claims: BTreeMap<Uuid, Claim>,
    mentions: HashMap<(String, Uuid), HashSet<Uuid>>,
}

/// In-memory [`GraphStore`].
#[derive(Default)]
pub struct MemoryGraphStore {
    state: RwLock<GraphState>,
    failures: FailureSwitch,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the named trait operation (e.g. `"redirect_claims"`) fail.
    pub fn fail_on(&self, op: &str) {
        self.failures.fail_on(op);
    }

    /// Make every operation fail as if the store were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.failures.set_unavailable(unavailable);
    }

    pub fn clear_failures(&self) {
        self.failures.clear();
    }

    fn check(&self, op: &str) -> Result<()> {
        self.failures.check(op, Error::Internal)
    }
}

fn owned<'a>(
    concepts: &'a mut HashMap<Uuid, CanonicalConcept>,
    tenant_id: &str,
    id: Uuid,
) -> Result<&'a mut CanonicalConcept> {
    concepts
        .get_mut(&id)
        .filter(|c| c.tenant_id == tenant_id)
        .ok_or(Error::ConceptNotFound(id))
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn ensure_indexes(&self) -> Result<()> {
        self.check("ensure_indexes")
    }

    async fn upsert_concept(&self, concept: &CanonicalConcept) -> Result<()> {
        self.check("upsert_concept")?;
        let mut state = self.state.write().await;
        state.concepts.insert(concept.id, concept.clone());
        Ok(())
    }

    async fn get_concept(&self, tenant_id: &str, id: Uuid) -> Result<Option<CanonicalConcept>> {
        self.check("get_concept")?;
        let state = self.state.read().await;
        Ok(state
            .concepts
            .get(&id)
            .filter(|c| c.tenant_id == tenant_id)
            .cloned())
    }

    async fn get_concepts(&self, tenant_id: &str, ids: &[Uuid]) -> Result<Vec<CanonicalConcept>> {
        self.check("get_concepts")?;
        let state = self.state.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.concepts.get(id))
            .filter(|c| c.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn list_active_concepts(
        &self,
        tenant_id: &str,
        types: &[ConceptType],
    ) -> Result<Vec<CanonicalConcept>> {
        self.check("list_active_concepts")?;
        let state = self.state.read().await;
        let mut out: Vec<CanonicalConcept> = state
            .concepts
            .values()
            .filter(|c| c.tenant_id == tenant_id && c.is_active())
            .filter(|c| types.is_empty() || types.contains(&c.concept_type))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn set_aliases(&self, tenant_id: &str, id: Uuid, aliases: &[String]) -> Result<()> {
        self.check("set_aliases")?;
        let mut state = self.state.write().await;
        let concept = owned(&mut state.concepts, tenant_id, id)?;
        concept.aliases = aliases.to_vec();
        concept.updated_at = Utc::now();
        Ok(())
    }

    async fn set_status(
        &self,
        tenant_id: &str,
        id: Uuid,
        status: ConceptStatus,
        merged_into: Option<Uuid>,
        merged_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.check("set_status")?;
        if status == ConceptStatus::Active && merged_into.is_some() {
            return Err(Error::InvalidInput(
                "an active concept cannot point at a survivor".to_string(),
            ));
        }
        if status == ConceptStatus::Merged && merged_into.is_none() {
            return Err(Error::InvalidInput(
                "a merged concept needs a merged_into pointer".to_string(),
            ));
        }
        let mut state = self.state.write().await;
        let concept = owned(&mut state.concepts, tenant_id, id)?;
        concept.status = status;
        concept.merged_into = merged_into;
        concept.merged_at = merged_at;
        concept.updated_at = Utc::now();
        Ok(())
    }

    async fn list_merged_into(&self, tenant_id: &str, target: Uuid) -> Result<Vec<Uuid>> {
        self.check("list_merged_into")?;
        let state = self.state.read().await;
        let mut ids: Vec<Uuid> = state
            .concepts
            .values()
            .filter(|c| c.tenant_id == tenant_id && c.merged_into == Some(target))
            .map(|c| c.id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn repoint_merged_into(
        &self,
        tenant_id: &str,
        ids: &[Uuid],
        target: Uuid,
    ) -> Result<u64> {
        self.check("repoint_merged_into")?;
        let mut state = self.state.write().await;
        let mut n = 0;
        for id in ids {
            if let Ok(concept) = owned(&mut state.concepts, tenant_id, *id) {
                concept.merged_into = Some(target);
                n += 1;
            }
        }
        Ok(n)
    }

    async fn relations_of(&self, tenant_id: &str, id: Uuid) -> Result<Vec<Relation>> {
        self.check("relations_of")?;
        let state = self.state.read().await;
        Ok(state
            .relations
            .values()
            .filter(|r| r.tenant_id == tenant_id && (r.source_id == id || r.target_id == id))
            .cloned()
            .collect())
    }

    async fn count_relations(&self, tenant_id: &str, id: Uuid) -> Result<i64> {
        self.check("count_relations")?;
        let state = self.state.read().await;
        Ok(state
            .relations
            .values()
            .filter(|r| r.tenant_id == tenant_id && (r.source_id == id || r.target_id == id))
            .count() as i64)
    }

    async fn insert_relation(&self, relation: &Relation) -> Result<()> {
        self.check("insert_relation")?;
        let mut state = self.state.write().await;
        state.relations.insert(relation.id, relation.clone());
        Ok(())
    }

    async fn delete_relation(&self, tenant_id: &str, id: Uuid) -> Result<()> {
        self.check("delete_relation")?;
        let mut state = self.state.write().await;
        if state
            .relations
            .get(&id)
            .is_some_and(|r| r.tenant_id == tenant_id)
        {
            state.relations.remove(&id);
        }
        Ok(())
    }

    async fn redirect_relations(
        &self,
        tenant_id: &str,
        from: Uuid,
        to: Uuid,
        merge_id: Uuid,
    ) -> Result<RelationRedirect> {
        self.check("redirect_relations")?;
        let mut state = self.state.write().await;
        let now = Utc::now();
        let touched: Vec<Uuid> = state
            .relations
            .values()
            .filter(|r| r.tenant_id == tenant_id && (r.source_id == from || r.target_id == from))
            .map(|r| r.id)
            .collect();

        let mut outcome = RelationRedirect::default();
        for id in touched {
            let self_loop = match state.relations.get(&id) {
                Some(r) => r.becomes_self_loop(from, to),
                None => continue,
            };
            if self_loop {
                if let Some(original) = state.relations.remove(&id) {
                    outcome.dropped.push(original);
                }
                continue;
            }
            if let Some(relation) = state.relations.get_mut(&id) {
                relation.apply_redirect(from, to, merge_id, now);
                outcome.redirected += 1;
            }
        }
        Ok(outcome)
    }

    async fn restore_relations(&self, tenant_id: &str, merge_id: Uuid) -> Result<u64> {
        self.check("restore_relations")?;
        let mut state = self.state.write().await;
        let mut restored = 0;
        for relation in state.relations.values_mut() {
            if relation.tenant_id == tenant_id && relation.undo_redirect(merge_id) {
                restored += 1;
            }
        }
        Ok(restored)
    }

    async fn insert_claim(&self, claim: &Claim) -> Result<()> {
        self.check("insert_claim")?;
        let mut state = self.state.write().await;
        state.claims.entry(claim.id).or_insert_with(|| claim.clone());
        Ok(())
    }

    async fn claims_of(&self, tenant_id: &str, id: Uuid) -> Result<Vec<Claim>> {
        self.check("claims_of")?;
        let state = self.state.read().await;
        Ok(state
            .claims
            .values()
            .filter(|c| c.tenant_id == tenant_id && c.references(id))
            .cloned()
            .collect())
    }

    async fn redirect_claims(
        &self,
        tenant_id: &str,
        from: Uuid,
        to: Uuid,
        merge_id: Uuid,
    ) -> Result<u64> {
        self.check("redirect_claims")?;
        let mut state = self.state.write().await;
        let now = Utc::now();
        let mut n = 0;
        for claim in state.claims.values_mut() {
            if claim.tenant_id == tenant_id && claim.references(from) {
                claim.apply_redirect(from, to, merge_id, now);
                n += 1;
            }
        }
        Ok(n)
    }

    async fn restore_claims(&self, tenant_id: &str, merge_id: Uuid) -> Result<u64> {
        self.check("restore_claims")?;
        let mut state = self.state.write().await;
        let mut restored = 0;
        for claim in state.claims.values_mut() {
            if claim.tenant_id == tenant_id && claim.undo_redirect(merge_id) {
                restored += 1;
            }
        }
        Ok(restored)
    }

    async fn add_document_mention(
        &self,
        tenant_id: &str,
        concept_id: Uuid,
        document_id: Uuid,
    ) -> Result<()> {
        self.check("add_document_mention")?;
        let mut state = self.state.write().await;
        state
            .mentions
            .entry((tenant_id.to_string(), concept_id))
            .or_default()
            .insert(document_id);
        Ok(())
    }

    async fn document_count(&self, tenant_id: &str, id: Uuid) -> Result<i64> {
        self.check("document_count")?;
        let state = self.state.read().await;
        Ok(state
            .mentions
            .get(&(tenant_id.to_string(), id))
            .map(|docs| docs.len() as i64)
            .unwrap_or(0))
    }

    async fn shared_document_count(&self, tenant_id: &str, a: Uuid, b: Uuid) -> Result<i64> {
        self.check("shared_document_count")?;
        let state = self.state.read().await;
        let docs_a = state.mentions.get(&(tenant_id.to_string(), a));
        let docs_b = state.mentions.get(&(tenant_id.to_string(), b));
        Ok(match (docs_a, docs_b) {
            (Some(x), Some(y)) => x.intersection(y).count() as i64,
            _ => 0,
        })
    }

    async fn concept_stats(&self, tenant_id: &str) -> Result<ConceptStats> {
        self.check("concept_stats")?;
        let state = self.state.read().await;
        let tenant: Vec<&CanonicalConcept> = state
            .concepts
            .values()
            .filter(|c| c.tenant_id == tenant_id)
            .collect();
        let absorbed: HashSet<Uuid> = tenant.iter().filter_map(|c| c.merged_into).collect();
        let count = |status: ConceptStatus| tenant.iter().filter(|c| c.status == status).count();
        Ok(ConceptStats {
            total: tenant.len() as i64,
            active: count(ConceptStatus::Active) as i64,
            merged: count(ConceptStatus::Merged) as i64,
            deprecated: count(ConceptStatus::Deprecated) as i64,
            standalone: tenant
                .iter()
                .filter(|c| c.is_active() && !absorbed.contains(&c.id))
                .count() as i64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn concept(name: &str) -> CanonicalConcept {
        CanonicalConcept::new("t", name, ConceptType::Technology)
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = MemoryGraphStore::new();
        let c = concept("Kafka").with_aliases(["Apache Kafka"]);
        store.upsert_concept(&c).await.unwrap();
        store.upsert_concept(&c).await.unwrap();

        let all = store.list_active_concepts("t", &[]).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].aliases, vec!["Apache Kafka".to_string()]);
    }

    #[tokio::test]
    async fn test_tenant_isolation() {
        let store = MemoryGraphStore::new();
        let c = concept("Kafka");
        store.upsert_concept(&c).await.unwrap();
        assert!(store.get_concept("other", c.id).await.unwrap().is_none());
        assert!(store.list_active_concepts("other", &[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_redirect_drops_self_loops_and_restores() {
        let store = MemoryGraphStore::new();
        let a = concept("A");
        let b = concept("B");
        let c = concept("C");
        for x in [&a, &b, &c] {
            store.upsert_concept(x).await.unwrap();
        }
        let b_to_c = Relation::new("t", b.id, c.id, "uses");
        let a_to_b = Relation::new("t", a.id, b.id, "related");
        store.insert_relation(&b_to_c).await.unwrap();
        store.insert_relation(&a_to_b).await.unwrap();

        let merge_id = Uuid::new_v4();
        let outcome = store
            .redirect_relations("t", b.id, a.id, merge_id)
            .await
            .unwrap();
        assert_eq!(outcome.redirected, 1);
        assert_eq!(outcome.dropped.len(), 1);
        assert_eq!(outcome.dropped[0].id, a_to_b.id);
        assert_eq!(store.count_relations("t", b.id).await.unwrap(), 0);

        let restored = store.restore_relations("t", merge_id).await.unwrap();
        assert_eq!(restored, 1);
        let rels = store.relations_of("t", b.id).await.unwrap();
        assert_eq!(rels.len(), 1);
        assert_eq!((rels[0].source_id, rels[0].target_id), (b.id, c.id));
    }

    #[tokio::test]
    async fn test_document_counts() {
        let store = MemoryGraphStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let d1 = Uuid::new_v4();
        let d2 = Uuid::new_v4();
        store.add_document_mention("t", a, d1).await.unwrap();
        store.add_document_mention("t", a, d1).await.unwrap();
        store.add_document_mention("t", a, d2).await.unwrap();
        store.add_document_mention("t", b, d2).await.unwrap();
        assert_eq!(store.document_count("t", a).await.unwrap(), 2);
        assert_eq!(store.shared_document_count("t", a, b).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_status_pointer_invariant() {
        let store = MemoryGraphStore::new();
        let a = concept("A");
        store.upsert_concept(&a).await.unwrap();
        let err = store
            .set_status("t", a.id, ConceptStatus::Merged, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let store = MemoryGraphStore::new();
        store.fail_on("redirect_claims");
        let err = store
            .redirect_claims("t", Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));

        store.set_unavailable(true);
        let err = store.concept_stats("t").await.unwrap_err();
        assert!(err.is_store_unreachable());

        store.clear_failures();
        assert!(store.concept_stats("t").await.is_ok());
    }
}
