use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use concord_core::lexical::cosine_similarity;
use concord_core::{ConceptType, Error, Result, VectorHit, VectorIndex};

use super::FailureSwitch;

/// Brute-force in-memory [`VectorIndex`].
///
/// Search is linear in the tenant's vectors; fine for tests and small
/// embedded corpora.
#[derive(Default)]
pub struct InMemoryVectorIndex {
    vectors: RwLock<HashMap<(String, Uuid), (ConceptType, Vec<f32>)>>,
    failures: FailureSwitch,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with an embedding error.
    pub fn set_failing(&self, failing: bool) {
        if failing {
            self.failures.fail_on("search");
            self.failures.fail_on("get_vector");
            self.failures.fail_on("upsert");
        } else {
            self.failures.clear();
        }
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn upsert(
        &self,
        tenant_id: &str,
        concept_id: Uuid,
        concept_type: ConceptType,
        vector: &[f32],
    ) -> Result<()> {
        self.failures.check("upsert", Error::Embedding)?;
        self.vectors.write().await.insert(
            (tenant_id.to_string(), concept_id),
            (concept_type, vector.to_vec()),
        );
        Ok(())
    }

    async fn get_vector(&self, tenant_id: &str, concept_id: Uuid) -> Result<Option<Vec<f32>>> {
        self.failures.check("get_vector", Error::Embedding)?;
        Ok(self
            .vectors
            .read()
            .await
            .get(&(tenant_id.to_string(), concept_id))
            .map(|(_, v)| v.clone()))
    }

    async fn search(
        &self,
        tenant_id: &str,
        vector: &[f32],
        types: &[ConceptType],
        top_k: usize,
    ) -> Result<Vec<VectorHit>> {
        self.failures.check("search", Error::Embedding)?;
        let vectors = self.vectors.read().await;
        let mut hits: Vec<VectorHit> = vectors
            .iter()
            .filter(|((tenant, _), (t, _))| tenant == tenant_id && (types.is_empty() || types.contains(t)))
            .map(|((_, id), (t, v))| VectorHit {
                concept_id: *id,
                concept_type: *t,
                similarity: cosine_similarity(vector, v),
            })
            .collect();
        hits.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then(a.concept_id.cmp(&b.concept_id))
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn remove(&self, tenant_id: &str, concept_id: Uuid) -> Result<()> {
        self.vectors
            .write()
            .await
            .remove(&(tenant_id.to_string(), concept_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_search_ranks_by_similarity_and_filters_type() {
        let index = InMemoryVectorIndex::new();
        let near = Uuid::new_v4();
        let far = Uuid::new_v4();
        let other_type = Uuid::new_v4();
        index.upsert("t", near, ConceptType::Product, &[1.0, 0.1]).await.unwrap();
        index.upsert("t", far, ConceptType::Product, &[0.0, 1.0]).await.unwrap();
        index
            .upsert("t", other_type, ConceptType::Person, &[1.0, 0.0])
            .await
            .unwrap();

        let hits = index
            .search("t", &[1.0, 0.0], &[ConceptType::Product], 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].concept_id, near);
        assert!(hits[0].similarity > hits[1].similarity);

        let top1 = index.search("t", &[1.0, 0.0], &[], 1).await.unwrap();
        assert_eq!(top1.len(), 1);
        assert_eq!(top1[0].concept_id, other_type);
    }

    #[tokio::test]
    async fn test_failing_index_reports_embedding_error() {
        let index = InMemoryVectorIndex::new();
        index.set_failing(true);
        let err = index.search("t", &[1.0], &[], 5).await.unwrap_err();
        assert!(matches!(err, Error::Embedding(_)));
        index.set_failing(false);
        assert!(index.search("t", &[1.0], &[], 5).await.unwrap().is_empty());
    }
}
