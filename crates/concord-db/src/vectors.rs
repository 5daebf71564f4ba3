//! pgvector-backed nearest-neighbour index over concept embeddings.

use async_trait::async_trait;
use pgvector::Vector;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use concord_core::{ConceptType, Error, Result, VectorHit, VectorIndex};

/// PostgreSQL implementation of [`VectorIndex`] using cosine distance.
#[derive(Clone)]
pub struct PgVectorIndex {
    pool: Pool<Postgres>,
}

impl PgVectorIndex {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VectorIndex for PgVectorIndex {
    async fn upsert(
        &self,
        tenant_id: &str,
        concept_id: Uuid,
        concept_type: ConceptType,
        vector: &[f32],
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO concept_embedding (tenant_id, concept_id, concept_type, vector)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (tenant_id, concept_id) DO UPDATE SET
                concept_type = EXCLUDED.concept_type,
                vector = EXCLUDED.vector,
                updated_at = now()",
        )
        .bind(tenant_id)
        .bind(concept_id)
        .bind(concept_type.as_str())
        .bind(Vector::from(vector.to_vec()))
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn get_vector(&self, tenant_id: &str, concept_id: Uuid) -> Result<Option<Vec<f32>>> {
        let row = sqlx::query(
            "SELECT vector FROM concept_embedding WHERE tenant_id = $1 AND concept_id = $2",
        )
        .bind(tenant_id)
        .bind(concept_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.map(|r| {
            let v: Vector = r.get("vector");
            v.to_vec()
        }))
    }

    async fn search(
        &self,
        tenant_id: &str,
        vector: &[f32],
        types: &[ConceptType],
        top_k: usize,
    ) -> Result<Vec<VectorHit>> {
        let type_tags: Vec<&str> = types.iter().map(ConceptType::as_str).collect();
        // Only active concepts are candidates; merged ones keep stale vectors.
        let rows = sqlx::query(
            "SELECT e.concept_id, e.concept_type,
                    1.0 - (e.vector <=> $2::vector) AS similarity
             FROM concept_embedding e
             JOIN canonical_concept c ON c.id = e.concept_id AND c.status = 'active'
             WHERE e.tenant_id = $1
               AND (cardinality($3::text[]) = 0 OR e.concept_type = ANY($3))
             ORDER BY e.vector <=> $2::vector
             LIMIT $4",
        )
        .bind(tenant_id)
        .bind(Vector::from(vector.to_vec()))
        .bind(&type_tags)
        .bind(top_k as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let concept_type: String = row.get("concept_type");
                let similarity: f64 = row.get("similarity");
                VectorHit {
                    concept_id: row.get("concept_id"),
                    concept_type: ConceptType::from_tag(&concept_type),
                    similarity: (similarity as f32).clamp(0.0, 1.0),
                }
            })
            .collect())
    }

    async fn remove(&self, tenant_id: &str, concept_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM concept_embedding WHERE tenant_id = $1 AND concept_id = $2")
            .bind(tenant_id)
            .bind(concept_id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }
}
