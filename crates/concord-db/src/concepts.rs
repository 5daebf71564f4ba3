//! PostgreSQL graph store: canonical concepts, relations, claims and
//! document mentions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{Pool, Postgres, Row};
use tracing::debug;
use uuid::Uuid;

use concord_core::{
    CanonicalConcept, Claim, ConceptStats, ConceptStatus, ConceptType, Error, GraphStore,
    RedirectTag, Relation, RelationRedirect, Result,
};

const CONCEPT_COLUMNS: &str = "id, tenant_id, canonical_name, concept_type, aliases, definition, \
     lexical_key, status, merged_into, merged_at, confidence, created_at, updated_at";

const RELATION_COLUMNS: &str =
    "id, tenant_id, source_id, target_id, relation_type, weight, provenance, created_at";

const CLAIM_COLUMNS: &str = "id, tenant_id, subject_id, predicate, object_id, object_literal, \
     document_id, provenance, created_at";

/// PostgreSQL implementation of [`GraphStore`].
#[derive(Clone)]
pub struct PgGraphStore {
    pool: Pool<Postgres>,
}

impl PgGraphStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

fn concept_from_row(row: &PgRow) -> Result<CanonicalConcept> {
    let concept_type: String = row.get("concept_type");
    let status: String = row.get("status");
    Ok(CanonicalConcept {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        canonical_name: row.get("canonical_name"),
        concept_type: ConceptType::from_tag(&concept_type),
        aliases: row.get("aliases"),
        definition: row.get("definition"),
        lexical_key: row.get("lexical_key"),
        status: status.parse().map_err(Error::Internal)?,
        merged_into: row.get("merged_into"),
        merged_at: row.get("merged_at"),
        confidence: row.get("confidence"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn relation_from_row(row: &PgRow) -> Relation {
    let provenance: Json<Vec<RedirectTag>> = row.get("provenance");
    Relation {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        source_id: row.get("source_id"),
        target_id: row.get("target_id"),
        relation_type: row.get("relation_type"),
        weight: row.get("weight"),
        provenance: provenance.0,
        created_at: row.get("created_at"),
    }
}

fn claim_from_row(row: &PgRow) -> Claim {
    let provenance: Json<Vec<RedirectTag>> = row.get("provenance");
    Claim {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        subject_id: row.get("subject_id"),
        predicate: row.get("predicate"),
        object_id: row.get("object_id"),
        object_literal: row.get("object_literal"),
        document_id: row.get("document_id"),
        provenance: provenance.0,
        created_at: row.get("created_at"),
    }
}

/// JSON containment probe matching any provenance stack holding `merge_id`.
fn provenance_probe(merge_id: Uuid) -> serde_json::Value {
    serde_json::json!([{ "merge_id": merge_id }])
}

#[async_trait]
impl GraphStore for PgGraphStore {
    async fn ensure_indexes(&self) -> Result<()> {
        for stmt in [
            "CREATE INDEX IF NOT EXISTS idx_concept_tenant_type_status \
             ON canonical_concept (tenant_id, concept_type, status)",
            "CREATE INDEX IF NOT EXISTS idx_concept_tenant_lexical_key \
             ON canonical_concept (tenant_id, lexical_key)",
            "CREATE INDEX IF NOT EXISTS idx_relation_source ON concept_relation (tenant_id, source_id)",
            "CREATE INDEX IF NOT EXISTS idx_relation_target ON concept_relation (tenant_id, target_id)",
        ] {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(Error::Database)?;
        }
        Ok(())
    }

    async fn upsert_concept(&self, concept: &CanonicalConcept) -> Result<()> {
        sqlx::query(
            "INSERT INTO canonical_concept
                (id, tenant_id, canonical_name, concept_type, aliases, definition, lexical_key,
                 status, merged_into, merged_at, confidence, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
             ON CONFLICT (id) DO UPDATE SET
                canonical_name = EXCLUDED.canonical_name,
                concept_type = EXCLUDED.concept_type,
                aliases = EXCLUDED.aliases,
                definition = EXCLUDED.definition,
                lexical_key = EXCLUDED.lexical_key,
                status = EXCLUDED.status,
                merged_into = EXCLUDED.merged_into,
                merged_at = EXCLUDED.merged_at,
                confidence = EXCLUDED.confidence,
                updated_at = now()",
        )
        .bind(concept.id)
        .bind(&concept.tenant_id)
        .bind(&concept.canonical_name)
        .bind(concept.concept_type.as_str())
        .bind(&concept.aliases)
        .bind(&concept.definition)
        .bind(&concept.lexical_key)
        .bind(concept.status.as_str())
        .bind(concept.merged_into)
        .bind(concept.merged_at)
        .bind(concept.confidence)
        .bind(concept.created_at)
        .bind(concept.updated_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn get_concept(&self, tenant_id: &str, id: Uuid) -> Result<Option<CanonicalConcept>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM canonical_concept WHERE tenant_id = $1 AND id = $2",
            CONCEPT_COLUMNS
        ))
        .bind(tenant_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.as_ref().map(concept_from_row).transpose()
    }

    async fn get_concepts(&self, tenant_id: &str, ids: &[Uuid]) -> Result<Vec<CanonicalConcept>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            "SELECT {} FROM canonical_concept WHERE tenant_id = $1 AND id = ANY($2)",
            CONCEPT_COLUMNS
        ))
        .bind(tenant_id)
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.iter().map(concept_from_row).collect()
    }

    async fn list_active_concepts(
        &self,
        tenant_id: &str,
        types: &[ConceptType],
    ) -> Result<Vec<CanonicalConcept>> {
        let type_tags: Vec<&str> = types.iter().map(ConceptType::as_str).collect();
        let rows = sqlx::query(&format!(
            "SELECT {} FROM canonical_concept
             WHERE tenant_id = $1 AND status = 'active'
               AND (cardinality($2::text[]) = 0 OR concept_type = ANY($2))
             ORDER BY created_at, id",
            CONCEPT_COLUMNS
        ))
        .bind(tenant_id)
        .bind(&type_tags)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        debug!(
            subsystem = "db",
            component = "graph_store",
            op = "list_active_concepts",
            tenant_id,
            result_count = rows.len(),
            "Loaded active concepts"
        );
        rows.iter().map(concept_from_row).collect()
    }

    async fn set_aliases(&self, tenant_id: &str, id: Uuid, aliases: &[String]) -> Result<()> {
        let result = sqlx::query(
            "UPDATE canonical_concept SET aliases = $3, updated_at = now()
             WHERE tenant_id = $1 AND id = $2",
        )
        .bind(tenant_id)
        .bind(id)
        .bind(aliases)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        if result.rows_affected() == 0 {
            return Err(Error::ConceptNotFound(id));
        }
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
        let result = sqlx::query(
            "UPDATE canonical_concept
             SET status = $3, merged_into = $4, merged_at = $5, updated_at = now()
             WHERE tenant_id = $1 AND id = $2",
        )
        .bind(tenant_id)
        .bind(id)
        .bind(status.as_str())
        .bind(merged_into)
        .bind(merged_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        if result.rows_affected() == 0 {
            return Err(Error::ConceptNotFound(id));
        }
        Ok(())
    }

    async fn list_merged_into(&self, tenant_id: &str, target: Uuid) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            "SELECT id FROM canonical_concept WHERE tenant_id = $1 AND merged_into = $2 ORDER BY id",
        )
        .bind(tenant_id)
        .bind(target)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    async fn repoint_merged_into(
        &self,
        tenant_id: &str,
        ids: &[Uuid],
        target: Uuid,
    ) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            "UPDATE canonical_concept SET merged_into = $3, updated_at = now()
             WHERE tenant_id = $1 AND id = ANY($2)",
        )
        .bind(tenant_id)
        .bind(ids)
        .bind(target)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected())
    }

    async fn relations_of(&self, tenant_id: &str, id: Uuid) -> Result<Vec<Relation>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM concept_relation
             WHERE tenant_id = $1 AND (source_id = $2 OR target_id = $2)
             ORDER BY created_at, id",
            RELATION_COLUMNS
        ))
        .bind(tenant_id)
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(rows.iter().map(relation_from_row).collect())
    }

    async fn count_relations(&self, tenant_id: &str, id: Uuid) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM concept_relation
             WHERE tenant_id = $1 AND (source_id = $2 OR target_id = $2)",
        )
        .bind(tenant_id)
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(row.get("n"))
    }

    async fn insert_relation(&self, relation: &Relation) -> Result<()> {
        sqlx::query(
            "INSERT INTO concept_relation
                (id, tenant_id, source_id, target_id, relation_type, weight, provenance, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (id) DO UPDATE SET
                source_id = EXCLUDED.source_id,
                target_id = EXCLUDED.target_id,
                provenance = EXCLUDED.provenance",
        )
        .bind(relation.id)
        .bind(&relation.tenant_id)
        .bind(relation.source_id)
        .bind(relation.target_id)
        .bind(&relation.relation_type)
        .bind(relation.weight)
        .bind(Json(&relation.provenance))
        .bind(relation.created_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn delete_relation(&self, tenant_id: &str, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM concept_relation WHERE tenant_id = $1 AND id = $2")
            .bind(tenant_id)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn redirect_relations(
        &self,
        tenant_id: &str,
        from: Uuid,
        to: Uuid,
        merge_id: Uuid,
    ) -> Result<RelationRedirect> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let rows = sqlx::query(&format!(
            "SELECT {} FROM concept_relation
             WHERE tenant_id = $1 AND (source_id = $2 OR target_id = $2)
             FOR UPDATE",
            RELATION_COLUMNS
        ))
        .bind(tenant_id)
        .bind(from)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let now = Utc::now();
        let mut outcome = RelationRedirect::default();
        for row in &rows {
            let original = relation_from_row(row);
            if original.becomes_self_loop(from, to) {
                sqlx::query("DELETE FROM concept_relation WHERE id = $1")
                    .bind(original.id)
                    .execute(&mut *tx)
                    .await
                    .map_err(Error::Database)?;
                outcome.dropped.push(original);
                continue;
            }
            let mut redirected = original;
            redirected.apply_redirect(from, to, merge_id, now);
            sqlx::query(
                "UPDATE concept_relation SET source_id = $2, target_id = $3, provenance = $4
                 WHERE id = $1",
            )
            .bind(redirected.id)
            .bind(redirected.source_id)
            .bind(redirected.target_id)
            .bind(Json(&redirected.provenance))
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
            outcome.redirected += 1;
        }

        tx.commit().await.map_err(Error::Database)?;
        Ok(outcome)
    }

    async fn restore_relations(&self, tenant_id: &str, merge_id: Uuid) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let rows = sqlx::query(&format!(
            "SELECT {} FROM concept_relation
             WHERE tenant_id = $1 AND provenance @> $2
             FOR UPDATE",
            RELATION_COLUMNS
        ))
        .bind(tenant_id)
        .bind(provenance_probe(merge_id))
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let mut restored = 0u64;
        for row in &rows {
            let mut relation = relation_from_row(row);
            if !relation.undo_redirect(merge_id) {
                continue;
            }
            sqlx::query(
                "UPDATE concept_relation SET source_id = $2, target_id = $3, provenance = $4
                 WHERE id = $1",
            )
            .bind(relation.id)
            .bind(relation.source_id)
            .bind(relation.target_id)
            .bind(Json(&relation.provenance))
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
            restored += 1;
        }

        tx.commit().await.map_err(Error::Database)?;
        Ok(restored)
    }

    async fn insert_claim(&self, claim: &Claim) -> Result<()> {
        sqlx::query(
            "INSERT INTO concept_claim
                (id, tenant_id, subject_id, predicate, object_id, object_literal, document_id,
                 provenance, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(claim.id)
        .bind(&claim.tenant_id)
        .bind(claim.subject_id)
        .bind(&claim.predicate)
        .bind(claim.object_id)
        .bind(&claim.object_literal)
        .bind(claim.document_id)
        .bind(Json(&claim.provenance))
        .bind(claim.created_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn claims_of(&self, tenant_id: &str, id: Uuid) -> Result<Vec<Claim>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM concept_claim
             WHERE tenant_id = $1 AND (subject_id = $2 OR object_id = $2)
             ORDER BY created_at, id",
            CLAIM_COLUMNS
        ))
        .bind(tenant_id)
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(rows.iter().map(claim_from_row).collect())
    }

    async fn redirect_claims(
        &self,
        tenant_id: &str,
        from: Uuid,
        to: Uuid,
        merge_id: Uuid,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let rows = sqlx::query(&format!(
            "SELECT {} FROM concept_claim
             WHERE tenant_id = $1 AND (subject_id = $2 OR object_id = $2)
             FOR UPDATE",
            CLAIM_COLUMNS
        ))
        .bind(tenant_id)
        .bind(from)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let now = Utc::now();
        for row in &rows {
            let mut claim = claim_from_row(row);
            claim.apply_redirect(from, to, merge_id, now);
            sqlx::query(
                "UPDATE concept_claim SET subject_id = $2, object_id = $3, provenance = $4
                 WHERE id = $1",
            )
            .bind(claim.id)
            .bind(claim.subject_id)
            .bind(claim.object_id)
            .bind(Json(&claim.provenance))
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }

        tx.commit().await.map_err(Error::Database)?;
        Ok(rows.len() as u64)
    }

    async fn restore_claims(&self, tenant_id: &str, merge_id: Uuid) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let rows = sqlx::query(&format!(
            "SELECT {} FROM concept_claim
             WHERE tenant_id = $1 AND provenance @> $2
             FOR UPDATE",
            CLAIM_COLUMNS
        ))
        .bind(tenant_id)
        .bind(provenance_probe(merge_id))
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let mut restored = 0u64;
        for row in &rows {
            let mut claim = claim_from_row(row);
            if !claim.undo_redirect(merge_id) {
                continue;
            }
            sqlx::query(
                "UPDATE concept_claim SET subject_id = $2, object_id = $3, provenance = $4
                 WHERE id = $1",
            )
            .bind(claim.id)
            .bind(claim.subject_id)
            .bind(claim.object_id)
            .bind(Json(&claim.provenance))
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
            restored += 1;
        }

        tx.commit().await.map_err(Error::Database)?;
        Ok(restored)
    }

    async fn add_document_mention(
        &self,
        tenant_id: &str,
        concept_id: Uuid,
        document_id: Uuid,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO concept_document (tenant_id, concept_id, document_id)
             VALUES ($1, $2, $3)
             ON CONFLICT DO NOTHING",
        )
        .bind(tenant_id)
        .bind(concept_id)
        .bind(document_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn document_count(&self, tenant_id: &str, id: Uuid) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM concept_document WHERE tenant_id = $1 AND concept_id = $2",
        )
        .bind(tenant_id)
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(row.get("n"))
    }

    async fn shared_document_count(&self, tenant_id: &str, a: Uuid, b: Uuid) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n
             FROM concept_document da
             JOIN concept_document db
               ON db.tenant_id = da.tenant_id AND db.document_id = da.document_id
             WHERE da.tenant_id = $1 AND da.concept_id = $2 AND db.concept_id = $3",
        )
        .bind(tenant_id)
        .bind(a)
        .bind(b)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(row.get("n"))
    }

    async fn concept_stats(&self, tenant_id: &str) -> Result<ConceptStats> {
        let row = sqlx::query(
            "SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE status = 'active') AS active,
                COUNT(*) FILTER (WHERE status = 'merged') AS merged,
                COUNT(*) FILTER (WHERE status = 'deprecated') AS deprecated,
                COUNT(*) FILTER (
                    WHERE status = 'active' AND NOT EXISTS (
                        SELECT 1 FROM canonical_concept m
                        WHERE m.tenant_id = c.tenant_id AND m.merged_into = c.id
                    )
                ) AS standalone
             FROM canonical_concept c
             WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(ConceptStats {
            total: row.get("total"),
            active: row.get("active"),
            merged: row.get("merged"),
            deprecated: row.get("deprecated"),
            standalone: row.get("standalone"),
        })
    }
}
