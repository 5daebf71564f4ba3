//! Deferred merge candidate repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use concord_core::{
    ConceptType, DeferredMergeCandidate, DeferredRepository, Error, EvidenceCounters, PairId,
    Result, SignalBreakdown,
};

const COLUMNS: &str = "tenant_id, pair_id, id_a, id_b, concept_type, signals, score, \
     doc_count_a, doc_count_b, shared_doc_count, created_at, last_evaluated_at, \
     evaluation_count, expires_at, status";

/// PostgreSQL implementation of [`DeferredRepository`].
#[derive(Clone)]
pub struct PgDeferredRepository {
    pool: Pool<Postgres>,
}

impl PgDeferredRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

fn entry_from_row(row: &PgRow) -> Result<DeferredMergeCandidate> {
    let pair_id: String = row.get("pair_id");
    let concept_type: String = row.get("concept_type");
    let status: String = row.get("status");
    let signals: Json<SignalBreakdown> = row.get("signals");
    Ok(DeferredMergeCandidate {
        tenant_id: row.get("tenant_id"),
        pair_id: PairId::parse(&pair_id)?,
        id_a: row.get("id_a"),
        id_b: row.get("id_b"),
        concept_type: ConceptType::from_tag(&concept_type),
        signals: signals.0,
        score: row.get("score"),
        evidence: EvidenceCounters {
            doc_count_a: row.get("doc_count_a"),
            doc_count_b: row.get("doc_count_b"),
            shared_doc_count: row.get("shared_doc_count"),
        },
        created_at: row.get("created_at"),
        last_evaluated_at: row.get("last_evaluated_at"),
        evaluation_count: row.get("evaluation_count"),
        expires_at: row.get("expires_at"),
        status: status.parse().map_err(Error::Internal)?,
    })
}

#[async_trait]
impl DeferredRepository for PgDeferredRepository {
    async fn upsert(&self, entry: &DeferredMergeCandidate) -> Result<bool> {
        // xmax = 0 only for freshly inserted rows.
        let row = sqlx::query(
            "INSERT INTO deferred_merge_candidate
                (tenant_id, pair_id, id_a, id_b, concept_type, signals, score,
                 doc_count_a, doc_count_b, shared_doc_count, created_at, last_evaluated_at,
                 evaluation_count, expires_at, status)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
             ON CONFLICT (tenant_id, pair_id) DO UPDATE SET
                signals = EXCLUDED.signals,
                score = EXCLUDED.score,
                doc_count_a = EXCLUDED.doc_count_a,
                doc_count_b = EXCLUDED.doc_count_b,
                shared_doc_count = EXCLUDED.shared_doc_count,
                last_evaluated_at = EXCLUDED.last_evaluated_at,
                evaluation_count = GREATEST(EXCLUDED.evaluation_count,
                                            deferred_merge_candidate.evaluation_count + 1),
                status = EXCLUDED.status
             RETURNING (xmax = 0) AS inserted",
        )
        .bind(&entry.tenant_id)
        .bind(entry.pair_id.to_string())
        .bind(entry.id_a)
        .bind(entry.id_b)
        .bind(entry.concept_type.as_str())
        .bind(Json(&entry.signals))
        .bind(entry.score)
        .bind(entry.evidence.doc_count_a)
        .bind(entry.evidence.doc_count_b)
        .bind(entry.evidence.shared_doc_count)
        .bind(entry.created_at)
        .bind(entry.last_evaluated_at)
        .bind(entry.evaluation_count)
        .bind(entry.expires_at)
        .bind(entry.status.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(row.get("inserted"))
    }

    async fn get(
        &self,
        tenant_id: &str,
        pair_id: &PairId,
    ) -> Result<Option<DeferredMergeCandidate>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM deferred_merge_candidate WHERE tenant_id = $1 AND pair_id = $2",
            COLUMNS
        ))
        .bind(tenant_id)
        .bind(pair_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        row.as_ref().map(entry_from_row).transpose()
    }

    async fn delete(&self, tenant_id: &str, pair_id: &PairId) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM deferred_merge_candidate WHERE tenant_id = $1 AND pair_id = $2",
        )
        .bind(tenant_id)
        .bind(pair_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_for_concept(&self, tenant_id: &str, concept_id: Uuid) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM deferred_merge_candidate
             WHERE tenant_id = $1 AND (id_a = $2 OR id_b = $2)",
        )
        .bind(tenant_id)
        .bind(concept_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected())
    }

    async fn count_pending(&self, tenant_id: &str) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM deferred_merge_candidate
             WHERE tenant_id = $1 AND status = 'pending'",
        )
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(row.get("n"))
    }

    async fn oldest_pending(
        &self,
        tenant_id: &str,
        limit: usize,
    ) -> Result<Vec<DeferredMergeCandidate>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM deferred_merge_candidate
             WHERE tenant_id = $1 AND status = 'pending'
             ORDER BY created_at, pair_id
             LIMIT $2",
            COLUMNS
        ))
        .bind(tenant_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn list_pending(
        &self,
        tenant_id: &str,
        now: DateTime<Utc>,
        min_docs: Option<i64>,
        limit: usize,
    ) -> Result<Vec<DeferredMergeCandidate>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM deferred_merge_candidate
             WHERE tenant_id = $1 AND status = 'pending' AND expires_at > $2
               AND ($3::bigint IS NULL
                    OR doc_count_a + doc_count_b - shared_doc_count >= $3)
             ORDER BY last_evaluated_at, pair_id
             LIMIT $4",
            COLUMNS
        ))
        .bind(tenant_id)
        .bind(now)
        .bind(min_docs)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn purge_expired(
        &self,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<DeferredMergeCandidate>> {
        let rows = sqlx::query(&format!(
            "DELETE FROM deferred_merge_candidate
             WHERE tenant_id = $1 AND expires_at <= $2
             RETURNING {}",
            COLUMNS
        ))
        .bind(tenant_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        rows.iter().map(entry_from_row).collect()
    }
}
