//! Append-only merge and rollback audit log.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use concord_core::{
    Error, MergeAuditRepository, MergeCounts, MergeResult, MergeStep, Relation, Result,
    RollbackRecord, SignalBreakdown,
};

const MERGE_COLUMNS: &str = "merge_id, tenant_id, survivor_id, merged_id, merge_trigger, reason, \
     score, signals, aliases_added, relations_redirected, dropped_relations, claims_redirected, \
     repointed, success, failed_step, error, executed_at";

const ROLLBACK_COLUMNS: &str = "id, merge_id, tenant_id, survivor_id, merged_id, aliases_removed, \
     relations_restored, claims_restored, repointed_restored, rolled_back_by, rolled_back_at";

/// PostgreSQL implementation of [`MergeAuditRepository`].
#[derive(Clone)]
pub struct PgMergeAuditRepository {
    pool: Pool<Postgres>,
}

impl PgMergeAuditRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

fn parse_step(s: &str) -> Result<MergeStep> {
    match s {
        "aliases" => Ok(MergeStep::Aliases),
        "relations" => Ok(MergeStep::Relations),
        "claims" => Ok(MergeStep::Claims),
        "status" => Ok(MergeStep::Status),
        "cache_invalidation" => Ok(MergeStep::CacheInvalidation),
        other => Err(Error::Internal(format!("unknown merge step: {}", other))),
    }
}

fn merge_from_row(row: &PgRow) -> Result<MergeResult> {
    let trigger: String = row.get("merge_trigger");
    let signals: Option<Json<SignalBreakdown>> = row.get("signals");
    let dropped: Json<Vec<Relation>> = row.get("dropped_relations");
    let failed_step: Option<String> = row.get("failed_step");
    let relations_redirected: i64 = row.get("relations_redirected");
    let claims_redirected: i64 = row.get("claims_redirected");
    Ok(MergeResult {
        merge_id: row.get("merge_id"),
        tenant_id: row.get("tenant_id"),
        survivor_id: row.get("survivor_id"),
        merged_id: row.get("merged_id"),
        trigger: trigger.parse().map_err(Error::Internal)?,
        reason: row.get("reason"),
        score: row.get("score"),
        signals: signals.map(|s| s.0),
        aliases_added: row.get("aliases_added"),
        relations_redirected: relations_redirected as u64,
        dropped_relations: dropped.0,
        claims_redirected: claims_redirected as u64,
        repointed: row.get("repointed"),
        success: row.get("success"),
        failed_step: failed_step.as_deref().map(parse_step).transpose()?,
        error: row.get("error"),
        executed_at: row.get("executed_at"),
    })
}

fn rollback_from_row(row: &PgRow) -> RollbackRecord {
    let relations_restored: i64 = row.get("relations_restored");
    let claims_restored: i64 = row.get("claims_restored");
    let repointed_restored: i64 = row.get("repointed_restored");
    RollbackRecord {
        id: row.get("id"),
        merge_id: row.get("merge_id"),
        tenant_id: row.get("tenant_id"),
        survivor_id: row.get("survivor_id"),
        merged_id: row.get("merged_id"),
        aliases_removed: row.get("aliases_removed"),
        relations_restored: relations_restored as u64,
        claims_restored: claims_restored as u64,
        repointed_restored: repointed_restored as u64,
        rolled_back_by: row.get("rolled_back_by"),
        rolled_back_at: row.get("rolled_back_at"),
    }
}

#[async_trait]
impl MergeAuditRepository for PgMergeAuditRepository {
    async fn record_merge(&self, result: &MergeResult) -> Result<()> {
        sqlx::query(
            "INSERT INTO merge_audit
                (merge_id, tenant_id, survivor_id, merged_id, merge_trigger, reason, score,
                 signals, aliases_added, relations_redirected, dropped_relations,
                 claims_redirected, repointed, success, failed_step, error, executed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)",
        )
        .bind(result.merge_id)
        .bind(&result.tenant_id)
        .bind(result.survivor_id)
        .bind(result.merged_id)
        .bind(result.trigger.as_str())
        .bind(&result.reason)
        .bind(result.score)
        .bind(result.signals.as_ref().map(Json))
        .bind(&result.aliases_added)
        .bind(result.relations_redirected as i64)
        .bind(Json(&result.dropped_relations))
        .bind(result.claims_redirected as i64)
        .bind(&result.repointed)
        .bind(result.success)
        .bind(result.failed_step.map(|s| s.as_str()))
        .bind(&result.error)
        .bind(result.executed_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn get_merge(&self, tenant_id: &str, merge_id: Uuid) -> Result<Option<MergeResult>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM merge_audit WHERE tenant_id = $1 AND merge_id = $2",
            MERGE_COLUMNS
        ))
        .bind(tenant_id)
        .bind(merge_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        row.as_ref().map(merge_from_row).transpose()
    }

    async fn latest_merge_touching(
        &self,
        tenant_id: &str,
        concept_id: Uuid,
    ) -> Result<Option<MergeResult>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM merge_audit a
             WHERE a.tenant_id = $1 AND a.success
               AND (a.survivor_id = $2 OR a.merged_id = $2)
               AND NOT EXISTS (SELECT 1 FROM merge_rollback r WHERE r.merge_id = a.merge_id)
             ORDER BY a.executed_at DESC, a.merge_id DESC
             LIMIT 1",
            MERGE_COLUMNS
        ))
        .bind(tenant_id)
        .bind(concept_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        row.as_ref().map(merge_from_row).transpose()
    }

    async fn merge_history(&self, tenant_id: &str, concept_id: Uuid) -> Result<Vec<MergeResult>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM merge_audit
             WHERE tenant_id = $1 AND (survivor_id = $2 OR merged_id = $2)
             ORDER BY executed_at DESC, merge_id DESC",
            MERGE_COLUMNS
        ))
        .bind(tenant_id)
        .bind(concept_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        rows.iter().map(merge_from_row).collect()
    }

    async fn record_rollback(&self, record: &RollbackRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO merge_rollback
                (id, merge_id, tenant_id, survivor_id, merged_id, aliases_removed,
                 relations_restored, claims_restored, repointed_restored, rolled_back_by,
                 rolled_back_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(record.id)
        .bind(record.merge_id)
        .bind(&record.tenant_id)
        .bind(record.survivor_id)
        .bind(record.merged_id)
        .bind(&record.aliases_removed)
        .bind(record.relations_restored as i64)
        .bind(record.claims_restored as i64)
        .bind(record.repointed_restored as i64)
        .bind(&record.rolled_back_by)
        .bind(record.rolled_back_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn get_rollback(
        &self,
        tenant_id: &str,
        merge_id: Uuid,
    ) -> Result<Option<RollbackRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM merge_rollback WHERE tenant_id = $1 AND merge_id = $2",
            ROLLBACK_COLUMNS
        ))
        .bind(tenant_id)
        .bind(merge_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(row.as_ref().map(rollback_from_row))
    }

    async fn counts(&self, tenant_id: &str) -> Result<MergeCounts> {
        let row = sqlx::query(
            "SELECT
                COUNT(*) FILTER (WHERE success) AS succeeded,
                COUNT(*) FILTER (WHERE NOT success) AS failed,
                (SELECT COUNT(*) FROM merge_rollback r WHERE r.tenant_id = $1) AS rolled_back
             FROM merge_audit WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(MergeCounts {
            succeeded: row.get("succeeded"),
            failed: row.get("failed"),
            rolled_back: row.get("rolled_back"),
        })
    }
}
