//! Merge proposal repository for corpus runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use concord_core::{
    ConceptType, Error, MergeProposal, PairId, ProposalCounts, ProposalRepository, Result,
    SignalBreakdown,
};

const COLUMNS: &str = "id, tenant_id, pair_id, id_a, id_b, concept_type, signals, score, \
     decision_reason, applied, applied_by, applied_at, merge_id, created_at";

/// PostgreSQL implementation of [`ProposalRepository`].
#[derive(Clone)]
pub struct PgProposalRepository {
    pool: Pool<Postgres>,
}

impl PgProposalRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

fn proposal_from_row(row: &PgRow) -> Result<MergeProposal> {
    let pair_id: String = row.get("pair_id");
    let concept_type: String = row.get("concept_type");
    let signals: Json<SignalBreakdown> = row.get("signals");
    Ok(MergeProposal {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        pair_id: PairId::parse(&pair_id)?,
        id_a: row.get("id_a"),
        id_b: row.get("id_b"),
        concept_type: ConceptType::from_tag(&concept_type),
        signals: signals.0,
        score: row.get("score"),
        decision_reason: row.get("decision_reason"),
        applied: row.get("applied"),
        applied_by: row.get("applied_by"),
        applied_at: row.get("applied_at"),
        merge_id: row.get("merge_id"),
        created_at: row.get("created_at"),
    })
}

#[async_trait]
impl ProposalRepository for PgProposalRepository {
    async fn insert(&self, proposal: &MergeProposal) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        sqlx::query(
            "DELETE FROM merge_proposal WHERE tenant_id = $1 AND pair_id = $2 AND NOT applied",
        )
        .bind(&proposal.tenant_id)
        .bind(proposal.pair_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        sqlx::query(
            "INSERT INTO merge_proposal
                (id, tenant_id, pair_id, id_a, id_b, concept_type, signals, score,
                 decision_reason, applied, applied_by, applied_at, merge_id, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(proposal.id)
        .bind(&proposal.tenant_id)
        .bind(proposal.pair_id.to_string())
        .bind(proposal.id_a)
        .bind(proposal.id_b)
        .bind(proposal.concept_type.as_str())
        .bind(Json(&proposal.signals))
        .bind(proposal.score)
        .bind(&proposal.decision_reason)
        .bind(proposal.applied)
        .bind(&proposal.applied_by)
        .bind(proposal.applied_at)
        .bind(proposal.merge_id)
        .bind(proposal.created_at)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }

    async fn get(&self, tenant_id: &str, id: Uuid) -> Result<Option<MergeProposal>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM merge_proposal WHERE tenant_id = $1 AND id = $2",
            COLUMNS
        ))
        .bind(tenant_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        row.as_ref().map(proposal_from_row).transpose()
    }

    async fn list_pending(&self, tenant_id: &str, limit: usize) -> Result<Vec<MergeProposal>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM merge_proposal
             WHERE tenant_id = $1 AND NOT applied
             ORDER BY score DESC, id
             LIMIT $2",
            COLUMNS
        ))
        .bind(tenant_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        rows.iter().map(proposal_from_row).collect()
    }

    async fn mark_applied(
        &self,
        tenant_id: &str,
        id: Uuid,
        applied_by: &str,
        applied_at: DateTime<Utc>,
        merge_id: Uuid,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE merge_proposal
             SET applied = TRUE, applied_by = $3, applied_at = $4, merge_id = $5
             WHERE tenant_id = $1 AND id = $2 AND NOT applied",
        )
        .bind(tenant_id)
        .bind(id)
        .bind(applied_by)
        .bind(applied_at)
        .bind(merge_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("pending merge proposal {}", id)));
        }
        Ok(())
    }

    async fn counts(&self, tenant_id: &str) -> Result<ProposalCounts> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total,
                    COUNT(*) FILTER (WHERE NOT applied) AS pending,
                    COUNT(*) FILTER (WHERE applied) AS applied
             FROM merge_proposal WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(ProposalCounts {
            total: row.get("total"),
            pending: row.get("pending"),
            applied: row.get("applied"),
        })
    }
}
