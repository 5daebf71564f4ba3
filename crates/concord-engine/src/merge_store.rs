//! Corpus merge store: the proposal review queue.
//!
//! Proposals have no TTL. A proposal is marked applied only after its merge
//! succeeded; a failed merge leaves it pending.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use concord_core::{
    Error, MergeCandidate, MergeProposal, MergeResult, MergeTrigger, ProposalCounts,
    ProposalRepository, Result,
};

use crate::resolver::{IdentityResolver, MergeRequest};

/// Tenant-scoped proposal queue.
pub struct MergeStore {
    tenant_id: String,
    proposals: Arc<dyn ProposalRepository>,
}

impl MergeStore {
    pub fn new(tenant_id: impl Into<String>, proposals: Arc<dyn ProposalRepository>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            proposals,
        }
    }

    /// Persist a PROPOSE outcome. A pending proposal for the same pair is
    /// replaced.
    pub async fn propose(&self, candidate: &MergeCandidate, reason: &str) -> Result<MergeProposal> {
        let proposal = MergeProposal::from_candidate(self.tenant_id.clone(), candidate, reason);
        self.proposals.insert(&proposal).await?;
        Ok(proposal)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<MergeProposal>> {
        self.proposals.get(&self.tenant_id, id).await
    }

    /// Pending proposals, highest score first.
    pub async fn pending(&self, limit: usize) -> Result<Vec<MergeProposal>> {
        self.proposals.list_pending(&self.tenant_id, limit).await
    }

    pub async fn counts(&self) -> Result<ProposalCounts> {
        self.proposals.counts(&self.tenant_id).await
    }

    /// Execute a stored proposal with its stored scores.
    #[instrument(skip(self, resolver), fields(subsystem = "engine", component = "merge_store", op = "apply_proposal", tenant_id = %self.tenant_id, proposal_id = %id))]
    pub async fn apply(&self, id: Uuid, applied_by: &str, resolver: &IdentityResolver) -> Result<MergeResult> {
        let proposal = self
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("proposal {}", id)))?;
        if proposal.applied {
            return Err(Error::InvalidState(format!(
                "proposal {} was already applied by {}",
                id,
                proposal.applied_by.as_deref().unwrap_or("unknown")
            )));
        }

        let request = MergeRequest::from_candidate(
            &proposal.to_candidate(),
            MergeTrigger::Proposal,
            proposal.decision_reason.clone(),
        );
        let result = resolver.merge(request).await?;
        if !result.success {
            warn!(
                merge_id = %result.merge_id,
                error = result.error.as_deref().unwrap_or(""),
                "Proposal merge failed, proposal stays pending"
            );
            return Ok(result);
        }

        if let Err(e) = self
            .proposals
            .mark_applied(&self.tenant_id, id, applied_by, Utc::now(), result.merge_id)
            .await
        {
            error!(merge_id = %result.merge_id, error = %e, "Merge succeeded but proposal could not be marked applied");
            return Err(e);
        }
        info!(merge_id = %result.merge_id, applied_by, "Proposal applied");
        Ok(result)
    }
}
