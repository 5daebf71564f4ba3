//! Human-readable and JSON rendering of command results.

use std::fmt::Write as _;

use serde::Serialize;

use concord_core::{CanonicalConcept, MergeProposal, MergeResult, ResolutionStats, RollbackRecord};
use concord_engine::RunReport;

/// Prints results to stdout, either as pretty JSON or as a short summary.
pub struct Printer {
    json: bool,
}

impl Printer {
    pub fn new(json: bool) -> Self {
        Self { json }
    }

    fn emit<T: Serialize>(&self, value: &T, human: impl FnOnce() -> String) -> anyhow::Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            print!("{}", human());
        }
        Ok(())
    }

    pub fn message(&self, text: &str) -> anyhow::Result<()> {
        self.emit(&serde_json::json!({ "message": text }), || format!("{}\n", text))
    }

    pub fn report(&self, report: &RunReport) -> anyhow::Result<()> {
        self.emit(report, || report.to_string())
    }

    pub fn proposals(&self, proposals: &[MergeProposal]) -> anyhow::Result<()> {
        self.emit(&proposals, || render_proposals(proposals))
    }

    pub fn merge(&self, result: &MergeResult) -> anyhow::Result<()> {
        self.emit(result, || render_merge(result))
    }

    pub fn rollback(&self, record: &RollbackRecord) -> anyhow::Result<()> {
        self.emit(record, || {
            format!(
                "rolled back merge {}\n  survivor {}  restored {}\n  aliases removed {}  relations {}  claims {}  repointed {}\n",
                record.merge_id,
                record.survivor_id,
                record.merged_id,
                record.aliases_removed.len(),
                record.relations_restored,
                record.claims_restored,
                record.repointed_restored
            )
        })
    }

    pub fn concept(&self, concept: &CanonicalConcept) -> anyhow::Result<()> {
        self.emit(concept, || {
            let mut out = format!(
                "{} {} ({}, {})\n",
                concept.id,
                concept.canonical_name,
                concept.concept_type,
                concept.status.as_str()
            );
            if !concept.aliases.is_empty() {
                let _ = writeln!(out, "  aliases: {}", concept.aliases.join(", "));
            }
            out
        })
    }

    pub fn stats(&self, stats: &ResolutionStats) -> anyhow::Result<()> {
        self.emit(stats, || render_stats(stats))
    }
}

fn render_proposals(proposals: &[MergeProposal]) -> String {
    if proposals.is_empty() {
        return "no pending proposals\n".to_string();
    }
    let mut out = String::new();
    for p in proposals {
        let _ = writeln!(
            out,
            "{}  {:.3}  {:<12}  {}  {}",
            p.id, p.score, p.concept_type, p.pair_id, p.decision_reason
        );
    }
    let _ = writeln!(out, "{} pending", proposals.len());
    out
}

fn render_merge(result: &MergeResult) -> String {
    let mut out = if result.success {
        format!(
            "merged {} into {} (merge {})\n",
            result.merged_id, result.survivor_id, result.merge_id
        )
    } else {
        format!(
            "merge {} failed at {:?}: {}\n",
            result.merge_id,
            result.failed_step,
            result.error.as_deref().unwrap_or("unknown error")
        )
    };
    let _ = writeln!(
        out,
        "  aliases {}  relations {} (dropped {})  claims {}  repointed {}",
        result.aliases_migrated(),
        result.relations_redirected,
        result.dropped_relations.len(),
        result.claims_redirected,
        result.repointed.len()
    );
    out
}

fn render_stats(stats: &ResolutionStats) -> String {
    let c = &stats.concepts;
    let mut out = format!("tenant {}\n", stats.tenant_id);
    let _ = writeln!(
        out,
        "  concepts   total {}  active {}  merged {}  deprecated {}  standalone {}",
        c.total, c.active, c.merged, c.deprecated, c.standalone
    );
    let _ = writeln!(
        out,
        "  proposals  total {}  pending {}  applied {}",
        stats.proposals.total, stats.proposals.pending, stats.proposals.applied
    );
    let _ = writeln!(
        out,
        "  merges     succeeded {}  failed {}  rolled back {}",
        stats.merges.succeeded, stats.merges.failed, stats.merges.rolled_back
    );
    let _ = writeln!(out, "  deferred   pending {}", stats.deferred_pending);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::{ConceptType, MergeCandidate, MergeTrigger, SignalBreakdown};
    use uuid::Uuid;

    #[test]
    fn test_empty_proposal_list() {
        assert_eq!(render_proposals(&[]), "no pending proposals\n");
    }

    #[test]
    fn test_proposal_rows_include_reason() {
        let candidate = MergeCandidate::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            ConceptType::Technology,
            SignalBreakdown::default(),
        );
        let proposal = MergeProposal::from_candidate("acme", &candidate, "strong_lexical");
        let out = render_proposals(&[proposal]);
        assert!(out.contains("strong_lexical"));
        assert!(out.ends_with("1 pending\n"));
    }

    #[test]
    fn test_failed_merge_names_the_step() {
        let mut result = MergeResult::pending(
            "acme",
            Uuid::new_v4(),
            Uuid::new_v4(),
            MergeTrigger::Manual,
            "operator",
            1.0,
            None,
        );
        result.error = Some("claims: store error".to_string());
        let out = render_merge(&result);
        assert!(out.contains("failed"));
        assert!(out.contains("claims: store error"));
    }

    #[test]
    fn test_stats_summary() {
        let stats = ResolutionStats {
            tenant_id: "acme".to_string(),
            deferred_pending: 4,
            ..Default::default()
        };
        let out = render_stats(&stats);
        assert!(out.starts_with("tenant acme\n"));
        assert!(out.contains("deferred   pending 4"));
    }
}
