//! Run reports.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use concord_core::defaults::ERROR_SAMPLE_LIMIT;
use concord_core::Decision;

use crate::blocking::BlockingOutput;
use crate::config::EngineMode;
use crate::corpus::PruneStats;

/// Bounded sample of error messages plus the total count.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorSample {
    pub messages: Vec<String>,
    pub total: usize,
}

impl ErrorSample {
    pub fn push(&mut self, message: impl Into<String>) {
        self.total += 1;
        if self.messages.len() < ERROR_SAMPLE_LIMIT {
            self.messages.push(message.into());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

/// Counters for one engine run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: uuid::Uuid,
    pub tenant_id: String,
    /// `resolve`, `corpus` or `reevaluate`.
    pub operation: &'static str,
    pub mode: EngineMode,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Pairs produced by blocking (or loaded from the deferred queue).
    pub candidates: usize,
    pub lexical_pairs: usize,
    pub vector_pairs: usize,
    pub skipped_buckets: usize,
    /// Pairs skipped because the reject store already holds them.
    pub filtered_rejected: usize,
    /// Pairs skipped because a concept is no longer active.
    pub skipped_inactive: usize,
    pub scored: usize,
    pub cache_hits: usize,
    pub degraded: usize,
    pub pruned: usize,
    pub gate_evaluated: usize,
    pub gate_blocked: usize,
    pub gate_downgraded: usize,
    pub auto: usize,
    pub merged: usize,
    pub merge_failed: usize,
    pub deferred: usize,
    pub proposed: usize,
    pub rejected: usize,
    pub expired: usize,
    pub evicted: usize,
    pub budget_dropped: usize,
    pub cancelled: bool,
    pub errors: ErrorSample,
}

impl RunReport {
    pub fn new(tenant_id: impl Into<String>, operation: &'static str, mode: EngineMode) -> Self {
        Self {
            run_id: concord_core::ids::new_v7(),
            tenant_id: tenant_id.into(),
            operation,
            mode,
            dry_run: false,
            started_at: Utc::now(),
            finished_at: None,
            candidates: 0,
            lexical_pairs: 0,
            vector_pairs: 0,
            skipped_buckets: 0,
            filtered_rejected: 0,
            skipped_inactive: 0,
            scored: 0,
            cache_hits: 0,
            degraded: 0,
            pruned: 0,
            gate_evaluated: 0,
            gate_blocked: 0,
            gate_downgraded: 0,
            auto: 0,
            merged: 0,
            merge_failed: 0,
            deferred: 0,
            proposed: 0,
            rejected: 0,
            expired: 0,
            evicted: 0,
            budget_dropped: 0,
            cancelled: false,
            errors: ErrorSample::default(),
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn record_blocking(&mut self, output: &BlockingOutput) {
        self.candidates += output.pairs.len();
        self.lexical_pairs += output.lexical_pairs;
        self.vector_pairs += output.vector_pairs;
        self.skipped_buckets += output.skipped_buckets;
    }

    pub fn record_prune(&mut self, stats: &PruneStats) {
        self.pruned += stats.input - stats.kept;
    }

    pub fn record_decision(&mut self, decision: Decision) {
        match decision {
            Decision::Auto => self.auto += 1,
            Decision::Defer => self.deferred += 1,
            Decision::Propose => self.proposed += 1,
            Decision::Reject => self.rejected += 1,
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn duration_ms(&self) -> i64 {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds())
            .unwrap_or(0)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} run {} ({} mode, tenant {}){}{}",
            self.operation,
            self.run_id,
            self.mode,
            self.tenant_id,
            if self.dry_run { " [dry run]" } else { "" },
            if self.cancelled { " [cancelled]" } else { "" }
        )?;
        writeln!(
            f,
            "  candidates {}  filtered {}  inactive {}  pruned {}  scored {} (cache {}, degraded {})",
            self.candidates,
            self.filtered_rejected,
            self.skipped_inactive,
            self.pruned,
            self.scored,
            self.cache_hits,
            self.degraded
        )?;
        writeln!(
            f,
            "  auto {}  merged {}  failed {}  defer {}  propose {}  reject {}",
            self.auto, self.merged, self.merge_failed, self.deferred, self.proposed, self.rejected
        )?;
        writeln!(
            f,
            "  expired {}  evicted {}  budget dropped {}  gate {}/{} blocked/{} downgraded",
            self.expired, self.evicted, self.budget_dropped, self.gate_evaluated, self.gate_blocked,
            self.gate_downgraded
        )?;
        if !self.errors.is_empty() {
            writeln!(f, "  errors {} (showing {})", self.errors.total, self.errors.messages.len())?;
            for message in &self.errors.messages {
                writeln!(f, "    - {}", message)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_sample_is_bounded() {
        let mut sample = ErrorSample::default();
        for i in 0..25 {
            sample.push(format!("error {}", i));
        }
        assert_eq!(sample.total, 25);
        assert_eq!(sample.messages.len(), ERROR_SAMPLE_LIMIT);
        assert_eq!(sample.messages[0], "error 0");
    }

    #[test]
    fn test_decision_counters_and_summary() {
        let mut report = RunReport::new("t", "corpus", EngineMode::Batch).with_dry_run(true);
        report.record_decision(Decision::Auto);
        report.record_decision(Decision::Propose);
        report.record_decision(Decision::Propose);
        report.errors.push("boom");
        report.finish();
        assert_eq!((report.auto, report.proposed), (1, 2));
        let text = report.to_string();
        assert!(text.starts_with("corpus run"));
        assert!(text.contains("batch mode"));
        assert!(text.contains("[dry run]"));
        assert!(text.contains("propose 2"));
        assert!(text.contains("- boom"));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["mode"], "batch");
        assert_eq!(json["errors"]["total"], 1);
    }
}
