//! LLM semantic gate.
//!
//! A precision overlay on AUTO candidates. Pairs are batched into one
//! generation request per batch; batches run under a semaphore so the
//! endpoint's rate limits are respected. Transport errors, timeouts and
//! unparseable responses all yield fail-safe verdicts, which neither block
//! nor confirm a merge.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use concord_core::defaults::{
    GATE_BATCH_SIZE, GATE_DISTINCT_BLOCK_CONFIDENCE, GATE_MAX_CONCURRENCY,
    GATE_MERGE_CONFIRM_CONFIDENCE, GATE_TIMEOUT_SECS, SLOW_CALL_MS,
};
use concord_core::{CanonicalConcept, Error, GenerationBackend, Result};
use concord_inference::{
    build_gate_prompt, parse_verdicts, GateDecision, GatePair, GateVerdict, GATE_SYSTEM_PROMPT,
};

use crate::config::{env_flag, env_or};

/// Gate configuration.
#[derive(Debug, Clone)]
pub struct GateConfig {
    pub enabled: bool,
    /// Pairs per generation request.
    pub batch_size: usize,
    /// Batches in flight at once.
    pub max_concurrency: usize,
    /// DISTINCT at or above this confidence blocks the merge.
    pub distinct_block: f32,
    /// MERGE below this confidence downgrades out of AUTO.
    pub merge_confirm: f32,
    /// Per-batch timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            batch_size: GATE_BATCH_SIZE,
            max_concurrency: GATE_MAX_CONCURRENCY,
            distinct_block: GATE_DISTINCT_BLOCK_CONFIDENCE,
            merge_confirm: GATE_MERGE_CONFIRM_CONFIDENCE,
            timeout_secs: GATE_TIMEOUT_SECS,
        }
    }
}

impl GateConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `CONCORD_GATE_ENABLED` | `false` | Run AUTO candidates through the gate |
    /// | `CONCORD_GATE_BATCH_SIZE` | `10` | Pairs per request |
    /// | `CONCORD_GATE_CONCURRENCY` | `2` | Concurrent requests |
    /// | `CONCORD_GATE_TIMEOUT_SECS` | `60` | Per-request timeout |
    pub fn from_env() -> Self {
        Self {
            enabled: env_flag("CONCORD_GATE_ENABLED", false),
            batch_size: env_or("CONCORD_GATE_BATCH_SIZE", GATE_BATCH_SIZE),
            max_concurrency: env_or("CONCORD_GATE_CONCURRENCY", GATE_MAX_CONCURRENCY),
            timeout_secs: env_or("CONCORD_GATE_TIMEOUT_SECS", GATE_TIMEOUT_SECS),
            ..Self::default()
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.max_concurrency == 0 || self.timeout_secs == 0 {
            return Err(Error::Config(
                "gate batch size, concurrency and timeout must be non-zero".to_string(),
            ));
        }
        for (name, v) in [
            ("distinct_block", self.distinct_block),
            ("merge_confirm", self.merge_confirm),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(Error::Config(format!("gate {} must be in [0, 1], got {}", name, v)));
            }
        }
        Ok(())
    }
}

/// What a verdict does to an AUTO candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateEffect {
    /// Confirmed; the merge proceeds.
    Pass,
    /// Confident DISTINCT; the pair is rejected.
    Blocked,
    /// Not confident enough to auto-merge; DEFER (incremental) or PROPOSE (batch).
    Downgraded,
}

impl GateEffect {
    pub fn of(verdict: &GateVerdict, config: &GateConfig) -> Self {
        match verdict.decision {
            GateDecision::Distinct if verdict.confidence >= config.distinct_block => GateEffect::Blocked,
            GateDecision::Distinct => GateEffect::Downgraded,
            GateDecision::Merge if verdict.confidence < config.merge_confirm => GateEffect::Downgraded,
            GateDecision::Merge => GateEffect::Pass,
        }
    }
}

/// Batched, rate-limited gate over a generation backend.
pub struct LlmGate {
    backend: Arc<dyn GenerationBackend>,
    config: GateConfig,
    permits: Arc<Semaphore>,
}

impl LlmGate {
    pub fn new(backend: Arc<dyn GenerationBackend>, config: GateConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self {
            backend,
            config,
            permits,
        }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn effect(&self, verdict: &GateVerdict) -> GateEffect {
        GateEffect::of(verdict, &self.config)
    }

    /// One verdict per pair, in input order. Never fails.
    #[instrument(skip(self, pairs), fields(subsystem = "engine", component = "gate", op = "evaluate", pair_count = pairs.len()))]
    pub async fn evaluate(&self, pairs: &[(&CanonicalConcept, &CanonicalConcept)]) -> Vec<GateVerdict> {
        if pairs.is_empty() {
            return Vec::new();
        }
        let batch_size = self.config.batch_size.max(1);
        let batches = pairs
            .chunks(batch_size)
            .enumerate()
            .map(|(n, chunk)| self.evaluate_batch(n * batch_size, chunk));

        let mut verdicts: Vec<GateVerdict> = join_all(batches).await.into_iter().flatten().collect();
        let fail_safe = verdicts.iter().filter(|v| v.is_fail_safe()).count();
        if fail_safe > 0 {
            warn!(fail_safe, total = verdicts.len(), "Gate returned fail-safe verdicts");
        }
        verdicts.sort_by_key(|v| v.index);
        verdicts
    }

    /// Verdicts for one batch, re-indexed to the caller's positions.
    async fn evaluate_batch(
        &self,
        offset: usize,
        chunk: &[(&CanonicalConcept, &CanonicalConcept)],
    ) -> Vec<GateVerdict> {
        let fail_safe = || {
            (0..chunk.len())
                .map(|i| GateVerdict::fail_safe(offset + i))
                .collect::<Vec<_>>()
        };
        let Ok(_permit) = self.permits.acquire().await else {
            return fail_safe();
        };

        let gate_pairs: Vec<GatePair> = chunk.iter().map(|(a, b)| GatePair::new(a, b)).collect();
        let prompt = build_gate_prompt(&gate_pairs);
        let started = Instant::now();
        let call = self.backend.generate_with_system(GATE_SYSTEM_PROMPT, &prompt);
        let raw = match timeout(Duration::from_secs(self.config.timeout_secs), call).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                warn!(error = %e, batch_offset = offset, "Gate request failed, using fail-safe verdicts");
                return fail_safe();
            }
            Err(_) => {
                warn!(batch_offset = offset, timeout_secs = self.config.timeout_secs, "Gate request timed out, using fail-safe verdicts");
                return fail_safe();
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;
        if duration_ms > SLOW_CALL_MS {
            warn!(duration_ms, slow = true, batch_offset = offset, "Slow gate request");
        } else {
            debug!(duration_ms, batch_offset = offset, "Gate batch evaluated");
        }

        parse_verdicts(&raw, chunk.len())
            .into_iter()
            .map(|mut v| {
                v.index += offset;
                v
            })
            .collect()
    }
}
