//! Engine configuration.
//!
//! Every knob defaults to a constant from `concord_core::defaults` and can be
//! overridden from `CONCORD_*` environment variables. Unparseable values fall
//! back to the default.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use concord_core::defaults::{
    DEFAULT_TENANT, EXTERNAL_TIMEOUT_SECS, REJECT_TTL_SECS, SCORE_CACHE_TTL_SECS,
    SCORING_CONCURRENCY,
};
use concord_core::{Error, Result};

use crate::blocking::BlockingConfig;
use crate::corpus::CorpusConfig;
use crate::deferred::DeferredConfig;
use crate::gate::GateConfig;
use crate::router::ThresholdTable;

/// Read and parse an environment variable, or fall back to `default`.
pub(crate) fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

/// Boolean flag: anything except "false" or "0" enables it.
pub(crate) fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v != "false" && v != "0")
        .unwrap_or(default)
}

/// Which pruning strategy and decision policy a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineMode {
    /// One new concept against the population; per-type threshold router.
    Incremental,
    /// Whole corpus; Top-K mutual-best pruning and decision v2.
    Batch,
}

impl EngineMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineMode::Incremental => "incremental",
            EngineMode::Batch => "batch",
        }
    }
}

impl fmt::Display for EngineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Configuration for one resolution engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tenant_id: String,
    pub blocking: BlockingConfig,
    pub thresholds: ThresholdTable,
    pub corpus: CorpusConfig,
    pub deferred: DeferredConfig,
    pub gate: GateConfig,
    /// Score cache TTL in seconds.
    pub score_ttl_secs: u64,
    /// Reject store TTL in seconds.
    pub reject_ttl_secs: u64,
    /// Concurrent pair scorings.
    pub scoring_concurrency: usize,
    /// Timeout for each embedding, vector or cross-encoder call.
    pub external_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tenant_id: DEFAULT_TENANT.to_string(),
            blocking: BlockingConfig::default(),
            thresholds: ThresholdTable::default(),
            corpus: CorpusConfig::default(),
            deferred: DeferredConfig::default(),
            gate: GateConfig::default(),
            score_ttl_secs: SCORE_CACHE_TTL_SECS,
            reject_ttl_secs: REJECT_TTL_SECS,
            scoring_concurrency: SCORING_CONCURRENCY,
            external_timeout_secs: EXTERNAL_TIMEOUT_SECS,
        }
    }
}

impl EngineConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `CONCORD_TENANT` | `default` | Tenant the engine resolves for |
    /// | `CONCORD_SCORE_TTL_SECS` | `21600` | Score cache TTL |
    /// | `CONCORD_REJECT_TTL_SECS` | `7776000` | Reject store TTL |
    /// | `CONCORD_SCORING_CONCURRENCY` | `8` | Concurrent pair scorings |
    /// | `CONCORD_EXTERNAL_TIMEOUT_SECS` | `15` | Embedding/vector/cross-encoder timeout |
    ///
    /// Blocking, corpus, deferred-queue and gate settings are read by their
    /// own `from_env` constructors.
    pub fn from_env() -> Self {
        Self {
            tenant_id: env_or("CONCORD_TENANT", DEFAULT_TENANT.to_string()),
            blocking: BlockingConfig::from_env(),
            thresholds: ThresholdTable::default(),
            corpus: CorpusConfig::from_env(),
            deferred: DeferredConfig::from_env(),
            gate: GateConfig::from_env(),
            score_ttl_secs: env_or("CONCORD_SCORE_TTL_SECS", SCORE_CACHE_TTL_SECS),
            reject_ttl_secs: env_or("CONCORD_REJECT_TTL_SECS", REJECT_TTL_SECS),
            scoring_concurrency: env_or("CONCORD_SCORING_CONCURRENCY", SCORING_CONCURRENCY).max(1),
            external_timeout_secs: env_or("CONCORD_EXTERNAL_TIMEOUT_SECS", EXTERNAL_TIMEOUT_SECS),
        }
    }

    /// Set the tenant.
    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    pub fn with_thresholds(mut self, thresholds: ThresholdTable) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_blocking(mut self, blocking: BlockingConfig) -> Self {
        self.blocking = blocking;
        self
    }

    pub fn with_corpus(mut self, corpus: CorpusConfig) -> Self {
        self.corpus = corpus;
        self
    }

    pub fn with_deferred(mut self, deferred: DeferredConfig) -> Self {
        self.deferred = deferred;
        self
    }

    pub fn with_gate(mut self, gate: GateConfig) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_scoring_concurrency(mut self, n: usize) -> Self {
        self.scoring_concurrency = n;
        self
    }

    pub fn external_timeout(&self) -> Duration {
        Duration::from_secs(self.external_timeout_secs)
    }

    /// Check every section; the first problem found is returned.
    pub fn validate(&self) -> Result<()> {
        if self.tenant_id.trim().is_empty() {
            return Err(Error::Config("tenant_id must not be empty".to_string()));
        }
        if self.score_ttl_secs == 0 || self.reject_ttl_secs == 0 {
            return Err(Error::Config("cache TTLs must be non-zero".to_string()));
        }
        if self.scoring_concurrency == 0 {
            return Err(Error::Config("scoring_concurrency must be at least 1".to_string()));
        }
        if self.external_timeout_secs == 0 {
            return Err(Error::Config("external_timeout_secs must be non-zero".to_string()));
        }
        self.thresholds.validate()?;
        self.blocking.validate()?;
        self.corpus.validate()?;
        self.deferred.validate()?;
        self.gate.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert_eq!(config.tenant_id, "default");
        assert_eq!(config.scoring_concurrency, 8);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_zero_ttl() {
        let mut config = EngineConfig::default();
        config.score_ttl_secs = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_empty_tenant() {
        let config = EngineConfig::default().with_tenant("  ");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_or_falls_back_on_garbage() {
        std::env::set_var("CONCORD_TEST_ENV_OR", "not-a-number");
        assert_eq!(env_or("CONCORD_TEST_ENV_OR", 7usize), 7);
        std::env::set_var("CONCORD_TEST_ENV_OR", " 12 ");
        assert_eq!(env_or("CONCORD_TEST_ENV_OR", 7usize), 12);
        std::env::remove_var("CONCORD_TEST_ENV_OR");
    }

    #[test]
    fn test_mode_display() {
        assert_eq!(EngineMode::Batch.to_string(), "batch");
        assert_eq!(
            serde_json::to_string(&EngineMode::Incremental).unwrap(),
            "\"incremental\""
        );
    }
}
