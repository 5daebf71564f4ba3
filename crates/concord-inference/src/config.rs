//! Inference endpoint configuration.
//!
//! Loaded from environment variables:
//! - `OLLAMA_BASE`, `OLLAMA_EMBED_MODEL`, `OLLAMA_GEN_MODEL`, `OLLAMA_EMBED_DIM`
//! - `CONCORD_EMBED_TIMEOUT_SECS`, `CONCORD_GEN_TIMEOUT_SECS`
//! - `CONCORD_RERANK_URL`, `CONCORD_RERANK_MODEL`, `CONCORD_EXTERNAL_TIMEOUT_SECS`

use std::env;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use concord_core::defaults;
use concord_core::{Error, Result};

fn env_or<T: FromStr>(key: &str, fallback: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}

fn validate_url(name: &str, url: &str) -> Result<()> {
    if url.is_empty() {
        return Err(Error::Config(format!("{} cannot be empty", name)));
    }
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(Error::Config(format!(
            "{} must start with http:// or https://, got: {}",
            name, url
        )));
    }
    Ok(())
}

/// Ollama backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    /// Base URL for the Ollama API.
    pub base_url: String,
    /// Model used for concept embeddings.
    pub embed_model: String,
    /// Model used by the semantic gate.
    pub gen_model: String,
    /// Expected embedding dimension.
    pub dimension: usize,
    pub embed_timeout_secs: u64,
    pub gen_timeout_secs: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::OLLAMA_URL.to_string(),
            embed_model: defaults::EMBED_MODEL.to_string(),
            gen_model: defaults::GEN_MODEL.to_string(),
            dimension: defaults::EMBED_DIMENSION,
            embed_timeout_secs: defaults::EMBED_TIMEOUT_SECS,
            gen_timeout_secs: defaults::GEN_TIMEOUT_SECS,
        }
    }
}

impl OllamaConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            base_url: env::var("OLLAMA_BASE").unwrap_or(d.base_url),
            embed_model: env::var("OLLAMA_EMBED_MODEL").unwrap_or(d.embed_model),
            gen_model: env::var("OLLAMA_GEN_MODEL").unwrap_or(d.gen_model),
            dimension: env_or("OLLAMA_EMBED_DIM", d.dimension),
            embed_timeout_secs: env_or("CONCORD_EMBED_TIMEOUT_SECS", d.embed_timeout_secs),
            gen_timeout_secs: env_or("CONCORD_GEN_TIMEOUT_SECS", d.gen_timeout_secs),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_gen_model(mut self, model: impl Into<String>) -> Self {
        self.gen_model = model.into();
        self
    }

    pub fn with_embed_model(mut self, model: impl Into<String>, dimension: usize) -> Self {
        self.embed_model = model.into();
        self.dimension = dimension;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_url("Ollama base_url", &self.base_url)?;
        if self.embed_model.is_empty() {
            return Err(Error::Config("Ollama embed_model cannot be empty".into()));
        }
        if self.gen_model.is_empty() {
            return Err(Error::Config("Ollama gen_model cannot be empty".into()));
        }
        if self.dimension == 0 {
            return Err(Error::Config("embedding dimension must be positive".into()));
        }
        if self.embed_timeout_secs == 0 || self.gen_timeout_secs == 0 {
            return Err(Error::Config("inference timeouts must be positive".into()));
        }
        Ok(())
    }
}

/// Cross-encoder (rerank endpoint) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankConfig {
    /// Base URL of a text-embeddings-inference style `/rerank` endpoint.
    /// `None` disables the cross-encoder signal.
    pub url: Option<String>,
    /// Reported model name.
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            url: None,
            model: "bge-reranker-base".to_string(),
            timeout_secs: defaults::EXTERNAL_TIMEOUT_SECS,
        }
    }
}

impl RerankConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            url: env::var("CONCORD_RERANK_URL").ok().filter(|u| !u.is_empty()),
            model: env::var("CONCORD_RERANK_MODEL").unwrap_or(d.model),
            timeout_secs: env_or("CONCORD_EXTERNAL_TIMEOUT_SECS", d.timeout_secs),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(url) = &self.url {
            validate_url("rerank url", url)?;
        }
        if self.timeout_secs == 0 {
            return Err(Error::Config("rerank timeout must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ollama_config_is_valid() {
        assert!(OllamaConfig::default().validate().is_ok());
    }

    #[test]
    fn test_ollama_config_rejects_bad_url() {
        let config = OllamaConfig::default().with_base_url("localhost:11434");
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_rerank_disabled_by_default() {
        let config = RerankConfig::default();
        assert!(config.url.is_none());
        assert!(config.validate().is_ok());
        assert!(config.with_url("ftp://x").validate().is_err());
    }
}
