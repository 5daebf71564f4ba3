//! # concord-inference
//!
//! Inference backends for the concord entity resolution engine.
//!
//! This crate provides:
//! - Ollama implementation of the embedding and generation traits (default)
//! - HTTP cross-encoder over a `/rerank` endpoint
//! - Semantic-gate prompt construction and lenient verdict parsing
//! - Deterministic mock backends (feature `mock`)
//!
//! # Feature Flags
//!
//! - `ollama` (default): Enable the Ollama backend
//! - `mock`: Enable scripted backends for tests
//!
//! # Example
//!
//! ```rust,no_run
//! use concord_inference::OllamaBackend;
//! use concord_core::EmbeddingBackend;
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend = OllamaBackend::from_env().unwrap();
//!     let texts = vec!["General Data Protection Regulation (regulation)".to_string()];
//!     let embeddings = backend.embed_texts(&texts).await.unwrap();
//! }
//! ```

pub mod config;
pub mod gate;
pub mod rerank;

#[cfg(feature = "ollama")]
pub mod ollama;

// Mock inference backends for testing
#[cfg(any(test, feature = "mock"))]
pub mod mock;

// Re-export core types
pub use concord_core::*;

pub use config::{OllamaConfig, RerankConfig};
pub use gate::{
    build_gate_prompt, parse_verdicts, GateConcept, GateDecision, GatePair, GateVerdict,
    FAIL_SAFE_REASON, GATE_SYSTEM_PROMPT,
};
pub use rerank::HttpCrossEncoder;

#[cfg(feature = "ollama")]
pub use ollama::OllamaBackend;
