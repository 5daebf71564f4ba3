//! Deterministic mock backends for testing.
//!
//! Enabled with the `mock` feature. Every mock records its call count and can
//! be switched into a failing state to exercise degraded paths.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use concord_inference::mock::{HashingEmbedder, ScriptedCrossEncoder, ScriptedGeneration};
//!
//! let embedder = HashingEmbedder::new(64).with_vector("GDPR (regulation)", vec![1.0, 0.0]);
//! let gate = ScriptedGeneration::new()
//!     .with_response(r#"[{"index":0,"decision":"DISTINCT","confidence":0.92,"reason":"x"}]"#);
//! let cross = ScriptedCrossEncoder::new(0.5);
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use concord_core::{CrossEncoder, EmbeddingBackend, Error, GenerationBackend, Result};

/// Deterministic embedding from text: character-position hashing into a unit
/// vector. Equal texts always embed identically.
pub fn hash_embedding(text: &str, dimension: usize) -> Vec<f32> {
    let mut vec = vec![0.0f32; dimension.max(1)];
    let len = vec.len();
    for (i, c) in text.to_lowercase().chars().enumerate() {
        vec[(c as usize + i) % len] += 0.1;
    }
    let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        vec.iter_mut().for_each(|x| *x /= norm);
    }
    vec
}

/// Embedding backend returning hashed vectors, with per-text overrides.
pub struct HashingEmbedder {
    dimension: usize,
    overrides: Mutex<HashMap<String, Vec<f32>>>,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            overrides: Mutex::new(HashMap::new()),
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    /// Builder: return `vector` whenever `text` is embedded.
    pub fn with_vector(self, text: impl Into<String>, vector: Vec<f32>) -> Self {
        self.set_vector(text, vector);
        self
    }

    pub fn set_vector(&self, text: impl Into<String>, vector: Vec<f32>) {
        if let Ok(mut overrides) = self.overrides.lock() {
            overrides.insert(text.into(), vector);
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingBackend for HashingEmbedder {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Embedding("mock embedder unavailable".to_string()));
        }
        let overrides = self
            .overrides
            .lock()
            .map_err(|_| Error::Internal("mock embedder lock poisoned".to_string()))?;
        Ok(texts
            .iter()
            .map(|t| {
                overrides
                    .get(t)
                    .cloned()
                    .unwrap_or_else(|| hash_embedding(t, self.dimension))
            })
            .collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        "mock-hashing-embedder"
    }
}

/// Generation backend replaying queued responses, then a default.
pub struct ScriptedGeneration {
    responses: Mutex<VecDeque<String>>,
    default_response: String,
    prompts: Mutex<Vec<String>>,
    failing: AtomicBool,
}

impl Default for ScriptedGeneration {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedGeneration {
    /// Default response is an empty verdict array, which the gate parses
    /// into fail-safe verdicts.
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            default_response: "[]".to_string(),
            prompts: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
        }
    }

    /// Builder: queue a response for the next call.
    pub fn with_response(self, response: impl Into<String>) -> Self {
        self.push_response(response);
        self
    }

    /// Builder: response used once the queue is empty.
    pub fn with_default_response(mut self, response: impl Into<String>) -> Self {
        self.default_response = response.into();
        self
    }

    pub fn push_response(&self, response: impl Into<String>) {
        if let Ok(mut responses) = self.responses.lock() {
            responses.push_back(response.into());
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Prompts received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().map(|p| p.len()).unwrap_or(0)
    }
}

#[async_trait]
impl GenerationBackend for ScriptedGeneration {
    async fn generate(&self, prompt: &str) -> Result<String> {
        self.generate_with_system("", prompt).await
    }

    async fn generate_with_system(&self, _system: &str, prompt: &str) -> Result<String> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Inference("mock generation unavailable".to_string()));
        }
        let next = self
            .responses
            .lock()
            .ok()
            .and_then(|mut r| r.pop_front());
        Ok(next.unwrap_or_else(|| self.default_response.clone()))
    }

    fn model_name(&self) -> &str {
        "mock-scripted-generation"
    }
}

/// Cross-encoder with per-pair scripted scores. Lookups ignore pair order.
pub struct ScriptedCrossEncoder {
    scores: Mutex<HashMap<(String, String), f32>>,
    default_score: f32,
    failing: AtomicBool,
    calls: AtomicUsize,
}

fn pair_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

impl ScriptedCrossEncoder {
    pub fn new(default_score: f32) -> Self {
        Self {
            scores: Mutex::new(HashMap::new()),
            default_score,
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    /// Builder: fixed score for one pair of texts.
    pub fn with_score(self, a: &str, b: &str, score: f32) -> Self {
        self.set_score(a, b, score);
        self
    }

    /// Change the score for one pair, e.g. between two runs.
    pub fn set_score(&self, a: &str, b: &str, score: f32) {
        if let Ok(mut scores) = self.scores.lock() {
            scores.insert(pair_key(a, b), score);
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CrossEncoder for ScriptedCrossEncoder {
    async fn score(&self, a: &str, b: &str) -> Result<f32> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::CrossEncoder("mock cross-encoder unavailable".to_string()));
        }
        let scores = self
            .scores
            .lock()
            .map_err(|_| Error::Internal("mock cross-encoder lock poisoned".to_string()))?;
        Ok(scores
            .get(&pair_key(a, b))
            .copied()
            .unwrap_or(self.default_score))
    }

    fn model_name(&self) -> &str {
        "mock-scripted-cross-encoder"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::lexical::cosine_similarity;

    #[test]
    fn test_hash_embedding_is_deterministic_unit_vector() {
        let a = hash_embedding("General Data Protection Regulation", 64);
        let b = hash_embedding("General Data Protection Regulation", 64);
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!(cosine_similarity(&a, &hash_embedding("ISO 9001", 64)) < 0.999);
    }

    #[tokio::test]
    async fn test_embedder_overrides_and_failure() {
        let embedder = HashingEmbedder::new(8).with_vector("x", vec![1.0, 0.0]);
        let out = embedder
            .embed_texts(&["x".to_string(), "y".to_string()])
            .await
            .unwrap();
        assert_eq!(out[0], vec![1.0, 0.0]);
        assert_eq!(out[1].len(), 8);
        embedder.set_failing(true);
        assert!(embedder.embed_texts(&["x".to_string()]).await.is_err());
        assert_eq!(embedder.call_count(), 2);
    }

    #[tokio::test]
    async fn test_scripted_generation_replays_queue_then_default() {
        let gen = ScriptedGeneration::new().with_response("first");
        assert_eq!(gen.generate("p1").await.unwrap(), "first");
        assert_eq!(gen.generate("p2").await.unwrap(), "[]");
        assert_eq!(gen.prompts(), vec!["p1".to_string(), "p2".to_string()]);
    }

    #[tokio::test]
    async fn test_cross_encoder_is_order_independent() {
        let ce = ScriptedCrossEncoder::new(0.1).with_score("a", "b", 0.9);
        assert_eq!(ce.score("b", "a").await.unwrap(), 0.9);
        assert_eq!(ce.score("a", "c").await.unwrap(), 0.1);
        ce.set_score("a", "b", 0.4);
        assert_eq!(ce.score("a", "b").await.unwrap(), 0.4);
    }
}
