//! HTTP cross-encoder backed by a `/rerank` endpoint.
//!
//! Speaks the text-embeddings-inference rerank protocol: one query, a list of
//! texts, and a response of `{index, score}` objects with scores in [0, 1].

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use concord_core::defaults::SLOW_CALL_MS;
use concord_core::{CrossEncoder, Error, Result};

use crate::config::RerankConfig;

/// Cross-encoder client.
pub struct HttpCrossEncoder {
    client: Client,
    url: String,
    model: String,
    timeout: Duration,
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    query: &'a str,
    texts: [&'a str; 1],
    raw_scores: bool,
}

#[derive(Deserialize)]
struct RerankHit {
    index: usize,
    score: f32,
}

impl HttpCrossEncoder {
    /// Build a client, or `None` when no rerank URL is configured.
    pub fn from_config(config: &RerankConfig) -> Result<Option<Self>> {
        config.validate()?;
        let Some(url) = &config.url else {
            return Ok(None);
        };
        let client = Client::builder()
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Some(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }))
    }
}

#[async_trait]
impl CrossEncoder for HttpCrossEncoder {
    #[instrument(skip(self, a, b), fields(subsystem = "inference", component = "cross_encoder", op = "score", model = %self.model))]
    async fn score(&self, a: &str, b: &str) -> Result<f32> {
        let start = Instant::now();
        let request = RerankRequest {
            query: a,
            texts: [b],
            raw_scores: false,
        };

        let response = self
            .client
            .post(format!("{}/rerank", self.url))
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(format!("cross-encoder: {}", e))
                } else {
                    Error::CrossEncoder(format!("Request failed: {}", e))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::CrossEncoder(format!(
                "rerank endpoint returned {}: {}",
                status, body
            )));
        }

        let hits: Vec<RerankHit> = response
            .json()
            .await
            .map_err(|e| Error::CrossEncoder(format!("Failed to parse response: {}", e)))?;
        let score = hits
            .iter()
            .find(|h| h.index == 0)
            .map(|h| h.score)
            .ok_or_else(|| Error::CrossEncoder("rerank response had no score".to_string()))?;

        let elapsed = start.elapsed().as_millis() as u64;
        debug!(score, duration_ms = elapsed, "Cross-encoder score");
        if elapsed > SLOW_CALL_MS {
            warn!(duration_ms = elapsed, slow = true, "Slow cross-encoder call");
        }
        Ok(score.clamp(0.0, 1.0))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn encoder(server: &MockServer) -> HttpCrossEncoder {
        HttpCrossEncoder::from_config(&RerankConfig::default().with_url(server.uri()))
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_disabled_without_url() {
        assert!(HttpCrossEncoder::from_config(&RerankConfig::default())
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_score_reads_first_text_and_clamps() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rerank"))
            .and(body_partial_json(json!({"query": "SAP S/4HANA"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([{"index": 0, "score": 1.3}])),
            )
            .expect(1)
            .mount(&server)
            .await;

        let score = encoder(&server)
            .await
            .score("SAP S/4HANA", "SAP HANA")
            .await
            .unwrap();
        assert_eq!(score, 1.0);
    }

    #[tokio::test]
    async fn test_server_error_maps_to_cross_encoder_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rerank"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = encoder(&server).await.score("a", "b").await.unwrap_err();
        assert!(matches!(err, Error::CrossEncoder(_)));
        assert!(err.is_transient());
    }
}
