//! Clients for a local Ollama server.
//!
//! Ollama's `/api/embeddings` endpoint takes one prompt per request, so
//! batches are emulated with sequential calls and a short pause between
//! them.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{EmbeddingConfig, ScoringConfig},
    embedding::EmbeddingBackend,
    error::{Error, Result},
    reranker::RelevanceScorer,
    retry::{RetryPolicy, send_json, with_retry},
};

pub const OLLAMA_BASE_URL: &str = "http://localhost:11434";
pub const OLLAMA_EMBEDDING_MODEL: &str = "mxbai-embed-large";
pub const OLLAMA_EMBEDDING_DIMENSION: usize = 1024;
pub const OLLAMA_SCORING_MODEL: &str = "llama3.2";
pub const OLLAMA_BATCH_SIZE: usize = 100;
/// Pause between the sequential calls of an emulated batch.
pub const OLLAMA_CALL_DELAY: Duration = Duration::from_millis(10);

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Deserialize)]
struct ModelTag {
    name: String,
}

fn normalize_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

/// Embeddings from a local Ollama model.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dimension: usize,
    max_batch_size: usize,
    batch_delay: Duration,
    call_delay: Duration,
    request_timeout: Duration,
    retry: RetryPolicy,
}

impl OllamaEmbedder {
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            base_url: OLLAMA_BASE_URL.to_string(),
            model: OLLAMA_EMBEDDING_MODEL.to_string(),
            dimension: OLLAMA_EMBEDDING_DIMENSION,
            max_batch_size: OLLAMA_BATCH_SIZE,
            batch_delay: Duration::ZERO,
            call_delay: OLLAMA_CALL_DELAY,
            request_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        })
    }

    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        let mut embedder = Self::new()?
            .with_timeout(config.request_timeout())
            .with_retry(config.retry);
        if let Some(url) = &config.base_url {
            embedder = embedder.with_base_url(url);
        }
        if let Some(model) = &config.model {
            embedder = embedder.with_model(model);
        }
        if let Some(dimension) = config.dimension {
            embedder = embedder.with_dimension(dimension);
        }
        if let Some(size) = config.max_batch_size {
            embedder.max_batch_size = size.max(1);
        }
        if let Some(ms) = config.batch_delay_ms {
            embedder.batch_delay = Duration::from_millis(ms);
        }
        Ok(embedder)
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = normalize_url(&url.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }

    pub fn with_call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Check that the server answers and the embedding model is pulled.
    pub async fn test_connection(&self) -> Result<()> {
        let url = format!("{}/api/tags", self.base_url);
        let tags: TagsResponse = send_json(
            self.client.get(&url).timeout(Duration::from_secs(5)),
        )
        .await
        .map_err(|failure| Error::Provider {
            provider: "ollama".into(),
            message: format!(
                "cannot reach Ollama at {}: {failure}",
                self.base_url
            ),
        })?;

        let available: Vec<&str> =
            tags.models.iter().map(|m| m.name.as_str()).collect();
        let found = available.iter().any(|name| {
            *name == self.model
                || name.split(':').next() == Some(self.model.as_str())
        });
        if !found {
            return Err(Error::Provider {
                provider: "ollama".into(),
                message: format!(
                    "model '{}' is not available (have: {}); run `ollama pull {}`",
                    self.model,
                    available.join(", "),
                    self.model
                ),
            });
        }

        tracing::debug!(model = %self.model, "ollama connection ok");
        Ok(())
    }
}

impl std::fmt::Debug for OllamaEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OllamaEmbedder")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("dimension", &self.dimension)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl EmbeddingBackend for OllamaEmbedder {
    fn name(&self) -> &str {
        "ollama"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    fn batch_delay(&self) -> Duration {
        self.batch_delay
    }

    async fn generate_embedding(&self, text: &str) -> Option<Vec<f32>> {
        let url = format!("{}/api/embeddings", self.base_url);
        let body = EmbeddingRequest {
            model: &self.model,
            prompt: text,
        };

        let result = with_retry(&self.retry, "ollama embeddings", || {
            send_json::<EmbeddingResponse>(
                self.client
                    .post(&url)
                    .timeout(self.request_timeout)
                    .json(&body),
            )
        })
        .await;

        match result {
            Ok(resp) if !resp.embedding.is_empty() => Some(resp.embedding),
            Ok(_) => {
                tracing::warn!("ollama returned an empty embedding");
                None
            }
            Err(failure) => {
                tracing::warn!(
                    base_url = %self.base_url,
                    error = %failure,
                    "ollama embedding failed"
                );
                None
            }
        }
    }

    async fn generate_embeddings_batch(
        &self,
        texts: &[&str],
        cancel: &CancellationToken,
    ) -> Vec<Option<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for (i, text) in texts.iter().enumerate() {
            if i > 0 && !self.call_delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.call_delay) => {}
                }
            }
            let embedding = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::warn!(
                        completed = results.len(),
                        total = texts.len(),
                        "ollama batch cancelled"
                    );
                    break;
                }
                embedding = self.generate_embedding(text) => embedding,
            };
            results.push(embedding);
        }
        results.resize(texts.len(), None);
        results
    }
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

/// Relevance scoring through `/api/generate`.
pub struct OllamaScorer {
    client: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f32,
    max_output_tokens: u32,
    timeout: Duration,
}

impl OllamaScorer {
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            base_url: OLLAMA_BASE_URL.to_string(),
            model: OLLAMA_SCORING_MODEL.to_string(),
            temperature: 0.0,
            max_output_tokens: 50,
            timeout: Duration::from_secs(30),
        })
    }

    pub fn from_config(config: &ScoringConfig) -> Result<Self> {
        let mut scorer = Self::new()?;
        if let Some(url) = &config.base_url {
            scorer = scorer.with_base_url(url);
        }
        if let Some(model) = &config.model {
            scorer = scorer.with_model(model);
        }
        scorer.temperature = config.temperature;
        scorer.max_output_tokens = config.max_output_tokens;
        scorer.timeout = config.timeout();
        Ok(scorer)
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = normalize_url(&url.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

impl std::fmt::Debug for OllamaScorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OllamaScorer")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RelevanceScorer for OllamaScorer {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/api/generate", self.base_url);
        let body = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            options: GenerateOptions {
                temperature: self.temperature,
                num_predict: self.max_output_tokens,
            },
        };

        let resp: GenerateResponse = send_json(
            self.client.post(&url).timeout(self.timeout).json(&body),
        )
        .await
        .map_err(|failure| Error::Provider {
            provider: "ollama".into(),
            message: failure.to_string(),
        })?;
        Ok(resp.response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let embedder = OllamaEmbedder::new().unwrap();
        assert_eq!(embedder.dimension(), 1024);
        assert_eq!(embedder.max_batch_size(), 100);
        assert_eq!(embedder.batch_delay(), Duration::ZERO);
        assert_eq!(embedder.call_delay, Duration::from_millis(10));
    }

    #[test]
    fn from_config_overrides() {
        let config = EmbeddingConfig {
            base_url: Some("http://gpu-box:11434/".into()),
            model: Some("nomic-embed-text".into()),
            dimension: Some(768),
            max_batch_size: Some(16),
            ..Default::default()
        };
        let embedder = OllamaEmbedder::from_config(&config).unwrap();
        assert_eq!(embedder.base_url, "http://gpu-box:11434");
        assert_eq!(embedder.model, "nomic-embed-text");
        assert_eq!(embedder.dimension(), 768);
        assert_eq!(embedder.max_batch_size(), 16);
    }

    #[test]
    fn generate_request_is_not_streaming() {
        let body = GenerateRequest {
            model: "llama3.2",
            prompt: "rate",
            stream: false,
            options: GenerateOptions {
                temperature: 0.0,
                num_predict: 50,
            },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["stream"], false);
        assert_eq!(json["options"]["num_predict"], 50);
    }
}
