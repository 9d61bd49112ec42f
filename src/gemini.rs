//! Google Gemini REST clients: embeddings with a native batch endpoint,
//! and text generation used for relevance scoring.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{EmbeddingConfig, GEMINI_MAX_BATCH, ScoringConfig},
    embedding::EmbeddingBackend,
    error::{Error, Result},
    reranker::RelevanceScorer,
    retry::{RetryPolicy, send_json, with_retry},
};

pub const GEMINI_BASE_URL: &str =
    "https://generativelanguage.googleapis.com/v1beta";
pub const GEMINI_EMBEDDING_MODEL: &str = "text-embedding-004";
pub const GEMINI_EMBEDDING_DIMENSION: usize = 768;
pub const GEMINI_SCORING_MODEL: &str = "gemini-2.5-flash-lite";
pub const GEMINI_BATCH_DELAY: Duration = Duration::from_millis(500);

const API_KEY_HEADER: &str = "x-goog-api-key";

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: [Part<'a>; 1],
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    content: Content<'a>,
}

#[derive(Serialize)]
struct BatchEmbedRequest<'a> {
    requests: Vec<EmbedRequest<'a>>,
}

#[derive(Deserialize)]
struct Values {
    #[serde(default)]
    values: Vec<f32>,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: Values,
}

#[derive(Deserialize)]
struct BatchEmbedResponse {
    #[serde(default)]
    embeddings: Vec<Values>,
}

fn non_empty(values: Vec<f32>) -> Option<Vec<f32>> {
    (!values.is_empty()).then_some(values)
}

/// Embeddings via `embedContent` and `batchEmbedContents`.
pub struct GeminiEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    /// `models/{model}`, as the request bodies expect.
    model_path: String,
    api_key: String,
    dimension: usize,
    max_batch_size: usize,
    batch_delay: Duration,
    request_timeout: Duration,
    batch_timeout: Duration,
    retry: RetryPolicy,
}

impl GeminiEmbedder {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            base_url: GEMINI_BASE_URL.to_string(),
            model: GEMINI_EMBEDDING_MODEL.to_string(),
            model_path: format!("models/{GEMINI_EMBEDDING_MODEL}"),
            api_key: api_key.into(),
            dimension: GEMINI_EMBEDDING_DIMENSION,
            max_batch_size: GEMINI_MAX_BATCH,
            batch_delay: GEMINI_BATCH_DELAY,
            request_timeout: Duration::from_secs(30),
            batch_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        })
    }

    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = config.api_key.clone().ok_or_else(|| {
            Error::Config(
                "Gemini embeddings need an API key (set GEMINI_API_KEY)".into(),
            )
        })?;

        let mut embedder = Self::new(api_key)?
            .with_timeouts(config.request_timeout(), config.batch_timeout())
            .with_retry(config.retry);
        if let Some(url) = &config.base_url {
            embedder = embedder.with_base_url(url);
        }
        if let Some(model) = &config.model {
            embedder = embedder.with_model(model);
        }
        if let Some(dimension) = config.dimension {
            embedder.dimension = dimension;
        }
        if let Some(size) = config.max_batch_size {
            embedder = embedder.with_max_batch_size(size);
        }
        if let Some(ms) = config.batch_delay_ms {
            embedder.batch_delay = Duration::from_millis(ms);
        }
        Ok(embedder)
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self.model_path = format!("models/{}", self.model);
        self
    }

    /// Clamped to Gemini's limit of 100 texts per batch.
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size.clamp(1, GEMINI_MAX_BATCH);
        self
    }

    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }

    pub fn with_timeouts(mut self, single: Duration, batch: Duration) -> Self {
        self.request_timeout = single;
        self.batch_timeout = batch;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/models/{}:{method}", self.base_url, self.model)
    }

    fn embed_request<'a>(&'a self, text: &'a str) -> EmbedRequest<'a> {
        EmbedRequest {
            model: &self.model_path,
            content: Content {
                parts: [Part { text }],
            },
        }
    }

    async fn embed_one_batch(&self, texts: &[&str]) -> Vec<Option<Vec<f32>>> {
        let url = self.endpoint("batchEmbedContents");
        let body = BatchEmbedRequest {
            requests: texts.iter().map(|t| self.embed_request(t)).collect(),
        };

        let result = with_retry(
            &self.retry.for_batch(),
            "gemini batchEmbedContents",
            || {
                send_json::<BatchEmbedResponse>(
                    self.client
                        .post(&url)
                        .header(API_KEY_HEADER, &self.api_key)
                        .timeout(self.batch_timeout)
                        .json(&body),
                )
            },
        )
        .await;

        match result {
            Ok(resp) => {
                if resp.embeddings.len() != texts.len() {
                    tracing::warn!(
                        expected = texts.len(),
                        received = resp.embeddings.len(),
                        "gemini returned a short batch"
                    );
                }
                let mut out: Vec<Option<Vec<f32>>> = resp
                    .embeddings
                    .into_iter()
                    .map(|e| non_empty(e.values))
                    .collect();
                out.resize(texts.len(), None);
                out
            }
            Err(failure) => {
                tracing::warn!(
                    texts = texts.len(),
                    error = %failure,
                    "gemini batch embedding failed"
                );
                vec![None; texts.len()]
            }
        }
    }
}

impl std::fmt::Debug for GeminiEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiEmbedder")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("dimension", &self.dimension)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl EmbeddingBackend for GeminiEmbedder {
    fn name(&self) -> &str {
        "gemini"
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
        let url = self.endpoint("embedContent");
        let body = self.embed_request(text);

        let result = with_retry(&self.retry, "gemini embedContent", || {
            send_json::<EmbedResponse>(
                self.client
                    .post(&url)
                    .header(API_KEY_HEADER, &self.api_key)
                    .timeout(self.request_timeout)
                    .json(&body),
            )
        })
        .await;

        match result {
            Ok(resp) => non_empty(resp.embedding.values),
            Err(failure) => {
                tracing::warn!(error = %failure, "gemini embedding failed");
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
        for batch in texts.chunks(self.max_batch_size) {
            if cancel.is_cancelled() {
                break;
            }
            results.extend(self.embed_one_batch(batch).await);
        }
        results.resize(texts.len(), None);
        results
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Serialize)]
struct UserContent<'a> {
    role: &'static str,
    parts: [Part<'a>; 1],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: [UserContent<'a>; 1],
    generation_config: GenerationConfig,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<TextPart>,
}

#[derive(Deserialize)]
struct TextPart {
    #[serde(default)]
    text: String,
}

/// Relevance scoring through `generateContent`.
pub struct GeminiScorer {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    temperature: f32,
    max_output_tokens: u32,
    timeout: Duration,
}

impl GeminiScorer {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            base_url: GEMINI_BASE_URL.to_string(),
            model: GEMINI_SCORING_MODEL.to_string(),
            api_key: api_key.into(),
            temperature: 0.0,
            max_output_tokens: 50,
            timeout: Duration::from_secs(30),
        })
    }

    pub fn from_config(config: &ScoringConfig) -> Result<Self> {
        let api_key = config.api_key.clone().ok_or_else(|| {
            Error::Config(
                "Gemini scoring needs an API key (set GEMINI_API_KEY)".into(),
            )
        })?;

        let mut scorer = Self::new(api_key)?;
        if let Some(url) = &config.base_url {
            scorer = scorer.with_base_url(url);
        }
        if let Some(model) = &config.model {
            scorer.model = model.clone();
        }
        scorer.temperature = config.temperature;
        scorer.max_output_tokens = config.max_output_tokens;
        scorer.timeout = config.timeout();
        Ok(scorer)
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }
}

impl std::fmt::Debug for GeminiScorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiScorer")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RelevanceScorer for GeminiScorer {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let url = format!(
            "{}/models/{}:generateContent",
            self.base_url, self.model
        );
        let body = GenerateRequest {
            contents: [UserContent {
                role: "user",
                parts: [Part { text: prompt }],
            }],
            generation_config: GenerationConfig {
                temperature: self.temperature,
                max_output_tokens: self.max_output_tokens,
            },
        };

        let resp: GenerateResponse = send_json(
            self.client
                .post(&url)
                .header(API_KEY_HEADER, &self.api_key)
                .timeout(self.timeout)
                .json(&body),
        )
        .await
        .map_err(|failure| Error::Provider {
            provider: "gemini".into(),
            message: failure.to_string(),
        })?;

        let text: String = resp
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().map(|p| p.text).collect())
            .unwrap_or_default();
        Ok(text)
    }
}
