//! The embedding backend interface and the batching built on top of it.
//!
//! Every method is soft-failing: a text that could not be embedded comes
//! back as `None` in its position, never as an error. Callers decide what
//! a partial result means.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::{
    chunking::Chunk,
    config::{EmbeddingConfig, Provider},
    error::Result,
    gemini::GeminiEmbedder,
    ollama::OllamaEmbedder,
};

/// Produces dense vectors for text.
///
/// Backends with a native batch endpoint override
/// [`generate_embeddings_batch`](EmbeddingBackend::generate_embeddings_batch);
/// the default embeds texts one at a time.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Short provider name for logs and reports.
    fn name(&self) -> &str;

    /// Length of every vector this backend produces.
    fn dimension(&self) -> usize;

    /// Most texts sent per batch call.
    fn max_batch_size(&self) -> usize;

    /// Pause between consecutive batches.
    fn batch_delay(&self) -> Duration {
        Duration::ZERO
    }

    /// Embed a single text, retrying transient failures.
    async fn generate_embedding(&self, text: &str) -> Option<Vec<f32>>;

    /// Embed a batch of texts. The result has exactly one entry per input,
    /// in input order; texts left unsent after cancellation are `None`.
    async fn generate_embeddings_batch(
        &self,
        texts: &[&str],
        cancel: &CancellationToken,
    ) -> Vec<Option<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            if cancel.is_cancelled() {
                break;
            }
            results.push(self.generate_embedding(text).await);
        }
        results.resize(texts.len(), None);
        results
    }

    /// Embed chunk texts in batches of at most
    /// [`max_batch_size`](EmbeddingBackend::max_batch_size), pausing
    /// [`batch_delay`](EmbeddingBackend::batch_delay) between batches.
    ///
    /// Cancellation is checked between batches; positions that were never
    /// sent come back as `None`.
    async fn generate_embeddings_for_chunks(
        &self,
        chunks: &[Chunk],
        cancel: &CancellationToken,
    ) -> Vec<Option<Vec<f32>>> {
        let batch_size = self.max_batch_size().max(1);
        let total_batches = chunks.len().div_ceil(batch_size);
        let mut results = Vec::with_capacity(chunks.len());

        for (i, batch) in chunks.chunks(batch_size).enumerate() {
            if i > 0 && !self.batch_delay().is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.batch_delay()) => {}
                }
            }
            if cancel.is_cancelled() {
                tracing::warn!(
                    provider = self.name(),
                    completed = i,
                    total_batches,
                    "embedding cancelled"
                );
                break;
            }

            let texts: Vec<&str> = batch.iter().map(|c| c.text.as_str()).collect();
            let mut embedded = self.generate_embeddings_batch(&texts, cancel).await;
            // Keep positions aligned even if a backend misbehaves.
            embedded.resize(batch.len(), None);

            let ok = embedded.iter().filter(|e| e.is_some()).count();
            tracing::debug!(
                provider = self.name(),
                batch = i + 1,
                total_batches,
                embedded = ok,
                failed = batch.len() - ok,
                "embedded batch"
            );
            results.extend(embedded);
        }

        results.resize(chunks.len(), None);
        results
    }

    /// Count usable embeddings: present, non-empty and of this backend's
    /// dimension.
    fn validate_embeddings(
        &self,
        embeddings: &[Option<Vec<f32>>],
    ) -> EmbeddingValidation {
        EmbeddingValidation::check(embeddings, self.dimension())
    }
}

/// Fail early when the configured backend cannot serve requests.
///
/// Only a local Ollama server is probed; Gemini needs no setup beyond the
/// API key checked when the backend is built.
pub async fn check_embedder(config: &EmbeddingConfig) -> Result<()> {
    match config.provider {
        Provider::Ollama => OllamaEmbedder::from_config(config)?.test_connection().await,
        Provider::Gemini => Ok(()),
    }
}

/// Build the backend selected by `config.provider`.
pub fn embedder_from_config(
    config: &EmbeddingConfig,
) -> Result<Arc<dyn EmbeddingBackend>> {
    let backend: Arc<dyn EmbeddingBackend> = match config.provider {
        Provider::Gemini => Arc::new(GeminiEmbedder::from_config(config)?),
        Provider::Ollama => Arc::new(OllamaEmbedder::from_config(config)?),
    };
    tracing::debug!(
        provider = backend.name(),
        dimension = backend.dimension(),
        "embedding backend ready"
    );
    Ok(backend)
}

/// Result of [`EmbeddingBackend::validate_embeddings`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EmbeddingValidation {
    pub total: usize,
    pub valid: usize,
    pub invalid: usize,
    /// Share of valid embeddings in percent.
    pub success_rate: f64,
}

impl EmbeddingValidation {
    pub fn check(embeddings: &[Option<Vec<f32>>], dimension: usize) -> Self {
        let total = embeddings.len();
        let valid = embeddings
            .iter()
            .filter(|e| is_valid(e.as_deref(), dimension))
            .count();
        let success_rate = if total == 0 {
            0.0
        } else {
            valid as f64 / total as f64 * 100.0
        };

        Self {
            total,
            valid,
            invalid: total - valid,
            success_rate,
        }
    }
}

/// Whether an embedding is present, non-empty and `dimension` long.
pub fn is_valid(embedding: Option<&[f32]>, dimension: usize) -> bool {
    embedding.is_some_and(|e| !e.is_empty() && e.len() == dimension)
}
