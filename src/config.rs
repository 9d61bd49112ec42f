//! Runtime configuration for the indexing and retrieval pipeline.
//!
//! Values are resolved in layers: built-in defaults, then an optional TOML
//! file (`config.toml` in the data directory, or `--config`), then `DOCRAG_*`
//! environment overrides. The result is checked with [`RagConfig::validate`]
//! before anything is built from it.
//!
//! ```toml
//! [chunking]
//! chunk_size = 500
//! overlap = 50
//!
//! [embedding]
//! provider = "gemini"
//! max_batch_size = 100
//!
//! [embedding.retry]
//! max_attempts = 3
//!
//! [rerank]
//! distance_threshold = 195.0
//! min_rerank_score = 5.0
//! ```

use std::{path::Path, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    chunking::ChunkingConfig,
    error::{Error, Result},
    reranker::RerankSettings,
    retry::RetryPolicy,
    vector_store::DistanceMetric,
};

/// Hard cap on the number of texts Gemini accepts per batch request.
pub const GEMINI_MAX_BATCH: usize = 100;

/// A remote model provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Gemini,
    #[default]
    Ollama,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Gemini => "gemini",
            Provider::Ollama => "ollama",
        }
    }
}

impl FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "gemini" => Ok(Provider::Gemini),
            "ollama" => Ok(Provider::Ollama),
            other => {
                Err(Error::Config(format!("unknown provider '{other}'")))
            }
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Embedding backend settings.
///
/// Unset optional fields fall back to the provider's own defaults
/// (model name, base URL, vector dimension, batch size, batch delay).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: Provider,
    pub model: Option<String>,
    pub base_url: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub dimension: Option<usize>,
    pub max_batch_size: Option<usize>,
    pub batch_delay_ms: Option<u64>,
    /// Timeout for single-text requests.
    pub request_timeout_secs: u64,
    /// Timeout for native batch requests.
    pub batch_timeout_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: Provider::default(),
            model: None,
            base_url: None,
            api_key: None,
            dimension: None,
            max_batch_size: None,
            batch_delay_ms: None,
            request_timeout_secs: 30,
            batch_timeout_secs: 60,
            retry: RetryPolicy::default(),
        }
    }
}

impl EmbeddingConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_timeout_secs)
    }
}

/// Settings for the LLM used to score relevance during reranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub provider: Provider,
    pub model: Option<String>,
    pub base_url: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub timeout_secs: u64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            provider: Provider::default(),
            model: None,
            base_url: None,
            api_key: None,
            temperature: 0.0,
            max_output_tokens: 50,
            timeout_secs: 30,
        }
    }
}

impl ScoringConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Results returned after reranking.
    pub top_k: usize,
    /// Candidates retrieved from the index before reranking.
    pub initial_k: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            initial_k: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub metric: DistanceMetric,
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RagConfig {
    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingConfig,
    pub scoring: ScoringConfig,
    pub rerank: RerankSettings,
    pub search: SearchConfig,
    pub store: StoreConfig,
}

impl RagConfig {
    /// Load configuration from defaults, a TOML file and the process
    /// environment, then validate it.
    ///
    /// An `explicit` path must exist; the `fallback` path is only read
    /// when present.
    pub fn load(explicit: Option<&Path>, fallback: &Path) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None if fallback.is_file() => Self::from_file(fallback)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML config file. Missing sections take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Apply environment overrides using `lookup` to read variables.
    ///
    /// `GEMINI_API_KEY` fills any API key not already set in the file.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("DOCRAG_EMBEDDING_PROVIDER") {
            self.embedding.provider = v.parse()?;
        }
        if let Some(v) = lookup("DOCRAG_EMBEDDING_MODEL") {
            self.embedding.model = Some(v);
        }
        if let Some(v) = lookup("DOCRAG_EMBEDDING_URL") {
            self.embedding.base_url = Some(v);
        }
        if let Some(v) = lookup("DOCRAG_SCORING_PROVIDER") {
            self.scoring.provider = v.parse()?;
        }
        if let Some(v) = lookup("DOCRAG_SCORING_MODEL") {
            self.scoring.model = Some(v);
        }
        if let Some(v) = lookup("DOCRAG_SCORING_URL") {
            self.scoring.base_url = Some(v);
        }
        if let Some(v) = lookup("DOCRAG_CHUNK_SIZE") {
            self.chunking.chunk_size = parse_env("DOCRAG_CHUNK_SIZE", &v)?;
        }
        if let Some(v) = lookup("DOCRAG_CHUNK_OVERLAP") {
            self.chunking.overlap = parse_env("DOCRAG_CHUNK_OVERLAP", &v)?;
        }
        if let Some(v) = lookup("DOCRAG_DISTANCE_THRESHOLD") {
            self.rerank.distance_threshold =
                parse_env("DOCRAG_DISTANCE_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("DOCRAG_MIN_RERANK_SCORE") {
            self.rerank.min_rerank_score =
                parse_env("DOCRAG_MIN_RERANK_SCORE", &v)?;
        }
        if let Some(key) = lookup("GEMINI_API_KEY") {
            if self.embedding.api_key.is_none() {
                self.embedding.api_key = Some(key.clone());
            }
            if self.scoring.api_key.is_none() {
                self.scoring.api_key = Some(key);
            }
        }
        Ok(())
    }

    /// Check every value against its documented range.
    pub fn validate(&self) -> Result<()> {
        self.chunking.validate()?;
        self.embedding.retry.validate()?;
        self.rerank.validate()?;

        let emb = &self.embedding;
        if let Some(batch) = emb.max_batch_size {
            let cap = match emb.provider {
                Provider::Gemini => GEMINI_MAX_BATCH,
                Provider::Ollama => usize::MAX,
            };
            if batch == 0 || batch > cap {
                return Err(Error::Config(format!(
                    "embedding.max_batch_size must be between 1 and {cap} for {}",
                    emb.provider
                )));
            }
        }
        if emb.dimension == Some(0) {
            return Err(Error::Config(
                "embedding.dimension must be greater than zero".into(),
            ));
        }
        if emb.request_timeout_secs == 0 || emb.batch_timeout_secs == 0 {
            return Err(Error::Config(
                "embedding timeouts must be greater than zero".into(),
            ));
        }

        let scoring = &self.scoring;
        if !(0.0..=2.0).contains(&scoring.temperature) {
            return Err(Error::Config(
                "scoring.temperature must be between 0 and 2".into(),
            ));
        }
        if scoring.max_output_tokens == 0 || scoring.timeout_secs == 0 {
            return Err(Error::Config(
                "scoring.max_output_tokens and scoring.timeout_secs must be greater than zero"
                    .into(),
            ));
        }

        if self.search.top_k == 0 {
            return Err(Error::Config(
                "search.top_k must be greater than zero".into(),
            ));
        }
        if self.search.initial_k < self.search.top_k {
            return Err(Error::Config(format!(
                "search.initial_k ({}) must be at least search.top_k ({})",
                self.search.initial_k, self.search.top_k
            )));
        }
        Ok(())
    }
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("invalid value for {key}: {value}")))
}
