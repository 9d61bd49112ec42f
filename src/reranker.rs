//! Two-stage reranking: a distance cut followed by LLM relevance scores.
//!
//! Candidates from the index are first filtered by distance. Survivors are
//! scored one at a time by a [`RelevanceScorer`], whose free-text answer is
//! parsed into a number in `[0, max_score]`. Anything scoring below
//! `min_rerank_score` is discarded and the rest are returned best first.

use std::{
    sync::{Arc, LazyLock},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{Provider, ScoringConfig},
    error::{Error, Result},
    gemini::GeminiScorer,
    index_manager::SearchResult,
    ollama::OllamaScorer,
};

/// A language model that can answer a relevance prompt.
#[async_trait]
pub trait RelevanceScorer: Send + Sync {
    fn name(&self) -> &str;

    /// Send `prompt` and return the raw completion text.
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// Build the scorer selected by `config.provider`.
pub fn scorer_from_config(config: &ScoringConfig) -> Result<Arc<dyn RelevanceScorer>> {
    Ok(match config.provider {
        Provider::Gemini => Arc::new(GeminiScorer::from_config(config)?),
        Provider::Ollama => Arc::new(OllamaScorer::from_config(config)?),
    })
}

/// Thresholds of the reranking stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankSettings {
    /// Candidates at or beyond this distance are never scored. The default
    /// suits squared L2 over 1024-dimensional embeddings.
    pub distance_threshold: f32,
    /// Scored candidates below this are discarded.
    pub min_rerank_score: f32,
    /// Top of the scoring scale.
    pub max_score: f32,
    /// Pause between scoring calls.
    pub score_delay_ms: u64,
}

impl Default for RerankSettings {
    fn default() -> Self {
        Self {
            distance_threshold: 195.0,
            min_rerank_score: 5.0,
            max_score: 10.0,
            score_delay_ms: 100,
        }
    }
}

impl RerankSettings {
    pub fn validate(&self) -> Result<()> {
        if !self.max_score.is_finite() || self.max_score <= 0.0 {
            return Err(Error::Config(format!(
                "rerank.max_score must be positive, got {}",
                self.max_score
            )));
        }
        if !(0.0..=self.max_score).contains(&self.min_rerank_score) {
            return Err(Error::Config(format!(
                "rerank.min_rerank_score must be within 0..={}, got {}",
                self.max_score, self.min_rerank_score
            )));
        }
        if self.distance_threshold.is_nan() || self.distance_threshold <= 0.0 {
            return Err(Error::Config(format!(
                "rerank.distance_threshold must be positive, got {}",
                self.distance_threshold
            )));
        }
        Ok(())
    }

    pub fn score_delay(&self) -> Duration {
        Duration::from_millis(self.score_delay_ms)
    }

    /// Score used when an answer cannot be parsed or the scorer fails.
    pub fn neutral_score(&self) -> f32 {
        self.max_score / 2.0
    }
}

/// Counters from one [`Reranker::rerank`] call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RerankStats {
    pub initial_count: usize,
    pub after_distance_filter: usize,
    pub after_rerank_filter: usize,
    pub final_count: usize,
    pub elapsed: Duration,
    /// Scoring stopped early; unscored candidates were dropped.
    pub cancelled: bool,
}

/// The prompt sent to the scorer for one candidate.
pub fn build_prompt(query: &str, document: &str, max_score: f32) -> String {
    format!(
        "Rate how relevant this document is to answering the question.\n\n\
         Question: {query}\n\n\
         Document: {document}\n\n\
         Rate from 0 (not relevant at all) to {max_score} (perfectly relevant and directly answers the question).\n\
         Respond with ONLY a single number between 0 and {max_score}. Do not include any explanation or text."
    )
}

static NUMBER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\d+\.?\d*").ok());

/// Turn a scorer's answer into a score in `[0, max_score]`.
///
/// The whole answer is tried as a number first, then the first number
/// inside it. Anything else yields `max_score / 2`.
///
/// # Examples
///
/// ```
/// use docrag::reranker::parse_score;
///
/// assert_eq!(parse_score("7", 10.0), 7.0);
/// assert_eq!(parse_score("Score: 8.5 out of 10", 10.0), 8.5);
/// assert_eq!(parse_score("not a number", 10.0), 5.0);
/// assert_eq!(parse_score("42", 10.0), 10.0);
/// ```
pub fn parse_score(text: &str, max_score: f32) -> f32 {
    let trimmed = text.trim();
    let parsed = trimmed
        .parse::<f32>()
        .ok()
        .filter(|n| n.is_finite())
        .or_else(|| {
            NUMBER
                .as_ref()
                .and_then(|re| re.find(trimmed))
                .and_then(|m| m.as_str().parse::<f32>().ok())
        });

    match parsed {
        Some(score) => score.clamp(0.0, max_score),
        None => {
            tracing::debug!(answer = trimmed, "unparseable relevance score");
            max_score / 2.0
        }
    }
}

/// Reranks index candidates with a [`RelevanceScorer`].
#[derive(Clone)]
pub struct Reranker {
    scorer: Arc<dyn RelevanceScorer>,
    settings: RerankSettings,
}

impl std::fmt::Debug for Reranker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reranker")
            .field("scorer", &self.scorer.name())
            .field("settings", &self.settings)
            .finish()
    }
}

impl Reranker {
    pub fn new(scorer: Arc<dyn RelevanceScorer>, settings: RerankSettings) -> Self {
        Self { scorer, settings }
    }

    pub fn settings(&self) -> &RerankSettings {
        &self.settings
    }

    async fn score(&self, query: &str, document: &str) -> f32 {
        let prompt = build_prompt(query, document, self.settings.max_score);
        match self.scorer.complete(&prompt).await {
            Ok(answer) => parse_score(&answer, self.settings.max_score),
            Err(e) => {
                tracing::warn!(
                    scorer = self.scorer.name(),
                    error = %e,
                    "relevance scoring failed, using neutral score"
                );
                self.settings.neutral_score()
            }
        }
    }

    /// Filter, score and reorder `candidates`, keeping at most `top_k`.
    ///
    /// Returned results carry their `rerank_score` and are ordered by it,
    /// highest first; equal scores keep their distance order.
    pub async fn rerank(
        &self,
        query: &str,
        candidates: Vec<SearchResult>,
        top_k: usize,
        cancel: &CancellationToken,
    ) -> (Vec<SearchResult>, RerankStats) {
        let started = Instant::now();
        let mut stats = RerankStats {
            initial_count: candidates.len(),
            ..Default::default()
        };

        let close: Vec<SearchResult> = candidates
            .into_iter()
            .filter(|c| c.distance < self.settings.distance_threshold)
            .collect();
        stats.after_distance_filter = close.len();

        if close.is_empty() {
            tracing::info!(
                initial = stats.initial_count,
                threshold = self.settings.distance_threshold,
                "no candidates within distance threshold"
            );
            stats.elapsed = started.elapsed();
            return (Vec::new(), stats);
        }

        let delay = self.settings.score_delay();
        let mut scored = Vec::with_capacity(close.len());
        for (i, mut candidate) in close.into_iter().enumerate() {
            if i > 0 && !delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if cancel.is_cancelled() {
                stats.cancelled = true;
                break;
            }

            let score = tokio::select! {
                _ = cancel.cancelled() => None,
                score = self.score(query, &candidate.text) => Some(score),
            };
            let Some(score) = score else {
                stats.cancelled = true;
                break;
            };

            tracing::debug!(id = %candidate.id, score, "scored candidate");
            candidate.rerank_score = Some(score);
            scored.push(candidate);
        }

        if stats.cancelled {
            tracing::warn!(
                scored = scored.len(),
                total = stats.after_distance_filter,
                "reranking cancelled"
            );
        }

        let min = self.settings.min_rerank_score;
        let mut kept: Vec<SearchResult> = scored
            .into_iter()
            .filter(|c| c.rerank_score.is_some_and(|s| s >= min))
            .collect();
        stats.after_rerank_filter = kept.len();

        // Stable sort keeps distance order among equal scores.
        kept.sort_by(|a, b| {
            let a = a.rerank_score.unwrap_or_default();
            let b = b.rerank_score.unwrap_or_default();
            b.total_cmp(&a)
        });
        kept.truncate(top_k);

        stats.final_count = kept.len();
        stats.elapsed = started.elapsed();
        tracing::info!(
            initial = stats.initial_count,
            after_distance = stats.after_distance_filter,
            after_score = stats.after_rerank_filter,
            returned = stats.final_count,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "reranked candidates"
        );
        (kept, stats)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::chunking::Metadata;

    /// Answers from a script keyed by document text, recording every prompt.
    #[derive(Default)]
    struct Scripted {
        answers: Vec<(&'static str, std::result::Result<&'static str, ()>)>,
        prompts: Mutex<Vec<String>>,
        cancel_after: Option<(usize, CancellationToken)>,
    }

    #[async_trait]
    impl RelevanceScorer for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, prompt: &str) -> Result<String> {
            let calls = {
                let mut prompts = self.prompts.lock().unwrap();
                prompts.push(prompt.to_string());
                prompts.len()
            };
            if let Some((after, token)) = &self.cancel_after
                && calls >= *after
            {
                token.cancel();
            }

            let answer = self
                .answers
                .iter()
                .find(|(doc, _)| prompt.contains(&format!("Document: {doc}\n")))
                .map(|(_, answer)| *answer)
                .unwrap_or(Ok("5"));
            answer.map(String::from).map_err(|()| Error::Provider {
                provider: "scripted".into(),
                message: "boom".into(),
            })
        }
    }

    fn settings() -> RerankSettings {
        RerankSettings {
            score_delay_ms: 0,
            ..Default::default()
        }
    }

    fn candidate(text: &str, distance: f32) -> SearchResult {
        SearchResult {
            id: text.to_string(),
            collection: "docs".into(),
            text: text.into(),
            source: "s".into(),
            distance,
            metadata: Metadata::new(),
            chunk_index: 0,
            rerank_score: None,
        }
    }

    #[test]
    fn parses_scores() {
        assert_eq!(parse_score("7", 10.0), 7.0);
        assert_eq!(parse_score("  9.5\n", 10.0), 9.5);
        assert_eq!(parse_score("Score: 8.5 out of 10", 10.0), 8.5);
        assert_eq!(parse_score("not a number", 10.0), 5.0);
        assert_eq!(parse_score("", 10.0), 5.0);
        assert_eq!(parse_score("NaN", 10.0), 5.0);
    }

    #[test]
    fn scores_are_clamped() {
        assert_eq!(parse_score("15", 10.0), 10.0);
        assert_eq!(parse_score("-3", 10.0), 0.0);
        assert_eq!(parse_score("I'd say 12", 10.0), 10.0);
        assert_eq!(parse_score("3", 2.0), 2.0);
    }

    #[test]
    fn prompt_mentions_query_and_document() {
        let prompt = build_prompt("what is rust?", "Rust is a language.", 10.0);
        assert!(prompt.contains("Question: what is rust?"));
        assert!(prompt.contains("Document: Rust is a language."));
        assert!(prompt.contains("between 0 and 10"));
    }

    #[test]
    fn settings_validation() {
        RerankSettings::default().validate().unwrap();
        let bad = RerankSettings {
            min_rerank_score: 11.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = RerankSettings {
            max_score: 0.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = RerankSettings {
            distance_threshold: -1.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[tokio::test]
    async fn empty_input_makes_no_calls() {
        let scorer = Arc::new(Scripted::default());
        let reranker = Reranker::new(scorer.clone(), settings());

        let (results, stats) = reranker
            .rerank("q", Vec::new(), 5, &CancellationToken::new())
            .await;
        assert!(results.is_empty());
        assert_eq!(stats.initial_count, 0);
        assert!(scorer.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn distance_threshold_is_exclusive() {
        let scorer = Arc::new(Scripted::default());
        let reranker = Reranker::new(scorer.clone(), settings());

        let candidates = vec![candidate("at", 195.0), candidate("beyond", 300.0)];
        let (results, stats) = reranker
            .rerank("q", candidates, 5, &CancellationToken::new())
            .await;
        assert!(results.is_empty());
        assert_eq!(stats.after_distance_filter, 0);
        assert!(scorer.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn filters_sorts_and_truncates() {
        let scorer = Arc::new(Scripted {
            answers: vec![
                ("low", Ok("2")),
                ("good", Ok("Score: 8")),
                ("best", Ok("9.5")),
                ("ok", Ok("6")),
                ("fails", Err(())),
            ],
            ..Default::default()
        });
        let reranker = Reranker::new(scorer.clone(), settings());

        let candidates = vec![
            candidate("low", 10.0),
            candidate("good", 20.0),
            candidate("best", 30.0),
            candidate("ok", 40.0),
            candidate("fails", 50.0),
            candidate("far", 500.0),
        ];
        let (results, stats) = reranker
            .rerank("q", candidates, 3, &CancellationToken::new())
            .await;

        let texts: Vec<_> = results.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, vec!["best", "good", "ok"]);
        assert_eq!(results[0].rerank_score, Some(9.5));
        assert_eq!(
            stats,
            RerankStats {
                initial_count: 6,
                after_distance_filter: 5,
                // "fails" gets the neutral 5.0, which passes the minimum.
                after_rerank_filter: 4,
                final_count: 3,
                elapsed: stats.elapsed,
                cancelled: false,
            }
        );
        assert_eq!(scorer.prompts.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn cancellation_stops_scoring() {
        let cancel = CancellationToken::new();
        let scorer = Arc::new(Scripted {
            answers: vec![("a", Ok("9")), ("b", Ok("8")), ("c", Ok("7"))],
            cancel_after: Some((2, cancel.clone())),
            ..Default::default()
        });
        let reranker = Reranker::new(scorer.clone(), settings());

        let candidates = vec![candidate("a", 1.0), candidate("b", 2.0), candidate("c", 3.0)];
        let (results, stats) = reranker.rerank("q", candidates, 5, &cancel).await;

        assert!(stats.cancelled);
        assert_eq!(scorer.prompts.lock().unwrap().len(), 2);
        let texts: Vec<_> = results.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b"]);
    }
}
