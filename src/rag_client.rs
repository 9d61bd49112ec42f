//! Question answering retrieval: embed, search, rerank.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{
    config::SearchConfig,
    embedding::EmbeddingBackend,
    error::Result,
    index_manager::{IndexManager, SearchResult},
    reranker::{RerankStats, Reranker},
};

/// Retrieves the passages most relevant to a question.
#[derive(Clone)]
pub struct RagClient {
    embedder: Arc<dyn EmbeddingBackend>,
    index: IndexManager,
    reranker: Reranker,
    defaults: SearchConfig,
}

impl std::fmt::Debug for RagClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RagClient")
            .field("embedder", &self.embedder.name())
            .field("index", &self.index)
            .field("reranker", &self.reranker)
            .finish()
    }
}

impl RagClient {
    pub fn new(
        embedder: Arc<dyn EmbeddingBackend>,
        index: IndexManager,
        reranker: Reranker,
    ) -> Self {
        Self {
            embedder,
            index,
            reranker,
            defaults: SearchConfig::default(),
        }
    }

    /// Use `defaults` for [`search_default`](Self::search_default).
    pub fn with_defaults(mut self, defaults: SearchConfig) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn index(&self) -> &IndexManager {
        &self.index
    }

    /// Search with the configured `top_k` and `initial_k`.
    pub async fn search_default(
        &self,
        question: &str,
        collection: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchResult>> {
        self.search(
            question,
            collection,
            self.defaults.top_k,
            self.defaults.initial_k,
            cancel,
        )
        .await
    }

    /// Retrieve `initial_k` candidates for `question` and rerank them down
    /// to at most `top_k`.
    ///
    /// An empty result means nothing relevant was found, including when the
    /// question itself could not be embedded.
    pub async fn search(
        &self,
        question: &str,
        collection: Option<&str>,
        top_k: usize,
        initial_k: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchResult>> {
        let (results, _) = self
            .search_with_stats(question, collection, top_k, initial_k, cancel)
            .await?;
        Ok(results)
    }

    /// Like [`search`](Self::search), also returning the reranking counters.
    /// The counters are `None` when reranking never ran.
    pub async fn search_with_stats(
        &self,
        question: &str,
        collection: Option<&str>,
        top_k: usize,
        initial_k: usize,
        cancel: &CancellationToken,
    ) -> Result<(Vec<SearchResult>, Option<RerankStats>)> {
        let Some(query) = self.embedder.generate_embedding(question).await else {
            tracing::warn!(
                provider = self.embedder.name(),
                "could not embed question"
            );
            return Ok((Vec::new(), None));
        };

        let candidates = self
            .index
            .search(&query, collection, initial_k.max(top_k), None)
            .await?;
        if candidates.is_empty() {
            tracing::info!(collection, "no candidates found");
            return Ok((Vec::new(), None));
        }

        let (results, stats) = self
            .reranker
            .rerank(question, candidates, top_k, cancel)
            .await;
        Ok((results, Some(stats)))
    }

    /// Nearest neighbors without the reranking stage.
    pub async fn search_unranked(
        &self,
        question: &str,
        collection: Option<&str>,
        top_k: usize,
    ) -> Result<Vec<SearchResult>> {
        let Some(query) = self.embedder.generate_embedding(question).await else {
            tracing::warn!(
                provider = self.embedder.name(),
                "could not embed question"
            );
            return Ok(Vec::new());
        };
        self.index.search(&query, collection, top_k, None).await
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::{
        chunking::{Chunk, Metadata},
        inmemory::InMemoryVectorStore,
        reranker::{RelevanceScorer, RerankSettings},
    };

    /// One-hot embeddings keyed on the first letter.
    struct Letters;

    #[async_trait]
    impl EmbeddingBackend for Letters {
        fn name(&self) -> &str {
            "letters"
        }

        fn dimension(&self) -> usize {
            3
        }

        fn max_batch_size(&self) -> usize {
            10
        }

        async fn generate_embedding(&self, text: &str) -> Option<Vec<f32>> {
            match text.chars().next()? {
                'a' => Some(vec![1.0, 0.0, 0.0]),
                'b' => Some(vec![0.0, 1.0, 0.0]),
                'c' => Some(vec![0.0, 0.0, 1.0]),
                _ => None,
            }
        }
    }

    struct Always(&'static str);

    #[async_trait]
    impl RelevanceScorer for Always {
        fn name(&self) -> &str {
            "always"
        }

        async fn complete(&self, _prompt: &str) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    async fn client(answer: &'static str) -> RagClient {
        let index = IndexManager::new(Arc::new(InMemoryVectorStore::default()));
        let texts = ["apples", "bananas", "cherries"];
        let chunks: Vec<Chunk> = texts
            .iter()
            .map(|t| Chunk {
                text: t.to_string(),
                source: format!("{t}.txt"),
                chunk_index: 0,
                start_char: 0,
                end_char: t.len(),
                metadata: Metadata::new(),
            })
            .collect();
        let mut embeddings = Vec::new();
        for t in texts {
            embeddings.push(Letters.generate_embedding(t).await);
        }
        index.add_documents("fruit", &chunks, &embeddings, None).await.unwrap();

        let reranker = Reranker::new(
            Arc::new(Always(answer)),
            RerankSettings {
                distance_threshold: 1.5,
                score_delay_ms: 0,
                ..Default::default()
            },
        );
        RagClient::new(Arc::new(Letters), index, reranker)
    }

    #[tokio::test]
    async fn returns_closest_relevant_passage() {
        let rag = client("9").await;
        let (results, stats) = rag
            .search_with_stats("a question", None, 1, 3, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].text, "apples");
        assert_eq!(results[0].rerank_score, Some(9.0));
        let stats = stats.unwrap();
        assert_eq!(stats.initial_count, 3);
        // The other two are at squared distance 2.0.
        assert_eq!(stats.after_distance_filter, 1);
    }

    #[tokio::test]
    async fn low_scores_yield_nothing() {
        let rag = client("1").await;
        let results = rag
            .search("a question", Some("fruit"), 5, 20, &CancellationToken::new())
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn unembeddable_question_is_empty() {
        let rag = client("9").await;
        let results = rag
            .search_default("zzz", None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn unranked_search_keeps_distance_order() {
        let rag = client("9").await;
        let results = rag.search_unranked("b?", None, 3).await.unwrap();
        let texts: Vec<_> = results.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts[0], "bananas");
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.rerank_score.is_none()));
    }
}
