//! End-to-end indexing: load, chunk, embed, store.

use std::{path::Path, sync::Arc};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::{
    chunking::{Metadata, TextChunker},
    document::{DocumentLoader, Skipped},
    embedding::{EmbeddingBackend, is_valid},
    error::{Error, Result},
    index_manager::{IndexManager, IndexStats, SearchResult},
    vector_store::{CollectionInfo, MetadataFilter},
};

/// What an [`IndexingPipeline::index_path`] run did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineReport {
    pub success: bool,
    pub collection: String,
    pub documents_loaded: usize,
    pub chunks_created: usize,
    /// Embeddings that came back usable.
    pub embeddings_generated: usize,
    pub items_indexed: usize,
    /// Chunks that were not indexed for lack of a usable embedding.
    pub embeddings_dropped: usize,
    pub skipped: Vec<Skipped>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl PipelineReport {
    fn fail(mut self, message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!(collection = %self.collection, %message, "indexing failed");
        self.success = false;
        self.error_message = Some(message);
        self
    }
}

/// Collection name derived from a path: the file stem or directory name,
/// lowercased, with spaces and dashes turned into underscores.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use docrag::pipeline::default_collection_name;
///
/// assert_eq!(default_collection_name(Path::new("notes/Team Notes.md")), "team_notes");
/// assert_eq!(default_collection_name(Path::new("src/my-project")), "my_project");
/// ```
pub fn default_collection_name(path: &Path) -> String {
    let resolved = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let name = if resolved.is_dir() {
        resolved.file_name()
    } else {
        resolved.file_stem()
    };

    let name: String = name
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect();

    if name.trim().is_empty() {
        "documents".to_string()
    } else {
        name
    }
}

/// Runs documents from disk into the vector index.
#[derive(Clone)]
pub struct IndexingPipeline {
    loader: DocumentLoader,
    chunker: TextChunker,
    embedder: Arc<dyn EmbeddingBackend>,
    index: IndexManager,
}

impl std::fmt::Debug for IndexingPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexingPipeline")
            .field("chunker", &self.chunker)
            .field("embedder", &self.embedder.name())
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

impl IndexingPipeline {
    pub fn new(
        loader: DocumentLoader,
        chunker: TextChunker,
        embedder: Arc<dyn EmbeddingBackend>,
        index: IndexManager,
    ) -> Self {
        Self {
            loader,
            chunker,
            embedder,
            index,
        }
    }

    pub fn index(&self) -> &IndexManager {
        &self.index
    }

    /// Index a file or directory tree into `collection`, or into
    /// [`default_collection_name`] of the path.
    ///
    /// Unreadable files and failed embeddings are reported, not fatal. The
    /// run fails when nothing could be indexed, when the store rejects the
    /// write, or when it is cancelled before the write.
    pub async fn index_path(
        &self,
        path: &Path,
        collection: Option<&str>,
        cancel: &CancellationToken,
    ) -> PipelineReport {
        let collection = collection
            .map(str::to_string)
            .unwrap_or_else(|| default_collection_name(path));
        let report = PipelineReport {
            collection: collection.clone(),
            ..Default::default()
        };

        if !path.exists() {
            return report.fail(format!("path does not exist: {}", path.display()));
        }

        tracing::info!(path = %path.display(), %collection, "indexing");
        let loader = self.loader.clone();
        let owned_path = path.to_path_buf();
        let loaded =
            tokio::task::spawn_blocking(move || loader.load_path(&owned_path)).await;
        let outcome = match loaded {
            Ok(outcome) => outcome,
            Err(e) => return report.fail(format!("document loading panicked: {e}")),
        };

        let mut report = PipelineReport {
            documents_loaded: outcome.documents.len(),
            skipped: outcome.skipped,
            ..report
        };
        if outcome.documents.is_empty() {
            return report.fail("no documents could be loaded");
        }
        if cancel.is_cancelled() {
            return report.fail(Error::Cancelled.to_string());
        }

        let chunks = self.chunker.chunk_documents(&outcome.documents, None);
        report.chunks_created = chunks.len();
        if chunks.is_empty() {
            return report.fail("documents produced no chunks");
        }

        let mut embeddings = self
            .embedder
            .generate_embeddings_for_chunks(&chunks, cancel)
            .await;
        if cancel.is_cancelled() {
            return report.fail(Error::Cancelled.to_string());
        }

        let validation = self.embedder.validate_embeddings(&embeddings);
        tracing::info!(
            valid = validation.valid,
            invalid = validation.invalid,
            success_rate = validation.success_rate,
            "embedding validation"
        );
        // Wrong-dimension vectors are dropped rather than poisoning the
        // collection's dimension.
        let dimension = self.embedder.dimension();
        for embedding in &mut embeddings {
            if !is_valid(embedding.as_deref(), dimension) {
                *embedding = None;
            }
        }
        report.embeddings_generated = validation.valid;
        if validation.valid == 0 {
            report.embeddings_dropped = chunks.len();
            return report.fail("no embeddings were generated");
        }

        let mut collection_metadata = Metadata::new();
        collection_metadata.insert(
            "source_path".into(),
            path.display().to_string().into(),
        );
        collection_metadata.insert("embedder".into(), self.embedder.name().into());
        if let Err(e) = self
            .index
            .create_or_get_collection(&collection, &collection_metadata)
            .await
        {
            return report.fail(e.to_string());
        }

        match self
            .index
            .add_documents(&collection, &chunks, &embeddings, None)
            .await
        {
            Ok(added) => {
                report.items_indexed = added.added;
                report.embeddings_dropped = added.dropped;
                report.success = true;
                tracing::info!(
                    %collection,
                    documents = report.documents_loaded,
                    chunks = report.chunks_created,
                    indexed = report.items_indexed,
                    dropped = report.embeddings_dropped,
                    skipped = report.skipped.len(),
                    "indexing complete"
                );
                report
            }
            Err(e) => {
                report.embeddings_dropped = chunks.len();
                report.fail(e.to_string())
            }
        }
    }

    /// Nearest-neighbor search for a text query, without reranking.
    pub async fn search(
        &self,
        query: &str,
        collection: Option<&str>,
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchResult>> {
        let Some(embedding) = self.embedder.generate_embedding(query).await else {
            tracing::warn!(provider = self.embedder.name(), "could not embed query");
            return Ok(Vec::new());
        };
        self.index.search(&embedding, collection, top_k, filter).await
    }

    pub async fn list_collections(&self) -> Result<Vec<CollectionInfo>> {
        self.index.list_collections().await
    }

    pub async fn delete_collection(&self, name: &str) -> Result<bool> {
        self.index.delete_collection(name).await
    }

    pub async fn clear_all(&self) -> Result<usize> {
        self.index.clear_all().await
    }

    pub async fn get_stats(&self) -> Result<IndexStats> {
        self.index.get_stats().await
    }
}
