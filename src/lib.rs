//! docrag - document indexing and reranked vector retrieval.
//!
//! docrag loads text files, splits them into overlapping chunks, embeds the
//! chunks with a remote ([Gemini](gemini)) or local ([Ollama](ollama))
//! model and stores them in named collections of a vector store. Queries
//! are embedded the same way; the nearest chunks are then filtered by
//! distance and rescored by an LLM before being returned.
//!
//! # Quick start
//!
//! ```no_run
//! use std::{path::Path, sync::Arc};
//!
//! use docrag::{
//!     DataDir, DistanceMetric, DocumentLoader, IndexManager, IndexingPipeline,
//!     OllamaEmbedder, OllamaScorer, RagClient, RedbVectorStore, RerankSettings,
//!     Reranker, TextChunker,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> docrag::Result<()> {
//! let data_dir = DataDir::resolve(None)?;
//! let store = RedbVectorStore::open(&data_dir.vectors_db(), DistanceMetric::SquaredL2)?;
//! let index = IndexManager::new(Arc::new(store));
//! let embedder = Arc::new(OllamaEmbedder::new()?);
//! let cancel = CancellationToken::new();
//!
//! let pipeline = IndexingPipeline::new(
//!     DocumentLoader::new(),
//!     TextChunker::default(),
//!     embedder.clone(),
//!     index.clone(),
//! );
//! let report = pipeline.index_path(Path::new("notes/"), None, &cancel).await;
//! println!("indexed {} chunks", report.items_indexed);
//!
//! let reranker = Reranker::new(Arc::new(OllamaScorer::new()?), RerankSettings::default());
//! let client = RagClient::new(embedder, index, reranker);
//! for r in client.search("how do I rotate keys?", None, 5, 20, &cancel).await? {
//!     println!("{}:{} ({:?})", r.collection, r.source, r.rerank_score);
//! }
//! # Ok(())
//! # }
//! ```

pub mod chunking;
pub mod config;
pub mod data_dir;
pub mod document;
pub mod embedding;
pub mod error;
pub mod gemini;
pub mod index_manager;
pub mod inmemory;
pub mod item_id;
pub mod ollama;
pub mod pipeline;
pub mod rag_client;
pub mod reranker;
pub mod retry;
pub mod vector_db;
pub mod vector_store;
pub mod walker;

pub use chunking::{Chunk, ChunkingConfig, Metadata, TextChunker};
pub use config::{Provider, RagConfig};
pub use data_dir::DataDir;
pub use document::{Document, DocumentLoader, FileType};
pub use embedding::EmbeddingBackend;
pub use error::{Error, Result};
pub use gemini::{GeminiEmbedder, GeminiScorer};
pub use index_manager::{IndexManager, SearchResult};
pub use inmemory::InMemoryVectorStore;
pub use item_id::ItemId;
pub use ollama::{OllamaEmbedder, OllamaScorer};
pub use pipeline::{IndexingPipeline, PipelineReport};
pub use rag_client::RagClient;
pub use reranker::{RelevanceScorer, RerankSettings, Reranker};
pub use vector_db::RedbVectorStore;
pub use vector_store::{DistanceMetric, MetadataFilter, VectorStore};
