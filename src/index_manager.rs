//! Collection management and nearest-neighbor search over a [`VectorStore`].

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::{
    chunking::{Chunk, Metadata},
    error::{Error, Result},
    item_id::ItemId,
    vector_store::{
        CollectionInfo, DistanceMetric, MetadataFilter, QueryHit, StoredItem,
        VectorStore,
    },
};

/// One retrieved chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub id: String,
    pub collection: String,
    pub text: String,
    pub source: String,
    /// Distance to the query under the store's metric; smaller is closer.
    pub distance: f32,
    pub metadata: Metadata,
    pub chunk_index: usize,
    /// Set once the result has been through the reranker.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f32>,
}

impl SearchResult {
    fn from_hit(collection: &str, hit: QueryHit) -> Self {
        let source = hit
            .metadata
            .get("source")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let chunk_index = hit
            .metadata
            .get("chunk_index")
            .and_then(Value::as_u64)
            .unwrap_or_default() as usize;

        Self {
            id: hit.id,
            collection: collection.to_string(),
            text: hit.text,
            source,
            distance: hit.distance,
            metadata: hit.metadata,
            chunk_index,
            rerank_score: None,
        }
    }
}

/// Outcome of [`IndexManager::add_documents`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct AddReport {
    pub added: usize,
    /// Chunks skipped because their embedding was missing or empty.
    pub dropped: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexStats {
    pub total_collections: usize,
    pub total_items: usize,
    pub collections: Vec<CollectionInfo>,
}

/// Maps chunks and their embeddings onto store collections.
#[derive(Clone)]
pub struct IndexManager {
    store: Arc<dyn VectorStore>,
}

impl std::fmt::Debug for IndexManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexManager")
            .field("metric", &self.store.metric())
            .finish_non_exhaustive()
    }
}

impl IndexManager {
    pub fn new(store: Arc<dyn VectorStore>) -> Self {
        Self { store }
    }

    pub fn metric(&self) -> DistanceMetric {
        self.store.metric()
    }

    pub async fn create_or_get_collection(
        &self,
        name: &str,
        metadata: &Metadata,
    ) -> Result<CollectionInfo> {
        self.store.create_collection(name, metadata).await
    }

    /// Index chunks with their embeddings, position for position.
    ///
    /// Chunks without a usable embedding are dropped and counted. Nothing is
    /// written when the lengths differ or the embeddings disagree on
    /// dimension. `metadata` is merged into every item's metadata, with the
    /// chunk's own keys taking precedence.
    pub async fn add_documents(
        &self,
        collection: &str,
        chunks: &[Chunk],
        embeddings: &[Option<Vec<f32>>],
        metadata: Option<&Metadata>,
    ) -> Result<AddReport> {
        if chunks.len() != embeddings.len() {
            return Err(Error::LengthMismatch {
                chunks: chunks.len(),
                embeddings: embeddings.len(),
            });
        }

        let mut items = Vec::with_capacity(chunks.len());
        let mut dropped = 0;
        for (ordinal, (chunk, embedding)) in chunks.iter().zip(embeddings).enumerate() {
            let Some(embedding) = embedding.as_ref().filter(|e| !e.is_empty()) else {
                dropped += 1;
                continue;
            };

            let mut item_metadata = metadata.cloned().unwrap_or_default();
            item_metadata.extend(
                chunk.metadata.iter().map(|(k, v)| (k.clone(), v.clone())),
            );
            item_metadata
                .entry("source".into())
                .or_insert_with(|| chunk.source.clone().into());
            item_metadata
                .entry("chunk_index".into())
                .or_insert_with(|| chunk.chunk_index.into());

            items.push(StoredItem {
                id: ItemId::new(collection, &chunk.source, chunk.chunk_index, ordinal)
                    .into(),
                text: chunk.text.clone(),
                metadata: item_metadata,
                embedding: embedding.clone(),
            });
        }

        if dropped > 0 {
            tracing::warn!(
                collection,
                dropped,
                "skipping chunks without embeddings"
            );
        }
        if items.is_empty() {
            return Ok(AddReport { added: 0, dropped });
        }

        // Reject mixed dimensions before the collection is touched.
        crate::vector_store::check_dimensions(collection, None, &items)?;

        let info = self
            .create_or_get_collection(collection, &Metadata::new())
            .await?;
        if let Some(expected) = info.dimension {
            crate::vector_store::check_dimensions(collection, Some(expected), &items)?;
        }

        let added = self.store.upsert(collection, &items).await?;
        tracing::info!(collection, added, dropped, "indexed chunks");
        Ok(AddReport { added, dropped })
    }

    /// The `top_k` nearest items, closest first.
    ///
    /// With a collection name only that collection is searched, and a
    /// missing collection yields no results. Without one every collection
    /// is searched and the hits are merged; a collection that fails to
    /// answer is logged and skipped.
    pub async fn search(
        &self,
        query_embedding: &[f32],
        collection: Option<&str>,
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchResult>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }

        if let Some(name) = collection {
            if self.store.get_collection(name).await?.is_none() {
                tracing::warn!(collection = name, "collection does not exist");
                return Ok(Vec::new());
            }
            let hits = self
                .store
                .query(name, query_embedding, top_k, filter)
                .await?;
            return Ok(hits
                .into_iter()
                .map(|hit| SearchResult::from_hit(name, hit))
                .collect());
        }

        let mut merged = Vec::new();
        for info in self.store.list_collections().await? {
            match self
                .store
                .query(&info.name, query_embedding, top_k, filter)
                .await
            {
                Ok(hits) => merged.extend(
                    hits.into_iter()
                        .map(|hit| SearchResult::from_hit(&info.name, hit)),
                ),
                Err(e) => {
                    tracing::warn!(
                        collection = %info.name,
                        error = %e,
                        "skipping collection in search"
                    );
                }
            }
        }

        merged.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| a.collection.cmp(&b.collection))
                .then_with(|| a.id.cmp(&b.id))
        });
        merged.truncate(top_k);
        Ok(merged)
    }

    pub async fn list_collections(&self) -> Result<Vec<CollectionInfo>> {
        self.store.list_collections().await
    }

    pub async fn get_collection(&self, name: &str) -> Result<Option<CollectionInfo>> {
        self.store.get_collection(name).await
    }

    pub async fn delete_collection(&self, name: &str) -> Result<bool> {
        let deleted = self.store.delete_collection(name).await?;
        if deleted {
            tracing::info!(collection = name, "deleted collection");
        }
        Ok(deleted)
    }

    /// Delete every collection, returning how many there were.
    pub async fn clear_all(&self) -> Result<usize> {
        let mut deleted = 0;
        for info in self.store.list_collections().await? {
            if self.store.delete_collection(&info.name).await? {
                deleted += 1;
            }
        }
        tracing::info!(deleted, "cleared all collections");
        Ok(deleted)
    }

    pub async fn get_stats(&self) -> Result<IndexStats> {
        let collections = self.store.list_collections().await?;
        Ok(IndexStats {
            total_collections: collections.len(),
            total_items: collections.iter().map(|c| c.count).sum(),
            collections,
        })
    }
}
