//! A [`VectorStore`] kept entirely in memory.
//!
//! Useful for tests and one-off runs; nothing survives the process.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    chunking::Metadata,
    error::{Error, Result},
    vector_store::{
        CollectionInfo, DistanceMetric, MetadataFilter, QueryHit, StoredItem,
        VectorStore, check_collection_name, check_dimensions, rank_hits,
    },
};

#[derive(Debug, Default)]
struct Collection {
    metadata: Metadata,
    dimension: Option<usize>,
    items: BTreeMap<String, StoredItem>,
}

impl Collection {
    fn info(&self, name: &str) -> CollectionInfo {
        CollectionInfo {
            name: name.to_string(),
            count: self.items.len(),
            metadata: self.metadata.clone(),
            dimension: self.dimension,
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryVectorStore {
    collections: RwLock<HashMap<String, Collection>>,
    metric: DistanceMetric,
}

impl InMemoryVectorStore {
    pub fn new(metric: DistanceMetric) -> Self {
        Self {
            collections: RwLock::default(),
            metric,
        }
    }
}

fn not_found(name: &str) -> Error {
    Error::NotFound {
        kind: "collection",
        name: name.to_string(),
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    fn metric(&self) -> DistanceMetric {
        self.metric
    }

    async fn create_collection(
        &self,
        name: &str,
        metadata: &Metadata,
    ) -> Result<CollectionInfo> {
        check_collection_name(name)?;
        let mut collections = self.collections.write().await;
        let collection =
            collections.entry(name.to_string()).or_insert_with(|| {
                tracing::info!(collection = name, "created collection");
                Collection {
                    metadata: metadata.clone(),
                    ..Default::default()
                }
            });
        Ok(collection.info(name))
    }

    async fn get_collection(&self, name: &str) -> Result<Option<CollectionInfo>> {
        let collections = self.collections.read().await;
        Ok(collections.get(name).map(|c| c.info(name)))
    }

    async fn list_collections(&self) -> Result<Vec<CollectionInfo>> {
        let collections = self.collections.read().await;
        let mut infos: Vec<CollectionInfo> = collections
            .iter()
            .map(|(name, c)| c.info(name))
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }

    async fn delete_collection(&self, name: &str) -> Result<bool> {
        let mut collections = self.collections.write().await;
        Ok(collections.remove(name).is_some())
    }

    async fn upsert(&self, collection: &str, items: &[StoredItem]) -> Result<usize> {
        let mut collections = self.collections.write().await;
        let store = collections
            .get_mut(collection)
            .ok_or_else(|| not_found(collection))?;

        store.dimension = check_dimensions(collection, store.dimension, items)?;
        for item in items {
            store.items.insert(item.id.clone(), item.clone());
        }
        Ok(items.len())
    }

    async fn query(
        &self,
        collection: &str,
        embedding: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<QueryHit>> {
        let collections = self.collections.read().await;
        let store = collections
            .get(collection)
            .ok_or_else(|| not_found(collection))?;

        if let Some(expected) = store.dimension
            && expected != embedding.len()
        {
            return Err(Error::DimensionMismatch {
                collection: collection.to_string(),
                expected,
                actual: embedding.len(),
            });
        }

        let mut hits: Vec<QueryHit> = store
            .items
            .values()
            .filter(|item| filter.is_none_or(|f| f.matches(&item.metadata)))
            .map(|item| QueryHit {
                id: item.id.clone(),
                text: item.text.clone(),
                metadata: item.metadata.clone(),
                distance: self.metric.distance(embedding, &item.embedding),
            })
            .collect();

        rank_hits(&mut hits, top_k);
        Ok(hits)
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        let collections = self.collections.read().await;
        collections
            .get(collection)
            .map(|c| c.items.len())
            .ok_or_else(|| not_found(collection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, embedding: Vec<f32>) -> StoredItem {
        StoredItem {
            id: id.into(),
            text: format!("text {id}"),
            metadata: Metadata::new(),
            embedding,
        }
    }

    #[tokio::test]
    async fn upsert_and_query() {
        let store = InMemoryVectorStore::default();
        store.create_collection("docs", &Metadata::new()).await.unwrap();
        store
            .upsert(
                "docs",
                &[item("b", vec![2.0, 0.0]), item("a", vec![0.0, 1.0])],
            )
            .await
            .unwrap();

        let hits = store.query("docs", &[0.0, 0.0], 5, None).await.unwrap();
        let ids: Vec<_> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(hits[1].distance, 4.0);
    }

    #[tokio::test]
    async fn mismatched_dimension_is_atomic() {
        let store = InMemoryVectorStore::default();
        store.create_collection("docs", &Metadata::new()).await.unwrap();
        let err = store
            .upsert("docs", &[item("a", vec![1.0]), item("b", vec![1.0, 2.0])])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { .. }));
        assert_eq!(store.count("docs").await.unwrap(), 0);
        let info = store.get_collection("docs").await.unwrap().unwrap();
        assert_eq!(info.dimension, None);
    }

    #[tokio::test]
    async fn missing_collection() {
        let store = InMemoryVectorStore::default();
        assert!(store.count("nope").await.is_err());
        assert!(!store.delete_collection("nope").await.unwrap());
    }
}
