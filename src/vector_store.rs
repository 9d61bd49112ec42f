//! The storage interface behind the index manager.
//!
//! A [`VectorStore`] holds named collections of embedded items and answers
//! nearest-neighbor queries with an exact scan. Distances are always
//! "smaller is closer", whatever the [`DistanceMetric`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    chunking::Metadata,
    error::{Error, Result},
};

/// How query distances are computed. Fixed per store.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// Sum of squared differences.
    #[default]
    SquaredL2,
    /// `1 - cosine similarity`, in `[0, 2]`.
    Cosine,
}

impl DistanceMetric {
    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            DistanceMetric::SquaredL2 => a
                .iter()
                .zip(b)
                .map(|(x, y)| (x - y) * (x - y))
                .sum(),
            DistanceMetric::Cosine => {
                let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
                let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
                let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
                if norm_a == 0.0 || norm_b == 0.0 {
                    return 1.0;
                }
                1.0 - dot / (norm_a * norm_b)
            }
        }
    }
}

/// A collection and its current item count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub name: String,
    pub count: usize,
    pub metadata: Metadata,
    /// Embedding dimension, fixed by the first write.
    pub dimension: Option<usize>,
}

/// An item as written to a store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredItem {
    pub id: String,
    pub text: String,
    pub metadata: Metadata,
    pub embedding: Vec<f32>,
}

/// One nearest-neighbor match.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryHit {
    pub id: String,
    pub text: String,
    pub metadata: Metadata,
    pub distance: f32,
}

/// Equality constraints on item metadata. An empty filter matches all.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataFilter {
    equals: BTreeMap<String, Value>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `key` to equal `value`.
    pub fn equals(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.equals.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.equals.is_empty()
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.equals
            .iter()
            .all(|(key, value)| metadata.get(key) == Some(value))
    }
}

/// Named collections of embedded items with exact nearest-neighbor search.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// The metric every query uses.
    fn metric(&self) -> DistanceMetric;

    /// Create a collection, or return the existing one unchanged.
    async fn create_collection(
        &self,
        name: &str,
        metadata: &Metadata,
    ) -> Result<CollectionInfo>;

    async fn get_collection(&self, name: &str) -> Result<Option<CollectionInfo>>;

    /// All collections, sorted by name.
    async fn list_collections(&self) -> Result<Vec<CollectionInfo>>;

    /// Drop a collection and its items. Returns whether it existed.
    async fn delete_collection(&self, name: &str) -> Result<bool>;

    /// Insert or replace items by id, all or nothing.
    ///
    /// Every embedding must share the collection's dimension; the first
    /// write to an empty collection fixes it.
    async fn upsert(&self, collection: &str, items: &[StoredItem]) -> Result<usize>;

    /// The `top_k` items closest to `embedding`, ordered by ascending
    /// distance with ties broken by id.
    async fn query(
        &self,
        collection: &str,
        embedding: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<QueryHit>>;

    async fn count(&self, collection: &str) -> Result<usize>;
}

/// Reject empty collection names.
pub fn check_collection_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::Config("collection name must not be empty".into()));
    }
    Ok(())
}

/// Check that a batch has one shared dimension that agrees with the
/// collection's, returning it.
pub fn check_dimensions(
    collection: &str,
    expected: Option<usize>,
    items: &[StoredItem],
) -> Result<Option<usize>> {
    let mut dimension = expected;
    for item in items {
        let actual = item.embedding.len();
        match dimension {
            Some(expected) if expected != actual => {
                return Err(Error::DimensionMismatch {
                    collection: collection.to_string(),
                    expected,
                    actual,
                });
            }
            Some(_) => {}
            None => dimension = Some(actual),
        }
    }
    Ok(dimension)
}

/// Sort hits by ascending distance, then id, and keep the first `top_k`.
pub fn rank_hits(hits: &mut Vec<QueryHit>, top_k: usize) {
    hits.sort_by(|a, b| {
        a.distance
            .total_cmp(&b.distance)
            .then_with(|| a.id.cmp(&b.id))
    });
    hits.truncate(top_k);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, embedding: Vec<f32>) -> StoredItem {
        StoredItem {
            id: id.into(),
            text: String::new(),
            metadata: Metadata::new(),
            embedding,
        }
    }

    fn hit(id: &str, distance: f32) -> QueryHit {
        QueryHit {
            id: id.into(),
            text: String::new(),
            metadata: Metadata::new(),
            distance,
        }
    }

    #[test]
    fn squared_l2() {
        let d = DistanceMetric::SquaredL2.distance(&[1.0, 2.0], &[4.0, 6.0]);
        assert_eq!(d, 25.0);
    }

    #[test]
    fn cosine() {
        let same = DistanceMetric::Cosine.distance(&[1.0, 0.0], &[2.0, 0.0]);
        assert!(same.abs() < 1e-6);
        let opposite = DistanceMetric::Cosine.distance(&[1.0, 0.0], &[-1.0, 0.0]);
        assert!((opposite - 2.0).abs() < 1e-6);
        assert_eq!(DistanceMetric::Cosine.distance(&[0.0, 0.0], &[1.0, 0.0]), 1.0);
    }

    #[test]
    fn metric_names_in_config() {
        let m: DistanceMetric = serde_json::from_str("\"cosine\"").unwrap();
        assert_eq!(m, DistanceMetric::Cosine);
        let m: DistanceMetric = serde_json::from_str("\"squared_l2\"").unwrap();
        assert_eq!(m, DistanceMetric::SquaredL2);
    }

    #[test]
    fn filter_matches_all_constraints() {
        let mut meta = Metadata::new();
        meta.insert("file_type".into(), "md".into());
        meta.insert("chunk_index".into(), 2.into());

        assert!(MetadataFilter::new().matches(&meta));
        assert!(MetadataFilter::new().equals("file_type", "md").matches(&meta));
        assert!(
            MetadataFilter::new()
                .equals("file_type", "md")
                .equals("chunk_index", 2)
                .matches(&meta)
        );
        assert!(!MetadataFilter::new().equals("file_type", "rs").matches(&meta));
        assert!(!MetadataFilter::new().equals("missing", 1).matches(&meta));
    }

    #[test]
    fn dimensions_must_agree() {
        let items = vec![item("a", vec![1.0, 2.0]), item("b", vec![3.0, 4.0])];
        assert_eq!(check_dimensions("c", None, &items).unwrap(), Some(2));
        assert_eq!(check_dimensions("c", Some(2), &items).unwrap(), Some(2));

        let err = check_dimensions("c", Some(3), &items).unwrap_err();
        assert!(matches!(
            err,
            Error::DimensionMismatch { expected: 3, actual: 2, .. }
        ));

        let mixed = vec![item("a", vec![1.0]), item("b", vec![1.0, 2.0])];
        assert!(check_dimensions("c", None, &mixed).is_err());
    }

    #[test]
    fn ranking_breaks_ties_by_id() {
        let mut hits = vec![hit("b", 1.0), hit("c", 0.5), hit("a", 1.0)];
        rank_hits(&mut hits, 2);
        let ids: Vec<_> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a"]);
    }

    #[test]
    fn empty_collection_name_rejected() {
        assert!(check_collection_name("  ").is_err());
        check_collection_name("docs").unwrap();
    }
}
