use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use redb::{
    Database, ReadableDatabase, ReadableTable, ReadableTableMetadata,
    TableDefinition,
};
use serde::{Deserialize, Serialize};

use crate::{
    chunking::Metadata,
    error::{Error, Result},
    vector_store::{
        CollectionInfo, DistanceMetric, MetadataFilter, QueryHit, StoredItem,
        VectorStore, check_collection_name, check_dimensions, rank_hits,
    },
};

/// Collection name -> JSON-encoded [`CollectionRecord`].
const COLLECTIONS: TableDefinition<&str, &str> =
    TableDefinition::new("collections");

/// Header size: 4 bytes embedding dimension.
const HEADER_SIZE: usize = 4;

#[derive(Debug, Serialize, Deserialize)]
struct CollectionRecord {
    metadata: Metadata,
    dimension: Option<usize>,
}

#[derive(Serialize)]
struct PayloadRef<'a> {
    text: &'a str,
    metadata: &'a Metadata,
}

#[derive(Deserialize)]
struct Payload {
    text: String,
    metadata: Metadata,
}

fn items_table_name(collection: &str) -> String {
    format!("items/{collection}")
}

/// Encode an item as:
/// - 4 bytes: embedding dimension D (u32 LE)
/// - D * 4 bytes: f32 values in native byte order
/// - remaining bytes: JSON `{text, metadata}`
fn encode_item(item: &StoredItem) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(&PayloadRef {
        text: &item.text,
        metadata: &item.metadata,
    })?;
    let floats: &[u8] = bytemuck::cast_slice(&item.embedding);

    let mut buf =
        Vec::with_capacity(HEADER_SIZE + floats.len() + payload.len());
    buf.extend_from_slice(&(item.embedding.len() as u32).to_le_bytes());
    buf.extend_from_slice(floats);
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode a stored record. Returns `None` for truncated records.
fn decode_item(bytes: &[u8]) -> Option<(Vec<f32>, Payload)> {
    let header: [u8; HEADER_SIZE] = bytes.get(..HEADER_SIZE)?.try_into().ok()?;
    let dimension = u32::from_le_bytes(header) as usize;
    let floats_end = HEADER_SIZE + dimension * 4;
    let float_bytes = bytes.get(HEADER_SIZE..floats_end)?;

    // redb gives no alignment guarantee for values.
    let embedding = match bytemuck::try_cast_slice::<u8, f32>(float_bytes) {
        Ok(floats) => floats.to_vec(),
        Err(_) => float_bytes
            .chunks_exact(4)
            .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    };
    let payload = serde_json::from_slice(&bytes[floats_end..]).ok()?;
    Some((embedding, payload))
}

/// A persistent [`VectorStore`] in a single redb file.
///
/// Collections are registered in one table and each keeps its items in a
/// table of its own, keyed by item id. All database work runs on the
/// blocking thread pool.
pub struct RedbVectorStore {
    db: Arc<Database>,
    metric: DistanceMetric,
}

impl RedbVectorStore {
    /// Open or create a store at the given path.
    ///
    /// # Examples
    ///
    /// ```
    /// # let tmp = tempfile::tempdir().unwrap();
    /// use docrag::{DistanceMetric, RedbVectorStore};
    ///
    /// let store = RedbVectorStore::open(
    ///     &tmp.path().join("vectors.redb"),
    ///     DistanceMetric::SquaredL2,
    /// )
    /// .unwrap();
    /// ```
    pub fn open(path: &Path, metric: DistanceMetric) -> Result<Self> {
        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        txn.open_table(COLLECTIONS)?;
        txn.commit()?;

        Ok(Self {
            db: Arc::new(db),
            metric,
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| Error::Store(format!("database task failed: {e}")))?
    }
}

fn not_found(name: &str) -> Error {
    Error::NotFound {
        kind: "collection",
        name: name.to_string(),
    }
}

fn read_record(db: &Database, name: &str) -> Result<Option<CollectionRecord>> {
    let txn = db.begin_read()?;
    let table = txn.open_table(COLLECTIONS)?;
    match table.get(name)? {
        Some(guard) => Ok(Some(serde_json::from_str(guard.value())?)),
        None => Ok(None),
    }
}

fn info(db: &Database, name: &str, record: CollectionRecord) -> Result<CollectionInfo> {
    let table_name = items_table_name(name);
    let def = TableDefinition::<&str, &[u8]>::new(&table_name);
    let txn = db.begin_read()?;
    let count = txn.open_table(def)?.len()? as usize;
    Ok(CollectionInfo {
        name: name.to_string(),
        count,
        metadata: record.metadata,
        dimension: record.dimension,
    })
}

impl std::fmt::Debug for RedbVectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbVectorStore")
            .field("metric", &self.metric)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl VectorStore for RedbVectorStore {
    fn metric(&self) -> DistanceMetric {
        self.metric
    }

    async fn create_collection(
        &self,
        name: &str,
        metadata: &Metadata,
    ) -> Result<CollectionInfo> {
        check_collection_name(name)?;
        let name = name.to_string();
        let metadata = metadata.clone();

        self.blocking(move |db| {
            let table_name = items_table_name(&name);
            let txn = db.begin_write()?;
            let (record, count, created) = {
                let mut registry = txn.open_table(COLLECTIONS)?;
                let existing = registry
                    .get(name.as_str())?
                    .map(|guard| guard.value().to_string());
                let items =
                    txn.open_table(TableDefinition::<&str, &[u8]>::new(&table_name))?;

                match existing {
                    Some(json) => {
                        let record: CollectionRecord = serde_json::from_str(&json)?;
                        (record, items.len()? as usize, false)
                    }
                    None => {
                        let record = CollectionRecord {
                            metadata,
                            dimension: None,
                        };
                        let json = serde_json::to_string(&record)?;
                        registry.insert(name.as_str(), json.as_str())?;
                        (record, 0, true)
                    }
                }
            };

            if created {
                txn.commit()?;
                tracing::info!(collection = %name, "created collection");
            } else {
                txn.abort()?;
            }

            Ok(CollectionInfo {
                name,
                count,
                metadata: record.metadata,
                dimension: record.dimension,
            })
        })
        .await
    }

    async fn get_collection(&self, name: &str) -> Result<Option<CollectionInfo>> {
        let name = name.to_string();
        self.blocking(move |db| match read_record(db, &name)? {
            Some(record) => Ok(Some(info(db, &name, record)?)),
            None => Ok(None),
        })
        .await
    }

    async fn list_collections(&self) -> Result<Vec<CollectionInfo>> {
        self.blocking(|db| {
            let records: Vec<(String, CollectionRecord)> = {
                let txn = db.begin_read()?;
                let table = txn.open_table(COLLECTIONS)?;
                let mut records = Vec::new();
                for entry in table.iter()? {
                    let (k, v) = entry?;
                    records
                        .push((k.value().to_string(), serde_json::from_str(v.value())?));
                }
                records
            };

            records
                .into_iter()
                .map(|(name, record)| info(db, &name, record))
                .collect()
        })
        .await
    }

    async fn delete_collection(&self, name: &str) -> Result<bool> {
        let name = name.to_string();
        self.blocking(move |db| {
            let table_name = items_table_name(&name);
            let txn = db.begin_write()?;
            let existed = {
                let mut registry = txn.open_table(COLLECTIONS)?;
                registry.remove(name.as_str())?.is_some()
            };
            txn.delete_table(TableDefinition::<&str, &[u8]>::new(&table_name))?;
            txn.commit()?;

            if existed {
                tracing::info!(collection = %name, "deleted collection");
            }
            Ok(existed)
        })
        .await
    }

    async fn upsert(&self, collection: &str, items: &[StoredItem]) -> Result<usize> {
        let collection = collection.to_string();
        let items = items.to_vec();

        self.blocking(move |db| {
            let table_name = items_table_name(&collection);
            // Record lookup, dimension check and insert share one write
            // transaction; redb serializes writers.
            let txn = db.begin_write()?;
            {
                let mut registry = txn.open_table(COLLECTIONS)?;
                let mut record: CollectionRecord = match registry
                    .get(collection.as_str())?
                    .map(|guard| guard.value().to_string())
                {
                    Some(json) => serde_json::from_str(&json)?,
                    None => return Err(not_found(&collection)),
                };
                if items.is_empty() {
                    return Ok(0);
                }

                let dimension = check_dimensions(&collection, record.dimension, &items)?;
                let mut table =
                    txn.open_table(TableDefinition::<&str, &[u8]>::new(&table_name))?;
                for item in &items {
                    table.insert(item.id.as_str(), encode_item(item)?.as_slice())?;
                }

                if record.dimension != dimension {
                    record.dimension = dimension;
                    let json = serde_json::to_string(&record)?;
                    registry.insert(collection.as_str(), json.as_str())?;
                }
            }
            txn.commit()?;

            tracing::debug!(%collection, items = items.len(), "upserted items");
            Ok(items.len())
        })
        .await
    }

    async fn query(
        &self,
        collection: &str,
        embedding: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<QueryHit>> {
        let collection = collection.to_string();
        let embedding = embedding.to_vec();
        let filter = filter.cloned();
        let metric = self.metric;

        self.blocking(move |db| {
            let record =
                read_record(db, &collection)?.ok_or_else(|| not_found(&collection))?;
            if let Some(expected) = record.dimension
                && expected != embedding.len()
            {
                return Err(Error::DimensionMismatch {
                    collection,
                    expected,
                    actual: embedding.len(),
                });
            }
            if top_k == 0 {
                return Ok(Vec::new());
            }

            let table_name = items_table_name(&collection);
            let txn = db.begin_read()?;
            let table =
                txn.open_table(TableDefinition::<&str, &[u8]>::new(&table_name))?;

            let mut hits = Vec::new();
            for entry in table.iter()? {
                let (k, v) = entry?;
                let Some((vector, payload)) = decode_item(v.value()) else {
                    tracing::warn!(%collection, id = k.value(), "skipping corrupt item");
                    continue;
                };
                if let Some(filter) = &filter
                    && !filter.matches(&payload.metadata)
                {
                    continue;
                }
                hits.push(QueryHit {
                    id: k.value().to_string(),
                    text: payload.text,
                    metadata: payload.metadata,
                    distance: metric.distance(&embedding, &vector),
                });
            }

            rank_hits(&mut hits, top_k);
            Ok(hits)
        })
        .await
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        let collection = collection.to_string();
        self.blocking(move |db| {
            let record =
                read_record(db, &collection)?.ok_or_else(|| not_found(&collection))?;
            Ok(info(db, &collection, record)?.count)
        })
        .await
    }
}
