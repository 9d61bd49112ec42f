use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("cannot open database: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("database storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("database transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("database table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("database commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config file error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),

    #[error("{chunks} chunks but {embeddings} embeddings")]
    LengthMismatch { chunks: usize, embeddings: usize },

    #[error(
        "embedding dimension {actual} does not match collection '{collection}' ({expected})"
    )]
    DimensionMismatch {
        collection: String,
        expected: usize,
        actual: usize,
    },

    #[error("provider '{provider}' failed: {message}")]
    Provider { provider: String, message: String },

    #[error("vector store error: {0}")]
    Store(String),

    #[error("indexing failed: {0}")]
    Indexing(String),

    #[error("operation cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_runs_are_not_reported_as_store_errors() {
        let err = Error::Indexing("no documents could be loaded".into());
        assert_eq!(err.to_string(), "indexing failed: no documents could be loaded");
        assert_eq!(Error::Cancelled.to_string(), "operation cancelled");
    }
}
