//! Crate-wide error type.

use thiserror::Error;

/// Errors produced by the catalog, storage, schema, writer and reader
/// subsystems.
#[derive(Debug, Error)]
pub enum Error {
    #[error("dataset not found: {0}")]
    DatasetNotFound(String),

    #[error("dataset conflict: {0}")]
    DatasetConflict(String),

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("invalid dataset reference: {0}")]
    InvalidReference(String),

    #[error("unsupported catalog scheme: {0}")]
    UnsupportedScheme(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    pub fn catalog(msg: impl Into<String>) -> Self {
        Error::Catalog(msg.into())
    }

    pub fn dataset(msg: impl Into<String>) -> Self {
        Error::Dataset(msg.into())
    }
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
