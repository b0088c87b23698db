// src/lib.rs

//! Lagoon: a versioned dataset catalog and reader/writer for columnar
//! Parquet data on a pluggable object store.
//!
//! # Architecture
//!
//! - Catalog-first: dataset identity, schema history, and the
//!   transaction/file/row-group/partition ledger all live in a relational
//!   catalog backed by SQLite.
//! - Storage is pluggable: a dataset's `base_uri` resolves to a local
//!   filesystem or an S3-compatible store through `object_store`.
//! - Writes are atomic: one write produces one new version, committed to
//!   the catalog in a single transaction.
//! - Reads prune before they touch storage: partition equality and
//!   row-group min/max statistics narrow the file and row-group set before
//!   any Parquet bytes are read, with an exact Arrow filter applied after
//!   materialization as the correctness backstop.

pub mod catalog;
mod error;
pub mod reader;
pub mod schema;
pub mod storage;
pub mod writer;

pub use catalog::{Catalog, DatasetRef};
pub use error::{Error, Result};
pub use reader::{read_dataset, Predicate, Table};
pub use storage::StorageOptions;
pub use writer::{write_dataset, WriteOptions, WriteResult};
