//! Relational catalog: dataset registry, schema version history, and the
//! atomic per-write transaction/file/row-group/partition ledger.
//!
//! Backed by a single SQLite database via `rusqlite`. A write is committed
//! with one SQL transaction covering the transaction row, every file row,
//! and their row-group/partition children, followed by the
//! `datasets.current_version` bump — so a reader never observes a version
//! whose files are only partially recorded.

pub mod models;
pub mod schema;

use std::collections::HashMap;
use std::path::Path;

use rusqlite::Connection;

use crate::error::{Error, Result};
use crate::storage::looks_like_uri;
use models::{Dataset, FileRecord, PartitionRecord, RowGroupRecord, SchemaVersionRecord, TransactionRecord};

/// A resolved handle to a specific dataset at a specific point in the
/// catalog, suitable for passing to the writer or reader.
#[derive(Debug, Clone)]
pub struct DatasetRef {
    pub catalog_uri: String,
    pub dataset_id: i64,
    pub name: String,
    pub base_uri: String,
    pub version: i64,
    pub metadata: HashMap<String, String>,
}

/// Pure, catalog-independent classification of a legacy string reference:
/// a uri-shaped reference becomes `base_uri`, everything else becomes
/// `name`. Ported from `DatasetRef.from_legacy` in the original
/// implementation, which performs no dataset-id parsing of its own - the
/// `dataset:<id>` and `dataset_id=` query-parameter forms are a superset
/// this crate layers on top in [`Catalog::resolve_dataset`] before falling
/// back to this classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyRef {
    pub base_uri: Option<String>,
    pub name: Option<String>,
}

impl DatasetRef {
    pub fn from_legacy(reference: &str) -> LegacyRef {
        if looks_like_uri(reference) {
            LegacyRef {
                base_uri: Some(reference.to_string()),
                name: None,
            }
        } else {
            LegacyRef {
                base_uri: None,
                name: Some(reference.to_string()),
            }
        }
    }

    pub fn with_version(&self, version: i64) -> DatasetRef {
        DatasetRef {
            version,
            ..self.clone()
        }
    }

    /// A canonical string form that [`Catalog::resolve_dataset`] can parse
    /// back into this same dataset: `<catalog_uri>?dataset_id=<id>` when a
    /// catalog URI is known, `<catalog_uri>/datasets/<name>` as a fallback,
    /// or bare `dataset:<id>` when no catalog URI is recorded.
    pub fn canonical_uri(&self) -> Result<String> {
        if !self.catalog_uri.is_empty() {
            if self.dataset_id > 0 {
                return Ok(format!("{}?dataset_id={}", self.catalog_uri, self.dataset_id));
            }
            if !self.name.is_empty() {
                return Ok(format!("{}/datasets/{}", self.catalog_uri.trim_end_matches('/'), self.name));
            }
        }
        if self.dataset_id > 0 {
            return Ok(format!("dataset:{}", self.dataset_id));
        }
        Err(Error::InvalidReference(
            "dataset reference has neither a catalog uri, a name, nor an id".to_string(),
        ))
    }
}

/// Inputs the writer gathers for one Parquet file produced by a write,
/// ready to be persisted atomically by [`Catalog::commit_write`].
pub struct WriteFileInput {
    pub file_path: String,
    pub row_count: i64,
    pub file_size: Option<i64>,
    pub metadata_json: Option<String>,
    pub partitions: Vec<(String, String)>,
    pub row_groups: Vec<RowGroupInput>,
}

pub struct RowGroupInput {
    pub row_group_index: i64,
    pub row_count: i64,
    pub stats_min: Option<String>,
    pub stats_max: Option<String>,
    pub null_counts: Option<String>,
}

pub struct Catalog {
    conn: Connection,
    uri: String,
}

impl Catalog {
    /// Connect to a catalog URI of the form `sqlite://<path>` (or
    /// `sqlite://:memory:` / bare `:memory:` for an ephemeral catalog),
    /// creating and migrating the schema as needed.
    pub fn connect(catalog_uri: &str) -> Result<Catalog> {
        let conn = if catalog_uri == ":memory:" || catalog_uri == "sqlite://:memory:" {
            Connection::open_in_memory()?
        } else if let Some(rest) = catalog_uri.strip_prefix("sqlite://") {
            Self::open_path(rest)?
        } else {
            return Err(Error::UnsupportedScheme(catalog_uri.to_string()));
        };
        schema::migrate(&conn)?;
        Ok(Catalog {
            conn,
            uri: catalog_uri.to_string(),
        })
    }

    fn open_path(path: &str) -> Result<Connection> {
        if path.is_empty() || path == ":memory:" {
            return Ok(Connection::open_in_memory()?);
        }
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(Connection::open(path)?)
    }

    fn to_ref(&self, ds: Dataset) -> DatasetRef {
        DatasetRef {
            catalog_uri: self.uri.clone(),
            dataset_id: ds.id.unwrap_or_default(),
            name: ds.name,
            base_uri: ds.base_uri,
            version: ds.current_version,
            metadata: HashMap::new(),
        }
    }

    /// Register a new dataset, or return the existing one if `name` (or
    /// `base_uri`) is already registered with a matching pairing. Raises
    /// [`Error::DatasetConflict`] if the name and uri disagree with what's
    /// already on file.
    pub fn register_dataset(&mut self, name: &str, base_uri: &str) -> Result<DatasetRef> {
        if let Some(existing) = Dataset::find_by_name(&self.conn, name)? {
            if existing.base_uri != base_uri {
                return Err(Error::DatasetConflict(format!(
                    "dataset '{name}' is already registered with base_uri '{}', requested '{base_uri}'",
                    existing.base_uri
                )));
            }
            return Ok(self.to_ref(existing));
        }
        if let Some(existing) = Dataset::find_by_base_uri(&self.conn, base_uri)? {
            if existing.name != name {
                return Err(Error::DatasetConflict(format!(
                    "base_uri '{base_uri}' is already registered under dataset '{}', requested '{name}'",
                    existing.name
                )));
            }
            return Ok(self.to_ref(existing));
        }
        let mut ds = Dataset::new(name, base_uri);
        ds.insert(&self.conn)?;
        Ok(self.to_ref(ds))
    }

    pub fn get_dataset_by_name(&self, name: &str) -> Result<Option<DatasetRef>> {
        Ok(Dataset::find_by_name(&self.conn, name)?.map(|ds| self.to_ref(ds)))
    }

    pub fn get_dataset_by_id(&self, id: i64) -> Result<Option<DatasetRef>> {
        Ok(Dataset::find_by_id(&self.conn, id)?.map(|ds| self.to_ref(ds)))
    }

    pub fn list_datasets(&self) -> Result<Vec<DatasetRef>> {
        Ok(Dataset::list_all(&self.conn)?
            .into_iter()
            .map(|ds| self.to_ref(ds))
            .collect())
    }

    /// Resolve a dataset reference: `dataset:<id>`, a URI with a
    /// `dataset_id` query parameter, a bare `base_uri`, or a plain name.
    /// When `create_if_missing` is set and the reference is a name or a
    /// uri with no matching dataset, a new one is registered (a name
    /// additionally requires `base_uri` to be supplied).
    pub fn resolve_dataset(
        &mut self,
        reference: &str,
        create_if_missing: bool,
        base_uri: Option<&str>,
    ) -> Result<DatasetRef> {
        if let Some(id_str) = reference.strip_prefix("dataset:") {
            let id: i64 = id_str
                .parse()
                .map_err(|_| Error::InvalidReference(format!("invalid dataset id '{id_str}'")))?;
            let ds = Dataset::find_by_id(&self.conn, id)?
                .ok_or_else(|| Error::DatasetNotFound(reference.to_string()))?;
            return Ok(self.to_ref(ds));
        }

        // Not necessarily a well-formed absolute URL (catalog uris like
        // `:memory:` or `sqlite://path` aren't), so pull `dataset_id=` out
        // by hand rather than relying on `Url::parse` succeeding.
        if let Some(pos) = reference.find("dataset_id=") {
            let tail = &reference[pos + "dataset_id=".len()..];
            let value: String = tail.chars().take_while(|c| c.is_ascii_digit()).collect();
            if !value.is_empty() {
                let id: i64 = value
                    .parse()
                    .map_err(|_| Error::InvalidReference(format!("invalid dataset_id '{value}'")))?;
                let ds = Dataset::find_by_id(&self.conn, id)?
                    .ok_or_else(|| Error::DatasetNotFound(reference.to_string()))?;
                return Ok(self.to_ref(ds));
            }
        }

        let legacy = DatasetRef::from_legacy(reference);
        if let Some(uri) = legacy.base_uri {
            if let Some(ds) = Dataset::find_by_base_uri(&self.conn, &uri)? {
                return Ok(self.to_ref(ds));
            }
            if create_if_missing {
                let name = derive_name_from_uri(&uri);
                return self.register_dataset(&name, &uri);
            }
            return Err(Error::DatasetNotFound(reference.to_string()));
        }

        let name = legacy.name.expect("from_legacy always sets base_uri or name");
        if let Some(ds) = Dataset::find_by_name(&self.conn, &name)? {
            return Ok(self.to_ref(ds));
        }
        if create_if_missing {
            let uri = base_uri.ok_or_else(|| {
                Error::Catalog(format!(
                    "dataset '{name}' does not exist and no base_uri was given to create it"
                ))
            })?;
            return self.register_dataset(&name, uri);
        }
        Err(Error::DatasetNotFound(reference.to_string()))
    }

    /// Atomically record one write's worth of files (and their row groups
    /// and partitions) against a dataset at `version`, bumping
    /// `current_version`. Fails, leaving the catalog unchanged, if `version`
    /// is not strictly greater than the dataset's current version - this is
    /// how a second, stale concurrent writer loses. Reuses an existing
    /// schema version row when `schema_bytes` matches one already on file
    /// for this dataset.
    pub fn commit_write(
        &mut self,
        dataset_id: i64,
        version: i64,
        schema_bytes: Vec<u8>,
        files: Vec<WriteFileInput>,
    ) -> Result<i64> {
        if files.is_empty() {
            return Err(Error::dataset("write produced no files to commit"));
        }

        let tx = self.conn.transaction()?;
        let dataset = Dataset::find_by_id(&tx, dataset_id)?
            .ok_or_else(|| Error::DatasetNotFound(dataset_id.to_string()))?;
        if version <= dataset.current_version {
            return Err(Error::Catalog(format!(
                "commit rejected: version {version} is not greater than current version {}",
                dataset.current_version
            )));
        }
        let new_version = version;

        let schema_version_id = match SchemaVersionRecord::find_by_bytes(&tx, dataset_id, &schema_bytes)? {
            Some(existing) => existing.id.expect("persisted schema version has an id"),
            None => {
                let next = SchemaVersionRecord::max_version(&tx, dataset_id)? + 1;
                let mut sv = SchemaVersionRecord::new(dataset_id, next, schema_bytes);
                sv.insert(&tx)?
            }
        };

        let mut txn_row = TransactionRecord::new(dataset_id, new_version);
        let transaction_id = txn_row.insert(&tx)?;

        for file in files {
            let mut file_row = FileRecord::new(
                dataset_id,
                transaction_id,
                schema_version_id,
                file.file_path,
                new_version,
                file.row_count,
                file.file_size,
                file.metadata_json,
            );
            let file_id = file_row.insert(&tx)?;

            for (key, value) in file.partitions {
                PartitionRecord::new(file_id, key, value).insert(&tx)?;
            }
            for rg in file.row_groups {
                RowGroupRecord::new(
                    file_id,
                    rg.row_group_index,
                    rg.row_count,
                    rg.stats_min,
                    rg.stats_max,
                    rg.null_counts,
                )
                .insert(&tx)?;
            }
        }

        Dataset::update_current_version(&tx, dataset_id, new_version)?;
        tx.commit()?;
        Ok(new_version)
    }

    pub fn file_records_for_version(&self, dataset_id: i64, version: i64) -> Result<Vec<FileRecord>> {
        FileRecord::list_for_dataset_version(&self.conn, dataset_id, version)
    }

    pub fn partitions_for_files(&self, file_ids: &[i64]) -> Result<Vec<PartitionRecord>> {
        PartitionRecord::list_for_files(&self.conn, file_ids)
    }

    pub fn row_groups_for_files(&self, file_ids: &[i64]) -> Result<Vec<RowGroupRecord>> {
        RowGroupRecord::list_for_files(&self.conn, file_ids)
    }

    pub fn schema_bytes_for_id(&self, schema_version_id: i64) -> Result<Vec<u8>> {
        let record = SchemaVersionRecord::find_by_id(&self.conn, schema_version_id)?
            .ok_or_else(|| Error::Catalog(format!("schema version {schema_version_id} not found")))?;
        Ok(record.arrow_schema)
    }

    /// Bytes of the most recently created schema version for a dataset, or
    /// `None` if the dataset has never been written to.
    pub fn latest_schema_bytes(&self, dataset_id: i64) -> Result<Option<Vec<u8>>> {
        let version = SchemaVersionRecord::max_version(&self.conn, dataset_id)?;
        if version == 0 {
            return Ok(None);
        }
        let record = SchemaVersionRecord::find_by_dataset_and_version(&self.conn, dataset_id, version)?
            .ok_or_else(|| Error::Catalog(format!("schema version {version} missing for dataset {dataset_id}")))?;
        Ok(Some(record.arrow_schema))
    }
}

fn derive_name_from_uri(uri: &str) -> String {
    uri.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(uri)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_legacy_classifies_uri_as_base_uri() {
        let legacy = DatasetRef::from_legacy("/tmp/events");
        assert_eq!(legacy.base_uri.as_deref(), Some("/tmp/events"));
        assert_eq!(legacy.name, None);

        let legacy = DatasetRef::from_legacy("s3://bucket/prefix");
        assert_eq!(legacy.base_uri.as_deref(), Some("s3://bucket/prefix"));
        assert_eq!(legacy.name, None);
    }

    #[test]
    fn from_legacy_classifies_bare_word_as_name() {
        let legacy = DatasetRef::from_legacy("events");
        assert_eq!(legacy.name.as_deref(), Some("events"));
        assert_eq!(legacy.base_uri, None);
    }

    #[test]
    fn register_and_resolve_by_name() {
        let mut cat = Catalog::connect(":memory:").unwrap();
        let ds_ref = cat.register_dataset("events", "/tmp/events").unwrap();
        assert!(ds_ref.dataset_id > 0);

        let resolved = cat.resolve_dataset("events", false, None).unwrap();
        assert_eq!(resolved.dataset_id, ds_ref.dataset_id);
    }

    #[test]
    fn register_dataset_conflict() {
        let mut cat = Catalog::connect(":memory:").unwrap();
        cat.register_dataset("events", "/tmp/events").unwrap();
        let err = cat.register_dataset("events", "/tmp/other").unwrap_err();
        assert!(matches!(err, Error::DatasetConflict(_)));
    }

    #[test]
    fn resolve_missing_without_create_errors() {
        let mut cat = Catalog::connect(":memory:").unwrap();
        let err = cat.resolve_dataset("nope", false, None).unwrap_err();
        assert!(matches!(err, Error::DatasetNotFound(_)));
    }

    #[test]
    fn resolve_by_dataset_id_reference() {
        let mut cat = Catalog::connect(":memory:").unwrap();
        let ds_ref = cat.register_dataset("events", "/tmp/events").unwrap();
        let by_ref = format!("dataset:{}", ds_ref.dataset_id);
        let resolved = cat.resolve_dataset(&by_ref, false, None).unwrap();
        assert_eq!(resolved.name, "events");
    }

    #[test]
    fn commit_write_bumps_version_atomically() {
        let mut cat = Catalog::connect(":memory:").unwrap();
        let ds_ref = cat.register_dataset("events", "/tmp/events").unwrap();

        let files = vec![WriteFileInput {
            file_path: "v1/part-0.parquet".to_string(),
            row_count: 5,
            file_size: Some(123),
            metadata_json: None,
            partitions: vec![("day".to_string(), "2024-01-01".to_string())],
            row_groups: vec![RowGroupInput {
                row_group_index: 0,
                row_count: 5,
                stats_min: Some("{\"id\":1}".to_string()),
                stats_max: Some("{\"id\":5}".to_string()),
                null_counts: None,
            }],
        }];

        let version = cat.commit_write(ds_ref.dataset_id, 1, vec![1, 2, 3], files).unwrap();
        assert_eq!(version, 1);

        let refreshed = cat.get_dataset_by_id(ds_ref.dataset_id).unwrap().unwrap();
        assert_eq!(refreshed.version, 1);

        let records = cat.file_records_for_version(ds_ref.dataset_id, 1).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn commit_write_rejects_empty_file_list() {
        let mut cat = Catalog::connect(":memory:").unwrap();
        let ds_ref = cat.register_dataset("events", "/tmp/events").unwrap();
        let err = cat.commit_write(ds_ref.dataset_id, 1, vec![], vec![]).unwrap_err();
        assert!(matches!(err, Error::Dataset(_)));
    }

    #[test]
    fn commit_write_rejects_stale_version_and_leaves_catalog_unchanged() {
        let mut cat = Catalog::connect(":memory:").unwrap();
        let ds_ref = cat.register_dataset("events", "/tmp/events").unwrap();

        let file = |path: &str| WriteFileInput {
            file_path: path.to_string(),
            row_count: 1,
            file_size: Some(1),
            metadata_json: None,
            partitions: vec![],
            row_groups: vec![],
        };

        cat.commit_write(ds_ref.dataset_id, 1, vec![1], vec![file("v1/part-0.parquet")])
            .unwrap();

        // A second writer racing from the same stale `current_version`
        // (or replaying an already-applied version) must be rejected.
        let err = cat
            .commit_write(ds_ref.dataset_id, 1, vec![1], vec![file("v1/part-1.parquet")])
            .unwrap_err();
        assert!(matches!(err, Error::Catalog(_)));

        let refreshed = cat.get_dataset_by_id(ds_ref.dataset_id).unwrap().unwrap();
        assert_eq!(refreshed.version, 1);
        let records = cat.file_records_for_version(ds_ref.dataset_id, 1).unwrap();
        assert_eq!(records.len(), 1, "catalog must be unchanged after the rejected commit");
    }
}
