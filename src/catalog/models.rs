//! Row structs for the catalog's relational tables.
//!
//! Each type follows the same shape: an `Option<i64>` id populated by
//! [`insert`], a constructor, an `insert(&mut self, conn)` that fills in
//! the id, and a handful of `find_by_*`/`list_*` finders built on
//! `from_row`.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct Dataset {
    pub id: Option<i64>,
    pub name: String,
    pub base_uri: String,
    pub current_version: i64,
    pub created_at: DateTime<Utc>,
}

impl Dataset {
    pub fn new(name: impl Into<String>, base_uri: impl Into<String>) -> Self {
        Dataset {
            id: None,
            name: name.into(),
            base_uri: base_uri.into(),
            current_version: 0,
            created_at: Utc::now(),
        }
    }

    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO datasets (name, base_uri, current_version, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                self.name,
                self.base_uri,
                self.current_version,
                self.created_at.to_rfc3339()
            ],
        )?;
        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Dataset>> {
        conn.query_row(
            "SELECT id, name, base_uri, current_version, created_at FROM datasets WHERE id = ?1",
            [id],
            Self::from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn find_by_name(conn: &Connection, name: &str) -> Result<Option<Dataset>> {
        conn.query_row(
            "SELECT id, name, base_uri, current_version, created_at FROM datasets WHERE name = ?1",
            [name],
            Self::from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn find_by_base_uri(conn: &Connection, base_uri: &str) -> Result<Option<Dataset>> {
        conn.query_row(
            "SELECT id, name, base_uri, current_version, created_at FROM datasets WHERE base_uri = ?1",
            [base_uri],
            Self::from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn list_all(conn: &Connection) -> Result<Vec<Dataset>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, base_uri, current_version, created_at FROM datasets ORDER BY name",
        )?;
        let rows = stmt.query_map([], Self::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn update_current_version(conn: &Connection, id: i64, version: i64) -> Result<()> {
        conn.execute(
            "UPDATE datasets SET current_version = ?1 WHERE id = ?2",
            params![version, id],
        )?;
        Ok(())
    }

    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Dataset> {
        let created_at: String = row.get(4)?;
        Ok(Dataset {
            id: row.get(0)?,
            name: row.get(1)?,
            base_uri: row.get(2)?,
            current_version: row.get(3)?,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }
}

#[derive(Debug, Clone)]
pub struct SchemaVersionRecord {
    pub id: Option<i64>,
    pub dataset_id: i64,
    pub version: i64,
    pub arrow_schema: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl SchemaVersionRecord {
    pub fn new(dataset_id: i64, version: i64, arrow_schema: Vec<u8>) -> Self {
        SchemaVersionRecord {
            id: None,
            dataset_id,
            version,
            arrow_schema,
            created_at: Utc::now(),
        }
    }

    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO schema_versions (dataset_id, version, arrow_schema, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                self.dataset_id,
                self.version,
                self.arrow_schema,
                self.created_at.to_rfc3339()
            ],
        )?;
        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// Look up an existing schema version for this dataset whose bytes
    /// match exactly, so repeated writes with an unchanged schema reuse
    /// the same row instead of accumulating duplicates.
    pub fn find_by_bytes(conn: &Connection, dataset_id: i64, bytes: &[u8]) -> Result<Option<SchemaVersionRecord>> {
        conn.query_row(
            "SELECT id, dataset_id, version, arrow_schema, created_at FROM schema_versions
             WHERE dataset_id = ?1 AND arrow_schema = ?2",
            params![dataset_id, bytes],
            Self::from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<SchemaVersionRecord>> {
        conn.query_row(
            "SELECT id, dataset_id, version, arrow_schema, created_at FROM schema_versions WHERE id = ?1",
            [id],
            Self::from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn find_by_dataset_and_version(
        conn: &Connection,
        dataset_id: i64,
        version: i64,
    ) -> Result<Option<SchemaVersionRecord>> {
        conn.query_row(
            "SELECT id, dataset_id, version, arrow_schema, created_at FROM schema_versions
             WHERE dataset_id = ?1 AND version = ?2",
            params![dataset_id, version],
            Self::from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn max_version(conn: &Connection, dataset_id: i64) -> Result<i64> {
        let version: Option<i64> = conn.query_row(
            "SELECT MAX(version) FROM schema_versions WHERE dataset_id = ?1",
            [dataset_id],
            |row| row.get(0),
        )?;
        Ok(version.unwrap_or(0))
    }

    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<SchemaVersionRecord> {
        let created_at: String = row.get(4)?;
        Ok(SchemaVersionRecord {
            id: row.get(0)?,
            dataset_id: row.get(1)?,
            version: row.get(2)?,
            arrow_schema: row.get(3)?,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }
}

#[derive(Debug, Clone)]
pub struct TransactionRecord {
    pub id: Option<i64>,
    pub dataset_id: i64,
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

impl TransactionRecord {
    pub fn new(dataset_id: i64, version: i64) -> Self {
        TransactionRecord {
            id: None,
            dataset_id,
            version,
            created_at: Utc::now(),
        }
    }

    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO transactions (dataset_id, version, created_at) VALUES (?1, ?2, ?3)",
            params![self.dataset_id, self.version, self.created_at.to_rfc3339()],
        )?;
        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }
}

#[derive(Debug, Clone)]
pub struct FileRecord {
    pub id: Option<i64>,
    pub dataset_id: i64,
    pub transaction_id: i64,
    pub schema_version_id: i64,
    pub file_path: String,
    pub version: i64,
    pub row_count: i64,
    pub file_size: Option<i64>,
    pub metadata_json: Option<String>,
}

impl FileRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dataset_id: i64,
        transaction_id: i64,
        schema_version_id: i64,
        file_path: impl Into<String>,
        version: i64,
        row_count: i64,
        file_size: Option<i64>,
        metadata_json: Option<String>,
    ) -> Self {
        FileRecord {
            id: None,
            dataset_id,
            transaction_id,
            schema_version_id,
            file_path: file_path.into(),
            version,
            row_count,
            file_size,
            metadata_json,
        }
    }

    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO files (dataset_id, transaction_id, schema_version_id, file_path, version, row_count, file_size, metadata_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                self.dataset_id,
                self.transaction_id,
                self.schema_version_id,
                self.file_path,
                self.version,
                self.row_count,
                self.file_size,
                self.metadata_json,
            ],
        )?;
        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    pub fn list_for_dataset_version(conn: &Connection, dataset_id: i64, version: i64) -> Result<Vec<FileRecord>> {
        let mut stmt = conn.prepare(
            "SELECT id, dataset_id, transaction_id, schema_version_id, file_path, version, row_count, file_size, metadata_json
             FROM files WHERE dataset_id = ?1 AND version = ?2 ORDER BY file_path",
        )?;
        let rows = stmt.query_map(params![dataset_id, version], Self::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<FileRecord> {
        Ok(FileRecord {
            id: row.get(0)?,
            dataset_id: row.get(1)?,
            transaction_id: row.get(2)?,
            schema_version_id: row.get(3)?,
            file_path: row.get(4)?,
            version: row.get(5)?,
            row_count: row.get(6)?,
            file_size: row.get(7)?,
            metadata_json: row.get(8)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct RowGroupRecord {
    pub id: Option<i64>,
    pub file_id: i64,
    pub row_group_index: i64,
    pub row_count: i64,
    pub stats_min: Option<String>,
    pub stats_max: Option<String>,
    pub null_counts: Option<String>,
}

impl RowGroupRecord {
    pub fn new(
        file_id: i64,
        row_group_index: i64,
        row_count: i64,
        stats_min: Option<String>,
        stats_max: Option<String>,
        null_counts: Option<String>,
    ) -> Self {
        RowGroupRecord {
            id: None,
            file_id,
            row_group_index,
            row_count,
            stats_min,
            stats_max,
            null_counts,
        }
    }

    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO row_groups (file_id, row_group_index, row_count, stats_min, stats_max, null_counts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                self.file_id,
                self.row_group_index,
                self.row_count,
                self.stats_min,
                self.stats_max,
                self.null_counts,
            ],
        )?;
        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    pub fn list_for_files(conn: &Connection, file_ids: &[i64]) -> Result<Vec<RowGroupRecord>> {
        if file_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = file_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT id, file_id, row_group_index, row_count, stats_min, stats_max, null_counts
             FROM row_groups WHERE file_id IN ({placeholders}) ORDER BY file_id, row_group_index"
        );
        let mut stmt = conn.prepare(&sql)?;
        let params = rusqlite::params_from_iter(file_ids.iter());
        let rows = stmt.query_map(params, Self::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<RowGroupRecord> {
        Ok(RowGroupRecord {
            id: row.get(0)?,
            file_id: row.get(1)?,
            row_group_index: row.get(2)?,
            row_count: row.get(3)?,
            stats_min: row.get(4)?,
            stats_max: row.get(5)?,
            null_counts: row.get(6)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PartitionRecord {
    pub id: Option<i64>,
    pub file_id: i64,
    pub key: String,
    pub value: String,
}

impl PartitionRecord {
    pub fn new(file_id: i64, key: impl Into<String>, value: impl Into<String>) -> Self {
        PartitionRecord {
            id: None,
            file_id,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO partitions (file_id, key, value) VALUES (?1, ?2, ?3)",
            params![self.file_id, self.key, self.value],
        )?;
        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    pub fn list_for_files(conn: &Connection, file_ids: &[i64]) -> Result<Vec<PartitionRecord>> {
        if file_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = file_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT id, file_id, key, value FROM partitions WHERE file_id IN ({placeholders})"
        );
        let mut stmt = conn.prepare(&sql)?;
        let params = rusqlite::params_from_iter(file_ids.iter());
        let rows = stmt.query_map(params, Self::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<PartitionRecord> {
        Ok(PartitionRecord {
            id: row.get(0)?,
            file_id: row.get(1)?,
            key: row.get(2)?,
            value: row.get(3)?,
        })
    }
}
