//! Catalog schema version tracking and migrations.
//!
//! Mirrors the versioned-migration idiom used for the rest of the catalog:
//! a `schema_version` table holding a single row, and one `migrate_vN`
//! function per version applied in order. New columns are added with
//! idempotent `ALTER TABLE ... ADD COLUMN` guarded by `PRAGMA table_info`
//! so re-running migrations against an already-migrated database is safe.

use rusqlite::Connection;

use crate::error::Result;

pub const SCHEMA_VERSION: i64 = 1;

pub fn get_schema_version(conn: &Connection) -> Result<i64> {
    let exists: bool = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            [],
            |row| row.get(0),
        )?;
    if !exists {
        return Ok(0);
    }
    let version: i64 = conn.query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))?;
    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i64) -> Result<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

/// Create the catalog schema (if absent) and apply any pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON")?;

    let current = get_schema_version(conn)?;
    if current == 0 {
        migrate_v1(conn)?;
        set_schema_version(conn, 1)?;
    }
    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS datasets (
            id              INTEGER PRIMARY KEY,
            name            TEXT NOT NULL UNIQUE,
            base_uri        TEXT NOT NULL,
            current_version INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS schema_versions (
            id           INTEGER PRIMARY KEY,
            dataset_id   INTEGER NOT NULL REFERENCES datasets(id) ON DELETE CASCADE,
            version      INTEGER NOT NULL,
            arrow_schema BLOB NOT NULL,
            created_at   TEXT NOT NULL,
            UNIQUE(dataset_id, version),
            UNIQUE(dataset_id, arrow_schema)
        );

        CREATE TABLE IF NOT EXISTS transactions (
            id         INTEGER PRIMARY KEY,
            dataset_id INTEGER NOT NULL REFERENCES datasets(id) ON DELETE CASCADE,
            version    INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE(dataset_id, version)
        );

        CREATE TABLE IF NOT EXISTS files (
            id                INTEGER PRIMARY KEY,
            dataset_id        INTEGER NOT NULL REFERENCES datasets(id) ON DELETE CASCADE,
            transaction_id    INTEGER NOT NULL REFERENCES transactions(id) ON DELETE CASCADE,
            schema_version_id INTEGER NOT NULL REFERENCES schema_versions(id),
            file_path         TEXT NOT NULL,
            version           INTEGER NOT NULL,
            row_count         INTEGER NOT NULL,
            file_size         INTEGER,
            metadata_json     TEXT,
            UNIQUE(dataset_id, file_path, version)
        );

        CREATE TABLE IF NOT EXISTS row_groups (
            id              INTEGER PRIMARY KEY,
            file_id         INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
            row_group_index INTEGER NOT NULL,
            row_count       INTEGER NOT NULL,
            stats_min       TEXT,
            stats_max       TEXT,
            null_counts     TEXT,
            UNIQUE(file_id, row_group_index)
        );

        CREATE TABLE IF NOT EXISTS partitions (
            id      INTEGER PRIMARY KEY,
            file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
            key     TEXT NOT NULL,
            value   TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_files_dataset_version ON files(dataset_id, version);
        CREATE INDEX IF NOT EXISTS idx_row_groups_file ON row_groups(file_id);
        CREATE INDEX IF NOT EXISTS idx_partitions_file ON partitions(file_id);
        "#,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_sets_schema_version() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn unique_constraint_on_dataset_name() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        conn.execute(
            "INSERT INTO datasets (name, base_uri, current_version, created_at) VALUES ('a', '/tmp/a', 0, '2024-01-01')",
            [],
        )
        .unwrap();
        let err = conn
            .execute(
                "INSERT INTO datasets (name, base_uri, current_version, created_at) VALUES ('a', '/tmp/b', 0, '2024-01-01')",
                [],
            )
            .unwrap_err();
        assert!(matches!(err, rusqlite::Error::SqliteFailure(_, _)));
    }
}
