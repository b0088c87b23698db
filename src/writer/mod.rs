//! Normalize -> write Parquet -> harvest stats -> commit.
//!
//! A write records the incoming batches' own schema as-is, splits them into
//! one Parquet file per distinct partition-key combination (or a single
//! file when unpartitioned), writes each file to local scratch space so a
//! plain [`ArrowWriter`] can be used, reopens it to harvest per-row-group
//! min/max/null-count statistics, moves it into the dataset's storage, and
//! finally commits everything to the catalog in one atomic transaction.

use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use arrow::array::{Array, RecordBatch};
use arrow::compute::{cast, concat_batches, take};
use arrow::datatypes::{DataType, Schema};
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::{EnabledStatistics, WriterProperties};
use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::file::statistics::Statistics;
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use crate::catalog::{Catalog, DatasetRef, RowGroupInput, WriteFileInput};
use crate::error::{Error, Result};
use crate::schema;
use crate::storage::{self, StorageOptions};

/// Options controlling how a write is split and where it's stored.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    pub partition_by: Vec<String>,
    pub storage_options: Option<StorageOptions>,
}

/// Outcome of a successful [`write_dataset`] call.
#[derive(Debug, Clone)]
pub struct WriteResult {
    pub dataset_ref: DatasetRef,
    pub row_count: usize,
    pub files: Vec<String>,
    pub version: i64,
}

/// Write `batches` to `reference`, creating the dataset (with `base_uri`)
/// if it doesn't exist yet.
pub fn write_dataset(
    catalog: &mut Catalog,
    reference: &str,
    base_uri: Option<&str>,
    batches: &[RecordBatch],
    options: &WriteOptions,
) -> Result<WriteResult> {
    if batches.is_empty() {
        return Err(Error::dataset("write_dataset called with no record batches"));
    }

    let dataset_ref = catalog.resolve_dataset(reference, true, base_uri)?;
    if dataset_ref.base_uri.is_empty() {
        return Err(Error::dataset(format!(
            "dataset '{}' has no base_uri configured",
            dataset_ref.name
        )));
    }

    let incoming_schema = batches[0].schema();
    let combined = concat_batches(&incoming_schema, batches)?;
    let total_rows = combined.num_rows();

    // The writer records the incoming schema as-is rather than merging it
    // against the dataset's prior schema; `schema::merge_schemas`/
    // `align_batch_to_schema` are kept for an eventual evolutionary write
    // path but are not wired in here.
    let schema_bytes = schema::serialize_schema(&incoming_schema)?;

    let handle = storage::resolve_filesystem(&dataset_ref.base_uri, options.storage_options.as_ref())?;
    let version = dataset_ref.version + 1;
    let groups = split_by_partitions(&combined, &options.partition_by)?;

    let mut files = Vec::with_capacity(groups.len());
    for (index, group) in groups.iter().enumerate() {
        let relative_path = relative_file_path(version, index, &group.partitions);
        let (file_uri, file_size, row_groups) =
            write_part_file(&handle, &relative_path, &group.batch, &incoming_schema)?;
        info!(
            dataset = %dataset_ref.name,
            file = %file_uri,
            rows = group.batch.num_rows(),
            "wrote parquet part file"
        );
        files.push(WriteFileInput {
            file_path: file_uri.clone(),
            row_count: group.batch.num_rows() as i64,
            file_size: Some(file_size as i64),
            metadata_json: None,
            partitions: group.partitions.clone(),
            row_groups,
        });
    }

    if files.is_empty() {
        return Err(Error::dataset("write produced no files"));
    }

    let file_paths: Vec<String> = files.iter().map(|f| f.file_path.clone()).collect();
    let written_version = catalog.commit_write(dataset_ref.dataset_id, version, schema_bytes, files)?;
    debug_assert_eq!(written_version, version);

    Ok(WriteResult {
        dataset_ref: dataset_ref.with_version(written_version),
        row_count: total_rows,
        files: file_paths,
        version: written_version,
    })
}

struct PartitionGroup {
    batch: RecordBatch,
    partitions: Vec<(String, String)>,
}

fn split_by_partitions(batch: &RecordBatch, partition_by: &[String]) -> Result<Vec<PartitionGroup>> {
    if partition_by.is_empty() {
        return Ok(vec![PartitionGroup {
            batch: batch.clone(),
            partitions: Vec::new(),
        }]);
    }

    let schema = batch.schema();
    let mut partition_cols = Vec::with_capacity(partition_by.len());
    for key in partition_by {
        let idx = schema
            .index_of(key)
            .map_err(|_| Error::dataset(format!("partition column '{key}' not present in batch")))?;
        let values = cast(batch.column(idx), &DataType::Utf8)?;
        partition_cols.push((key.clone(), values));
    }

    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, (Vec<(String, String)>, Vec<u64>)> = HashMap::new();
    for row in 0..batch.num_rows() {
        let mut key_parts = Vec::with_capacity(partition_cols.len());
        for (name, values) in &partition_cols {
            let array = values
                .as_any()
                .downcast_ref::<arrow::array::StringArray>()
                .expect("cast to Utf8 always yields StringArray");
            let value = if array.is_null(row) {
                "null".to_string()
            } else {
                array.value(row).to_string()
            };
            key_parts.push((name.clone(), value));
        }
        let key = key_parts
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("/");
        let entry = groups.entry(key.clone()).or_insert_with(|| {
            order.push(key.clone());
            (key_parts.clone(), Vec::new())
        });
        entry.1.push(row as u64);
    }

    let mut out = Vec::with_capacity(order.len());
    let retained_indices: Vec<usize> = (0..schema.fields().len())
        .filter(|i| !partition_by.contains(schema.field(*i).name()))
        .collect();

    for key in order {
        let (partitions, rows) = groups.remove(&key).expect("key was just inserted");
        let indices = arrow::array::UInt64Array::from(rows);
        let mut columns = Vec::with_capacity(retained_indices.len());
        let mut fields = Vec::with_capacity(retained_indices.len());
        for &i in &retained_indices {
            columns.push(take(batch.column(i), &indices, None)?);
            fields.push(schema.field(i).clone());
        }
        let projected_schema = Arc::new(Schema::new(fields));
        let projected = RecordBatch::try_new(projected_schema, columns)?;
        out.push(PartitionGroup {
            batch: projected,
            partitions,
        });
    }
    Ok(out)
}

fn relative_file_path(version: i64, index: usize, partitions: &[(String, String)]) -> String {
    let mut parts = vec![format!("v{version}")];
    for (key, value) in partitions {
        parts.push(format!("{key}={value}"));
    }
    parts.push(format!("part-v{version}-{index}.parquet"));
    parts.join("/")
}

/// Write one Arrow batch as a Parquet file, harvest its row-group
/// statistics, and move it into `handle`'s storage at `relative_path`.
/// Returns the absolute file URI, file size in bytes, and per-row-group
/// stats ready for the catalog.
fn write_part_file(
    handle: &storage::StorageHandle,
    relative_path: &str,
    batch: &RecordBatch,
    schema: &Arc<Schema>,
) -> Result<(String, u64, Vec<RowGroupInput>)> {
    let scratch_path = scratch_file_path(handle, relative_path);
    if let Some(parent) = scratch_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let props = WriterProperties::builder()
        .set_statistics_enabled(EnabledStatistics::Chunk)
        .set_compression(Compression::SNAPPY)
        .build();

    {
        let file = File::create(&scratch_path)?;
        let mut writer = ArrowWriter::try_new(file, schema.clone(), Some(props))?;
        writer.write(batch)?;
        writer.close()?;
    }

    let row_groups = harvest_row_group_stats(&scratch_path, schema)?;
    let file_size = std::fs::metadata(&scratch_path)?.len();

    let file_uri = match &handle.local_root {
        Some(_) => {
            let final_path = storage::local_path_for(handle, relative_path)
                .expect("local_root implies local_path_for succeeds");
            if let Some(parent) = final_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            move_file_atomic(&scratch_path, &final_path)?;
            format!("{}/{}", handle.base_uri.trim_end_matches('/'), relative_path)
        }
        None => {
            let bytes = std::fs::read(&scratch_path)?;
            let object_path = storage::object_path_for(handle, relative_path);
            let store = handle.store.clone();
            storage::block_on(async move {
                store
                    .put(&object_path, object_store::PutPayload::from(bytes))
                    .await
            })?;
            std::fs::remove_file(&scratch_path)?;
            format!("{}/{}", handle.base_uri.trim_end_matches('/'), relative_path)
        }
    };

    Ok((file_uri, file_size, row_groups))
}

fn scratch_file_path(handle: &storage::StorageHandle, relative_path: &str) -> PathBuf {
    if let Some(final_path) = storage::local_path_for(handle, relative_path) {
        final_path.with_extension("parquet.tmp")
    } else {
        let mut path = std::env::temp_dir();
        let unique = format!(
            "lagoon-{}-{}-{}",
            std::process::id(),
            relative_path.replace('/', "_"),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or_default()
        );
        path.push(unique);
        path
    }
}

/// Fall back to copy-then-delete when `from` and `to` live on different
/// filesystems (`rename` returns `EXDEV`).
fn move_file_atomic(from: &std::path::Path, to: &std::path::Path) -> Result<()> {
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc_exdev()) => {
            std::fs::copy(from, to)?;
            std::fs::remove_file(from)?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
fn libc_exdev() -> i32 {
    18
}

#[cfg(not(unix))]
fn libc_exdev() -> i32 {
    -1
}

fn harvest_row_group_stats(path: &std::path::Path, schema: &Schema) -> Result<Vec<RowGroupInput>> {
    let file = File::open(path)?;
    let reader = SerializedFileReader::new(file)?;
    let metadata = reader.metadata();

    let mut out = Vec::with_capacity(metadata.num_row_groups());
    for (rg_index, rg) in metadata.row_groups().iter().enumerate() {
        let mut stats_min = serde_json::Map::new();
        let mut stats_max = serde_json::Map::new();
        let mut null_counts = serde_json::Map::new();

        for (col_index, column) in rg.columns().iter().enumerate() {
            let Some(field) = schema.fields().get(col_index) else {
                continue;
            };
            let Some(stats) = column.statistics() else {
                continue;
            };
            if let Some(count) = stats.null_count_opt() {
                null_counts.insert(field.name().clone(), JsonValue::from(count));
            }
            if let (Some(min), Some(max)) = statistics_min_max(stats) {
                stats_min.insert(field.name().clone(), min);
                stats_max.insert(field.name().clone(), max);
            }
        }

        debug!(row_group = rg_index, rows = rg.num_rows(), "harvested row group stats");
        out.push(RowGroupInput {
            row_group_index: rg_index as i64,
            row_count: rg.num_rows(),
            stats_min: Some(JsonValue::Object(stats_min).to_string()),
            stats_max: Some(JsonValue::Object(stats_max).to_string()),
            null_counts: Some(JsonValue::Object(null_counts).to_string()),
        });
    }
    Ok(out)
}

fn statistics_min_max(stats: &Statistics) -> (Option<JsonValue>, Option<JsonValue>) {
    match stats {
        Statistics::Boolean(s) => (
            s.min_opt().map(|v| JsonValue::from(*v)),
            s.max_opt().map(|v| JsonValue::from(*v)),
        ),
        Statistics::Int32(s) => (
            s.min_opt().map(|v| JsonValue::from(*v)),
            s.max_opt().map(|v| JsonValue::from(*v)),
        ),
        Statistics::Int64(s) => (
            s.min_opt().map(|v| JsonValue::from(*v)),
            s.max_opt().map(|v| JsonValue::from(*v)),
        ),
        Statistics::Float(s) => (
            s.min_opt().map(|v| JsonValue::from(*v)),
            s.max_opt().map(|v| JsonValue::from(*v)),
        ),
        Statistics::Double(s) => (
            s.min_opt().map(|v| JsonValue::from(*v)),
            s.max_opt().map(|v| JsonValue::from(*v)),
        ),
        Statistics::ByteArray(s) => (
            s.min_opt().map(|v| JsonValue::from(String::from_utf8_lossy(v.as_bytes()).to_string())),
            s.max_opt().map(|v| JsonValue::from(String::from_utf8_lossy(v.as_bytes()).to_string())),
        ),
        _ => (None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, StringArray};
    use arrow::datatypes::Field;
    use std::sync::Arc;

    fn sample_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("day", DataType::Utf8, false),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![1, 2, 3, 4])),
                Arc::new(StringArray::from(vec!["2024-01-01", "2024-01-01", "2024-01-02", "2024-01-02"])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn split_without_partitioning_returns_one_group() {
        let batch = sample_batch();
        let groups = split_by_partitions(&batch, &[]).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].batch.num_rows(), 4);
    }

    #[test]
    fn split_by_day_groups_rows() {
        let batch = sample_batch();
        let groups = split_by_partitions(&batch, &["day".to_string()]).unwrap();
        assert_eq!(groups.len(), 2);
        for group in &groups {
            assert_eq!(group.batch.num_columns(), 1, "partition column is dropped from the file");
            assert_eq!(group.batch.num_rows(), 2);
            assert_eq!(group.partitions.len(), 1);
        }
    }

    #[test]
    fn write_and_harvest_stats_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let handle = storage::resolve_filesystem(dir.path().to_str().unwrap(), None).unwrap();
        let batch = sample_batch();
        let schema = batch.schema();
        let (uri, size, row_groups) = write_part_file(&handle, "v1/part-v1-0.parquet", &batch, &schema).unwrap();
        assert!(uri.ends_with("v1/part-v1-0.parquet"));
        assert!(size > 0);
        assert_eq!(row_groups.len(), 1);
        assert_eq!(row_groups[0].row_count, 4);
        assert!(row_groups[0].stats_min.as_ref().unwrap().contains("\"id\":1"));
    }
}
