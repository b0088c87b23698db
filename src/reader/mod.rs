//! Resolve -> prune -> materialize.
//!
//! Files are pruned first by partition equality (from the catalog's
//! `partitions` table) and then by row-group min/max statistics (from
//! `row_groups`). Both passes only ever over-approximate: a file or row
//! group survives unless a predicate can *prove* it contains no matching
//! rows. The materialized batches are always run back through an exact
//! Arrow comparison before being returned, so statistics gaps never affect
//! correctness, only how much gets read off of storage.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, BooleanArray, RecordBatch, StringArray};
use arrow::compute::kernels::cmp;
use arrow::compute::{and, cast, concat_batches, filter_record_batch};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use futures::TryStreamExt;
use parquet::arrow::async_reader::{ParquetObjectReader, ParquetRecordBatchStreamBuilder};
use serde_json::Value as JsonValue;

use crate::catalog::{models::FileRecord, Catalog};
use crate::error::{Error, Result};
use crate::schema;
use crate::storage::{self, StorageOptions};

/// A comparison operator supported by predicate pushdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
}

/// A single `column <op> value` predicate.
#[derive(Debug, Clone)]
pub struct Predicate {
    pub column: String,
    pub op: Op,
    pub value: JsonValue,
}

/// Parse `(column, operator, value)` triples into [`Predicate`]s.
/// `=` is accepted as an alias for `==`.
pub fn parse_predicates(raw: &[(String, String, JsonValue)]) -> Result<Vec<Predicate>> {
    raw.iter()
        .map(|(column, op, value)| {
            let op = match op.as_str() {
                "=" | "==" => Op::Eq,
                "<" => Op::Lt,
                "<=" => Op::Le,
                ">" => Op::Gt,
                ">=" => Op::Ge,
                other => return Err(Error::dataset(format!("unsupported predicate operator '{other}'"))),
            };
            Ok(Predicate {
                column: column.clone(),
                op,
                value: value.clone(),
            })
        })
        .collect()
}

/// A materialized set of batches sharing one schema - the crate's stand-in
/// for an in-memory Arrow table.
#[derive(Debug, Clone)]
pub struct Table {
    pub schema: SchemaRef,
    pub batches: Vec<RecordBatch>,
}

impl Table {
    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(|b| b.num_rows()).sum()
    }

    /// Concatenate all batches into a single one. Convenient for tests and
    /// small results; callers that want streaming should use `batches`
    /// directly.
    pub fn concat(&self) -> Result<RecordBatch> {
        if self.batches.is_empty() {
            return Ok(RecordBatch::new_empty(self.schema.clone()));
        }
        Ok(concat_batches(&self.schema, &self.batches)?)
    }
}

struct PrunedFile {
    file: FileRecord,
    partitions: Vec<(String, String)>,
    row_groups: Option<Vec<i64>>,
}

/// Read `reference` at `version` (or its current version if `None`),
/// pruning by `predicates` and returning the materialized result.
///
/// Raises [`Error::Dataset`] if pruning eliminates every file - callers
/// must not receive a silently-widened, full-scan result.
pub fn read_dataset(
    catalog: &mut Catalog,
    reference: &str,
    version: Option<i64>,
    raw_predicates: &[(String, String, JsonValue)],
    storage_options: Option<&StorageOptions>,
) -> Result<Table> {
    let dataset_ref = catalog.resolve_dataset(reference, false, None)?;
    let effective_version = version.unwrap_or(dataset_ref.version);
    if effective_version <= 0 {
        return Err(Error::dataset("dataset has no committed version to read"));
    }

    let file_records = catalog.file_records_for_version(dataset_ref.dataset_id, effective_version)?;
    if file_records.is_empty() {
        return Err(Error::dataset(format!(
            "no files recorded for version {effective_version}"
        )));
    }

    let predicates = parse_predicates(raw_predicates)?;
    let pruned = prune_files_and_row_groups(catalog, &file_records, &predicates)?;
    if pruned.is_empty() {
        return Err(Error::dataset(
            "predicate pushdown eliminated every file for this version; refusing to widen the read",
        ));
    }

    // Every file in `pruned` was committed by the same write (a version is
    // an exact snapshot, not a union across versions), so they all share one
    // schema_version_id. Align each batch onto it before appending partition
    // columns so concatenation below sees one consistent schema.
    let schema_version_id = pruned[0].file.schema_version_id;
    let target_bytes = catalog.schema_bytes_for_id(schema_version_id)?;
    let target_schema = schema::deserialize_schema(&target_bytes)?;

    let handle = storage::resolve_filesystem(&dataset_ref.base_uri, storage_options)?;
    let mut batches = Vec::new();
    let mut schema: Option<SchemaRef> = None;

    for pf in &pruned {
        // `file_path` was recorded by the writer using the storage handle's
        // normalized base uri (e.g. `file:///...`), which can differ from
        // the raw `base_uri` string the dataset was registered with.
        let relative = strip_base_uri(&handle.base_uri, &pf.file.file_path)?;
        let file_batches = read_file_row_groups(&handle, relative, pf.row_groups.clone())?;
        for batch in file_batches {
            let aligned = align_to_schema(&batch, &target_schema)?;
            let with_partitions = append_partition_columns(&aligned, &pf.partitions)?;
            if schema.is_none() {
                schema = Some(with_partitions.schema());
            }
            batches.push(with_partitions);
        }
    }

    let schema = schema.ok_or_else(|| Error::dataset("no row groups produced any batches"))?;
    let filtered = apply_exact_predicates(&schema, batches, &predicates)?;

    Ok(Table { schema, batches: filtered })
}

fn strip_base_uri<'a>(base_uri: &str, file_path: &'a str) -> Result<&'a str> {
    let prefix = format!("{}/", base_uri.trim_end_matches('/'));
    file_path
        .strip_prefix(&prefix)
        .ok_or_else(|| Error::dataset(format!("file '{file_path}' is not rooted under dataset base_uri '{base_uri}'")))
}

fn prune_files_and_row_groups(
    catalog: &Catalog,
    file_records: &[FileRecord],
    predicates: &[Predicate],
) -> Result<Vec<PrunedFile>> {
    let file_ids: Vec<i64> = file_records.iter().filter_map(|f| f.id).collect();
    let partition_rows = catalog.partitions_for_files(&file_ids)?;
    let row_group_rows = catalog.row_groups_for_files(&file_ids)?;

    let mut partitions_by_file: HashMap<i64, Vec<(String, String)>> = HashMap::new();
    for p in partition_rows {
        partitions_by_file
            .entry(p.file_id)
            .or_default()
            .push((p.key, p.value));
    }

    let mut row_groups_by_file: HashMap<i64, Vec<crate::catalog::models::RowGroupRecord>> = HashMap::new();
    for rg in row_group_rows {
        row_groups_by_file.entry(rg.file_id).or_default().push(rg);
    }

    let equality_filters: HashMap<&str, &JsonValue> = predicates
        .iter()
        .filter(|p| p.op == Op::Eq)
        .map(|p| (p.column.as_str(), &p.value))
        .collect();

    let mut out = Vec::new();
    for file in file_records {
        let file_id = file.id.expect("persisted file record has an id");
        let partitions = partitions_by_file.remove(&file_id).unwrap_or_default();

        if !partitions_match(&partitions, &equality_filters) {
            continue;
        }

        if predicates.is_empty() {
            out.push(PrunedFile {
                file: file.clone(),
                partitions,
                row_groups: None,
            });
            continue;
        }

        let row_groups = row_groups_by_file.remove(&file_id).unwrap_or_default();
        if row_groups.is_empty() {
            out.push(PrunedFile {
                file: file.clone(),
                partitions,
                row_groups: None,
            });
            continue;
        }

        let selected = filter_row_groups(&row_groups, predicates)?;
        if selected.is_empty() {
            continue;
        }
        out.push(PrunedFile {
            file: file.clone(),
            partitions,
            row_groups: Some(selected),
        });
    }
    Ok(out)
}

fn partitions_match(file_partitions: &[(String, String)], equality_filters: &HashMap<&str, &JsonValue>) -> bool {
    for (key, expected) in equality_filters {
        if let Some((_, actual)) = file_partitions.iter().find(|(k, _)| k == key) {
            let expected_str = json_as_string(expected);
            if &expected_str != actual {
                return false;
            }
        }
        // A partition key the file doesn't carry can't be contradicted; pass through.
    }
    true
}

fn json_as_string(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Returns the row-group indices that survive every predicate. An empty
/// result means none did - the caller drops the whole file.
fn filter_row_groups(
    row_groups: &[crate::catalog::models::RowGroupRecord],
    predicates: &[Predicate],
) -> Result<Vec<i64>> {
    let mut selected = Vec::new();
    for rg in row_groups {
        let min_map: HashMap<String, JsonValue> = rg
            .stats_min
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?
            .unwrap_or_default();
        let max_map: HashMap<String, JsonValue> = rg
            .stats_max
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?
            .unwrap_or_default();

        let mut keep = true;
        for predicate in predicates {
            let min_val = min_map.get(&predicate.column);
            let max_val = max_map.get(&predicate.column);
            if !row_group_matches(min_val, max_val, predicate) {
                keep = false;
                break;
            }
        }
        if keep {
            selected.push(rg.row_group_index);
        }
    }
    Ok(selected)
}

fn row_group_matches(min_val: Option<&JsonValue>, max_val: Option<&JsonValue>, predicate: &Predicate) -> bool {
    let (Some(min_val), Some(max_val)) = (min_val, max_val) else {
        return true; // no recorded bound: cannot prune, assume it might match
    };
    let Some(min_cmp) = compare_json(min_val, &predicate.value) else {
        return true;
    };
    let Some(max_cmp) = compare_json(max_val, &predicate.value) else {
        return true;
    };
    use std::cmp::Ordering::*;
    match predicate.op {
        Op::Eq => min_cmp != Greater && max_cmp != Less,
        Op::Gt => max_cmp == Greater,
        Op::Ge => max_cmp != Less,
        Op::Lt => min_cmp == Less,
        Op::Le => min_cmp != Greater,
    }
}

fn compare_json(a: &JsonValue, b: &JsonValue) -> Option<std::cmp::Ordering> {
    if let (Some(a), Some(b)) = (a.as_f64(), b.as_f64()) {
        return a.partial_cmp(&b);
    }
    if let (Some(a), Some(b)) = (a.as_str(), b.as_str()) {
        return Some(a.cmp(b));
    }
    if let (Some(a), Some(b)) = (a.as_bool(), b.as_bool()) {
        return Some(a.cmp(&b));
    }
    None
}

fn read_file_row_groups(
    handle: &storage::StorageHandle,
    relative_path: &str,
    row_groups: Option<Vec<i64>>,
) -> Result<Vec<RecordBatch>> {
    let object_path = storage::object_path_for(handle, relative_path);
    let store = handle.store.clone();

    storage::block_on(async move {
        let meta = store.head(&object_path).await?;
        let reader = ParquetObjectReader::new(store.clone(), meta);
        let mut builder = ParquetRecordBatchStreamBuilder::new(reader).await?;
        if let Some(indices) = row_groups {
            let usize_indices: Vec<usize> = indices.into_iter().map(|i| i as usize).collect();
            builder = builder.with_row_groups(usize_indices);
        }
        let stream = builder.build()?;
        let batches: Vec<RecordBatch> = stream.try_collect().await?;
        Ok(batches)
    })
}

fn align_to_schema(batch: &RecordBatch, target: &SchemaRef) -> Result<RecordBatch> {
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(target.fields().len());
    for field in target.fields() {
        match batch.schema().index_of(field.name()) {
            Ok(idx) => {
                let column = batch.column(idx);
                if column.data_type() == field.data_type() {
                    columns.push(column.clone());
                } else {
                    columns.push(cast(column, field.data_type())?);
                }
            }
            Err(_) => columns.push(arrow::array::new_null_array(field.data_type(), batch.num_rows())),
        }
    }
    Ok(RecordBatch::try_new(target.clone(), columns)?)
}

fn append_partition_columns(batch: &RecordBatch, partitions: &[(String, String)]) -> Result<RecordBatch> {
    if partitions.is_empty() {
        return Ok(batch.clone());
    }
    let mut fields: Vec<Field> = batch.schema().fields().iter().map(|f| f.as_ref().clone()).collect();
    let mut columns: Vec<ArrayRef> = batch.columns().to_vec();
    let num_rows = batch.num_rows();

    for (key, value) in partitions {
        fields.push(Field::new(key, DataType::Utf8, false));
        let repeated: ArrayRef = Arc::new(StringArray::from(vec![value.as_str(); num_rows]));
        columns.push(repeated);
    }

    let schema = Arc::new(Schema::new(fields));
    Ok(RecordBatch::try_new(schema, columns)?)
}

fn apply_exact_predicates(
    schema: &SchemaRef,
    batches: Vec<RecordBatch>,
    predicates: &[Predicate],
) -> Result<Vec<RecordBatch>> {
    if predicates.is_empty() {
        return Ok(batches);
    }

    let mut out = Vec::with_capacity(batches.len());
    for batch in batches {
        let mut mask: Option<BooleanArray> = None;
        for predicate in predicates {
            let Ok(idx) = schema.index_of(&predicate.column) else {
                continue; // partition-only predicates are already exact from equality pruning
            };
            let column = batch.column(idx);
            let predicate_mask = predicate_mask_for_column(column, predicate)?;
            mask = Some(match mask {
                Some(existing) => and(&existing, &predicate_mask)?,
                None => predicate_mask,
            });
        }
        let filtered = match mask {
            Some(mask) => filter_record_batch(&batch, &mask)?,
            None => batch,
        };
        out.push(filtered);
    }
    Ok(out)
}

fn predicate_mask_for_column(column: &ArrayRef, predicate: &Predicate) -> Result<BooleanArray> {
    let scalar = build_scalar_array(column.data_type(), &predicate.value)?;
    let scalar = cast(&scalar, column.data_type())?;
    let scalar_ref = arrow::array::Scalar::new(scalar);

    let result = match predicate.op {
        Op::Eq => cmp::eq(column.as_ref(), &scalar_ref)?,
        Op::Lt => cmp::lt(column.as_ref(), &scalar_ref)?,
        Op::Le => cmp::lt_eq(column.as_ref(), &scalar_ref)?,
        Op::Gt => cmp::gt(column.as_ref(), &scalar_ref)?,
        Op::Ge => cmp::gt_eq(column.as_ref(), &scalar_ref)?,
    };
    Ok(result)
}

fn build_scalar_array(target: &DataType, value: &JsonValue) -> Result<ArrayRef> {
    use arrow::array::{BooleanArray, Float64Array, Int64Array};
    let array: ArrayRef = match value {
        JsonValue::Bool(b) => Arc::new(BooleanArray::from(vec![*b])),
        JsonValue::Number(n) if n.is_i64() || n.is_u64() => Arc::new(Int64Array::from(vec![n.as_i64().unwrap()])),
        JsonValue::Number(n) => Arc::new(Float64Array::from(vec![n.as_f64().unwrap_or_default()])),
        JsonValue::String(s) => Arc::new(StringArray::from(vec![s.clone()])),
        other => {
            return Err(Error::dataset(format!(
                "unsupported predicate value for column of type {target:?}: {other}"
            )))
        }
    };
    Ok(array)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::models::RowGroupRecord;

    fn rg(min: &str, max: &str) -> RowGroupRecord {
        RowGroupRecord::new(1, 0, 10, Some(min.to_string()), Some(max.to_string()), None)
    }

    #[test]
    fn row_group_matches_equality_within_range() {
        let predicate = Predicate {
            column: "id".to_string(),
            op: Op::Eq,
            value: JsonValue::from(5),
        };
        let r = rg("{\"id\":1}", "{\"id\":9}");
        let min = serde_json::from_str::<HashMap<String, JsonValue>>(r.stats_min.as_ref().unwrap()).unwrap();
        let max = serde_json::from_str::<HashMap<String, JsonValue>>(r.stats_max.as_ref().unwrap()).unwrap();
        assert!(row_group_matches(min.get("id"), max.get("id"), &predicate));
    }

    #[test]
    fn row_group_excluded_when_equality_outside_range() {
        let predicate = Predicate {
            column: "id".to_string(),
            op: Op::Eq,
            value: JsonValue::from(50),
        };
        let r = rg("{\"id\":1}", "{\"id\":9}");
        let min = serde_json::from_str::<HashMap<String, JsonValue>>(r.stats_min.as_ref().unwrap()).unwrap();
        let max = serde_json::from_str::<HashMap<String, JsonValue>>(r.stats_max.as_ref().unwrap()).unwrap();
        assert!(!row_group_matches(min.get("id"), max.get("id"), &predicate));
    }

    #[test]
    fn missing_bound_cannot_prune() {
        let predicate = Predicate {
            column: "id".to_string(),
            op: Op::Gt,
            value: JsonValue::from(5),
        };
        assert!(row_group_matches(None, None, &predicate));
    }

    #[test]
    fn partitions_match_passes_through_missing_keys() {
        let filters: HashMap<&str, &JsonValue> = {
            let mut m = HashMap::new();
            let v = JsonValue::from("2024-01-01");
            m.insert("day", Box::leak(Box::new(v)) as &JsonValue);
            m
        };
        let file_partitions = vec![("other_key".to_string(), "x".to_string())];
        assert!(partitions_match(&file_partitions, &filters));
    }

    #[test]
    fn partitions_match_rejects_mismatched_value() {
        let value = JsonValue::from("2024-01-01");
        let mut filters = HashMap::new();
        filters.insert("day", &value);
        let file_partitions = vec![("day".to_string(), "2024-01-02".to_string())];
        assert!(!partitions_match(&file_partitions, &filters));
    }

    #[test]
    fn parse_predicates_normalizes_eq_alias() {
        let raw = vec![("id".to_string(), "=".to_string(), JsonValue::from(1))];
        let parsed = parse_predicates(&raw).unwrap();
        assert_eq!(parsed[0].op, Op::Eq);
    }

    #[test]
    fn parse_predicates_rejects_unknown_operator() {
        let raw = vec![("id".to_string(), "!=".to_string(), JsonValue::from(1))];
        assert!(parse_predicates(&raw).is_err());
    }
}
