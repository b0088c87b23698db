//! Arrow schema (de)serialization and cross-write schema merge/promotion.
//!
//! A dataset's schema is stored in the catalog as the bytes of an Arrow IPC
//! stream containing zero record batches (schema-only). Each write merges
//! the incoming batch's schema against the dataset's current schema,
//! promoting compatible numeric types and optionally widening to strings or
//! adding new nullable columns.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::RecordBatch;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;

use crate::error::{Error, Result};

/// A merged schema plus the per-column casts needed to align a batch
/// written against the old schema onto the merged one.
#[derive(Debug, Clone)]
pub struct MergeResult {
    pub schema: SchemaRef,
    pub casts: HashMap<String, DataType>,
    pub schema_changed: bool,
}

/// Serialize a schema as a headerless Arrow IPC stream (schema message
/// only, zero record batches).
pub fn serialize_schema(schema: &Schema) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    {
        let mut writer = StreamWriter::try_new(&mut buf, schema)?;
        writer.finish()?;
    }
    Ok(buf)
}

/// Deserialize a schema previously produced by [`serialize_schema`].
pub fn deserialize_schema(bytes: &[u8]) -> Result<SchemaRef> {
    let reader = StreamReader::try_new(bytes, None)?;
    Ok(reader.schema())
}

const PROMOTIONS: &[(DataType, DataType)] = &[
    (DataType::Int32, DataType::Int64),
    (DataType::Int64, DataType::Float64),
    (DataType::Float32, DataType::Float64),
];

fn resolve_type(
    current: &DataType,
    incoming: &DataType,
    promote_to_string: bool,
) -> Result<DataType> {
    if current == incoming {
        return Ok(current.clone());
    }
    if promote_to_string {
        return Ok(DataType::Utf8);
    }
    for (from, to) in PROMOTIONS {
        if from == current && to == incoming {
            return Ok(incoming.clone());
        }
    }
    Err(Error::SchemaMismatch(format!(
        "cannot reconcile column type {current:?} with incoming {incoming:?}"
    )))
}

/// Merge a dataset's current schema (`None` on first write) against an
/// incoming batch's schema.
///
/// * `schema_merge` - when false, any type mismatch or new/dropped column
///   is an error instead of being reconciled.
/// * `promote_to_string` - when true, any type mismatch is resolved by
///   widening the column to `Utf8` rather than consulting the promotion
///   table.
pub fn merge_schemas(
    current: Option<&Schema>,
    incoming: &Schema,
    schema_merge: bool,
    promote_to_string: bool,
) -> Result<MergeResult> {
    let Some(current) = current else {
        return Ok(MergeResult {
            schema: Arc::new(incoming.clone()),
            casts: HashMap::new(),
            schema_changed: true,
        });
    };

    let mut incoming_fields: HashMap<String, Field> = incoming
        .fields()
        .iter()
        .map(|f| (f.name().clone(), f.as_ref().clone()))
        .collect();

    let mut merged_fields = Vec::with_capacity(current.fields().len());
    let mut casts = HashMap::new();
    let mut schema_changed = false;

    for field in current.fields() {
        let Some(incoming_field) = incoming_fields.remove(field.name()) else {
            return Err(Error::SchemaMismatch(format!(
                "column '{}' is missing from the incoming batch",
                field.name()
            )));
        };

        if field.data_type() == incoming_field.data_type() {
            let nullable = field.is_nullable() || incoming_field.is_nullable();
            if nullable != field.is_nullable() {
                schema_changed = true;
            }
            merged_fields.push(Field::new(field.name(), field.data_type().clone(), nullable));
            continue;
        }

        if !schema_merge {
            return Err(Error::SchemaMismatch(format!(
                "column '{}' type changed from {:?} to {:?}",
                field.name(),
                field.data_type(),
                incoming_field.data_type()
            )));
        }

        let resolved = resolve_type(field.data_type(), incoming_field.data_type(), promote_to_string)?;
        if &resolved != field.data_type() {
            schema_changed = true;
            casts.insert(field.name().clone(), resolved.clone());
        }
        merged_fields.push(Field::new(
            field.name(),
            resolved,
            field.is_nullable() || incoming_field.is_nullable(),
        ));
    }

    if !incoming_fields.is_empty() {
        if !schema_merge {
            let names: Vec<_> = incoming_fields.keys().cloned().collect();
            return Err(Error::SchemaMismatch(format!(
                "incoming batch has new columns not present in dataset schema: {}",
                names.join(", ")
            )));
        }
        schema_changed = true;
        for (name, field) in incoming.fields().iter().filter_map(|f| {
            incoming_fields.get(f.name()).map(|field| (f.name().clone(), field.clone()))
        }) {
            merged_fields.push(Field::new(name, field.data_type().clone(), true));
        }
    }

    Ok(MergeResult {
        schema: Arc::new(Schema::new(merged_fields)),
        casts,
        schema_changed,
    })
}

/// Rebuild `batch` with columns reordered/cast to match `result.schema`.
pub fn align_batch_to_schema(batch: &RecordBatch, result: &MergeResult) -> Result<RecordBatch> {
    let mut columns = Vec::with_capacity(result.schema.fields().len());
    for field in result.schema.fields() {
        let idx = batch.schema().index_of(field.name()).ok();
        let column = match idx {
            Some(i) => {
                let array = batch.column(i);
                if let Some(target) = result.casts.get(field.name()) {
                    arrow::compute::cast(array, target)?
                } else {
                    array.clone()
                }
            }
            None => arrow::array::new_null_array(field.data_type(), batch.num_rows()),
        };
        columns.push(column);
    }
    Ok(RecordBatch::try_new(result.schema.clone(), columns)?)
}
