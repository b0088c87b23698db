mod common;

use lagoon::{read_dataset, write_dataset, Error, WriteOptions};
use serde_json::json;

#[test]
fn write_then_read_full_dataset() {
    let mut catalog = common::test_catalog();
    let storage = common::test_storage_dir();
    let batch = common::sample_batch(&[1, 2, 3], &["2024-01-01", "2024-01-01", "2024-01-02"]);

    let result = write_dataset(
        &mut catalog,
        "events",
        Some(storage.path().to_str().unwrap()),
        &[batch],
        &WriteOptions::default(),
    )
    .unwrap();
    assert_eq!(result.version, 1);
    assert_eq!(result.row_count, 3);

    let table = read_dataset(&mut catalog, "events", None, &[], None).unwrap();
    assert_eq!(table.num_rows(), 3);
}

#[test]
fn partitioned_write_prunes_to_matching_partition() {
    let mut catalog = common::test_catalog();
    let storage = common::test_storage_dir();
    let batch = common::sample_batch(&[1, 2, 3, 4], &["2024-01-01", "2024-01-01", "2024-01-02", "2024-01-02"]);

    let options = WriteOptions {
        partition_by: vec!["day".to_string()],
        ..Default::default()
    };
    write_dataset(&mut catalog, "events", Some(storage.path().to_str().unwrap()), &[batch], &options).unwrap();

    let predicates = vec![("day".to_string(), "=".to_string(), json!("2024-01-02"))];
    let table = read_dataset(&mut catalog, "events", None, &predicates, None).unwrap();
    assert_eq!(table.num_rows(), 2);

    let combined = table.concat().unwrap();
    let ids = combined
        .column_by_name("id")
        .unwrap()
        .as_any()
        .downcast_ref::<arrow::array::Int64Array>()
        .unwrap();
    let mut values: Vec<i64> = ids.values().to_vec();
    values.sort();
    assert_eq!(values, vec![3, 4]);
}

#[test]
fn row_group_pruning_by_range_predicate() {
    let mut catalog = common::test_catalog();
    let storage = common::test_storage_dir();
    let batch = common::sample_batch(&[10, 20, 30], &["d", "d", "d"]);
    write_dataset(
        &mut catalog,
        "events",
        Some(storage.path().to_str().unwrap()),
        &[batch],
        &WriteOptions::default(),
    )
    .unwrap();

    let predicates = vec![("id".to_string(), ">=".to_string(), json!(25))];
    let table = read_dataset(&mut catalog, "events", None, &predicates, None).unwrap();
    let combined = table.concat().unwrap();
    assert_eq!(combined.num_rows(), 1);
}

#[test]
fn predicate_eliminating_all_files_raises_dataset_error() {
    let mut catalog = common::test_catalog();
    let storage = common::test_storage_dir();
    let batch = common::sample_batch(&[1, 2, 3], &["d", "d", "d"]);
    write_dataset(
        &mut catalog,
        "events",
        Some(storage.path().to_str().unwrap()),
        &[batch],
        &WriteOptions::default(),
    )
    .unwrap();

    let predicates = vec![("id".to_string(), ">".to_string(), json!(1000))];
    let err = read_dataset(&mut catalog, "events", None, &predicates, None).unwrap_err();
    assert!(matches!(err, Error::Dataset(_)));
}

#[test]
fn repeated_writes_bump_version_and_old_versions_stay_readable() {
    let mut catalog = common::test_catalog();
    let storage = common::test_storage_dir();
    let first = common::sample_batch(&[1, 2], &["d", "d"]);
    let second = common::sample_batch(&[3, 4, 5], &["d", "d", "d"]);

    write_dataset(&mut catalog, "events", Some(storage.path().to_str().unwrap()), &[first], &WriteOptions::default()).unwrap();
    let result2 = write_dataset(&mut catalog, "events", None, &[second], &WriteOptions::default()).unwrap();
    assert_eq!(result2.version, 2);

    let v1_table = read_dataset(&mut catalog, "events", Some(1), &[], None).unwrap();
    assert_eq!(v1_table.num_rows(), 2);

    // Each version is an exact snapshot of the files committed at that
    // version, not a union with prior versions.
    let current_table = read_dataset(&mut catalog, "events", None, &[], None).unwrap();
    assert_eq!(current_table.num_rows(), 3);
}

#[test]
fn each_write_records_its_own_schema_unmerged() {
    // The writer records each write's incoming schema as-is rather than
    // merging it against the dataset's prior schema, so a later write with
    // a different (but schema-version-distinct) column type succeeds and
    // each version's snapshot reflects only its own schema.
    let mut catalog = common::test_catalog();
    let storage = common::test_storage_dir();
    let narrow = common::narrow_batch(&[1, 2]);
    let wide = common::wide_batch(&[3_000_000_000]);

    write_dataset(&mut catalog, "counters", Some(storage.path().to_str().unwrap()), &[narrow], &WriteOptions::default()).unwrap();
    let result = write_dataset(&mut catalog, "counters", None, &[wide], &WriteOptions::default()).unwrap();
    assert_eq!(result.version, 2);

    let v1_table = read_dataset(&mut catalog, "counters", Some(1), &[], None).unwrap();
    assert_eq!(v1_table.schema.field(0).data_type(), &arrow::datatypes::DataType::Int32);

    let current_table = read_dataset(&mut catalog, "counters", None, &[], None).unwrap();
    assert_eq!(current_table.schema.field(0).data_type(), &arrow::datatypes::DataType::Int64);
}

#[test]
fn register_dataset_conflict_on_base_uri_mismatch() {
    let mut catalog = common::test_catalog();
    catalog.register_dataset("events", "/tmp/a").unwrap();
    let err = catalog.register_dataset("events", "/tmp/b").unwrap_err();
    assert!(matches!(err, Error::DatasetConflict(_)));
}
