mod common;

use lagoon::Error;

#[test]
fn resolve_by_base_uri_creates_dataset_when_missing() {
    let mut catalog = common::test_catalog();
    let storage = common::test_storage_dir();
    let uri = storage.path().to_str().unwrap();

    let ds_ref = catalog.resolve_dataset(uri, true, None).unwrap();
    assert_eq!(ds_ref.base_uri, uri);
    assert!(!ds_ref.name.is_empty());

    let resolved_again = catalog.resolve_dataset(uri, false, None).unwrap();
    assert_eq!(resolved_again.dataset_id, ds_ref.dataset_id);
}

#[test]
fn canonical_uri_round_trips_through_resolve() {
    let mut catalog = common::test_catalog();
    let ds_ref = catalog.register_dataset("events", "/tmp/events").unwrap();
    let canonical = ds_ref.canonical_uri().unwrap();
    assert!(canonical.ends_with(&format!("dataset_id={}", ds_ref.dataset_id)));

    let resolved = catalog.resolve_dataset(&canonical, false, None).unwrap();
    assert_eq!(resolved.dataset_id, ds_ref.dataset_id);
}

#[test]
fn resolve_missing_name_without_base_uri_errors() {
    let mut catalog = common::test_catalog();
    let err = catalog.resolve_dataset("ghost", true, None).unwrap_err();
    assert!(matches!(err, Error::Catalog(_)));
}

#[test]
fn list_datasets_reflects_registrations() {
    let mut catalog = common::test_catalog();
    catalog.register_dataset("a", "/tmp/a").unwrap();
    catalog.register_dataset("b", "/tmp/b").unwrap();
    let datasets = catalog.list_datasets().unwrap();
    assert_eq!(datasets.len(), 2);
}
