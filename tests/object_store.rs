mod common;

use assert_matches::assert_matches;

use bts_ingest::error::IngestError;
use bts_ingest::object_store::{FsObjectStore, ObjectStore, UploadOutcome, upload_bytes};

use common::utf8;

fn store() -> (tempfile::TempDir, FsObjectStore) {
    let temp = tempfile::tempdir().unwrap();
    let store = FsObjectStore::new(utf8(temp.path().join("blob")));
    (temp, store)
}

#[test]
fn create_only_upload_keeps_existing_content() {
    let (_temp, store) = store();
    let key = "2001/Q3/curated/a__2001Q3__with_metrics.csv";

    let first = upload_bytes(&store, "c", key, b"original", None, false).unwrap();
    let second = upload_bytes(&store, "c", key, b"clobber", None, false).unwrap();

    assert_eq!(first, UploadOutcome::Uploaded);
    assert_eq!(second, UploadOutcome::Skipped);
    assert_eq!(store.get("c", key).unwrap(), b"original".to_vec());
}

#[test]
fn overwrite_replaces_content() {
    let (_temp, store) = store();
    upload_bytes(&store, "c", "markers/2001-Q3.done", b"x", None, true).unwrap();
    upload_bytes(&store, "c", "markers/2001-Q3.done", b"ok", None, true).unwrap();
    assert_eq!(store.get("c", "markers/2001-Q3.done").unwrap(), b"ok".to_vec());
}

#[test]
fn raw_put_without_overwrite_reports_conflict() {
    let (_temp, store) = store();
    store.put("c", "k.csv", b"1", None, false).unwrap();
    let err = store.put("c", "k.csv", b"2", None, false).unwrap_err();
    assert_matches!(err, IngestError::AlreadyExists { .. });
}

#[test]
fn list_filters_by_prefix() {
    let (_temp, store) = store();
    for key in [
        "2001/Q3/raw/a.csv",
        "2001/Q3/curated/a.csv",
        "2001/Q4/curated/b.csv",
        "markers/2001-Q3.done",
    ] {
        store.put("c", key, b"x", None, true).unwrap();
    }

    assert_eq!(
        store.list("c", "2001/Q3/curated/").unwrap(),
        vec!["2001/Q3/curated/a.csv".to_string()]
    );
    assert_eq!(store.list("c", "2001/").unwrap().len(), 3);
    assert!(store.list("missing", "").unwrap().is_empty());
}

#[test]
fn missing_objects() {
    let (_temp, store) = store();
    assert!(!store.exists("c", "markers/1990-Q1.done").unwrap());
    assert_matches!(
        store.get("c", "markers/1990-Q1.done"),
        Err(IngestError::ObjectNotFound { .. })
    );
    assert_matches!(
        store.put("c", "../outside", b"x", None, true),
        Err(IngestError::ObjectStore(_))
    );
}

#[test]
fn create_only_put_leaves_no_temp_files() {
    let (temp, store) = store();
    let key = "2001/Q3/curated/a__2001Q3__with_metrics.csv";

    store.put("c", key, b"original", None, false).unwrap();
    assert_matches!(
        store.put("c", key, b"clobber", None, false),
        Err(IngestError::AlreadyExists { .. })
    );

    let dir = temp.path().join("blob/c/2001/Q3/curated");
    let names: Vec<String> = std::fs::read_dir(&dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["a__2001Q3__with_metrics.csv".to_string()]);
    assert_eq!(store.get("c", key).unwrap(), b"original".to_vec());
}
