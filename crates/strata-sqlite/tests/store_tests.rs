//! Data store facade tests for SqliteDataStore

use pretty_assertions::assert_eq;
use strata_core::{
    AccessGate, AccessMode, ActorToken, AttributeTypes, Cell, PathPrefix, StoreConfig,
    StoreError, StoreResult, Timestamps, TypeHint, Value,
};
use strata_sqlite::{Entry, SetOptions, SqliteDataStore, ValuesByPredicate};
use tempfile::TempDir;

const SUBJECT: &str = "aff4:/C.1000";

/// Helper to create a store rooted in a fresh temp directory
fn create_store() -> (TempDir, SqliteDataStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteDataStore::builder(StoreConfig::new(dir.path().join("db")))
        .type_registry(
            AttributeTypes::new()
                .with("size", TypeHint::Integer)
                .with("hostname", TypeHint::String)
                .with("a.1", TypeHint::String)
                .with("a.2", TypeHint::String)
                .with("b.1", TypeHint::String),
        )
        .build()
        .unwrap();
    (dir, store)
}

fn values(predicate: &str, entries: Vec<Entry>) -> ValuesByPredicate {
    let mut values = ValuesByPredicate::new();
    values.insert(predicate.to_string(), entries);
    values
}

/// Denies writes to everyone but "admin"
struct AdminWrites;

impl AccessGate for AdminWrites {
    fn check_access(
        &self,
        token: Option<&ActorToken>,
        subjects: &[&str],
        mode: AccessMode,
    ) -> StoreResult<()> {
        let is_admin = token.map(|t| t.username == "admin").unwrap_or(false);
        if mode == AccessMode::Write && !is_admin {
            return Err(StoreError::AccessDenied(format!(
                "write to {:?} requires admin",
                subjects
            )));
        }
        Ok(())
    }
}

#[test]
fn test_set_then_resolve_newest() {
    let (_dir, store) = create_store();
    store
        .multi_set(
            None,
            SUBJECT,
            &values("hostname", vec![Entry::new("alpha")]),
            SetOptions::default().timestamp(1000),
        )
        .unwrap();

    let cells = store
        .resolve_multi(None, SUBJECT, &["hostname"], Timestamps::Newest, None)
        .unwrap();
    assert_eq!(cells, vec![Cell::new("hostname", "alpha", 1000)]);
}

#[test]
fn test_replace_keeps_only_latest_write() {
    let (_dir, store) = create_store();
    store.set(None, SUBJECT, "size", 10i64, Some(100), true).unwrap();
    store.set(None, SUBJECT, "size", 20i64, Some(200), true).unwrap();

    let newest = store
        .resolve_multi(None, SUBJECT, &["size"], Timestamps::Newest, None)
        .unwrap();
    assert_eq!(newest, vec![Cell::new("size", 20i64, 200)]);

    let all = store
        .resolve_multi(None, SUBJECT, &["size"], Timestamps::All, None)
        .unwrap();
    assert_eq!(all, vec![Cell::new("size", 20i64, 200)]);
}

#[test]
fn test_versions_accumulate_without_replace() {
    let (_dir, store) = create_store();
    store.set(None, SUBJECT, "size", 10i64, Some(100), false).unwrap();
    store.set(None, SUBJECT, "size", 20i64, Some(200), false).unwrap();

    let newest = store
        .resolve_multi(None, SUBJECT, &["size"], Timestamps::Newest, None)
        .unwrap();
    assert_eq!(newest, vec![Cell::new("size", 20i64, 200)]);

    let all = store
        .resolve_multi(None, SUBJECT, &["size"], Timestamps::All, None)
        .unwrap();
    assert_eq!(
        all,
        vec![Cell::new("size", 10i64, 100), Cell::new("size", 20i64, 200)]
    );

    let window = store
        .resolve_multi(None, SUBJECT, &["size"], Timestamps::Range(150, 250), None)
        .unwrap();
    assert_eq!(window, vec![Cell::new("size", 20i64, 200)]);
}

#[test]
fn test_per_entry_timestamps_override_default() {
    let (_dir, store) = create_store();
    let entries = vec![Entry::at(1i64, 5), Entry::new(2i64), Entry::at(3i64, 7)];
    store
        .multi_set(
            None,
            SUBJECT,
            &values("size", entries),
            SetOptions::default().timestamp(6),
        )
        .unwrap();

    let all = store
        .resolve_multi(None, SUBJECT, &["size"], Timestamps::All, None)
        .unwrap();
    let timestamps: Vec<i64> = all.iter().map(|c| c.timestamp).collect();
    assert_eq!(timestamps, vec![5, 6, 7]);
}

#[test]
fn test_default_timestamp_is_now() {
    let (_dir, store) = create_store();
    store.set(None, SUBJECT, "size", 1i64, None, true).unwrap();
    let (_, ts) = store.resolve(None, SUBJECT, "size").unwrap().unwrap();
    // 2024-01-01 00:00:00 UTC in microseconds
    assert!(ts > 1_704_067_200_000_000);
}

#[test]
fn test_to_delete_removes_other_predicates() {
    let (_dir, store) = create_store();
    store.set(None, SUBJECT, "hostname", "alpha", Some(1), true).unwrap();
    store
        .multi_set(
            None,
            SUBJECT,
            &values("size", vec![Entry::new(1i64)]),
            SetOptions::default().timestamp(2).delete("hostname"),
        )
        .unwrap();

    assert_eq!(store.resolve(None, SUBJECT, "hostname").unwrap(), None);
    assert!(store.resolve(None, SUBJECT, "size").unwrap().is_some());
}

#[test]
fn test_delete_attributes() {
    let (_dir, store) = create_store();
    store.set(None, SUBJECT, "size", 1i64, Some(1), true).unwrap();
    store.delete_attributes(None, SUBJECT, &["size"], None, None).unwrap();

    let all = store
        .resolve_multi(None, SUBJECT, &["size"], Timestamps::All, None)
        .unwrap();
    assert!(all.is_empty());
}

#[test]
fn test_delete_attributes_range() {
    let (_dir, store) = create_store();
    for ts in [10, 20, 30] {
        store.set(None, SUBJECT, "size", ts, Some(ts), false).unwrap();
    }

    store
        .delete_attributes(None, SUBJECT, &["size"], Some(15), None)
        .unwrap();
    let all = store
        .resolve_multi(None, SUBJECT, &["size"], Timestamps::All, None)
        .unwrap();
    assert_eq!(all, vec![Cell::new("size", 10i64, 10)]);

    store
        .delete_attributes(None, SUBJECT, &["size"], None, Some(10))
        .unwrap();
    assert_eq!(store.resolve(None, SUBJECT, "size").unwrap(), None);
}

#[test]
fn test_resolve_matching_regex() {
    let (_dir, store) = create_store();
    for (predicate, ts) in [("a.1", 1), ("a.2", 2), ("b.1", 3)] {
        store.set(None, SUBJECT, predicate, predicate, Some(ts), true).unwrap();
    }

    let cells = store
        .resolve_matching(None, SUBJECT, &[r"a\..*"], Timestamps::Newest, None)
        .unwrap();
    assert_eq!(
        cells,
        vec![Cell::new("a.1", "a.1", 1), Cell::new("a.2", "a.2", 2)]
    );

    let none = store
        .resolve_matching(None, SUBJECT, &["^zzz"], Timestamps::All, None)
        .unwrap();
    assert!(none.is_empty());
}

#[test]
fn test_resolve_matching_limit_spans_patterns() {
    let (_dir, store) = create_store();
    for (predicate, ts) in [("a.1", 1), ("a.2", 2), ("b.1", 3)] {
        store.set(None, SUBJECT, predicate, predicate, Some(ts), true).unwrap();
    }

    let cells = store
        .resolve_matching(None, SUBJECT, &["^a", "^b"], Timestamps::Newest, Some(2))
        .unwrap();
    let predicates: Vec<&str> = cells.iter().map(|c| c.predicate.as_str()).collect();
    assert_eq!(predicates, vec!["a.1", "a.2"]);

    let cells = store
        .resolve_matching(None, SUBJECT, &["^a", "^b"], Timestamps::All, Some(3))
        .unwrap();
    assert_eq!(cells.len(), 3);
    assert_eq!(cells[2].predicate, "b.1");

    let cells = store
        .resolve_matching(None, SUBJECT, &["."], Timestamps::All, Some(0))
        .unwrap();
    assert!(cells.is_empty());
}

#[test]
fn test_resolve_multi_limit() {
    let (_dir, store) = create_store();
    for ts in 1..=5 {
        store.set(None, SUBJECT, "size", ts, Some(ts), false).unwrap();
    }
    store.set(None, SUBJECT, "hostname", "h", Some(1), true).unwrap();

    let cells = store
        .resolve_multi(None, SUBJECT, &["size", "hostname"], Timestamps::All, Some(3))
        .unwrap();
    assert_eq!(cells.len(), 3);
    assert!(cells.iter().all(|c| c.predicate == "size"));

    let cells = store
        .resolve_multi(None, SUBJECT, &["size", "hostname"], Timestamps::Newest, Some(1))
        .unwrap();
    assert_eq!(cells, vec![Cell::new("size", 5i64, 5)]);
}

#[test]
fn test_delete_attributes_matching() {
    let (_dir, store) = create_store();
    for predicate in ["a.1", "a.2", "b.1"] {
        store.set(None, SUBJECT, predicate, "x", Some(1), true).unwrap();
    }

    store
        .delete_attributes_matching(None, SUBJECT, &["^a"])
        .unwrap();
    let left = store
        .resolve_matching(None, SUBJECT, &["."], Timestamps::All, None)
        .unwrap();
    assert_eq!(left, vec![Cell::new("b.1", "x", 1)]);
}

#[test]
fn test_delete_subject() {
    let (_dir, store) = create_store();
    store.set(None, SUBJECT, "size", 1i64, Some(1), true).unwrap();
    store.set(None, "aff4:/C.2000", "size", 2i64, Some(1), true).unwrap();

    store.delete_subject(None, SUBJECT).unwrap();
    assert_eq!(store.resolve(None, SUBJECT, "size").unwrap(), None);
    assert!(store.resolve(None, "aff4:/C.2000", "size").unwrap().is_some());
}

#[test]
fn test_multi_resolve_matching_preserves_order_and_shares_limit() {
    let (_dir, store) = create_store();
    for subject in ["S3", "S1", "S2"] {
        store.set(None, subject, "a.1", subject, Some(1), true).unwrap();
        store.set(None, subject, "a.2", subject, Some(2), true).unwrap();
    }

    let results = store
        .multi_resolve_matching(None, &["S2", "S9", "S1", "S3"], &["^a"], Timestamps::Newest, None)
        .unwrap();
    let subjects: Vec<&str> = results.iter().map(|(s, _)| s.as_str()).collect();
    assert_eq!(subjects, vec!["S2", "S1", "S3"]);

    let results = store
        .multi_resolve_matching(None, &["S2", "S1", "S3"], &["^a"], Timestamps::Newest, Some(3))
        .unwrap();
    let counts: Vec<usize> = results.iter().map(|(_, cells)| cells.len()).collect();
    assert_eq!(counts, vec![2, 1]);
}

#[test]
fn test_decode_error_surfaces() {
    let (_dir, store) = create_store();
    store.set(None, SUBJECT, "size", "not a number", Some(1), true).unwrap();

    let err = store.resolve(None, SUBJECT, "size").unwrap_err();
    assert!(matches!(err, StoreError::Decode { .. }));
}

#[test]
fn test_structured_and_bytes_values() {
    let (_dir, store) = create_store();
    let doc = serde_json::json!({"os": "linux", "cores": 8});
    store
        .set(None, SUBJECT, "info", Value::Structured(doc.clone()), Some(1), true)
        .unwrap();

    // unregistered predicates come back as raw bytes
    let (value, _) = store.resolve(None, SUBJECT, "info").unwrap().unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(value.as_bytes().unwrap()).unwrap();
    assert_eq!(parsed, doc);
}

#[test]
fn test_invalid_pattern_is_an_error() {
    let (_dir, store) = create_store();
    let err = store
        .resolve_matching(None, SUBJECT, &["("], Timestamps::Newest, None)
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidPattern { .. }));
}

#[test]
fn test_access_denied_before_storage() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("db");
    let store = SqliteDataStore::builder(StoreConfig::new(&root))
        .access_gate(AdminWrites)
        .build()
        .unwrap();

    let guest = ActorToken::new("guest");
    let err = store
        .set(Some(&guest), SUBJECT, "size", 1i64, None, true)
        .unwrap_err();
    assert!(matches!(err, StoreError::AccessDenied(_)));
    assert!(!root.exists());

    let err = store.delete_subject(None, SUBJECT).unwrap_err();
    assert!(matches!(err, StoreError::AccessDenied(_)));

    let admin = ActorToken::new("admin");
    store.set(Some(&admin), SUBJECT, "size", 1i64, None, true).unwrap();
    assert!(store.resolve(Some(&guest), SUBJECT, "size").unwrap().is_some());
}

#[test]
fn test_size() {
    let (dir, store) = create_store();
    assert_eq!(store.size().unwrap(), 0);

    store.set(None, SUBJECT, "size", 1i64, None, true).unwrap();
    assert!(store.size().unwrap() > 0);

    drop(store);
    let file_root = dir.path().join("not-a-dir");
    std::fs::write(&file_root, b"x").unwrap();
    let store = SqliteDataStore::open(StoreConfig::new(&file_root)).unwrap();
    assert!(matches!(store.size().unwrap_err(), StoreError::StoreCorrupt(_)));
}

#[test]
fn test_dump_lists_every_cell() {
    let (_dir, store) = create_store();
    store.set(None, "S2", "p", "two", Some(2), true).unwrap();
    store.set(None, "S1", "p", "one", Some(1), true).unwrap();

    let cells = store.dump(None).unwrap();
    let rows: Vec<(&str, &[u8])> = cells
        .iter()
        .map(|c| (c.subject.as_str(), c.value.as_slice()))
        .collect();
    assert_eq!(rows, vec![("S1", &b"one"[..]), ("S2", &b"two"[..])]);
}

#[test]
fn test_cache_capacity_evicts_and_reopens() {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig {
        cache_size: 3,
        ..StoreConfig::new(dir.path().join("db"))
    };
    let store = SqliteDataStore::open(config).unwrap();

    let first = store.cache().get("S0").unwrap();
    for i in 0..4 {
        store
            .set(None, &format!("S{}", i), "p", "v", Some(i), true)
            .unwrap();
    }

    assert_eq!(store.cache().len(), 3);
    assert!(!store.cache().contains("S0"));
    assert!(first.is_closed());

    // data written before eviction survives the reopen
    assert!(store.resolve(None, "S0", "p").unwrap().is_some());
    let reopened = store.cache().get("S0").unwrap();
    assert!(!std::sync::Arc::ptr_eq(&first, &reopened));
}

#[test]
fn test_closed_cached_connection_is_reopened() {
    let (_dir, store) = create_store();
    store.set(None, SUBJECT, "size", 1i64, Some(1), true).unwrap();

    let closed = store.cache().get(SUBJECT).unwrap();
    closed.close().unwrap();

    let (value, _) = store.resolve(None, SUBJECT, "size").unwrap().unwrap();
    assert_eq!(value, Value::Integer(1));
    let current = store.cache().get(SUBJECT).unwrap();
    assert!(!std::sync::Arc::ptr_eq(&closed, &current));
    assert!(!current.is_closed());
}

#[test]
fn test_failed_batch_leaves_nothing_applied() {
    let (_dir, store) = create_store();
    store.set(None, SUBJECT, "hostname", "alpha", Some(1), true).unwrap();

    let other = rusqlite::Connection::open(store.cache().path_for(SUBJECT)).unwrap();
    other
        .execute_batch(
            "CREATE TRIGGER reject_bad BEFORE INSERT ON tbl WHEN NEW.predicate = 'bad'
             BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
        )
        .unwrap();
    drop(other);

    // deletes and the first insert run before the rejected row
    let mut batch = values("a.1", vec![Entry::new("first")]);
    batch.insert("bad".to_string(), vec![Entry::new("x")]);
    let err = store
        .multi_set(
            None,
            SUBJECT,
            &batch,
            SetOptions::default().timestamp(2).delete("hostname"),
        )
        .unwrap_err();
    assert!(matches!(err, StoreError::Backend(_)));

    assert_eq!(
        store.resolve(None, SUBJECT, "hostname").unwrap(),
        Some((Value::Text("alpha".to_string()), 1))
    );
    assert_eq!(store.resolve(None, SUBJECT, "a.1").unwrap(), None);

    // the connection stays usable
    store.set(None, SUBJECT, "a.1", "second", Some(3), true).unwrap();
    assert!(store.resolve(None, SUBJECT, "a.1").unwrap().is_some());
}

#[test]
fn test_shared_destination_keeps_subjects_apart() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteDataStore::builder(StoreConfig::new(dir.path().join("db")))
        .subject_mapping(PathPrefix::new(2))
        .build()
        .unwrap();

    store.set(None, "aff4:/C.1/fs/os", "p", "os", Some(1), true).unwrap();
    store.set(None, "aff4:/C.1/stats", "p", "stats", Some(1), true).unwrap();

    assert_eq!(store.cache().len(), 1);
    let (value, _) = store.resolve(None, "aff4:/C.1/fs/os", "p").unwrap().unwrap();
    assert_eq!(value, Value::Bytes(b"os".to_vec()));
}

#[test]
fn test_concurrent_writers_on_different_subjects() {
    let (_dir, store) = create_store();
    let store = std::sync::Arc::new(store);

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let store = std::sync::Arc::clone(&store);
            std::thread::spawn(move || {
                let subject = format!("S{}", i);
                for ts in 0..20 {
                    store.set(None, &subject, "size", ts, Some(ts), false).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for i in 0..4 {
        let cells = store
            .resolve_multi(None, &format!("S{}", i), &["size"], Timestamps::All, None)
            .unwrap();
        assert_eq!(cells.len(), 20);
    }
}
