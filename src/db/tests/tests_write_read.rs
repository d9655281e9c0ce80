//! Write/read correctness: put/get round-trips, batch atomicity and
//! sequence assignment, deletes, and the core ordering guarantee — a
//! read at the latest committed sequence always returns the write with
//! the highest sequence at or below it.

use tempfile::TempDir;

use crate::db::tests::helpers::*;
use crate::db::{ReadOptions, WriteBatch};

/// # Scenario
/// Basic put/get round-trip for a single key.
///
/// # Actions
/// 1. Put key `"hello"` with value `"world"`.
/// 2. Immediately get the same key.
///
/// # Expected behavior
/// `get("hello")` returns `Some("world")`.
#[test]
fn put_get_single_key() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), memtable_only_config());

    put(&engine, b"hello", b"world");
    assert_eq!(get(&engine, b"hello"), Some(b"world".to_vec()));
    engine.close().unwrap();
}

/// # Scenario
/// Get on a key that was never inserted.
///
/// # Expected behavior
/// `get` returns `None` — a missing key is not an error.
#[test]
fn get_missing_key_returns_none() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), memtable_only_config());

    assert_eq!(get(&engine, b"nope"), None);
    engine.close().unwrap();
}

/// # Scenario
/// Overwriting the same key returns only the latest value.
///
/// # Actions
/// 1. Put `"k"` → `"v1"`, `"v2"`, `"v3"` in sequence.
///
/// # Expected behavior
/// Only the most recent write is visible.
#[test]
fn overwrite_returns_latest_value() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), memtable_only_config());

    put(&engine, b"k", b"v1");
    put(&engine, b"k", b"v2");
    put(&engine, b"k", b"v3");
    assert_eq!(get(&engine, b"k"), Some(b"v3".to_vec()));
    engine.close().unwrap();
}

/// # Scenario
/// Delete hides a key; re-put resurrects it.
#[test]
fn delete_then_reput() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), memtable_only_config());

    put(&engine, b"k", b"v");
    delete(&engine, b"k");
    assert_eq!(get(&engine, b"k"), None);

    put(&engine, b"k", b"v2");
    assert_eq!(get(&engine, b"k"), Some(b"v2".to_vec()));
    engine.close().unwrap();
}

/// # Scenario
/// A batch commits one contiguous sequence range atomically.
///
/// # Actions
/// 1. Note the last sequence.
/// 2. Commit a 3-entry batch.
///
/// # Expected behavior
/// The last sequence advances by exactly 3 and all entries are visible.
#[test]
fn batch_commits_contiguous_sequence_range() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), memtable_only_config());

    let before = engine.last_sequence();
    let mut batch = WriteBatch::new();
    batch.put(b"a", b"1").unwrap();
    batch.put(b"b", b"2").unwrap();
    batch.delete(b"c").unwrap();
    engine.write(batch).unwrap();

    assert_eq!(engine.last_sequence(), before + 3);
    assert_eq!(get(&engine, b"a"), Some(b"1".to_vec()));
    assert_eq!(get(&engine, b"b"), Some(b"2".to_vec()));
    assert_eq!(get(&engine, b"c"), None);
    engine.close().unwrap();
}

/// # Scenario
/// An empty batch is a no-op: no sequence consumed, no error.
#[test]
fn empty_batch_is_noop() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), memtable_only_config());

    let before = engine.last_sequence();
    engine.write(WriteBatch::new()).unwrap();
    assert_eq!(engine.last_sequence(), before);
    engine.close().unwrap();
}

/// # Scenario
/// The core ordering guarantee: after an arbitrary interleaving of
/// writes, a read at the latest sequence returns, for every key, the
/// value of the write with the highest sequence number at or below it.
#[test]
fn ordering_latest_write_wins_per_key() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), memtable_only_config());

    for round in 0u32..10 {
        for k in 0u32..20 {
            put(
                &engine,
                format!("key_{k:02}").as_bytes(),
                format!("round_{round}").as_bytes(),
            );
        }
    }
    for k in 0u32..20 {
        assert_eq!(
            get(&engine, format!("key_{k:02}").as_bytes()),
            Some(b"round_9".to_vec())
        );
    }
    engine.close().unwrap();
}

/// # Scenario
/// Binary keys with embedded zero bytes round-trip unchanged.
#[test]
fn binary_keys_roundtrip() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), memtable_only_config());

    put(&engine, &[0x00, 0x00, 0x01], b"nulls");
    put(&engine, &[0xFF; 64], b"ffs");
    assert_eq!(get(&engine, &[0x00, 0x00, 0x01]), Some(b"nulls".to_vec()));
    assert_eq!(get(&engine, &[0xFF; 64]), Some(b"ffs".to_vec()));
    engine.close().unwrap();
}

/// # Scenario
/// Empty lookup keys are a caller programming error.
#[test]
fn empty_key_read_rejected() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), memtable_only_config());

    assert!(matches!(
        engine.get(b"", &ReadOptions::default()),
        Err(crate::db::EngineError::InvalidArgument(_))
    ));
    engine.close().unwrap();
}

/// # Scenario
/// Concurrent writers on distinct keys all commit; total sequence count
/// matches the number of writes (no gaps, no reordering losses).
#[test]
fn concurrent_writers_all_commit() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), memtable_only_config());
    let before = engine.last_sequence();

    std::thread::scope(|scope| {
        for t in 0u32..4 {
            let engine = engine.clone();
            scope.spawn(move || {
                for i in 0u32..50 {
                    let mut batch = WriteBatch::new();
                    batch
                        .put(format!("t{t}_k{i:03}").as_bytes(), b"v")
                        .unwrap();
                    engine.write(batch).unwrap();
                }
            });
        }
    });

    assert_eq!(engine.last_sequence(), before + 200);
    for t in 0u32..4 {
        for i in 0u32..50 {
            assert_eq!(
                get(&engine, format!("t{t}_k{i:03}").as_bytes()),
                Some(b"v".to_vec())
            );
        }
    }
    engine.close().unwrap();
}
