//! Snapshot isolation and rollback through the engine: fixed-sequence
//! reads under concurrent writes, snapshot survival across compaction,
//! and rollback intervals hiding committed writes.

use tempfile::TempDir;

use crate::db::tests::helpers::*;
use crate::db::ReadOptions;

fn get_at(engine: &crate::db::Engine, key: &[u8], snapshot: u64) -> Option<Vec<u8>> {
    let opts = ReadOptions {
        snapshot: Some(snapshot),
        ..ReadOptions::default()
    };
    engine.get(key, &opts).unwrap()
}

/// # Scenario
/// A snapshot pins the value visible at its sequence while writes
/// continue.
///
/// # Actions
/// 1. Write `"k"` → `"old"`, take a snapshot.
/// 2. Overwrite `"k"` twice.
///
/// # Expected behavior
/// Reads at the snapshot return `"old"`; latest reads see the newest.
#[test]
fn snapshot_pins_point_in_time() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), memtable_only_config());

    put(&engine, b"k", b"old");
    let snap = engine.snapshot();

    put(&engine, b"k", b"mid");
    put(&engine, b"k", b"new");

    assert_eq!(get_at(&engine, b"k", snap), Some(b"old".to_vec()));
    assert_eq!(get(&engine, b"k"), Some(b"new".to_vec()));

    engine.release_snapshot(snap).unwrap();
    engine.close().unwrap();
}

/// # Scenario
/// Isolation across compaction: writes at seq 1..5, snapshot S at 3,
/// more writes to seq 8, then a compaction — a read at S still returns
/// exactly the value committed at seq ≤ 3.
///
/// # Actions
/// 1. Five writes to `"key"`; snapshot after the third.
/// 2. Three more writes; flush and compact the whole range.
/// 3. Read at the snapshot.
///
/// # Expected behavior
/// The snapshot read returns the third value: compaction must not remove
/// data a held snapshot still needs.
#[test]
fn snapshot_survives_compaction() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), small_buffer_config());

    for i in 1u32..=3 {
        put(&engine, b"key", format!("v{i}").as_bytes());
    }
    let snap = engine.snapshot();

    for i in 4u32..=8 {
        put(&engine, b"key", format!("v{i}").as_bytes());
    }
    engine.flush_memtable().unwrap();
    engine.compact_range(None, None).unwrap();

    assert_eq!(get_at(&engine, b"key", snap), Some(b"v3".to_vec()));
    assert_eq!(get(&engine, b"key"), Some(b"v8".to_vec()));

    engine.release_snapshot(snap).unwrap();
    engine.close().unwrap();
}

/// # Scenario
/// A deletion above a held snapshot does not erase the snapshot's view,
/// even after full compaction.
#[test]
fn snapshot_protects_value_under_delete() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), small_buffer_config());

    put(&engine, b"doomed", b"still-here");
    let snap = engine.snapshot();
    delete(&engine, b"doomed");

    engine.flush_memtable().unwrap();
    engine.compact_range(None, None).unwrap();

    assert_eq!(get(&engine, b"doomed"), None);
    assert_eq!(get_at(&engine, b"doomed", snap), Some(b"still-here".to_vec()));

    engine.release_snapshot(snap).unwrap();
    engine.close().unwrap();
}

/// # Scenario
/// Once the last snapshot is released, a full compaction may erase the
/// shadowed history — and the live view is unaffected.
#[test]
fn released_snapshot_frees_history() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), small_buffer_config());

    put(&engine, b"k", b"v1");
    let snap = engine.snapshot();
    put(&engine, b"k", b"v2");
    engine.release_snapshot(snap).unwrap();

    engine.flush_memtable().unwrap();
    engine.compact_range(None, None).unwrap();
    assert_eq!(get(&engine, b"k"), Some(b"v2".to_vec()));
    engine.close().unwrap();
}

/// # Scenario
/// Snapshot bookkeeping errors: releasing an unheld snapshot and
/// snapshotting beyond the committed sequence are caller errors.
#[test]
fn snapshot_argument_errors() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), memtable_only_config());
    put(&engine, b"k", b"v");

    assert!(engine.release_snapshot(9999).is_err());
    assert!(engine.snapshot_at(engine.last_sequence() + 1).is_err());
    let snap = engine.snapshot_at(engine.last_sequence()).unwrap();
    engine.release_snapshot(snap).unwrap();
    engine.close().unwrap();
}

// ------------------------------------------------------------------------------------------------
// Rollback
// ------------------------------------------------------------------------------------------------

/// # Scenario
/// A rollback interval hides committed writes from reads immediately.
///
/// # Actions
/// 1. Write `"k"` → `"keep"`, note the sequence, write `"k"` → `"bad"`.
/// 2. Roll back everything after the noted sequence.
///
/// # Expected behavior
/// Reads return `"keep"` — the rolled-back write is invisible.
#[test]
fn rollback_hides_writes_from_reads() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), memtable_only_config());

    put(&engine, b"k", b"keep");
    let mark = engine.last_sequence();
    put(&engine, b"k", b"bad");
    let point = engine.last_sequence();

    engine.rollback(mark, point).unwrap();
    assert_eq!(get(&engine, b"k"), Some(b"keep".to_vec()));
    engine.close().unwrap();
}

/// # Scenario
/// Rolled-back entries are physically dropped by compaction while the
/// pre-rollback value remains. Per the rollback contract, the caller
/// holds a snapshot at the rollback's base sequence (the state being
/// returned to) for as long as the rollback is active.
#[test]
fn rollback_entries_dropped_by_compaction() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), small_buffer_config());

    put(&engine, b"k", b"keep");
    let mark = engine.last_sequence();
    let anchor = engine.snapshot_at(mark).unwrap();
    put(&engine, b"k", b"rolled-away");
    let point = engine.last_sequence();
    engine.rollback(mark, point).unwrap();

    engine.flush_memtable().unwrap();
    engine.compact_range(None, None).unwrap();

    assert_eq!(get(&engine, b"k"), Some(b"keep".to_vec()));
    engine.release_snapshot(anchor).unwrap();
    engine.close().unwrap();
}

/// # Scenario
/// A rollback point below its snapshot sequence is a caller error.
#[test]
fn rollback_validates_interval() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), memtable_only_config());
    assert!(engine.rollback(10, 5).is_err());
    engine.close().unwrap();
}
