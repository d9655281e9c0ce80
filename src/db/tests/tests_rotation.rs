//! Rotation and backpressure: small-buffer writes rotate the memtable,
//! flushes land at level 0 (or deeper when nothing overlaps), and the
//! engine never holds two immutable memtables.

use tempfile::TempDir;

use crate::db::tests::helpers::*;

fn level_files(engine: &crate::db::Engine, level: usize) -> usize {
    engine
        .property(&format!("stratadb.num-files-at-level{level}"))
        .unwrap()
        .parse()
        .unwrap()
}

/// # Scenario
/// Writing past the buffer size rotates and flushes to disk.
///
/// # Actions
/// 1. Write well past the 2 KiB buffer.
/// 2. Force a final flush.
///
/// # Expected behavior
/// At least one table file exists on disk, and every key still reads
/// back correctly through the table path.
#[test]
fn overflow_produces_table_files() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), small_buffer_config());

    for i in 0u32..200 {
        put(
            &engine,
            format!("key_{i:04}").as_bytes(),
            format!("value_{i:04}_{}", "x".repeat(32)).as_bytes(),
        );
    }
    engine.flush_memtable().unwrap();

    let total: usize = (0..crate::config::NUM_LEVELS)
        .map(|l| level_files(&engine, l))
        .sum();
    assert!(total >= 1, "flushes must have produced table files");

    for i in 0u32..200 {
        let expected = format!("value_{i:04}_{}", "x".repeat(32)).into_bytes();
        assert_eq!(get(&engine, format!("key_{i:04}").as_bytes()), Some(expected));
    }
    engine.close().unwrap();
}

/// # Scenario
/// `flush_memtable` on an empty engine is a no-op.
#[test]
fn flush_empty_memtable_is_noop() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), memtable_only_config());
    engine.flush_memtable().unwrap();
    engine.flush_memtable().unwrap();
    engine.close().unwrap();
}

/// # Scenario
/// A flush pushes a non-overlapping memtable past level 0, up to
/// `max_mem_compact_level`.
///
/// # Actions
/// 1. Write and flush once into an empty tree.
///
/// # Expected behavior
/// With nothing to overlap, the output lands at level 2 (the default
/// `max_mem_compact_level`), leaving level 0 empty.
#[test]
fn first_flush_lands_past_level0_when_nothing_overlaps() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), small_buffer_config());

    put(&engine, b"a", b"1");
    put(&engine, b"b", b"2");
    engine.flush_memtable().unwrap();

    assert_eq!(level_files(&engine, 0), 0);
    assert_eq!(level_files(&engine, 2), 1);
    engine.close().unwrap();
}

/// # Scenario
/// Rotation invariant under sustained write pressure: many rotations
/// happen, yet writes never fail and all data stays readable — which is
/// only possible if `make_room_for_write` never rotates onto an
/// unflushed immutable memtable.
#[test]
fn sustained_pressure_never_double_rotates() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), small_buffer_config());

    for i in 0u32..500 {
        put(
            &engine,
            format!("k{i:05}").as_bytes(),
            "y".repeat(64).as_bytes(),
        );
    }
    for i in (0u32..500).step_by(71) {
        assert_eq!(
            get(&engine, format!("k{i:05}").as_bytes()),
            Some("y".repeat(64).into_bytes())
        );
    }
    engine.close().unwrap();
}
