//! Engine-level compaction behavior: manual range compaction, deletion
//! garbage collection, automatic level-0 compaction under write
//! pressure, and counter merge-on-compaction through the full stack.

use tempfile::TempDir;

use crate::config::{CompactStrategyKind, DbConfig, NUM_LEVELS};
use crate::db::WriteBatch;
use crate::db::tests::helpers::*;

fn level_files(engine: &crate::db::Engine, level: usize) -> usize {
    engine
        .property(&format!("stratadb.num-files-at-level{level}"))
        .unwrap()
        .parse()
        .unwrap()
}

fn total_files(engine: &crate::db::Engine) -> usize {
    (0..NUM_LEVELS).map(|l| level_files(engine, l)).sum()
}

/// # Scenario
/// Manual compaction over everything preserves the live data set.
///
/// # Actions
/// 1. Write 100 keys across several flushes.
/// 2. `compact_range(None, None)`.
///
/// # Expected behavior
/// All keys read back; files have been merged down the hierarchy.
#[test]
fn full_compaction_preserves_data() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), small_buffer_config());

    for i in 0u32..100 {
        put(
            &engine,
            format!("k{i:04}").as_bytes(),
            format!("v{i:04}_{}", "p".repeat(30)).as_bytes(),
        );
        if i % 25 == 24 {
            engine.flush_memtable().unwrap();
        }
    }
    let before = total_files(&engine);
    engine.compact_range(None, None).unwrap();
    let after = total_files(&engine);

    assert!(after <= before, "compaction must not multiply files");
    for i in 0u32..100 {
        assert_eq!(
            get(&engine, format!("k{i:04}").as_bytes()),
            Some(format!("v{i:04}_{}", "p".repeat(30)).into_bytes())
        );
    }
    engine.close().unwrap();
}

/// # Scenario
/// Deleted keys vanish physically after full compaction with no
/// snapshots held: both the marker and the shadowed value are gone,
/// and the remaining data is intact.
#[test]
fn compaction_garbage_collects_deletions() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), small_buffer_config());

    for i in 0u32..50 {
        put(&engine, format!("k{i:03}").as_bytes(), b"value");
    }
    engine.flush_memtable().unwrap();
    for i in (0u32..50).step_by(2) {
        delete(&engine, format!("k{i:03}").as_bytes());
    }
    engine.flush_memtable().unwrap();
    engine.compact_range(None, None).unwrap();

    for i in 0u32..50 {
        let expected = if i % 2 == 0 { None } else { Some(b"value".to_vec()) };
        assert_eq!(get(&engine, format!("k{i:03}").as_bytes()), expected);
    }
    engine.close().unwrap();
}

/// # Scenario
/// Accumulating level-0 files past the trigger starts background
/// compaction without any manual prodding.
#[test]
fn level0_pressure_triggers_background_compaction() {
    let tmp = TempDir::new().unwrap();
    let config = DbConfig {
        tablet_id: 7,
        write_buffer_size: 1024,
        max_file_size: 8 * 1024,
        // Flushes land at level 0 so pressure builds there.
        max_mem_compact_level: 0,
        ..DbConfig::default()
    };
    let engine = open_engine(tmp.path(), config);

    for i in 0u32..400 {
        put(
            &engine,
            format!("k{i:05}").as_bytes(),
            "q".repeat(48).as_bytes(),
        );
    }
    // Wait for background compaction to bring level 0 back under the
    // trigger. Bounded wait: compaction is score-driven and must fire.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(30);
    loop {
        engine.flush_memtable().unwrap();
        if level_files(&engine, 0) <= 4 && level_files(&engine, 1) > 0 {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "background compaction never reduced level 0"
        );
        std::thread::sleep(std::time::Duration::from_millis(20));
    }

    for i in (0u32..400).step_by(41) {
        assert_eq!(
            get(&engine, format!("k{i:05}").as_bytes()),
            Some("q".repeat(48).into_bytes())
        );
    }
    engine.close().unwrap();
}

/// # Scenario
/// The counter strategy folds per-key deltas during compaction: three
/// deltas written as separate batches read back as their sum after a
/// full compaction.
#[test]
fn counter_strategy_folds_deltas_end_to_end() {
    let tmp = TempDir::new().unwrap();
    let config = DbConfig {
        tablet_id: 7,
        write_buffer_size: 2048,
        compact_strategy: CompactStrategyKind::MergeCounters,
        ..DbConfig::default()
    };
    let engine = open_engine(tmp.path(), config);

    for delta in [5i64, 10, 100] {
        let mut batch = WriteBatch::new();
        batch.put(b"counter", &delta.to_le_bytes()).unwrap();
        engine.write(batch).unwrap();
    }
    engine.flush_memtable().unwrap();
    engine.compact_range(None, None).unwrap();

    let raw = get(&engine, b"counter").unwrap();
    assert_eq!(i64::from_le_bytes(raw.try_into().unwrap()), 115);
    engine.close().unwrap();
}

/// # Scenario
/// Compacting an empty engine is a no-op, not an error.
#[test]
fn compact_empty_engine() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), memtable_only_config());
    engine.compact_range(None, None).unwrap();
    engine.close().unwrap();
}

/// # Scenario
/// A bounded manual compaction only touches the requested range; data
/// outside it stays readable.
#[test]
fn bounded_compaction_leaves_outside_data() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), small_buffer_config());

    for i in 0u32..60 {
        put(&engine, format!("k{i:03}").as_bytes(), b"v");
    }
    engine.flush_memtable().unwrap();
    engine
        .compact_range(Some(b"k010"), Some(b"k020"))
        .unwrap();

    for i in 0u32..60 {
        assert_eq!(get(&engine, format!("k{i:03}").as_bytes()), Some(b"v".to_vec()));
    }
    engine.close().unwrap();
}
