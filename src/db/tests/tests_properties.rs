//! Property surface: per-level file counts, the stats table, the
//! query-and-reset compaction-error slot, and split-key suggestion.

use tempfile::TempDir;

use crate::db::tests::helpers::*;

/// # Scenario
/// File-count properties track flushes; unknown names and out-of-range
/// levels return `None`.
#[test]
fn num_files_properties() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), small_buffer_config());

    assert_eq!(
        engine.property("stratadb.num-files-at-level0").unwrap(),
        "0"
    );
    put(&engine, b"k", b"v");
    engine.flush_memtable().unwrap();

    let total: usize = (0..crate::config::NUM_LEVELS)
        .map(|l| {
            engine
                .property(&format!("stratadb.num-files-at-level{l}"))
                .unwrap()
                .parse::<usize>()
                .unwrap()
        })
        .sum();
    assert_eq!(total, 1);

    assert!(engine.property("stratadb.num-files-at-level99").is_none());
    assert!(engine.property("stratadb.no-such-property").is_none());
    assert!(engine.property("otherdb.stats").is_none());
    engine.close().unwrap();
}

/// # Scenario
/// The stats property renders a table header and one row per populated
/// level.
#[test]
fn stats_property_renders() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), small_buffer_config());

    put(&engine, b"k", b"v");
    engine.flush_memtable().unwrap();

    let stats = engine.property("stratadb.stats").unwrap();
    assert!(stats.starts_with("Level"));
    assert!(stats.lines().count() >= 2, "one populated level expected");
    engine.close().unwrap();
}

/// # Scenario
/// The compaction-error slot is empty on a healthy engine and is
/// consumed by reading (query-and-reset): two consecutive reads cannot
/// both observe the same transient error report.
#[test]
fn compaction_error_property_is_query_and_reset() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), memtable_only_config());

    assert_eq!(
        engine.property("stratadb.compaction_error").unwrap(),
        "",
        "healthy engine reports no error"
    );
    assert_eq!(engine.property("stratadb.compaction_error").unwrap(), "");
    engine.close().unwrap();
}

/// # Scenario
/// Split-key suggestion: empty engine has nothing to split; after
/// enough flushed data a mid-range key is suggested.
#[test]
fn split_key_suggestion() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), small_buffer_config());

    assert!(engine.suggest_split_key().is_none());

    for i in 0u32..100 {
        put(
            &engine,
            format!("k{i:04}").as_bytes(),
            "s".repeat(50).as_bytes(),
        );
        if i % 20 == 19 {
            engine.flush_memtable().unwrap();
        }
    }
    engine.flush_memtable().unwrap();

    let split = engine.suggest_split_key().expect("split key for flushed data");
    assert!(split.as_slice() > b"k0000".as_slice());
    assert!(split.as_slice() <= b"k0099".as_slice());
    engine.close().unwrap();
}

/// # Scenario
/// A healthy engine never demands a forced unload.
#[test]
fn no_forced_unload_without_fatal_error() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), memtable_only_config());
    assert!(!engine.should_force_unload());
    engine.close().unwrap();
}
