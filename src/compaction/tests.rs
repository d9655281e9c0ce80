//! Compaction unit tests: trivial-move detection, grandparent output
//! cutting, sub-range partitioning, and the merge loop's visibility rules
//! (shadowed versions, base-level deletion markers, snapshots, rollback,
//! counter merging).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tempfile::TempDir;

use super::executor::generate_sub_compactions;
use super::*;
use crate::config::{CompactStrategyKind, DbConfig, NUM_LEVELS};
use crate::env::{EnvRef, LocalEnv};
use crate::files;
use crate::keys::{InternalKey, MAX_SEQUENCE, RollbackMap, ValueType};
use crate::sstable::{Table, TableBuilder, TableBuilderOptions};
use crate::version::{TableCache, Version};

// ------------------------------------------------------------------------------------------------
// Harness
// ------------------------------------------------------------------------------------------------

fn test_config() -> DbConfig {
    DbConfig {
        tablet_id: 9,
        ..DbConfig::default()
    }
}

fn key(user: &[u8], seq: u64, kind: ValueType) -> InternalKey {
    InternalKey::new(user.to_vec(), seq, kind)
}

/// Builds a real table file and returns its metadata.
fn make_table(
    env: &EnvRef,
    dir: &std::path::Path,
    number: u64,
    cells: &[(InternalKey, &[u8])],
) -> Arc<FileMetaData> {
    let path = files::table_file_path(dir, number);
    let mut builder =
        TableBuilder::new(Arc::clone(env), &path, TableBuilderOptions::default()).unwrap();
    for (k, v) in cells {
        builder.add(k, v).unwrap();
    }
    let built = builder.finish().unwrap();
    Arc::new(FileMetaData {
        number,
        file_size: built.file_size,
        smallest: built.smallest,
        largest: built.largest,
        del_percentage: built.del_percentage,
        ttl_check_ts: built.ttl_check_ts,
        entry_count: built.entry_count,
    })
}

/// Synthetic metadata for picker-level tests (no file on disk).
fn meta(number: u64, smallest: &[u8], largest: &[u8], size: u64) -> Arc<FileMetaData> {
    Arc::new(FileMetaData {
        number,
        file_size: size,
        smallest: key(smallest, 100, ValueType::Value),
        largest: key(largest, 1, ValueType::Value),
        del_percentage: 0,
        ttl_check_ts: 0,
        entry_count: 1,
    })
}

fn version_with(level: usize, files_at_level: Vec<Arc<FileMetaData>>) -> Arc<Version> {
    let mut files = vec![Vec::new(); NUM_LEVELS];
    files[level] = files_at_level;
    Arc::new(Version::from_files(files))
}

/// Runs a merge compaction over `inputs` at `level` and returns the cells
/// of all output files, in order.
fn run_merge(
    config: &DbConfig,
    level: usize,
    inputs: Vec<Arc<FileMetaData>>,
    next_inputs: Vec<Arc<FileMetaData>>,
    version: Arc<Version>,
    smallest_snapshot: u64,
    rollbacks: &RollbackMap,
    env: &EnvRef,
    dir: &std::path::Path,
) -> (Vec<(InternalKey, Vec<u8>)>, CompactionOutcome) {
    let cache = TableCache::new(Arc::clone(env), dir);
    let mut compaction = Compaction::new(config, version, level, inputs, false);
    compaction.set_next_level_inputs(next_inputs);
    compaction.smallest_snapshot = smallest_snapshot;

    let next_number = AtomicU64::new(files::pack_file_number(config.tablet_id, 900));
    let alloc = || next_number.fetch_add(1, Ordering::SeqCst);
    let shutting_down = AtomicBool::new(false);

    let outcome = run_compaction(
        env,
        &cache,
        config,
        &compaction,
        rollbacks,
        &alloc,
        &shutting_down,
    )
    .unwrap();

    let mut cells = Vec::new();
    for &number in &outcome.output_numbers {
        let table = Table::open(env, &files::table_file_path(dir, number)).unwrap();
        let mut iter = table.iter();
        cells.extend(iter.by_ref().collect::<Vec<_>>());
        assert!(iter.status().is_none());
    }
    (cells, outcome)
}

// ------------------------------------------------------------------------------------------------
// Compaction object
// ------------------------------------------------------------------------------------------------

#[test]
fn trivial_move_requires_single_input_and_no_overlap() {
    let config = test_config();
    let version = version_with(1, vec![]);

    let mut single = Compaction::new(
        &config,
        Arc::clone(&version),
        1,
        vec![meta(1, b"a", b"m", 1000)],
        false,
    );
    assert!(single.is_trivial_move());

    single.set_next_level_inputs(vec![meta(2, b"c", b"k", 1000)]);
    assert!(!single.is_trivial_move(), "next-level overlap forbids move");

    let two = Compaction::new(
        &config,
        version,
        1,
        vec![meta(3, b"a", b"c", 10), meta(4, b"d", b"f", 10)],
        false,
    );
    assert!(!two.is_trivial_move(), "two inputs forbid move");
}

#[test]
fn trivial_move_blocked_by_heavy_grandparent_overlap() {
    let config = test_config();
    let budget = config.max_grandparent_overlap_bytes();
    let version = version_with(1, vec![]);

    let mut c = Compaction::new(
        &config,
        version,
        1,
        vec![meta(1, b"a", b"z", 1000)],
        false,
    );
    c.set_grandparents(vec![meta(2, b"a", b"z", budget + 1)]);
    assert!(!c.is_trivial_move());
}

#[test]
fn should_stop_before_cuts_at_overlap_budget() {
    let config = DbConfig {
        max_file_size: 100, // overlap budget = 1000 bytes
        ..test_config()
    };
    let version = version_with(1, vec![]);
    let mut c = Compaction::new(&config, version, 1, vec![meta(1, b"a", b"z", 10)], false);
    c.set_grandparents(vec![
        meta(10, b"b", b"c", 600),
        meta(11, b"d", b"e", 600),
        meta(12, b"f", b"g", 600),
    ]);

    // Walking past grandparents accumulates overlap; the budget (1000)
    // trips after the second grandparent is crossed.
    assert!(!c.should_stop_before(&key(b"b", 1, ValueType::Value)));
    assert!(!c.should_stop_before(&key(b"d", 1, ValueType::Value)));
    assert!(c.should_stop_before(&key(b"h", 1, ValueType::Value)));
    // The trip resets the accumulator.
    assert!(!c.should_stop_before(&key(b"i", 1, ValueType::Value)));
}

#[test]
fn is_base_level_for_key_checks_deeper_levels() {
    let config = test_config();
    let mut files = vec![Vec::new(); NUM_LEVELS];
    files[3] = vec![meta(7, b"k", b"p", 100)];
    let version = Arc::new(Version::from_files(files));

    let mut c = Compaction::new(&config, version, 1, vec![meta(1, b"a", b"z", 10)], false);
    assert!(!c.is_base_level_for_key(b"m"), "level 3 holds data for m");
    assert!(c.is_base_level_for_key(b"q"), "nothing below covers q");
}

#[test]
fn sub_compactions_cover_range_disjointly() {
    let config = test_config();
    let version = version_with(1, vec![]);
    let inputs = vec![
        meta(1, b"a", b"c", 1000),
        meta(2, b"d", b"f", 1000),
        meta(3, b"g", b"i", 1000),
        meta(4, b"j", b"l", 1000),
    ];
    let c = Compaction::new(&config, version, 1, inputs, false);
    let subs = generate_sub_compactions(&c, 4);

    assert!(subs.len() > 1, "four equal files should split");
    assert!(subs[0].sub_start.is_none());
    assert!(subs.last().unwrap().sub_end.is_none());
    for pair in subs.windows(2) {
        let end = pair[0].sub_end.as_ref().unwrap();
        let start = pair[1].sub_start.as_ref().unwrap();
        assert_eq!(end, start, "ranges must tile exactly");
    }
}

#[test]
fn sub_compactions_single_worker_for_single_file() {
    let config = test_config();
    let version = version_with(1, vec![]);
    let c = Compaction::new(&config, version, 1, vec![meta(1, b"a", b"z", 10)], false);
    let subs = generate_sub_compactions(&c, 8);
    assert_eq!(subs.len(), 1);
}

// ------------------------------------------------------------------------------------------------
// Merge loop — visibility rules
// ------------------------------------------------------------------------------------------------

#[test]
fn shadowed_versions_dropped_without_snapshots() {
    let dir = TempDir::new().unwrap();
    let env = LocalEnv::shared();
    let config = test_config();

    let f1 = make_table(
        &env,
        dir.path(),
        files::pack_file_number(9, 1),
        &[
            (key(b"k", 9, ValueType::Value), b"newest"),
            (key(b"k", 5, ValueType::Value), b"middle"),
            (key(b"k", 2, ValueType::Value), b"oldest"),
        ],
    );
    let version = version_with(0, vec![Arc::clone(&f1)]);

    let (cells, _) = run_merge(
        &config,
        0,
        vec![f1],
        vec![],
        version,
        MAX_SEQUENCE,
        &RollbackMap::new(),
        &env,
        dir.path(),
    );

    assert_eq!(cells.len(), 1, "only the newest version survives");
    assert_eq!(cells[0].0.sequence, 9);
    assert_eq!(cells[0].1, b"newest");
}

#[test]
fn deletion_and_value_both_drop_at_base_level() {
    // (k, seq=5, delete) over (k, seq=3, value) with no snapshot below 5
    // and no deeper data for k → both disappear.
    let dir = TempDir::new().unwrap();
    let env = LocalEnv::shared();
    let config = test_config();

    let f1 = make_table(
        &env,
        dir.path(),
        files::pack_file_number(9, 1),
        &[
            (key(b"k", 5, ValueType::Deletion), b""),
            (key(b"k", 3, ValueType::Value), b"v"),
            (key(b"other", 1, ValueType::Value), b"keep"),
        ],
    );
    let version = version_with(0, vec![Arc::clone(&f1)]);

    let (cells, _) = run_merge(
        &config,
        0,
        vec![f1],
        vec![],
        version,
        MAX_SEQUENCE,
        &RollbackMap::new(),
        &env,
        dir.path(),
    );

    assert_eq!(cells.len(), 1);
    assert_eq!(cells[0].0.user_key, b"other");
}

#[test]
fn snapshot_preserves_value_under_newer_delete() {
    // With an active snapshot at seq=4, the value at seq=3 must survive
    // even though a delete at seq=5 exists above it.
    let dir = TempDir::new().unwrap();
    let env = LocalEnv::shared();
    let config = test_config();

    let f1 = make_table(
        &env,
        dir.path(),
        files::pack_file_number(9, 1),
        &[
            (key(b"k", 5, ValueType::Deletion), b""),
            (key(b"k", 3, ValueType::Value), b"pinned"),
        ],
    );
    let version = version_with(0, vec![Arc::clone(&f1)]);

    let (cells, _) = run_merge(
        &config,
        0,
        vec![f1],
        vec![],
        version,
        4, // smallest active snapshot
        &RollbackMap::new(),
        &env,
        dir.path(),
    );

    let seqs: Vec<u64> = cells.iter().map(|(k, _)| k.sequence).collect();
    assert!(seqs.contains(&3), "snapshot-pinned value must survive");
    assert!(seqs.contains(&5), "delete above snapshot must survive");
}

#[test]
fn rollback_interval_drops_entries_unconditionally() {
    let dir = TempDir::new().unwrap();
    let env = LocalEnv::shared();
    let config = test_config();

    let f1 = make_table(
        &env,
        dir.path(),
        files::pack_file_number(9, 1),
        &[
            (key(b"k", 15, ValueType::Value), b"rolled-back"),
            (key(b"k", 8, ValueType::Value), b"survivor"),
        ],
    );
    let version = version_with(0, vec![Arc::clone(&f1)]);

    let mut rollbacks = RollbackMap::new();
    rollbacks.insert(10, 20);

    // Rollback is anchored at a held snapshot (seq 10 here): the rolled
    // interval drops by rule 1 even though a snapshot would otherwise pin
    // it, and the pre-rollback entry at seq 8 stays readable.
    let (cells, _) = run_merge(
        &config,
        0,
        vec![f1],
        vec![],
        version,
        10,
        &rollbacks,
        &env,
        dir.path(),
    );

    assert_eq!(cells.len(), 1);
    assert_eq!(cells[0].0.sequence, 8);
    assert_eq!(cells[0].1, b"survivor");
}

#[test]
fn counter_strategy_merges_versions_into_sum() {
    let dir = TempDir::new().unwrap();
    let env = LocalEnv::shared();
    let config = DbConfig {
        compact_strategy: CompactStrategyKind::MergeCounters,
        ..test_config()
    };

    let f1 = make_table(
        &env,
        dir.path(),
        files::pack_file_number(9, 1),
        &[
            (key(b"c", 7, ValueType::Value), &5i64.to_le_bytes()),
            (key(b"c", 4, ValueType::Value), &10i64.to_le_bytes()),
            (key(b"c", 2, ValueType::Value), &100i64.to_le_bytes()),
        ],
    );
    let version = version_with(0, vec![Arc::clone(&f1)]);

    let (cells, _) = run_merge(
        &config,
        0,
        vec![f1],
        vec![],
        version,
        MAX_SEQUENCE,
        &RollbackMap::new(),
        &env,
        dir.path(),
    );

    assert_eq!(cells.len(), 1);
    assert_eq!(cells[0].0.sequence, 7, "merged cell keeps the newest key");
    assert_eq!(cells[0].1, 115i64.to_le_bytes());
}

#[test]
fn merge_across_two_files_prefers_newer() {
    let dir = TempDir::new().unwrap();
    let env = LocalEnv::shared();
    let config = test_config();

    let newer = make_table(
        &env,
        dir.path(),
        files::pack_file_number(9, 2),
        &[(key(b"k", 9, ValueType::Value), b"new")],
    );
    let older = make_table(
        &env,
        dir.path(),
        files::pack_file_number(9, 1),
        &[
            (key(b"k", 3, ValueType::Value), b"old"),
            (key(b"z", 1, ValueType::Value), b"tail"),
        ],
    );
    let version = version_with(0, vec![Arc::clone(&newer), Arc::clone(&older)]);

    let (cells, outcome) = run_merge(
        &config,
        0,
        vec![newer, older],
        vec![],
        version,
        MAX_SEQUENCE,
        &RollbackMap::new(),
        &env,
        dir.path(),
    );

    let kv: Vec<(Vec<u8>, Vec<u8>)> = cells
        .iter()
        .map(|(k, v)| (k.user_key.clone(), v.clone()))
        .collect();
    assert_eq!(
        kv,
        [(b"k".to_vec(), b"new".to_vec()), (b"z".to_vec(), b"tail".to_vec())]
    );
    // Both inputs deleted, one output added at level 1.
    assert_eq!(outcome.edit.deleted_files.len(), 2);
    assert_eq!(outcome.edit.new_files.len(), 1);
    assert_eq!(outcome.edit.new_files[0].0, 1);
}
