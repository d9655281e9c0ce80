//! Crash recovery: reopen round-trips, idempotent log replay (duplicate
//! batches), torn-tail tolerance, recovery-memtable spilling, and the
//! first-load marker transaction.

use std::sync::Arc;

use tempfile::TempDir;

use crate::db::batch::{BatchEntry, LogRecord};
use crate::db::tests::helpers::*;
use crate::db::Engine;
use crate::files;
use crate::keys::ValueType;
use crate::wal::Wal;

/// # Scenario
/// Data written before a close is visible after reopen.
///
/// # Actions
/// 1. Write keys, close.
/// 2. Reopen the same directory.
///
/// # Expected behavior
/// All keys read back; the committed sequence is not lower than before.
#[test]
fn reopen_recovers_memtable_data() {
    let tmp = TempDir::new().unwrap();
    {
        let engine = open_engine(tmp.path(), memtable_only_config());
        put(&engine, b"persisted", b"yes");
        put(&engine, b"also", b"this");
        engine.close().unwrap();
    }
    let engine = open_engine(tmp.path(), memtable_only_config());
    assert_eq!(get(&engine, b"persisted"), Some(b"yes".to_vec()));
    assert_eq!(get(&engine, b"also"), Some(b"this".to_vec()));
    engine.close().unwrap();
}

/// # Scenario
/// Deletes survive reopen.
#[test]
fn reopen_preserves_deletes() {
    let tmp = TempDir::new().unwrap();
    {
        let engine = open_engine(tmp.path(), memtable_only_config());
        put(&engine, b"k", b"v");
        delete(&engine, b"k");
        engine.close().unwrap();
    }
    let engine = open_engine(tmp.path(), memtable_only_config());
    assert_eq!(get(&engine, b"k"), None);
    engine.close().unwrap();
}

/// # Scenario
/// Data that was flushed to tables AND data still in the log both
/// survive a reopen.
#[test]
fn reopen_recovers_tables_and_log_tail() {
    let tmp = TempDir::new().unwrap();
    {
        let engine = open_engine(tmp.path(), small_buffer_config());
        for i in 0u32..100 {
            put(
                &engine,
                format!("flushed_{i:03}").as_bytes(),
                "z".repeat(40).as_bytes(),
            );
        }
        engine.flush_memtable().unwrap();
        put(&engine, b"tail_key", b"in-log-only");
        engine.close().unwrap();
    }

    let engine = open_engine(tmp.path(), small_buffer_config());
    assert_eq!(
        get(&engine, b"flushed_042"),
        Some("z".repeat(40).into_bytes())
    );
    assert_eq!(get(&engine, b"tail_key"), Some(b"in-log-only".to_vec()));
    engine.close().unwrap();
}

/// # Scenario
/// Idempotent replay: a log containing batch A
/// (seq 10–12) followed by the *same* batch A again must apply A once.
///
/// # Starting environment
/// A freshly created engine directory, closed, with its newest log
/// hand-appended to contain a duplicated record.
///
/// # Expected behavior
/// After reopen, the batch's effect appears once: the duplicate record is
/// skipped and the committed sequence reflects a single application.
#[test]
fn duplicate_log_record_applies_once() {
    let tmp = TempDir::new().unwrap();
    let env = env();
    let base_sequence;
    {
        let engine = open_engine(tmp.path(), memtable_only_config());
        put(&engine, b"anchor", b"1");
        base_sequence = engine.last_sequence();
        engine.close().unwrap();
    }

    // Find the newest log and append batch A twice, byte-identically.
    let mut log_ids: Vec<u32> = env
        .get_children(tmp.path())
        .unwrap()
        .iter()
        .filter_map(|n| match files::parse_file_name(n) {
            Some(files::FileKind::Log(id)) => Some(id),
            _ => None,
        })
        .collect();
    log_ids.sort_unstable();
    let newest = *log_ids.last().unwrap();
    let number = files::pack_file_number(7, newest);
    let wal: Wal<LogRecord> =
        Wal::open_for_append(&env, files::log_file_path(tmp.path(), number), number).unwrap();

    let batch_a = LogRecord {
        first_sequence: base_sequence + 1,
        entries: vec![
            BatchEntry {
                kind: ValueType::Value,
                key: b"dup_a".to_vec(),
                value: b"v1".to_vec(),
            },
            BatchEntry {
                kind: ValueType::Value,
                key: b"dup_b".to_vec(),
                value: b"v2".to_vec(),
            },
            BatchEntry {
                kind: ValueType::Value,
                key: b"dup_c".to_vec(),
                value: b"v3".to_vec(),
            },
        ],
    };
    wal.append(&batch_a).unwrap();
    wal.append(&batch_a).unwrap(); // the crash-and-retry duplicate
    drop(wal);

    let engine = open_engine(tmp.path(), memtable_only_config());
    assert_eq!(get(&engine, b"dup_a"), Some(b"v1".to_vec()));
    assert_eq!(get(&engine, b"dup_b"), Some(b"v2".to_vec()));
    assert_eq!(get(&engine, b"dup_c"), Some(b"v3".to_vec()));
    // One application: exactly three sequences consumed.
    assert_eq!(engine.last_sequence(), base_sequence + 3);
    engine.close().unwrap();
}

/// # Scenario
/// A torn final record (crash mid-append) is discarded; everything
/// before it replays.
#[test]
fn torn_log_tail_is_tolerated() {
    let tmp = TempDir::new().unwrap();
    let env = env();
    {
        let engine = open_engine(tmp.path(), memtable_only_config());
        put(&engine, b"intact", b"yes");
        put(&engine, b"torn", b"partial");
        // Skip close(): leave the log as the only durable copy.
        engine.shutdown1().ok();
    }

    // Tear the last few bytes of the newest log.
    let mut log_ids: Vec<u32> = env
        .get_children(tmp.path())
        .unwrap()
        .iter()
        .filter_map(|n| match files::parse_file_name(n) {
            Some(files::FileKind::Log(id)) => Some(id),
            _ => None,
        })
        .collect();
    log_ids.sort_unstable();
    let path = tmp.path().join(format!("{:06}.log", log_ids.last().unwrap()));
    let len = std::fs::metadata(&path).unwrap().len();
    if len > 4 {
        std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(len - 4)
            .unwrap();
    }

    // Reopen must succeed regardless of where the tear landed.
    let engine = open_engine(tmp.path(), memtable_only_config());
    engine.close().unwrap();
}

/// # Scenario
/// Recovery of a log far larger than the write buffer spills to level-0
/// tables instead of growing one giant recovery memtable.
///
/// # Expected behavior
/// After reopen, table files exist (spills happened) and all data is
/// readable.
#[test]
fn oversized_log_recovery_spills_to_level0() {
    let tmp = TempDir::new().unwrap();
    let config = crate::config::DbConfig {
        tablet_id: 7,
        // Big enough that nothing rotates during the writes, and no dump
        // on shutdown, so the log stays the only durable copy.
        write_buffer_size: 1024 * 1024,
        dump_mem_on_shutdown: false,
        ..crate::config::DbConfig::default()
    };
    {
        let engine = open_engine(tmp.path(), config);
        for i in 0u32..300 {
            put(
                &engine,
                format!("bulk_{i:04}").as_bytes(),
                "w".repeat(100).as_bytes(),
            );
        }
        engine.close().unwrap();
    }

    // ...and small enough on reopen that replay must spill repeatedly.
    let small = crate::config::DbConfig {
        tablet_id: 7,
        write_buffer_size: 4096,
        ..crate::config::DbConfig::default()
    };
    let engine = Engine::open(Arc::clone(&env()), tmp.path(), small).unwrap();
    let l0 = engine
        .property("stratadb.num-files-at-level0")
        .unwrap()
        .parse::<usize>()
        .unwrap();
    assert!(l0 >= 2, "replay should have spilled multiple level-0 tables");
    for i in (0u32..300).step_by(37) {
        assert_eq!(
            get(&engine, format!("bulk_{i:04}").as_bytes()),
            Some("w".repeat(100).into_bytes())
        );
    }
    engine.close().unwrap();
}

/// # Scenario
/// A leftover `__init_load_filelock` marker (crashed first load) makes
/// the next open wipe partial state and rebuild cleanly.
#[test]
fn interrupted_first_load_retries_cleanly() {
    let tmp = TempDir::new().unwrap();
    let env = env();

    // Fabricate a crashed first load: marker plus a stray partial file.
    let mut marker = env
        .new_writable(&tmp.path().join(files::INIT_LOAD_MARKER))
        .unwrap();
    marker.sync().unwrap();
    drop(marker);
    let mut stray = env.new_writable(&tmp.path().join("000099.sst")).unwrap();
    stray.append(b"half-written garbage").unwrap();
    stray.sync().unwrap();
    drop(stray);

    let engine = open_engine(tmp.path(), memtable_only_config());
    put(&engine, b"fresh", b"start");
    assert_eq!(get(&engine, b"fresh"), Some(b"start".to_vec()));
    assert!(
        !env.file_exists(&tmp.path().join(files::INIT_LOAD_MARKER)),
        "marker must be consumed by a successful load"
    );
    assert!(
        !env.file_exists(&tmp.path().join("000099.sst")),
        "partial state must be wiped"
    );
    engine.close().unwrap();
}

/// # Scenario
/// A missing CURRENT on a *non-empty* directory is corruption — unless
/// the repair policy accepts data loss.
#[test]
fn missing_current_needs_repair_policy() {
    let tmp = TempDir::new().unwrap();
    let env = env();
    {
        let engine = open_engine(tmp.path(), memtable_only_config());
        put(&engine, b"k", b"v");
        engine.flush_memtable().unwrap();
        engine.close().unwrap();
    }
    env.delete_file(&files::current_file_path(tmp.path())).unwrap();

    // Without the repair policy: Corruption, not a silent fresh start.
    let plain = Engine::open(Arc::clone(&env), tmp.path(), memtable_only_config());
    assert!(matches!(
        plain,
        Err(crate::db::EngineError::Corruption(_))
    ));

    // With the repair policy (equivalently, an `__oops` marker): open
    // succeeds, accepting the loss of unreferenced tables.
    let config = crate::config::DbConfig {
        ignore_corruption_in_open: true,
        ..memtable_only_config()
    };
    let engine = open_engine(tmp.path(), config);
    engine.close().unwrap();
}

/// # Scenario
/// The on-disk `__oops` marker forces the corruption-tolerant open even
/// when the config flag is off.
#[test]
fn oops_marker_enables_repair() {
    let tmp = TempDir::new().unwrap();
    let env = env();
    {
        let engine = open_engine(tmp.path(), memtable_only_config());
        put(&engine, b"k", b"v");
        engine.flush_memtable().unwrap();
        engine.close().unwrap();
    }
    env.delete_file(&files::current_file_path(tmp.path())).unwrap();
    let mut marker = env
        .new_writable(&tmp.path().join(files::OOPS_MARKER))
        .unwrap();
    marker.sync().unwrap();
    drop(marker);

    let engine = open_engine(tmp.path(), memtable_only_config());
    engine.close().unwrap();
}
