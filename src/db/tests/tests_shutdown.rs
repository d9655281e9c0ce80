//! Two-phase shutdown: state transitions, memtable dumping, rejection of
//! operations past `Opened`, and full-close durability.

use tempfile::TempDir;

use crate::db::tests::helpers::*;
use crate::db::{EngineError, ReadOptions, WriteBatch};
use crate::files;

/// # Scenario
/// Phase 1 then phase 2 complete cleanly on an engine with buffered
/// writes; the dumped data is durable for the next open.
#[test]
fn two_phase_shutdown_dumps_memtable() {
    let tmp = TempDir::new().unwrap();
    {
        let engine = open_engine(tmp.path(), memtable_only_config());
        put(&engine, b"phase", b"one");
        engine.shutdown1().unwrap();
        engine.shutdown2().unwrap();
    }
    let engine = open_engine(tmp.path(), memtable_only_config());
    assert_eq!(get(&engine, b"phase"), Some(b"one".to_vec()));
    engine.close().unwrap();
}

/// # Scenario
/// Phase ordering is enforced: phase 2 before phase 1 is a caller
/// error, as is repeating phase 1.
#[test]
fn shutdown_phases_enforce_order() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), memtable_only_config());

    assert!(matches!(
        engine.shutdown2(),
        Err(EngineError::InvalidArgument(_))
    ));
    engine.shutdown1().unwrap();
    assert!(matches!(
        engine.shutdown1(),
        Err(EngineError::InvalidArgument(_))
    ));
    engine.shutdown2().unwrap();
    engine.close().unwrap();
}

/// # Scenario
/// After phase 1, reads and writes are rejected with a shutting-down
/// status instead of blocking or corrupting state.
#[test]
fn operations_rejected_after_shutdown1() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), memtable_only_config());
    put(&engine, b"k", b"v");
    engine.shutdown1().unwrap();

    let mut batch = WriteBatch::new();
    batch.put(b"late", b"write").unwrap();
    assert!(matches!(
        engine.write(batch),
        Err(EngineError::ShuttingDown)
    ));
    assert!(matches!(
        engine.get(b"k", &ReadOptions::default()),
        Err(EngineError::ShuttingDown)
    ));
    engine.shutdown2().unwrap();
    engine.close().unwrap();
}

/// # Scenario
/// `close` from `Opened` runs both phases itself and releases the
/// directory lock so a new engine can open immediately.
#[test]
fn close_runs_both_phases_and_releases_lock() {
    let tmp = TempDir::new().unwrap();
    {
        let engine = open_engine(tmp.path(), memtable_only_config());
        put(&engine, b"k", b"v");
        engine.close().unwrap();
    }
    // Lock must be free.
    let engine = open_engine(tmp.path(), memtable_only_config());
    assert_eq!(get(&engine, b"k"), Some(b"v".to_vec()));
    engine.close().unwrap();
}

/// # Scenario
/// With `dump_mem_on_shutdown` disabled, shutdown leaves the memtable in
/// the log only; recovery replays it.
#[test]
fn shutdown_without_dump_relies_on_log() {
    let tmp = TempDir::new().unwrap();
    let config = crate::config::DbConfig {
        tablet_id: 7,
        dump_mem_on_shutdown: false,
        ..memtable_only_config()
    };
    {
        let engine = open_engine(tmp.path(), config.clone());
        put(&engine, b"logged", b"only");
        engine.close().unwrap();
        // No dump happened: no table file exists yet.
        let has_table = env()
            .get_children(tmp.path())
            .unwrap()
            .iter()
            .any(|n| matches!(files::parse_file_name(n), Some(files::FileKind::Table(_))));
        assert!(!has_table);
    }
    let engine = open_engine(tmp.path(), config);
    assert_eq!(get(&engine, b"logged"), Some(b"only".to_vec()));
    engine.close().unwrap();
}

/// # Scenario
/// A second engine cannot open a directory whose lock is held.
#[test]
fn directory_lock_is_exclusive() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), memtable_only_config());

    let second = crate::db::Engine::open(env(), tmp.path(), memtable_only_config());
    assert!(second.is_err());

    engine.close().unwrap();
}
