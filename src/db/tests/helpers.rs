use crate::config::DbConfig;
use crate::db::Engine;
use crate::env::{EnvRef, LocalEnv};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times — only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Large write buffer — no rotation or flush is ever triggered.
pub fn memtable_only_config() -> DbConfig {
    init_tracing();
    DbConfig {
        tablet_id: 7,
        write_buffer_size: 4 * 1024 * 1024,
        ..DbConfig::default()
    }
}

/// Small write buffer that rotates and flushes quickly.
pub fn small_buffer_config() -> DbConfig {
    init_tracing();
    DbConfig {
        tablet_id: 7,
        write_buffer_size: 2048,
        max_file_size: 16 * 1024,
        ..DbConfig::default()
    }
}

/// Opens an engine on local disk at `dir`.
pub fn open_engine(dir: &std::path::Path, config: DbConfig) -> Engine {
    Engine::open(LocalEnv::shared(), dir, config).expect("open engine")
}

/// Local-disk Env handle for direct file manipulation in tests.
pub fn env() -> EnvRef {
    LocalEnv::shared()
}

/// Writes one key through a single-entry batch.
pub fn put(engine: &Engine, key: &[u8], value: &[u8]) {
    let mut batch = crate::db::WriteBatch::new();
    batch.put(key, value).unwrap();
    engine.write(batch).unwrap();
}

/// Deletes one key through a single-entry batch.
pub fn delete(engine: &Engine, key: &[u8]) {
    let mut batch = crate::db::WriteBatch::new();
    batch.delete(key).unwrap();
    engine.write(batch).unwrap();
}

/// Point read at the latest sequence.
pub fn get(engine: &Engine, key: &[u8]) -> Option<Vec<u8>> {
    engine.get(key, &crate::db::ReadOptions::default()).unwrap()
}
