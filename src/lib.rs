//! # StrataDB
//!
//! An embeddable, **leveled LSM** storage engine built to serve one
//! tablet of a wide-column store: snapshot-isolated reads, rollback
//! points, TTL-aware compaction statistics, and parallel sub-compaction.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stratadb::{Db, DbConfig};
//!
//! let db = Db::open("/tmp/tablet-0001", DbConfig::default()).unwrap();
//!
//! // Write
//! db.put(b"row/cf:qualifier", b"value").unwrap();
//!
//! // Read
//! assert_eq!(db.get(b"row/cf:qualifier").unwrap(), Some(b"value".to_vec()));
//!
//! // Snapshot-isolated read
//! let snap = db.snapshot();
//! db.put(b"row/cf:qualifier", b"newer").unwrap();
//! assert_eq!(
//!     db.get_at(b"row/cf:qualifier", snap).unwrap(),
//!     Some(b"value".to_vec())
//! );
//! db.release_snapshot(snap).unwrap();
//!
//! // Graceful shutdown
//! db.close().unwrap();
//! ```
//!
//! ## Features
//!
//! - **Write-ahead logging** — every batch is persisted before it is
//!   applied, and recovery replays logs idempotently.
//! - **Versioned file metadata** — an immutable manifest of level file
//!   lists, transitioned by durable edits; crash-atomic by construction.
//! - **Leveled compaction** — score-driven background merging with
//!   trivial moves, grandparent-bounded outputs, and parallel
//!   sub-compaction workers.
//! - **Snapshots and rollback** — fixed-sequence read cursors that
//!   compaction respects, plus administrative rollback intervals.
//! - **Two-phase shutdown** — quiesce first, finalise later, the way a
//!   cluster controller unloads a tablet.

pub mod compaction;
pub mod config;
pub mod db;
pub mod encoding;
pub mod env;
pub mod files;
pub mod keys;
pub mod memtable;
pub mod sstable;
pub mod version;
pub mod wal;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::info;

use db::Engine;

pub use config::{CompactStrategyKind, DbConfig, NUM_LEVELS};
pub use db::{
    BatchError, DbState, EngineError, ReadOptions, ScanOptions, ScanResult, WriteBatch,
};
pub use env::{Env, EnvRef, LocalEnv};
pub use keys::SequenceNumber;

/// A single key-value pair returned by [`Db::scan`].
pub type KeyValue = (Vec<u8>, Vec<u8>);

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Db`] operations.
#[derive(Debug, Error)]
pub enum DbError {
    /// The database has been closed.
    #[error("database is closed")]
    Closed,

    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Batch construction error.
    #[error("{0}")]
    Batch(#[from] BatchError),

    /// An engine-internal error occurred.
    #[error("{0}")]
    Engine(#[from] EngineError),
}

// ------------------------------------------------------------------------------------------------
// Config validation
// ------------------------------------------------------------------------------------------------

fn validate(config: &DbConfig) -> Result<(), DbError> {
    if config.write_buffer_size < 1024 {
        return Err(DbError::InvalidConfig(
            "write_buffer_size must be >= 1024".into(),
        ));
    }
    if config.max_file_size < 4096 {
        return Err(DbError::InvalidConfig(
            "max_file_size must be >= 4096".into(),
        ));
    }
    if config.l0_slowdown_writes_trigger < config.l0_compaction_trigger {
        return Err(DbError::InvalidConfig(
            "l0_slowdown_writes_trigger must be >= l0_compaction_trigger".into(),
        ));
    }
    if config.l0_stop_writes_trigger < config.l0_slowdown_writes_trigger {
        return Err(DbError::InvalidConfig(
            "l0_stop_writes_trigger must be >= l0_slowdown_writes_trigger".into(),
        ));
    }
    if config.max_mem_compact_level >= NUM_LEVELS {
        return Err(DbError::InvalidConfig(format!(
            "max_mem_compact_level must be < {NUM_LEVELS}"
        )));
    }
    if config.max_background_compactions < 1 {
        return Err(DbError::InvalidConfig(
            "max_background_compactions must be >= 1".into(),
        ));
    }
    if config.max_sub_compactions < 1 {
        return Err(DbError::InvalidConfig(
            "max_sub_compactions must be >= 1".into(),
        ));
    }
    if config.ttl_percentage > 100 {
        return Err(DbError::InvalidConfig(
            "ttl_percentage must be <= 100".into(),
        ));
    }
    if config.parent_tablets.len() > 2 {
        return Err(DbError::InvalidConfig(
            "at most 2 parent tablets are supported".into(),
        ));
    }
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Database handle
// ------------------------------------------------------------------------------------------------

/// The per-tablet database handle.
///
/// Thread-safe: share it across threads via `Arc<Db>`. All reads merge
/// the active memtable, the immutable memtable, and the current version's
/// level files; all writes serialise through the engine's writer queue.
///
/// # Shutdown
///
/// [`Db::close`] runs both shutdown phases. A controller that wants to
/// quiesce the tablet before finalising it calls [`Db::shutdown1`] and
/// [`Db::shutdown2`] explicitly. Dropping the handle without closing
/// attempts cleanup but swallows errors.
pub struct Db {
    engine: Engine,
    closed: AtomicBool,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Db {
    /// Opens (or recovers) the tablet database at `path` on local disk.
    ///
    /// # Errors
    ///
    /// [`DbError::InvalidConfig`] for out-of-range parameters;
    /// [`EngineError::Corruption`] when CURRENT/manifest state is
    /// inconsistent and no repair policy is enabled; transient I/O errors
    /// pass through for the caller to retry the open.
    pub fn open(path: impl AsRef<Path>, config: DbConfig) -> Result<Self, DbError> {
        Self::open_with_env(LocalEnv::shared(), path, config)
    }

    /// Opens with an explicit storage backend (DFS adapter, test
    /// environment, ...).
    pub fn open_with_env(
        env: EnvRef,
        path: impl AsRef<Path>,
        config: DbConfig,
    ) -> Result<Self, DbError> {
        validate(&config)?;
        let engine = Engine::open(env, path.as_ref(), config)?;
        info!(path = %path.as_ref().display(), "database opened");
        Ok(Self {
            engine,
            closed: AtomicBool::new(false),
        })
    }

    // --------------------------------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------------------------------

    /// Inserts or updates one key.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), DbError> {
        self.check_open()?;
        let mut batch = WriteBatch::new();
        batch.put(key, value)?;
        Ok(self.engine.write(batch)?)
    }

    /// Deletes one key (writes a deletion marker).
    pub fn delete(&self, key: &[u8]) -> Result<(), DbError> {
        self.check_open()?;
        let mut batch = WriteBatch::new();
        batch.delete(key)?;
        Ok(self.engine.write(batch)?)
    }

    /// Commits a batch atomically: the batch occupies one contiguous
    /// range of sequence numbers, logged as a single record.
    pub fn write(&self, batch: WriteBatch) -> Result<(), DbError> {
        self.check_open()?;
        Ok(self.engine.write(batch)?)
    }

    // --------------------------------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------------------------------

    /// Reads the newest visible value for `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        self.check_open()?;
        Ok(self.engine.get(key, &ReadOptions::default())?)
    }

    /// Reads `key` as of snapshot `snapshot`.
    pub fn get_at(
        &self,
        key: &[u8],
        snapshot: SequenceNumber,
    ) -> Result<Option<Vec<u8>>, DbError> {
        self.check_open()?;
        let opts = ReadOptions {
            snapshot: Some(snapshot),
            ..ReadOptions::default()
        };
        Ok(self.engine.get(key, &opts)?)
    }

    /// Reads with explicit options (snapshot, deadline).
    pub fn get_with(&self, key: &[u8], opts: &ReadOptions) -> Result<Option<Vec<u8>>, DbError> {
        self.check_open()?;
        Ok(self.engine.get(key, opts)?)
    }

    /// Scans live pairs in `[start, end)` (`end` empty = unbounded),
    /// bounded by the default result limits. Resume with
    /// [`ScanResult::next_start_key`] when `complete` is false.
    pub fn scan(&self, start: &[u8], end: &[u8]) -> Result<ScanResult, DbError> {
        self.scan_with(start, end, &ScanOptions::default())
    }

    /// Scans with explicit options (snapshot, deadline, limits).
    pub fn scan_with(
        &self,
        start: &[u8],
        end: &[u8],
        opts: &ScanOptions,
    ) -> Result<ScanResult, DbError> {
        self.check_open()?;
        Ok(self.engine.scan(start, end, opts)?)
    }

    // --------------------------------------------------------------------------------------------
    // Snapshots and rollback
    // --------------------------------------------------------------------------------------------

    /// Registers a snapshot at the latest committed sequence and returns
    /// its handle.
    pub fn snapshot(&self) -> SequenceNumber {
        self.engine.snapshot()
    }

    /// Registers a snapshot at an explicit committed sequence.
    pub fn snapshot_at(&self, seq: SequenceNumber) -> Result<SequenceNumber, DbError> {
        self.check_open()?;
        Ok(self.engine.snapshot_at(seq)?)
    }

    /// Releases a snapshot handle.
    pub fn release_snapshot(&self, seq: SequenceNumber) -> Result<(), DbError> {
        Ok(self.engine.release_snapshot(seq)?)
    }

    /// Rolls back everything committed after `snapshot_seq` up to and
    /// including `rollback_point`: those sequences become invisible to
    /// reads and are dropped by compaction.
    pub fn rollback(
        &self,
        snapshot_seq: SequenceNumber,
        rollback_point: SequenceNumber,
    ) -> Result<SequenceNumber, DbError> {
        self.check_open()?;
        Ok(self.engine.rollback(snapshot_seq, rollback_point)?)
    }

    /// Latest committed sequence number.
    pub fn last_sequence(&self) -> SequenceNumber {
        self.engine.last_sequence()
    }

    // --------------------------------------------------------------------------------------------
    // Maintenance
    // --------------------------------------------------------------------------------------------

    /// Flushes the memtable and compacts all levels overlapping
    /// `[begin, end]` (`None` = unbounded). Blocking.
    pub fn compact_range(
        &self,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<(), DbError> {
        self.check_open()?;
        Ok(self.engine.compact_range(begin, end)?)
    }

    /// Forces the active memtable to disk and waits for the flush.
    pub fn flush(&self) -> Result<(), DbError> {
        self.check_open()?;
        Ok(self.engine.flush_memtable()?)
    }

    /// Engine properties: `stratadb.num-files-at-level<N>`,
    /// `stratadb.stats`, `stratadb.compaction_error` (query-and-reset).
    pub fn property(&self, name: &str) -> Option<String> {
        self.engine.property(name)
    }

    /// Suggests a midpoint user key for splitting this tablet, by
    /// cumulative on-disk size.
    pub fn suggest_split_key(&self) -> Option<Vec<u8>> {
        self.engine.suggest_split_key()
    }

    /// True when a fatal storage error has latched and the serving layer
    /// should force-unload this tablet.
    pub fn should_force_unload(&self) -> bool {
        self.engine.should_force_unload()
    }

    // --------------------------------------------------------------------------------------------
    // Shutdown
    // --------------------------------------------------------------------------------------------

    /// Phase-1 shutdown: stop and drain background compactions,
    /// optionally dumping the memtable. Reads and writes are rejected
    /// afterwards.
    pub fn shutdown1(&self) -> Result<(), DbError> {
        Ok(self.engine.shutdown1()?)
    }

    /// Phase-2 shutdown: flush whatever phase 1 left behind.
    pub fn shutdown2(&self) -> Result<(), DbError> {
        Ok(self.engine.shutdown2()?)
    }

    /// Gracefully shuts down: both phases, worker join, lock release.
    /// Idempotent.
    pub fn close(&self) -> Result<(), DbError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(()); // already closed
        }
        self.engine.close()?;
        info!("database closed");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------------------------------

    fn check_open(&self) -> Result<(), DbError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DbError::Closed);
        }
        Ok(())
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            let _ = self.engine.close();
        }
    }
}
