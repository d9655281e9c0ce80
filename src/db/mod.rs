//! The engine core — write path, rotation, recovery, and background
//! compaction scheduling for one tablet.
//!
//! ## State machine
//!
//! `NotOpen → Opened → Shutdown1 → Shutdown2 → Closed`. Only `Opened`
//! accepts reads and writes. Shutdown is two-phase so a cluster
//! controller can quiesce a tablet (phase 1: drain background work,
//! optionally dump the memtable) and finalise it later (phase 2: flush
//! whatever remains) without holding locks across a network round-trip.
//!
//! ## Locking
//!
//! One global mutex guards engine metadata: the version set, memtable
//! pointers, snapshot and rollback state, pending-output numbers, and the
//! background-error latch. Long I/O — table builds, compaction merges,
//! log appends, directory sweeps — always runs with the lock released,
//! re-acquiring only to update shared state. Memtables and versions are
//! `Arc`-shared, so readers clone handles under the lock and read without
//! it.
//!
//! ## Write path
//!
//! Writers serialise through the FIFO [`write_queue`]: the head writer
//! makes room (possibly delaying, waiting, or rotating the memtable),
//! appends one log record for its batch, applies the batch to the active
//! memtable with the lock released, and finally advances the committed
//! sequence. At most one memtable is active and at most one immutable at
//! any time — a third cannot exist until the immutable one is flushed,
//! which bounds memory and provides write backpressure.

pub mod batch;
mod scheduler;
mod snapshot;
mod write_queue;

#[cfg(test)]
mod tests;

pub use batch::{BatchEntry, BatchError, WriteBatch};

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::compaction::{
    Compaction, CompactionStats, executor::CompactionError, run_compaction,
};
use crate::config::{DbConfig, NUM_LEVELS};
use crate::env::{EnvRef, FileLock};
use crate::files::{self, FileKind};
use crate::keys::{
    InternalKey, LookupKey, MAX_SEQUENCE, RollbackMap, SequenceNumber, ValueType,
};
use crate::memtable::{MemGetResult, MemTable, MemtableError};
use crate::sstable::{TableBuilder, TableBuilderOptions, TableError};
use crate::version::{
    FileMetaData, VersionEdit, VersionError, VersionGetResult, VersionSet, set as version_set,
};
use crate::wal::{self, Wal, WalError};

use batch::LogRecord;
use scheduler::{Job, PriorityPool, TaskId};
use snapshot::SnapshotList;
use write_queue::WriteQueue;

// Background scheduling scores. Memtable dumps outrank manual
// compactions, which outrank any size-triggered score.
const DUMP_MEM_SCORE: f64 = 10.0;
const MANUAL_COMPACT_SCORE: f64 = 5.0;
const URGENT_SCORE: f64 = 100.0;

/// Scans return at most this many pairs per call unless the caller asks
/// for fewer.
const DEFAULT_SCAN_LIMIT: usize = 1 << 16;

// ------------------------------------------------------------------------------------------------
// Errors
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Transient storage failure — retryable by the caller.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Log subsystem failure.
    #[error("Log error: {0}")]
    Wal(#[from] WalError),

    /// Memtable failure.
    #[error("Memtable error: {0}")]
    Memtable(#[from] MemtableError),

    /// Table read/build failure.
    #[error("Table error: {0}")]
    Table(#[from] TableError),

    /// Version/manifest failure.
    #[error("Version error: {0}")]
    Version(#[from] VersionError),

    /// Compaction execution failure.
    #[error("Compaction error: {0}")]
    Compaction(#[from] CompactionError),

    /// Persistent state is inconsistent.
    #[error("Corruption: {0}")]
    Corruption(String),

    /// A read or scan exceeded its deadline.
    #[error("operation timed out")]
    TimedOut,

    /// The latched background error, yielded to writers under
    /// `paranoid_checks`.
    #[error("background error: {0}")]
    Background(String),

    /// The engine is past `Opened` and no longer accepts this operation.
    #[error("engine is shutting down")]
    ShuttingDown,

    /// Caller programming error.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Walks an error chain looking for a permission-denied I/O failure —
/// the one storage error treated as fatal for the tablet.
fn is_permission_denied(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut cursor: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = cursor {
        if let Some(io_err) = e.downcast_ref::<io::Error>()
            && io_err.kind() == io::ErrorKind::PermissionDenied
        {
            return true;
        }
        cursor = e.source();
    }
    false
}

// ------------------------------------------------------------------------------------------------
// Read/scan options
// ------------------------------------------------------------------------------------------------

/// Options for point reads.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Read at this snapshot; `None` = latest committed sequence.
    pub snapshot: Option<SequenceNumber>,
    /// Deadline budget; `None` = unbounded.
    pub timeout: Option<Duration>,
}

/// Options for range scans.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Read at this snapshot; `None` = latest committed sequence.
    pub snapshot: Option<SequenceNumber>,
    /// Deadline budget; on expiry the scan returns what it has with
    /// `timed_out` set.
    pub timeout: Option<Duration>,
    /// Upper bound on returned pairs.
    pub max_results: usize,
    /// Upper bound on returned key+value bytes.
    pub max_bytes: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            snapshot: None,
            timeout: None,
            max_results: DEFAULT_SCAN_LIMIT,
            max_bytes: 8 * 1024 * 1024,
        }
    }
}

/// Result of one resumable scan call.
#[derive(Debug, Default)]
pub struct ScanResult {
    /// Live pairs in ascending key order.
    pub pairs: Vec<(Vec<u8>, Vec<u8>)>,
    /// True when the whole requested range was covered.
    pub complete: bool,
    /// Where to resume when `complete` is false.
    pub next_start_key: Option<Vec<u8>>,
    /// True when the scan stopped because its deadline elapsed.
    pub timed_out: bool,
}

// ------------------------------------------------------------------------------------------------
// Engine state
// ------------------------------------------------------------------------------------------------

/// Lifecycle state of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbState {
    /// Constructed but not yet recovered.
    NotOpen,
    /// Serving reads and writes.
    Opened,
    /// Phase-1 shutdown: background work drained, memtable optionally
    /// dumped.
    Shutdown1,
    /// Phase-2 shutdown: remaining state flushed.
    Shutdown2,
    /// Fully closed.
    Closed,
}

/// A pending manual (explicit key-range) compaction.
struct ManualCompaction {
    level: usize,
    begin: Option<InternalKey>,
    end: Option<InternalKey>,
    done: bool,
    /// Set while an overlapping automatic compaction is in flight; the
    /// manual request retries once it drains.
    in_conflict: bool,
}

struct BgTask {
    id: TaskId,
    score: f64,
}

struct EngineInner {
    state: DbState,
    versions: VersionSet,

    mem: Arc<MemTable>,
    imm: Option<Arc<MemTable>>,

    log: Option<Arc<Wal<LogRecord>>>,
    /// Packed number of the active data log.
    log_number: u64,

    snapshots: SnapshotList,
    rollbacks: RollbackMap,

    /// Output files being written by in-flight compactions; spared by GC.
    pending_outputs: HashSet<u64>,

    /// Latched fatal background error; disables compaction permanently.
    bg_error: Option<Arc<EngineError>>,
    /// Last background failure, consumed by the compaction-error
    /// property.
    last_compaction_error: Option<String>,
    consecutive_errors: u64,

    /// Scheduled-but-unfinished background jobs.
    bg_tasks: Vec<BgTask>,

    manual: Option<ManualCompaction>,
    /// User-key ranges of compactions currently merging (for manual
    /// conflict detection).
    running_compactions: Vec<(usize, Vec<u8>, Vec<u8>)>,

    /// Per-output-level compaction counters.
    stats: Vec<CompactionStats>,
}

struct Shared {
    env: EnvRef,
    dir: PathBuf,
    config: DbConfig,
    inner: Mutex<EngineInner>,
    /// Signalled on flush/compaction completion and state changes; waited
    /// on by rotation backpressure, manual compaction, and shutdown.
    bg_cv: Condvar,
    write_queue: WriteQueue,
    pool: PriorityPool,
    shutting_down: AtomicBool,
    _dir_lock: Mutex<Option<Box<dyn FileLock>>>,
}

/// The per-tablet storage engine.
///
/// Cloneable handle; all clones share one engine.
pub(crate) struct Engine {
    shared: Arc<Shared>,
}

impl Clone for Engine {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Pops the head writer and promotes the next on every exit path.
struct PromoteGuard<'a> {
    queue: &'a WriteQueue,
}

impl Drop for PromoteGuard<'_> {
    fn drop(&mut self) {
        self.queue.pop_and_promote();
    }
}

impl Engine {
    fn lock(&self) -> MutexGuard<'_, EngineInner> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    // --------------------------------------------------------------------------------------------
    // Open / recovery
    // --------------------------------------------------------------------------------------------

    /// Opens (or recovers) the engine for one tablet directory.
    pub(crate) fn open(
        env: EnvRef,
        dir: impl Into<PathBuf>,
        config: DbConfig,
    ) -> Result<Engine, EngineError> {
        let dir = dir.into();
        env.create_dir_all(&dir)?;
        let dir_lock = env.lock_file(&dir.join(files::LOCK_FILE))?;

        // A leftover first-load marker means the previous load died before
        // committing; wipe the partial state and retry the load cleanly.
        let init_marker = dir.join(files::INIT_LOAD_MARKER);
        if env.file_exists(&init_marker) {
            warn!(dir = %dir.display(), "detected interrupted first load; clearing partial state");
            wipe_tablet_files(&env, &dir)?;
        }

        let repair = config.ignore_corruption_in_open
            || env.file_exists(&dir.join(files::OOPS_MARKER));

        let mut versions = VersionSet::new(Arc::clone(&env), dir.clone(), config.clone());
        let fresh = !env.file_exists(&files::current_file_path(&dir));

        if fresh {
            // Distinguish a true first load from a lost CURRENT: a
            // directory that already holds tablet files without a CURRENT
            // pointer is corrupt, not new.
            let has_engine_files = env.get_children(&dir)?.iter().any(|name| {
                matches!(
                    files::parse_file_name(name),
                    Some(FileKind::Manifest(_) | FileKind::Table(_) | FileKind::Log(_))
                )
            });
            if has_engine_files {
                if !repair {
                    return Err(EngineError::Corruption(
                        "CURRENT file missing but tablet files exist".into(),
                    ));
                }
                // Repair policy: accept the loss, start a fresh manifest;
                // surviving logs still replay below, orphaned tables are
                // garbage-collected.
                error!(dir = %dir.display(), "CURRENT missing; repairing with data loss");
                versions.create_new()?;
            } else {
                // First load runs as a marked transaction: marker in,
                // build state, marker out. A crash in between is detected
                // above.
                let mut marker = env.new_writable(&init_marker)?;
                marker.sync()?;
                drop(marker);

                versions.create_new()?;
                if !config.parent_tablets.is_empty() {
                    import_parent_files(&env, &mut versions, &config)?;
                }

                env.delete_file(&init_marker)?;
                env.sync_dir(&dir)?;
            }
        } else {
            match versions.recover() {
                Ok(()) => {}
                Err(VersionError::Corruption(msg)) if repair => {
                    // Data loss accepted by policy; start from empty.
                    error!(dir = %dir.display(), %msg, "corrupt manifest; opening empty by repair policy");
                    versions = VersionSet::new(Arc::clone(&env), dir.clone(), config.clone());
                    versions.create_new()?;
                }
                Err(VersionError::Corruption(msg)) => {
                    return Err(EngineError::Corruption(msg));
                }
                // IOError (incl. timeouts) stays retryable: the caller
                // should retry the open, not declare data loss.
                Err(e) => return Err(e.into()),
            }
        }

        // Replay data logs into a dedicated recovery memtable, spilling to
        // level 0 whenever it outgrows the write buffer so recovery memory
        // stays bounded for arbitrarily large logs.
        let mem = replay_log_files(&env, &dir, &config, &mut versions)?;

        // Fresh log for the new lifetime.
        let log_number = versions.new_file_number();
        let log = Wal::<LogRecord>::create(&env, files::log_file_path(&dir, log_number), log_number)?;
        let mut edit = VersionEdit::new();
        edit.log_number = Some(log_number);
        versions.log_and_apply(&mut edit)?;

        let inner = EngineInner {
            state: DbState::Opened,
            versions,
            mem: Arc::new(mem),
            imm: None,
            log: Some(Arc::new(log)),
            log_number,
            snapshots: SnapshotList::new(),
            rollbacks: RollbackMap::new(),
            pending_outputs: HashSet::new(),
            bg_error: None,
            last_compaction_error: None,
            consecutive_errors: 0,
            bg_tasks: Vec::new(),
            manual: None,
            running_compactions: Vec::new(),
            stats: vec![CompactionStats::default(); NUM_LEVELS],
        };

        let engine = Engine {
            shared: Arc::new(Shared {
                env,
                dir,
                pool: PriorityPool::new(config.max_background_compactions.max(1)),
                config,
                inner: Mutex::new(inner),
                bg_cv: Condvar::new(),
                write_queue: WriteQueue::new(),
                shutting_down: AtomicBool::new(false),
                _dir_lock: Mutex::new(Some(dir_lock)),
            }),
        };

        engine.remove_obsolete_files();
        {
            let mut inner = engine.lock();
            engine.maybe_schedule_compaction(&mut inner);
        }
        info!(dir = %engine.shared.dir.display(), "engine opened");
        Ok(engine)
    }

    // --------------------------------------------------------------------------------------------
    // Write path
    // --------------------------------------------------------------------------------------------

    /// Commits one batch: queue position → room → log → memtable →
    /// sequence advance.
    pub(crate) fn write(&self, batch: WriteBatch) -> Result<(), EngineError> {
        if batch.is_empty() {
            return Ok(());
        }

        let (promoted, is_head) = self.shared.write_queue.submit();
        if !is_head {
            // Cooperative block until this writer reaches the queue head.
            promoted
                .recv()
                .map_err(|_| EngineError::Internal("writer queue disconnected".into()))?;
        }
        let _promote = PromoteGuard {
            queue: &self.shared.write_queue,
        };

        let inner = self.lock();
        if inner.state != DbState::Opened {
            return Err(EngineError::ShuttingDown);
        }
        let mut inner = self.make_room_for_write(inner, false)?;

        let first_sequence = inner.versions.last_sequence() + 1;
        let mem = Arc::clone(&inner.mem);
        let log = inner
            .log
            .clone()
            .ok_or_else(|| EngineError::Internal("no active log".into()))?;
        drop(inner);

        // Queue-head position excludes every other writer, so the log
        // append and memtable inserts run without the engine lock.
        let record = LogRecord {
            first_sequence,
            entries: batch.entries.clone(),
        };
        log.append(&record)?;

        for (i, entry) in batch.entries.iter().enumerate() {
            mem.add(first_sequence + i as u64, entry.kind, &entry.key, &entry.value)?;
        }

        let mut inner = self.lock();
        inner
            .versions
            .set_last_sequence(first_sequence + batch.len() as u64 - 1);
        drop(inner);
        Ok(())
    }

    /// Room-making loop run by the queue-head writer.
    ///
    /// Invariant on return: either an error is yielded, or the active
    /// memtable has room and no rotation is pending — `imm` may be
    /// non-`None`, but then the active memtable is *not* full.
    fn make_room_for_write<'a>(
        &'a self,
        mut inner: MutexGuard<'a, EngineInner>,
        mut force: bool,
    ) -> Result<MutexGuard<'a, EngineInner>, EngineError> {
        let config = &self.shared.config;
        let mut allow_delay = !force;

        loop {
            if let Some(err) = &inner.bg_error {
                if config.paranoid_checks {
                    return Err(EngineError::Background(err.to_string()));
                }
                if is_permission_denied(err.as_ref()) {
                    return Err(EngineError::Background(err.to_string()));
                }
            }

            if allow_delay
                && inner.versions.num_level_files(0) >= config.l0_slowdown_writes_trigger
            {
                // Near the level-0 hard limit: delay this write 1 ms once
                // instead of stalling for seconds at the stop trigger,
                // smoothing latency and ceding CPU to compaction.
                drop(inner);
                std::thread::sleep(Duration::from_millis(1));
                allow_delay = false;
                inner = self.lock();
                continue;
            }

            if self.shared.shutting_down.load(Ordering::Acquire) {
                return Err(EngineError::ShuttingDown);
            }

            if !force
                && inner.mem.approximate_memory_usage() <= config.write_buffer_size
            {
                break; // room in the active memtable
            }

            if inner.imm.is_some() {
                // Previous rotation not yet flushed; a third memtable
                // cannot exist. Wait for the flush to signal.
                debug!("active memtable full; waiting on immutable flush");
                inner = self
                    .shared
                    .bg_cv
                    .wait(inner)
                    .unwrap_or_else(|e| e.into_inner());
                continue;
            }

            if inner.versions.num_level_files(0) >= config.l0_stop_writes_trigger {
                warn!("too many level-0 files; stalling writes");
                inner = self
                    .shared
                    .bg_cv
                    .wait(inner)
                    .unwrap_or_else(|e| e.into_inner());
                continue;
            }

            // Rotate: active becomes immutable, fresh memtable + log.
            let new_log_number = inner.versions.new_file_number();
            drop(inner);
            // Log creation is an Env call — never under the engine lock.
            // Only the queue head rotates, so nothing races this gap.
            let new_log = Wal::<LogRecord>::create(
                &self.shared.env,
                files::log_file_path(&self.shared.dir, new_log_number),
                new_log_number,
            )?;
            inner = self.lock();

            let old_mem = std::mem::replace(&mut inner.mem, Arc::new(MemTable::new()));
            old_mem.mark_immutable();
            inner.imm = Some(old_mem);
            inner.log = Some(Arc::new(new_log));
            inner.log_number = new_log_number;
            debug!(log_number = new_log_number, "rotated memtable");

            force = false; // one rotation satisfies a forced flush
            self.maybe_schedule_compaction(&mut inner);
        }
        Ok(inner)
    }

    // --------------------------------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------------------------------

    /// Point lookup at a snapshot (explicit or latest), honoring rollback
    /// filtering and the optional deadline.
    pub(crate) fn get(
        &self,
        key: &[u8],
        opts: &ReadOptions,
    ) -> Result<Option<Vec<u8>>, EngineError> {
        if key.is_empty() {
            return Err(EngineError::InvalidArgument("key must not be empty".into()));
        }
        let deadline = opts.timeout.map(|t| Instant::now() + t);

        // Clone handles under the lock, then merge without it.
        let inner = self.lock();
        if inner.state != DbState::Opened {
            return Err(EngineError::ShuttingDown);
        }
        let snapshot = opts.snapshot.unwrap_or_else(|| inner.versions.last_sequence());
        let mem = Arc::clone(&inner.mem);
        let imm = inner.imm.clone();
        let version = inner.versions.current();
        let cache = inner.versions.table_cache();
        let rollbacks = inner.rollbacks.clone();
        drop(inner);

        let lookup = LookupKey::new(key.to_vec(), snapshot);

        match mem.get(&lookup, &rollbacks)? {
            MemGetResult::Found(v) => return Ok(Some(v)),
            MemGetResult::Deleted => return Ok(None),
            MemGetResult::NotFound => {}
        }
        check_deadline(deadline)?;

        if let Some(imm) = imm {
            match imm.get(&lookup, &rollbacks)? {
                MemGetResult::Found(v) => return Ok(Some(v)),
                MemGetResult::Deleted => return Ok(None),
                MemGetResult::NotFound => {}
            }
            check_deadline(deadline)?;
        }

        match version.get(&cache, &lookup, &rollbacks)? {
            VersionGetResult::Found(v) => Ok(Some(v)),
            VersionGetResult::Deleted | VersionGetResult::NotFound => Ok(None),
        }
    }

    /// Resumable range scan over `[start, end)`.
    pub(crate) fn scan(
        &self,
        start: &[u8],
        end: &[u8],
        opts: &ScanOptions,
    ) -> Result<ScanResult, EngineError> {
        if start.is_empty() {
            return Err(EngineError::InvalidArgument(
                "start key must not be empty".into(),
            ));
        }
        if !end.is_empty() && start >= end {
            return Ok(ScanResult {
                complete: true,
                ..ScanResult::default()
            });
        }
        let deadline = opts.timeout.map(|t| Instant::now() + t);

        let inner = self.lock();
        if inner.state != DbState::Opened {
            return Err(EngineError::ShuttingDown);
        }
        let snapshot = opts.snapshot.unwrap_or_else(|| inner.versions.last_sequence());
        let mem = Arc::clone(&inner.mem);
        let imm = inner.imm.clone();
        let version = inner.versions.current();
        let cache = inner.versions.table_cache();
        let rollbacks = inner.rollbacks.clone();
        drop(inner);

        let in_range = |user_key: &[u8]| {
            user_key >= start && (end.is_empty() || user_key < end)
        };

        // Materialise each layer's in-range entries while the handles are
        // alive; the sources own their data past this point.
        let mut entries: Vec<(InternalKey, Vec<u8>)> = Vec::new();
        for (k, v) in mem.iter()? {
            if in_range(&k.user_key) {
                entries.push((k, v));
            }
        }
        if let Some(imm) = &imm {
            for (k, v) in imm.iter()? {
                if in_range(&k.user_key) {
                    entries.push((k, v));
                }
            }
        }
        let start_probe = InternalKey::max_for_key(start.to_vec());
        for level in 0..NUM_LEVELS {
            for file in version.files(level) {
                if file.largest.user_key.as_slice() < start
                    || (!end.is_empty() && file.smallest.user_key.as_slice() >= end)
                {
                    continue;
                }
                let table = cache.get(file.number)?;
                let mut iter = table.iter();
                iter.seek(&start_probe);
                for (k, v) in iter.by_ref() {
                    if !end.is_empty() && k.user_key.as_slice() >= end {
                        break;
                    }
                    entries.push((k, v));
                }
                iter.into_status()?;
            }
        }
        entries.sort();

        // Visibility: newest visible version per user key; deletion
        // markers suppress the key.
        let mut result = ScanResult::default();
        let mut bytes = 0usize;
        let mut current_key: Option<Vec<u8>> = None;
        let mut iter = entries.into_iter().peekable();

        while let Some((key, value)) = iter.next() {
            if current_key.as_deref() == Some(key.user_key.as_slice()) {
                continue; // older version of an already-decided key
            }
            if key.sequence > snapshot || rollbacks.should_drop(key.sequence) {
                continue; // invisible at this snapshot; try older versions
            }
            current_key = Some(key.user_key.clone());

            if let Some(d) = deadline
                && Instant::now() >= d
            {
                result.complete = false;
                result.timed_out = true;
                result.next_start_key = Some(key.user_key.clone());
                return Ok(result);
            }

            if key.kind == ValueType::Deletion {
                continue;
            }

            bytes += key.user_key.len() + value.len();
            result.pairs.push((key.user_key.clone(), value));

            if result.pairs.len() >= opts.max_results || bytes >= opts.max_bytes {
                // Stop here; the caller resumes past this key.
                let more = iter.any(|(k, _)| current_key.as_deref() != Some(k.user_key.as_slice()));
                result.complete = !more;
                if more {
                    let mut resume = key.user_key.clone();
                    resume.push(0); // smallest key strictly after
                    result.next_start_key = Some(resume);
                }
                return Ok(result);
            }
        }

        result.complete = true;
        Ok(result)
    }

    // --------------------------------------------------------------------------------------------
    // Snapshots and rollback
    // --------------------------------------------------------------------------------------------

    /// Registers a snapshot at the latest committed sequence.
    pub(crate) fn snapshot(&self) -> SequenceNumber {
        let mut inner = self.lock();
        let seq = inner.versions.last_sequence();
        inner.snapshots.acquire(seq)
    }

    /// Registers a snapshot at an explicit sequence.
    pub(crate) fn snapshot_at(&self, seq: SequenceNumber) -> Result<SequenceNumber, EngineError> {
        let mut inner = self.lock();
        if seq > inner.versions.last_sequence() {
            return Err(EngineError::InvalidArgument(format!(
                "snapshot {seq} is beyond last committed sequence {}",
                inner.versions.last_sequence()
            )));
        }
        Ok(inner.snapshots.acquire(seq))
    }

    /// Releases one reference to a snapshot.
    pub(crate) fn release_snapshot(&self, seq: SequenceNumber) -> Result<(), EngineError> {
        let mut inner = self.lock();
        if !inner.snapshots.release(seq) {
            return Err(EngineError::InvalidArgument(format!(
                "snapshot {seq} is not held"
            )));
        }
        Ok(())
    }

    /// Marks everything written after `snapshot_seq` up to and including
    /// `rollback_point` as rolled back: hidden from reads, dropped by
    /// compaction.
    ///
    /// `snapshot_seq` must be a snapshot the caller holds for as long as
    /// the rollback is active — it anchors the state being returned to,
    /// keeping compaction from collapsing entries at or below it.
    pub(crate) fn rollback(
        &self,
        snapshot_seq: SequenceNumber,
        rollback_point: SequenceNumber,
    ) -> Result<SequenceNumber, EngineError> {
        if rollback_point < snapshot_seq {
            return Err(EngineError::InvalidArgument(format!(
                "rollback point {rollback_point} precedes snapshot {snapshot_seq}"
            )));
        }
        let mut inner = self.lock();
        inner.rollbacks.insert(snapshot_seq, rollback_point);
        info!(snapshot_seq, rollback_point, "registered rollback interval");
        Ok(rollback_point)
    }

    /// Latest committed sequence number.
    pub(crate) fn last_sequence(&self) -> SequenceNumber {
        self.lock().versions.last_sequence()
    }

    // --------------------------------------------------------------------------------------------
    // Manual compaction
    // --------------------------------------------------------------------------------------------

    /// Compacts every level whose files overlap `[begin, end]` (user
    /// keys; `None` = unbounded). Blocks until the range is fully
    /// compacted, the engine shuts down, or a background error latches.
    pub(crate) fn compact_range(
        &self,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<(), EngineError> {
        // Flush current memtable contents first so they participate.
        self.flush_memtable()?;

        for level in 0..NUM_LEVELS - 1 {
            self.manual_compact_level(level, begin, end)?;
        }
        Ok(())
    }

    fn manual_compact_level(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<(), EngineError> {
        let mut inner = self.lock();
        if inner.state != DbState::Opened {
            return Err(EngineError::ShuttingDown);
        }
        inner.manual = Some(ManualCompaction {
            level,
            begin: begin.map(|k| InternalKey::max_for_key(k.to_vec())),
            end: end.map(|k| InternalKey::new(k.to_vec(), 0, ValueType::Deletion)),
            done: false,
            in_conflict: false,
        });
        self.maybe_schedule_compaction(&mut inner);

        loop {
            if self.shared.shutting_down.load(Ordering::Acquire) {
                inner.manual = None;
                return Err(EngineError::ShuttingDown);
            }
            if let Some(err) = &inner.bg_error {
                let msg = err.to_string();
                inner.manual = None;
                return Err(EngineError::Background(msg));
            }
            match &inner.manual {
                Some(manual) if !manual.done => {
                    inner = self
                        .shared
                        .bg_cv
                        .wait(inner)
                        .unwrap_or_else(|e| e.into_inner());
                }
                _ => break,
            }
        }
        inner.manual = None;
        Ok(())
    }

    /// Rotates the active memtable (if non-empty) and waits until both it
    /// and any prior immutable memtable are flushed.
    pub(crate) fn flush_memtable(&self) -> Result<(), EngineError> {
        let inner = self.lock();
        if inner.state != DbState::Opened {
            return Err(EngineError::ShuttingDown);
        }
        if inner.mem.is_empty() && inner.imm.is_none() {
            return Ok(());
        }
        // Force a rotation even though the memtable may not be full.
        let mut inner = self.make_room_for_write(inner, true)?;
        self.maybe_schedule_compaction(&mut inner);
        while inner.imm.is_some() && inner.bg_error.is_none() {
            inner = self
                .shared
                .bg_cv
                .wait(inner)
                .unwrap_or_else(|e| e.into_inner());
        }
        if let Some(err) = &inner.bg_error {
            return Err(EngineError::Background(err.to_string()));
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Properties and introspection
    // --------------------------------------------------------------------------------------------

    /// Engine properties:
    /// `stratadb.num-files-at-level<N>`, `stratadb.stats`,
    /// `stratadb.compaction_error` (query-and-reset).
    pub(crate) fn property(&self, name: &str) -> Option<String> {
        let prefix = "stratadb.";
        let name = name.strip_prefix(prefix)?;
        let mut inner = self.lock();

        if let Some(level) = name.strip_prefix("num-files-at-level") {
            let level: usize = level.parse().ok()?;
            if level >= NUM_LEVELS {
                return None;
            }
            return Some(inner.versions.num_level_files(level).to_string());
        }

        match name {
            "stats" => {
                let mut out = String::from(
                    "Level  Files  Size(MB)  Time(sec)  Read(MB)  Write(MB)\n",
                );
                let version = inner.versions.current();
                for level in 0..NUM_LEVELS {
                    let files = version.num_files(level);
                    let stats = inner.stats[level];
                    if files == 0 && stats == CompactionStats::default() {
                        continue;
                    }
                    out.push_str(&format!(
                        "{:>5}  {:>5}  {:>8.1}  {:>9.3}  {:>8.1}  {:>9.1}\n",
                        level,
                        files,
                        version.level_bytes(level) as f64 / 1048576.0,
                        stats.micros as f64 / 1e6,
                        stats.bytes_read as f64 / 1048576.0,
                        stats.bytes_written as f64 / 1048576.0,
                    ));
                }
                Some(out)
            }
            "compaction_error" => {
                // Latched errors refresh the polled slot; reading consumes
                // it (query-and-reset), while the latch itself persists.
                if inner.last_compaction_error.is_none()
                    && let Some(err) = &inner.bg_error
                {
                    inner.last_compaction_error = Some(err.to_string());
                }
                Some(inner.last_compaction_error.take().unwrap_or_default())
            }
            _ => None,
        }
    }

    /// Suggested midpoint user key for splitting this tablet.
    pub(crate) fn suggest_split_key(&self) -> Option<Vec<u8>> {
        self.lock().versions.suggest_split_key()
    }

    /// True when the latched background error demands a forced unload.
    pub(crate) fn should_force_unload(&self) -> bool {
        let inner = self.lock();
        inner
            .bg_error
            .as_ref()
            .is_some_and(|e| is_permission_denied(e.as_ref()))
    }

    // --------------------------------------------------------------------------------------------
    // Shutdown
    // --------------------------------------------------------------------------------------------

    /// Phase-1 shutdown: stop background compactions, drain in-flight
    /// ones, optionally dump the memtable.
    pub(crate) fn shutdown1(&self) -> Result<(), EngineError> {
        let mut inner = self.lock();
        if inner.state != DbState::Opened {
            return Err(EngineError::InvalidArgument(format!(
                "shutdown1 in state {:?}",
                inner.state
            )));
        }
        inner.state = DbState::Shutdown1;
        self.shared.shutting_down.store(true, Ordering::Release);
        info!("shutdown1: draining background compactions");

        // Boost pending tasks so drainage is prompt.
        let job = self.bg_job();
        for task in &mut inner.bg_tasks {
            if self.shared.pool.reschedule(task.id, URGENT_SCORE, job.clone()) {
                task.score = URGENT_SCORE;
            }
        }
        while !inner.bg_tasks.is_empty() {
            inner = self
                .shared
                .bg_cv
                .wait(inner)
                .unwrap_or_else(|e| e.into_inner());
        }

        // Fatal permission error: return immediately, do not attempt to
        // dump the memtable onto storage that rejects us.
        if let Some(err) = &inner.bg_error
            && is_permission_denied(err.as_ref())
        {
            return Err(EngineError::Background(err.to_string()));
        }

        if !self.shared.config.dump_mem_on_shutdown {
            return Ok(());
        }

        if inner.imm.is_some() {
            inner = self.compact_memtable_locked(inner)?;
        }
        if !inner.mem.is_empty() {
            let old_mem = std::mem::replace(&mut inner.mem, Arc::new(MemTable::new()));
            old_mem.mark_immutable();
            inner.imm = Some(old_mem);
            inner = self.compact_memtable_locked(inner)?;
        }
        drop(inner);
        Ok(())
    }

    /// Phase-2 shutdown: flush whatever remains.
    pub(crate) fn shutdown2(&self) -> Result<(), EngineError> {
        let mut inner = self.lock();
        if inner.state != DbState::Shutdown1 {
            return Err(EngineError::InvalidArgument(format!(
                "shutdown2 in state {:?}",
                inner.state
            )));
        }
        inner.state = DbState::Shutdown2;
        if let Some(err) = &inner.bg_error
            && is_permission_denied(err.as_ref())
        {
            return Err(EngineError::Background(err.to_string()));
        }
        if !self.shared.config.dump_mem_on_shutdown {
            return Ok(());
        }

        if inner.imm.is_some() {
            inner = self.compact_memtable_locked(inner)?;
        }
        if !inner.mem.is_empty() {
            let old_mem = std::mem::replace(&mut inner.mem, Arc::new(MemTable::new()));
            old_mem.mark_immutable();
            inner.imm = Some(old_mem);
            inner = self.compact_memtable_locked(inner)?;
        }
        drop(inner);
        Ok(())
    }

    /// Full close: both shutdown phases (as needed), worker join, lock
    /// release.
    pub(crate) fn close(&self) -> Result<(), EngineError> {
        {
            let inner = self.lock();
            match inner.state {
                DbState::Opened => {
                    drop(inner);
                    self.shutdown1()?;
                    self.shutdown2()?;
                }
                DbState::Shutdown1 => {
                    drop(inner);
                    self.shutdown2()?;
                }
                _ => {}
            }
        }
        self.shared.pool.shutdown();
        let mut inner = self.lock();
        inner.state = DbState::Closed;
        drop(inner);
        let mut lock = self
            .shared
            ._dir_lock
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        lock.take();
        info!(dir = %self.shared.dir.display(), "engine closed");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Background work
    // --------------------------------------------------------------------------------------------

    fn bg_job(&self) -> Job {
        let weak = Arc::downgrade(&self.shared);
        Arc::new(move || {
            if let Some(shared) = weak.upgrade() {
                Engine { shared }.background_call();
            }
        })
    }

    /// Schedules/rescheduls background jobs to match the current work:
    /// one slot per pending item (memtable dump, manual request, level
    /// scores ≥ 1), bounded by `max_background_compactions`.
    fn maybe_schedule_compaction(&self, inner: &mut EngineInner) {
        if self.shared.shutting_down.load(Ordering::Acquire) {
            return;
        }
        if inner
            .bg_error
            .as_ref()
            .is_some_and(|e| is_permission_denied(e.as_ref()))
        {
            // The tablet will be force-unloaded; no further compaction.
            return;
        }

        let mut scores: Vec<f64> = Vec::new();
        if inner.imm.is_some() {
            scores.push(DUMP_MEM_SCORE);
        }
        if inner
            .manual
            .as_ref()
            .is_some_and(|m| !m.done && !m.in_conflict)
        {
            scores.push(MANUAL_COMPACT_SCORE);
        }
        for s in inner.versions.scores() {
            if s.score >= 1.0 {
                scores.push(s.score);
            }
        }
        scores.sort_by(|a, b| b.total_cmp(a));

        let slots = self.shared.config.max_background_compactions.max(1);
        let job = self.bg_job();
        for (i, &score) in scores.iter().take(slots).enumerate() {
            if i < inner.bg_tasks.len() {
                // Decrease-key: refresh the pending task's priority.
                let task = &mut inner.bg_tasks[i];
                if (score - task.score).abs() > f64::EPSILON
                    && self.shared.pool.reschedule(task.id, score, job.clone())
                {
                    task.score = score;
                }
            } else {
                let id = self.shared.pool.schedule(score, job.clone());
                inner.bg_tasks.push(BgTask { id, score });
                debug!(score, "scheduled background compaction");
            }
        }
    }

    /// Body of one scheduled background job.
    fn background_call(&self) {
        let mut inner = self.lock();

        if self.shared.shutting_down.load(Ordering::Acquire) {
            inner.bg_tasks.pop();
            drop(inner);
            self.notify_all();
            return;
        }

        let (guard, result) = self.background_compaction(inner);
        let mut inner = guard;

        match result {
            Ok(()) => {
                inner.consecutive_errors = 0;
            }
            Err(_) if self.shared.shutting_down.load(Ordering::Acquire) => {
                // Error most likely caused by the shutdown itself.
            }
            Err(e) => {
                inner.consecutive_errors += 1;
                inner.last_compaction_error = Some(e.to_string());
                warn!(
                    error = %e,
                    retries = inner.consecutive_errors,
                    "background compaction failed"
                );
                let fatal = is_permission_denied(&e)
                    || inner.consecutive_errors
                        > self.shared.config.max_consecutive_compaction_errors;
                if fatal {
                    error!(error = %e, "latching background error; compaction disabled");
                    inner.bg_error = Some(Arc::new(e));
                    inner.consecutive_errors = 0;
                } else {
                    // Exponential backoff: 1s, 2s, 4s, 8s cap. Sleep with
                    // the lock released so readers and writers proceed.
                    let exponent = inner.consecutive_errors.saturating_sub(1).min(3);
                    let backoff = Duration::from_secs(1 << exponent);
                    drop(inner);
                    self.notify_all();
                    std::thread::sleep(backoff);
                    inner = self.lock();
                }
            }
        }

        inner.bg_tasks.pop();
        self.maybe_schedule_compaction(&mut inner);
        drop(inner);
        self.notify_all();
        self.remove_obsolete_files();
    }

    fn notify_all(&self) {
        self.shared.bg_cv.notify_all();
    }

    /// Picks and runs one unit of background work: immutable-memtable
    /// dump first, then the pending manual compaction, then the
    /// highest-scoring automatic compaction.
    fn background_compaction<'a>(
        &'a self,
        mut inner: MutexGuard<'a, EngineInner>,
    ) -> (MutexGuard<'a, EngineInner>, Result<(), EngineError>) {
        if inner.imm.is_some() {
            return match self.compact_memtable_locked(inner) {
                Ok(guard) => (guard, Ok(())),
                Err(e) => (self.lock(), Err(e)),
            };
        }

        // Manual request, if any and not blocked by a running overlap.
        if inner.manual.as_ref().is_some_and(|m| !m.done) {
            return self.run_manual_compaction(inner);
        }

        let Some(compaction) = inner.versions.pick_compaction() else {
            return (inner, Ok(()));
        };

        // An automatic pick overlapping a pending manual range defers to
        // the manual request.
        if let Some(manual) = &inner.manual
            && !manual.done
            && ranges_overlap(
                &compaction,
                manual.begin.as_ref().map(|k| k.user_key.as_slice()),
                manual.end.as_ref().map(|k| k.user_key.as_slice()),
            )
        {
            debug!("deferring automatic compaction overlapping manual range");
            return (inner, Ok(()));
        }

        // Never merge over inputs an in-flight compaction is touching;
        // retry once it drains (its completion reschedules).
        {
            let (lo, hi) = compaction.total_input_range();
            if compaction_busy(&inner, compaction.level, &lo.user_key, &hi.user_key) {
                debug!(level = compaction.level, "deferring pick overlapping running compaction");
                return (inner, Ok(()));
            }
        }

        if compaction.is_trivial_move() {
            // Metadata relocation only: no bytes move.
            let file = Arc::clone(&compaction.input(0)[0]);
            let mut edit = compaction.edit_template.clone();
            edit.delete_file(compaction.level as u32, file.number);
            edit.add_file(compaction.output_level() as u32, file.as_ref().clone());
            let result = inner
                .versions
                .log_and_apply(&mut edit)
                .map(|_| ())
                .map_err(EngineError::from);
            info!(
                number = file.number,
                from = compaction.level,
                to = compaction.output_level(),
                "trivial move"
            );
            return (inner, result);
        }

        self.run_merge_compaction(inner, compaction)
    }

    fn run_manual_compaction<'a>(
        &'a self,
        mut inner: MutexGuard<'a, EngineInner>,
    ) -> (MutexGuard<'a, EngineInner>, Result<(), EngineError>) {
        let Some(manual) = &inner.manual else {
            return (inner, Ok(()));
        };
        let level = manual.level;
        let begin = manual.begin.clone();
        let end = manual.end.clone();

        // An in-flight automatic compaction overlapping the manual range
        // forces the manual request into conflict-retry.
        let conflict = inner.running_compactions.iter().any(|(l, lo, hi)| {
            levels_touch(*l, level)
                && begin.as_ref().is_none_or(|b| hi.as_slice() >= b.user_key.as_slice())
                && end.as_ref().is_none_or(|e| lo.as_slice() <= e.user_key.as_slice())
        });
        if conflict {
            if let Some(manual) = &mut inner.manual {
                manual.in_conflict = true;
            }
            debug!(level, "manual compaction in conflict; retrying later");
            return (inner, Ok(()));
        }
        if let Some(manual) = &mut inner.manual {
            manual.in_conflict = false;
        }

        let Some(compaction) = inner
            .versions
            .compact_range(level, begin.as_ref(), end.as_ref())
        else {
            if let Some(manual) = &mut inner.manual {
                manual.done = true;
            }
            return (inner, Ok(()));
        };

        let (_, covered_through) = compaction.input_range(0);

        let (guard, result) = self.run_merge_compaction(inner, compaction);
        let mut inner = guard;
        if result.is_ok()
            && let Some(manual) = &mut inner.manual
        {
            // Resume past the files already compacted; the request is done
            // when a later round finds nothing left in range.
            manual.begin = Some(covered_through);
        }
        (inner, result)
    }

    /// Runs the executor for `compaction` with the lock released, then
    /// commits the resulting edit.
    fn run_merge_compaction<'a>(
        &'a self,
        mut inner: MutexGuard<'a, EngineInner>,
        mut compaction: Compaction,
    ) -> (MutexGuard<'a, EngineInner>, Result<(), EngineError>) {
        compaction.smallest_snapshot =
            inner.snapshots.smallest().unwrap_or(MAX_SEQUENCE);
        let rollbacks = inner.rollbacks.clone();
        let cache = inner.versions.table_cache();

        let (range_lo, range_hi) = compaction.total_input_range();
        inner.running_compactions.push((
            compaction.level,
            range_lo.user_key.clone(),
            range_hi.user_key.clone(),
        ));
        let range_token = (compaction.level, range_lo.user_key, range_hi.user_key);

        drop(inner);

        let alloc = || {
            let mut inner = self.lock();
            let number = inner.versions.new_file_number();
            inner.pending_outputs.insert(number);
            number
        };
        let outcome = run_compaction(
            &self.shared.env,
            &cache,
            &self.shared.config,
            &compaction,
            &rollbacks,
            &alloc,
            &self.shared.shutting_down,
        );

        let mut inner = self.lock();
        inner
            .running_compactions
            .retain(|r| *r != range_token);
        // The overlap that forced a manual request into conflict-retry is
        // gone; let it schedule again.
        if let Some(manual) = &mut inner.manual {
            manual.in_conflict = false;
        }

        let result = match outcome {
            Ok(mut outcome) => {
                let commit = inner
                    .versions
                    .log_and_apply(&mut outcome.edit)
                    .map(|_| ())
                    .map_err(EngineError::from);
                for number in &outcome.output_numbers {
                    inner.pending_outputs.remove(number);
                }
                inner.stats[compaction.output_level()].add(&outcome.stats);
                commit
            }
            Err(e) => {
                // The executor already deleted its outputs; just drop the
                // pending registrations it allocated.
                let live: HashSet<u64> = inner.versions.live_file_numbers();
                inner.pending_outputs.retain(|n| live.contains(n));
                Err(e.into())
            }
        };
        (inner, result)
    }

    /// Flushes the immutable memtable to a table file and commits it.
    fn compact_memtable_locked<'a>(
        &'a self,
        mut inner: MutexGuard<'a, EngineInner>,
    ) -> Result<MutexGuard<'a, EngineInner>, EngineError> {
        let Some(imm) = inner.imm.clone() else {
            return Ok(inner);
        };
        let number = inner.versions.new_file_number();
        inner.pending_outputs.insert(number);
        let log_number = inner.log_number;
        drop(inner);

        // Build with the lock released; the immutable memtable is frozen
        // and Arc-shared.
        let built = build_memtable_table(
            &self.shared.env,
            &self.shared.dir,
            &self.shared.config,
            number,
            &imm,
        );

        let mut inner = self.lock();
        inner.pending_outputs.remove(&number);
        let file = match built {
            Ok(file) => file,
            Err(e) => {
                self.notify_all();
                return Err(e);
            }
        };

        let mut edit = VersionEdit::new();
        // All writes in this memtable came from logs before the current
        // one; committing the flush obsoletes them.
        edit.log_number = Some(log_number);
        // Level choice must see the version the edit will apply to — a
        // compaction may have committed while the table was building.
        let mut level = match &file {
            Some(meta) => inner.versions.current().pick_level_for_memtable_output(
                &meta.smallest.user_key,
                &meta.largest.user_key,
                self.shared.config.max_mem_compact_level,
            ),
            None => 0,
        };
        // A running compaction may be about to install outputs at or
        // above the chosen level in this key range; level 0 tolerates
        // overlap, deeper levels do not.
        if level > 0
            && let Some(meta) = &file
            && inner.running_compactions.iter().any(|(l, rlo, rhi)| {
                *l + 1 <= level
                    && rhi.as_slice() >= meta.smallest.user_key.as_slice()
                    && rlo.as_slice() <= meta.largest.user_key.as_slice()
            })
        {
            level = 0;
        }
        if let Some(meta) = file {
            info!(
                number = meta.number,
                level,
                entries = meta.entry_count,
                "flushed immutable memtable"
            );
            edit.add_file(level as u32, meta);
        }
        inner.versions.log_and_apply(&mut edit)?;
        inner.imm = None;
        self.notify_all();
        Ok(inner)
    }

    // --------------------------------------------------------------------------------------------
    // Garbage collection
    // --------------------------------------------------------------------------------------------

    /// Deletes files no live version, pending output, or active log
    /// references. Runs entirely outside the engine lock.
    fn remove_obsolete_files(&self) {
        let (live_local, pending_local, log_local, manifest_local) = {
            let mut inner = self.lock();
            let live: HashSet<u32> = inner
                .versions
                .live_file_numbers()
                .into_iter()
                .map(files::local_file_id)
                .collect();
            let pending: HashSet<u32> = inner
                .pending_outputs
                .iter()
                .map(|n| files::local_file_id(*n))
                .collect();
            (
                live,
                pending,
                files::local_file_id(inner.versions.log_number()),
                files::local_file_id(inner.versions.manifest_number()),
            )
        };

        let Ok(children) = self.shared.env.get_children(&self.shared.dir) else {
            return;
        };
        for name in children {
            let keep = match files::parse_file_name(&name) {
                Some(FileKind::Table(id)) => live_local.contains(&id) || pending_local.contains(&id),
                Some(FileKind::Log(id)) => id >= log_local,
                Some(FileKind::Manifest(id)) => id >= manifest_local,
                Some(FileKind::Current | FileKind::Lock | FileKind::Marker) => true,
                None => true, // foreign file; not ours to delete
            };
            if keep {
                continue;
            }
            debug!(file = %name, "removing obsolete file");
            if let Some(FileKind::Table(id)) = files::parse_file_name(&name) {
                let inner = self.lock();
                inner.versions.table_cache().evict_local(id);
                drop(inner);
            }
            if let Err(e) = self.shared.env.delete_file(&self.shared.dir.join(&name)) {
                warn!(file = %name, error = %e, "failed to remove obsolete file");
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Free helpers (recovery, flush)
// ------------------------------------------------------------------------------------------------

/// Whether `compaction` touches the user-key range `[begin, end]`.
fn ranges_overlap(compaction: &Compaction, begin: Option<&[u8]>, end: Option<&[u8]>) -> bool {
    let (lo, hi) = compaction.total_input_range();
    begin.is_none_or(|b| hi.user_key.as_slice() >= b)
        && end.is_none_or(|e| lo.user_key.as_slice() <= e)
}

/// Whether two compactions share a level: one's input or output level is
/// the other's.
fn levels_touch(running_level: usize, level: usize) -> bool {
    running_level == level || running_level + 1 == level || running_level == level + 1
}

/// Whether an in-flight compaction overlaps `[lo, hi]` at a touching
/// level.
fn compaction_busy(inner: &EngineInner, level: usize, lo: &[u8], hi: &[u8]) -> bool {
    inner
        .running_compactions
        .iter()
        .any(|(l, rlo, rhi)| levels_touch(*l, level) && rhi.as_slice() >= lo && rlo.as_slice() <= hi)
}

fn check_deadline(deadline: Option<Instant>) -> Result<(), EngineError> {
    match deadline {
        Some(d) if Instant::now() >= d => Err(EngineError::TimedOut),
        _ => Ok(()),
    }
}

/// Builds one table from a memtable snapshot; `None` when it was empty.
fn build_memtable_table(
    env: &EnvRef,
    dir: &Path,
    config: &DbConfig,
    number: u64,
    mem: &MemTable,
) -> Result<Option<FileMetaData>, EngineError> {
    if mem.is_empty() {
        return Ok(None);
    }
    let path = files::table_file_path(dir, number);
    let opts = TableBuilderOptions {
        block_size: 4096,
        ttl_percentage: config.ttl_percentage,
    };
    let mut builder = TableBuilder::new(Arc::clone(env), &path, opts)?;
    for (key, value) in mem.iter()? {
        builder.add(&key, &value)?;
    }
    let built = builder.finish()?;
    Ok(Some(FileMetaData {
        number,
        file_size: built.file_size,
        smallest: built.smallest,
        largest: built.largest,
        del_percentage: built.del_percentage,
        ttl_check_ts: built.ttl_check_ts,
        entry_count: built.entry_count,
    }))
}

/// Removes all engine-owned files (tables, logs, manifests, CURRENT,
/// markers) from a tablet directory, sparing the lock and foreign files.
fn wipe_tablet_files(env: &EnvRef, dir: &Path) -> Result<(), EngineError> {
    for name in env.get_children(dir)? {
        let delete = match files::parse_file_name(&name) {
            Some(FileKind::Lock) | None => false,
            Some(_) => true,
        };
        if delete {
            env.delete_file(&dir.join(&name))?;
        }
    }
    env.sync_dir(dir)?;
    Ok(())
}

/// Imports the file sets of 0, 1, or 2 parent tablets into a fresh child
/// manifest (post-split child or post-merge result). The serving layer is
/// responsible for placing the physical table files into the child
/// directory before load.
fn import_parent_files(
    env: &EnvRef,
    versions: &mut VersionSet,
    config: &DbConfig,
) -> Result<(), EngineError> {
    let mut edit = VersionEdit::new();
    let mut max_local = 0u32;
    let mut imported = 0usize;

    for parent_dir in &config.parent_tablets {
        let parent_files = version_set::load_manifest_files(env, parent_dir)?;
        for (level, file) in parent_files {
            max_local = max_local.max(files::local_file_id(file.number));
            edit.add_file(level, file);
            imported += 1;
        }
    }

    if imported > 0 {
        versions.ensure_next_file_at_least(max_local as u64 + 1);
        versions.log_and_apply(&mut edit)?;
    }
    info!(
        parents = config.parent_tablets.len(),
        files = imported,
        "imported parent tablet files"
    );
    Ok(())
}

/// Replays every data log at or past the manifest's log number into a
/// recovery memtable, spilling to level 0 whenever it exceeds the write
/// buffer. Returns the final (unspilled) recovery memtable as the new
/// active memtable seed.
fn replay_log_files(
    env: &EnvRef,
    dir: &Path,
    config: &DbConfig,
    versions: &mut VersionSet,
) -> Result<MemTable, EngineError> {
    let mut log_ids: Vec<u32> = env
        .get_children(dir)?
        .iter()
        .filter_map(|name| match files::parse_file_name(name) {
            Some(FileKind::Log(id)) if id >= files::local_file_id(versions.log_number()) => {
                Some(id)
            }
            _ => None,
        })
        .collect();
    log_ids.sort_unstable();

    let mut recovery_mem = MemTable::new();
    let mut max_sequence = versions.last_sequence();
    let mut edit = VersionEdit::new();
    let mut spilled = 0usize;

    for id in log_ids {
        let path = dir.join(format!("{id:06}.log"));
        let replay = wal::replay::<LogRecord>(env, &path)?;
        for record in replay {
            let record = match record {
                Ok(r) => r,
                Err(e) => {
                    // Torn tail: the write was never acknowledged. Stop
                    // replaying this log and keep what we have.
                    warn!(log = id, error = %e, "log replay stopped at torn record");
                    break;
                }
            };
            // Idempotent duplicate skip: a record (or prefix) whose
            // sequences are already reflected is a no-op.
            if record.last_sequence() <= max_sequence {
                continue;
            }
            for (i, entry) in record.entries.iter().enumerate() {
                let seq = record.first_sequence + i as u64;
                if seq <= max_sequence {
                    continue;
                }
                recovery_mem.add(seq, entry.kind, &entry.key, &entry.value)?;
            }
            max_sequence = max_sequence.max(record.last_sequence());

            // Bound peak recovery memory for very large logs.
            if recovery_mem.approximate_memory_usage() > config.write_buffer_size {
                let number = versions.new_file_number();
                if let Some(meta) =
                    build_memtable_table(env, dir, config, number, &recovery_mem)?
                {
                    edit.add_file(0, meta);
                    spilled += 1;
                }
                recovery_mem = MemTable::new();
            }
        }
    }

    versions.set_last_sequence(max_sequence);
    if !edit.is_empty() {
        versions.log_and_apply(&mut edit)?;
    }
    info!(
        last_sequence = max_sequence,
        spilled_tables = spilled,
        "log recovery complete"
    );
    Ok(recovery_mem)
}
