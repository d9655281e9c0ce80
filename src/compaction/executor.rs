//! Compaction execution: the merge loop and parallel sub-compaction.
//!
//! The executor consumes a picked [`Compaction`] and produces the
//! [`VersionEdit`] that commits its effect. It runs entirely without the
//! engine lock — the engine supplies a file-number allocator callback that
//! takes the lock only for the allocation itself.
//!
//! # Visibility rules
//!
//! For each distinct user key, entries are examined newest-first and
//! dropped by **exactly these rules in this order**:
//!
//! 1. the sequence falls inside an active rollback interval;
//! 2. a newer entry for the same key was already kept and sits at or
//!    below the smallest active snapshot (this entry is hidden from every
//!    observer);
//! 3. the entry is a deletion marker at or below the smallest snapshot
//!    and no deeper level holds data for the key — the marker can no
//!    longer affect any read;
//! 4. the configured strategy drops it (TTL expiry, custom GC), again
//!    only at or below the smallest snapshot.
//!
//! # Parallel sub-compaction
//!
//! The input key range may be partitioned into disjoint sub-ranges of
//! roughly equal estimated bytes. Each sub-range is compacted by an
//! independent worker thread with its own cursor state and its own
//! strategy instance; workers share nothing mutable. Results are joined
//! strictly before the single union edit is assembled. If any worker
//! fails, every produced output file is deleted and the whole compaction
//! fails — no partial edit is ever committed.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::{Compaction, CompactionStats, new_strategy};
use crate::config::DbConfig;
use crate::env::EnvRef;
use crate::files;
use crate::keys::{InternalKey, RollbackMap, ValueType};
use crate::sstable::{Table, TableBuilder, TableBuilderOptions, TableError, TableIterator};
use crate::version::{FileMetaData, TableCache, VersionEdit, VersionError};

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors raised while executing a compaction.
#[derive(Debug, Error)]
pub enum CompactionError {
    /// Table read/build failure.
    #[error("Table error: {0}")]
    Table(#[from] TableError),

    /// Version/manifest bookkeeping failure.
    #[error("Version error: {0}")]
    Version(#[from] VersionError),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The engine began shutting down; the merge loop stopped early.
    #[error("compaction aborted: {0}")]
    Aborted(String),

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Outcome
// ------------------------------------------------------------------------------------------------

/// Result of one executed compaction, ready for `log_and_apply`.
pub struct CompactionOutcome {
    /// The edit committing this compaction: input deletions, output
    /// additions, advanced compact pointer.
    pub edit: VersionEdit,

    /// I/O counters for stats reporting.
    pub stats: CompactionStats,

    /// Output file numbers (already part of `edit`; listed separately so
    /// the engine can unregister pending outputs).
    pub output_numbers: Vec<u64>,
}

// ------------------------------------------------------------------------------------------------
// Entry point
// ------------------------------------------------------------------------------------------------

/// Executes a merge compaction, possibly split into parallel sub-ranges.
///
/// `alloc_file_number` is called (briefly locking the engine) for every
/// output file; allocated numbers must be registered as pending outputs by
/// the callback so garbage collection spares half-written files.
pub fn run_compaction(
    env: &EnvRef,
    cache: &TableCache,
    config: &DbConfig,
    compaction: &Compaction,
    rollbacks: &RollbackMap,
    alloc_file_number: &(dyn Fn() -> u64 + Sync),
    shutting_down: &AtomicBool,
) -> Result<CompactionOutcome, CompactionError> {
    let start = Instant::now();
    let subs = generate_sub_compactions(compaction, config.max_sub_compactions);

    info!(
        level = compaction.level,
        inputs_level = compaction.input(0).len(),
        inputs_next = compaction.input(1).len(),
        sub_compactions = subs.len(),
        snapshot = compaction.smallest_snapshot,
        "compacting"
    );

    // Each worker owns its sub-range, cursors, and strategy instance; the
    // scope join is the only synchronisation point.
    let results: Vec<Result<Vec<FileMetaData>, CompactionError>> = std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(subs.len());
        for sub in subs {
            handles.push(scope.spawn(move || {
                compact_sub_range(env, cache, config, sub, rollbacks, alloc_file_number, shutting_down)
            }));
        }
        handles
            .into_iter()
            .map(|h| {
                h.join().unwrap_or_else(|_| {
                    Err(CompactionError::Internal("sub-compaction worker panicked".into()))
                })
            })
            .collect()
    });

    // All-or-nothing: one failed worker poisons the whole compaction.
    let mut outputs = Vec::new();
    let mut failure = None;
    for result in results {
        match result {
            Ok(files) => outputs.extend(files),
            Err(e) => failure = Some(e),
        }
    }
    if let Some(e) = failure {
        for file in &outputs {
            let path = files::table_file_path(cache.dir(), file.number);
            if let Err(del) = env.delete_file(&path) {
                warn!(number = file.number, error = %del, "failed to remove orphaned compaction output");
            }
        }
        return Err(e);
    }

    // Union edit, assembled strictly after all workers joined.
    let mut edit = compaction.edit_template.clone();
    compaction.add_input_deletions(&mut edit);
    let mut output_numbers = Vec::with_capacity(outputs.len());
    let mut bytes_written = 0;
    outputs.sort_by(|a, b| a.smallest.cmp(&b.smallest));
    for file in outputs {
        output_numbers.push(file.number);
        bytes_written += file.file_size;
        edit.add_file(compaction.output_level() as u32, file);
    }

    let stats = CompactionStats {
        micros: start.elapsed().as_micros() as u64,
        bytes_read: compaction.total_input_bytes(),
        bytes_written,
    };
    debug!(
        outputs = output_numbers.len(),
        bytes_read = stats.bytes_read,
        bytes_written = stats.bytes_written,
        "compaction merge complete"
    );

    Ok(CompactionOutcome {
        edit,
        stats,
        output_numbers,
    })
}

// ------------------------------------------------------------------------------------------------
// Sub-compaction partitioning
// ------------------------------------------------------------------------------------------------

/// Splits the input key range into at most `max_subs` disjoint sub-ranges
/// of roughly equal estimated bytes, cutting only at input-file smallest
/// keys so every worker scans whole file prefixes.
pub(crate) fn generate_sub_compactions(compaction: &Compaction, max_subs: usize) -> Vec<Compaction> {
    let mut sized: Vec<(&Arc<FileMetaData>, u64)> = compaction
        .input(0)
        .iter()
        .chain(compaction.input(1).iter())
        .map(|f| (f, f.file_size))
        .collect();

    if max_subs <= 1 || sized.len() < 2 {
        return vec![compaction.sub_range(None, None)];
    }

    sized.sort_by(|a, b| a.0.smallest.cmp(&b.0.smallest));
    let total: u64 = sized.iter().map(|(_, s)| s).sum();
    let want = max_subs.min(sized.len());
    let target = (total / want as u64).max(1);

    let mut boundaries: Vec<Vec<u8>> = Vec::new();
    let mut acc = 0u64;
    for (file, size) in &sized {
        if acc >= target
            && boundaries.len() + 1 < want
            && boundaries
                .last()
                .is_none_or(|b| b.as_slice() < file.smallest.user_key.as_slice())
        {
            boundaries.push(file.smallest.user_key.clone());
            acc = 0;
        }
        acc += size;
    }

    if boundaries.is_empty() {
        return vec![compaction.sub_range(None, None)];
    }

    let mut subs = Vec::with_capacity(boundaries.len() + 1);
    let mut start: Option<InternalKey> = None;
    for boundary in boundaries {
        let end = InternalKey::max_for_key(boundary);
        subs.push(compaction.sub_range(start.clone(), Some(end.clone())));
        start = Some(end);
    }
    subs.push(compaction.sub_range(start, None));
    subs
}

// ------------------------------------------------------------------------------------------------
// Merge iterator
// ------------------------------------------------------------------------------------------------

/// K-way merge over table iterators, in internal-key order, with one-entry
/// lookahead for merge-on-compaction.
struct MergeIter<'a> {
    iters: Vec<TableIterator<'a>>,
    heap: BinaryHeap<HeapEntry>,
    peeked: Option<(InternalKey, Vec<u8>)>,
}

struct HeapEntry {
    key: InternalKey,
    value: Vec<u8>,
    source: usize,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap over (key, source); source breaks exact ties so
        // same-level inputs pop oldest file first deterministically.
        self.key
            .cmp(&other.key)
            .then_with(|| self.source.cmp(&other.source))
            .reverse()
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source == other.source
    }
}

impl Eq for HeapEntry {}

impl<'a> MergeIter<'a> {
    fn new(mut iters: Vec<TableIterator<'a>>) -> Self {
        let mut heap = BinaryHeap::new();
        for (source, iter) in iters.iter_mut().enumerate() {
            if let Some((key, value)) = iter.next() {
                heap.push(HeapEntry { key, value, source });
            }
        }
        Self {
            iters,
            heap,
            peeked: None,
        }
    }

    fn next(&mut self) -> Option<(InternalKey, Vec<u8>)> {
        if let Some(entry) = self.peeked.take() {
            return Some(entry);
        }
        self.advance()
    }

    fn peek(&mut self) -> Option<&(InternalKey, Vec<u8>)> {
        if self.peeked.is_none() {
            self.peeked = self.advance();
        }
        self.peeked.as_ref()
    }

    fn advance(&mut self) -> Option<(InternalKey, Vec<u8>)> {
        let entry = self.heap.pop()?;
        if let Some((key, value)) = self.iters[entry.source].next() {
            self.heap.push(HeapEntry {
                key,
                value,
                source: entry.source,
            });
        }
        Some((entry.key, entry.value))
    }

    /// First I/O error any input hit; the merge is incomplete if set.
    fn status(self) -> Result<(), TableError> {
        for iter in self.iters {
            iter.into_status()?;
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Sub-range merge loop
// ------------------------------------------------------------------------------------------------

/// Compacts one disjoint sub-range into zero or more output files.
fn compact_sub_range(
    env: &EnvRef,
    cache: &TableCache,
    config: &DbConfig,
    mut compaction: Compaction,
    rollbacks: &RollbackMap,
    alloc_file_number: &(dyn Fn() -> u64 + Sync),
    shutting_down: &AtomicBool,
) -> Result<Vec<FileMetaData>, CompactionError> {
    // Open every input table up front and keep the handles alive for the
    // whole merge; iterators borrow from them.
    let mut tables: Vec<Arc<Table>> = Vec::new();
    for file in compaction.input(0).iter().chain(compaction.input(1)) {
        tables.push(cache.get(file.number)?);
    }

    let mut iters: Vec<TableIterator<'_>> = tables.iter().map(|t| t.iter()).collect();
    if let Some(start) = &compaction.sub_start {
        for iter in &mut iters {
            iter.seek(start);
        }
    }
    let mut input = MergeIter::new(iters);

    let mut strategy = new_strategy(config.compact_strategy);
    let smallest_snapshot = compaction.smallest_snapshot;
    let sub_end_user = compaction.sub_end.as_ref().map(|k| k.user_key.clone());

    let mut builder: Option<(u64, TableBuilder)> = None;
    let mut outputs: Vec<FileMetaData> = Vec::new();

    let mut current_user_key: Option<Vec<u8>> = None;
    let mut last_sequence_for_key = crate::keys::MAX_SEQUENCE;

    while let Some((key, value)) = input.next() {
        if shutting_down.load(AtomicOrdering::Acquire) {
            if let Some((_, b)) = builder.take() {
                b.abandon();
            }
            // Outputs finished so far are deleted by the caller's
            // all-or-nothing cleanup when this error propagates.
            return Err(CompactionError::Aborted("engine shutting down".into()));
        }

        // Sub-range upper bound (exclusive by user key).
        if let Some(end) = &sub_end_user
            && key.user_key.as_slice() >= end.as_slice()
        {
            break;
        }

        // Cut the output early if it would overlap level+2 too much.
        if builder.is_some() && compaction.should_stop_before(&key) {
            finish_output(&mut builder, &mut outputs)?;
        }

        // New user key resets the hidden-entry tracking.
        if current_user_key.as_deref() != Some(key.user_key.as_slice()) {
            current_user_key = Some(key.user_key.clone());
            last_sequence_for_key = crate::keys::MAX_SEQUENCE;
        }

        // Visibility rules, in order. See the module docs.
        let mut drop = false;
        if rollbacks.should_drop(key.sequence) {
            drop = true;
        } else if last_sequence_for_key <= smallest_snapshot
            && last_sequence_for_key != crate::keys::MAX_SEQUENCE
        {
            // (rule 2) a newer, universally-visible entry shadows this one
            drop = true;
        } else if key.kind == ValueType::Deletion
            && key.sequence <= smallest_snapshot
            && config.drop_base_level_deletions
            && compaction.is_base_level_for_key(&key.user_key)
        {
            // (rule 3) obsolete deletion marker at the base level
            drop = true;
        } else if key.sequence <= smallest_snapshot
            && strategy.drop_entry(&key.user_key, key.sequence, &value)
        {
            // (rule 4) strategy GC
            drop = true;
        }
        last_sequence_for_key = key.sequence;

        if drop {
            continue;
        }

        // Merge-on-compaction: fold mergeable older versions of the same
        // user key into this entry (only below the smallest snapshot, so
        // no snapshot observes the rewrite).
        let mut value = value;
        if key.kind == ValueType::Value && key.sequence <= smallest_snapshot {
            loop {
                enum Fold {
                    Stop,
                    Skip(u64),
                    Merge(u64, Vec<u8>),
                }
                let decision = match input.peek() {
                    Some((next_key, next_value))
                        if next_key.user_key == key.user_key
                            && next_key.kind == ValueType::Value =>
                    {
                        if rollbacks.should_drop(next_key.sequence) {
                            Fold::Skip(next_key.sequence)
                        } else {
                            match strategy.merge_values(&key.user_key, &value, next_value) {
                                Some(merged) => Fold::Merge(next_key.sequence, merged),
                                None => Fold::Stop,
                            }
                        }
                    }
                    _ => Fold::Stop,
                };
                match decision {
                    Fold::Stop => break,
                    Fold::Skip(seq) => {
                        input.next();
                        last_sequence_for_key = seq;
                    }
                    Fold::Merge(seq, merged) => {
                        value = merged;
                        input.next();
                        last_sequence_for_key = seq;
                    }
                }
            }
        }

        // Open an output file when none is open.
        if builder.is_none() {
            let number = alloc_file_number();
            let path = files::table_file_path(cache.dir(), number);
            let opts = TableBuilderOptions {
                block_size: 4096,
                ttl_percentage: config.ttl_percentage,
            };
            builder = Some((number, TableBuilder::new(Arc::clone(env), &path, opts)?));
        }
        let (_, b) = builder
            .as_mut()
            .ok_or_else(|| CompactionError::Internal("output builder missing".into()))?;

        // Strategy tags feed the output's GC statistics.
        if key.kind == ValueType::Value {
            let (del_tag, ttl) = strategy.check_tag(&key.user_key, &value);
            if del_tag {
                b.record_deletion_tag();
            } else if ttl > 0 {
                b.record_ttl(ttl);
            }
        }
        b.add(&key, &value)?;

        if b.file_size_estimate() >= compaction.max_output_file_size {
            finish_output(&mut builder, &mut outputs)?;
        }
    }

    finish_output(&mut builder, &mut outputs)?;
    input.status()?;
    Ok(outputs)
}

/// Finalises the open output file, if any, recording its metadata.
fn finish_output(
    builder: &mut Option<(u64, TableBuilder)>,
    outputs: &mut Vec<FileMetaData>,
) -> Result<(), CompactionError> {
    let Some((number, b)) = builder.take() else {
        return Ok(());
    };
    if b.is_empty() {
        b.abandon();
        return Ok(());
    }
    let built = b.finish()?;
    outputs.push(FileMetaData {
        number,
        file_size: built.file_size,
        smallest: built.smallest,
        largest: built.largest,
        del_percentage: built.del_percentage,
        ttl_check_ts: built.ttl_check_ts,
        entry_count: built.entry_count,
    });
    Ok(())
}
