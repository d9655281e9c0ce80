//! Compaction — merging sorted files down the level hierarchy.
//!
//! A [`Compaction`] is the task object produced by the picker
//! ([`VersionSet::pick_compaction`](crate::version::VersionSet::pick_compaction))
//! and consumed by the executor ([`executor`]): the chosen level, the
//! input file lists at that level and the next, the grandparent files
//! bounding output size, and the cursors used while merging.
//!
//! The degenerate case is the **trivial move**: a single input file with
//! no overlap in the next level is relocated by metadata edit alone —
//! zero bytes read or written.
//!
//! Sub-modules:
//!
//! - [`strategy`] — pluggable per-entry policies (counter merge, TTL
//!   tags) applied below the smallest active snapshot.
//! - [`executor`] — the merge loop, output building, and parallel
//!   sub-compaction.

pub mod executor;
pub mod strategy;

#[cfg(test)]
mod tests;

pub use executor::{CompactionOutcome, run_compaction};
pub use strategy::{CompactStrategy, new_strategy};

use std::sync::Arc;

use crate::config::{DbConfig, NUM_LEVELS};
use crate::keys::{InternalKey, SequenceNumber};
use crate::version::{FileMetaData, Version, VersionEdit};

/// A picked compaction: inputs, bounds, and merge-time cursors.
///
/// Sub-compactions clone the task and restrict it to a key sub-range;
/// cursors (`grandparent_index`, `level_ptrs`) are per-clone, so workers
/// never share mutable state.
#[derive(Clone)]
pub struct Compaction {
    /// Input level. Outputs land at `level + 1`.
    pub level: usize,

    /// True for an explicitly requested (manual) compaction.
    pub is_manual: bool,

    /// Inputs: `[0]` = files at `level`, `[1]` = overlapping files at
    /// `level + 1`.
    inputs: [Vec<Arc<FileMetaData>>; 2],

    /// Files at `level + 2` overlapping the total input range; bound how
    /// much any single output file may overlap the grandparent level.
    grandparents: Vec<Arc<FileMetaData>>,

    /// The version the inputs were chosen from; kept alive so input files
    /// cannot be garbage-collected mid-compaction.
    version: Arc<Version>,

    /// Seed for the final edit (carries the advanced compact pointer).
    pub edit_template: VersionEdit,

    /// Output files are cut at this size.
    pub max_output_file_size: u64,

    /// Grandparent-overlap budget per output file.
    max_grandparent_overlap_bytes: u64,

    /// Reads below or at this snapshot must stay answerable; entries
    /// above it are never dropped by visibility rules 2–4.
    pub smallest_snapshot: SequenceNumber,

    /// Sub-compaction bounds (user keys); `None` = unbounded.
    pub sub_start: Option<InternalKey>,
    pub sub_end: Option<InternalKey>,

    // Merge-time cursors (per clone).
    grandparent_index: usize,
    seen_key: bool,
    overlapped_bytes: u64,
    level_ptrs: [usize; NUM_LEVELS],
}

impl Compaction {
    pub(crate) fn new(
        config: &DbConfig,
        version: Arc<Version>,
        level: usize,
        inputs: Vec<Arc<FileMetaData>>,
        is_manual: bool,
    ) -> Self {
        Self {
            level,
            is_manual,
            inputs: [inputs, Vec::new()],
            grandparents: Vec::new(),
            version,
            edit_template: VersionEdit::new(),
            max_output_file_size: config.max_file_size,
            max_grandparent_overlap_bytes: config.max_grandparent_overlap_bytes(),
            smallest_snapshot: crate::keys::MAX_SEQUENCE,
            sub_start: None,
            sub_end: None,
            grandparent_index: 0,
            seen_key: false,
            overlapped_bytes: 0,
            level_ptrs: [0; NUM_LEVELS],
        }
    }

    /// Output level of this compaction.
    pub fn output_level(&self) -> usize {
        self.level + 1
    }

    /// Input files at `which` (0 = level, 1 = level + 1).
    pub fn input(&self, which: usize) -> &[Arc<FileMetaData>] {
        &self.inputs[which]
    }

    /// Total bytes across both input lists.
    pub fn total_input_bytes(&self) -> u64 {
        self.inputs
            .iter()
            .flatten()
            .map(|f| f.file_size)
            .sum()
    }

    /// The version the inputs were chosen from.
    pub fn input_version(&self) -> Arc<Version> {
        Arc::clone(&self.version)
    }

    pub(crate) fn set_next_level_inputs(&mut self, files: Vec<Arc<FileMetaData>>) {
        self.inputs[1] = files;
    }

    pub(crate) fn set_grandparents(&mut self, files: Vec<Arc<FileMetaData>>) {
        self.grandparents = files;
    }

    /// Smallest and largest internal key across input list `which`.
    pub(crate) fn input_range(&self, which: usize) -> (InternalKey, InternalKey) {
        let files = &self.inputs[which];
        debug_assert!(!files.is_empty());
        let mut smallest = files[0].smallest.clone();
        let mut largest = files[0].largest.clone();
        for file in &files[1..] {
            if file.smallest < smallest {
                smallest = file.smallest.clone();
            }
            if file.largest > largest {
                largest = file.largest.clone();
            }
        }
        (smallest, largest)
    }

    /// Smallest and largest internal key across both input lists.
    pub(crate) fn total_input_range(&self) -> (InternalKey, InternalKey) {
        let (mut smallest, mut largest) = self.input_range(0);
        if !self.inputs[1].is_empty() {
            let (s, l) = self.input_range(1);
            if s < smallest {
                smallest = s;
            }
            if l > largest {
                largest = l;
            }
        }
        (smallest, largest)
    }

    /// Whether this compaction degenerates to a metadata-only relocation:
    /// one input file, nothing to merge with at the next level, and not
    /// enough grandparent overlap to make the move regrettable.
    pub fn is_trivial_move(&self) -> bool {
        self.inputs[0].len() == 1
            && self.inputs[1].is_empty()
            && total_file_size(&self.grandparents) <= self.max_grandparent_overlap_bytes
    }

    /// Signals that the current output file should be finalised before
    /// `key` is added, because continuing would make the output overlap
    /// level + 2 excessively.
    ///
    /// Called with keys in ascending order; advances internal cursors.
    pub fn should_stop_before(&mut self, key: &InternalKey) -> bool {
        while self.grandparent_index < self.grandparents.len()
            && *key > self.grandparents[self.grandparent_index].largest
        {
            if self.seen_key {
                self.overlapped_bytes += self.grandparents[self.grandparent_index].file_size;
            }
            self.grandparent_index += 1;
        }
        self.seen_key = true;

        if self.overlapped_bytes > self.max_grandparent_overlap_bytes {
            self.overlapped_bytes = 0;
            true
        } else {
            false
        }
    }

    /// Whether no level below the output level holds any data for
    /// `user_key` — the precondition for dropping an obsolete deletion
    /// marker (visibility rule 3).
    ///
    /// Called with keys in ascending order; advances per-level cursors.
    pub fn is_base_level_for_key(&mut self, user_key: &[u8]) -> bool {
        for level in self.output_level() + 1..NUM_LEVELS {
            let files = self.version.files(level);
            let ptr = &mut self.level_ptrs[level];
            while *ptr < files.len() {
                let file = &files[*ptr];
                if user_key <= file.largest.user_key.as_slice() {
                    if user_key >= file.smallest.user_key.as_slice() {
                        return false;
                    }
                    break;
                }
                *ptr += 1;
            }
        }
        true
    }

    /// Records the deletion of every input file into `edit`.
    pub fn add_input_deletions(&self, edit: &mut VersionEdit) {
        for (which, level) in [(0, self.level), (1, self.output_level())] {
            for file in &self.inputs[which] {
                edit.delete_file(level as u32, file.number);
            }
        }
    }

    /// Restricts a clone of this compaction to the user-key range
    /// `[start, end)` for one sub-compaction worker. Cursors reset so the
    /// worker scans its own range from scratch.
    pub(crate) fn sub_range(
        &self,
        start: Option<InternalKey>,
        end: Option<InternalKey>,
    ) -> Compaction {
        let mut sub = self.clone();
        sub.sub_start = start;
        sub.sub_end = end;
        sub.grandparent_index = 0;
        sub.seen_key = false;
        sub.overlapped_bytes = 0;
        sub.level_ptrs = [0; NUM_LEVELS];
        sub
    }
}

pub(crate) fn total_file_size(files: &[Arc<FileMetaData>]) -> u64 {
    files.iter().map(|f| f.file_size).sum()
}

/// Cumulative I/O counters for one executed compaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
    /// Wall-clock time spent, in microseconds.
    pub micros: u64,
    /// Bytes read from input files.
    pub bytes_read: u64,
    /// Bytes written to output files.
    pub bytes_written: u64,
}

impl CompactionStats {
    /// Accumulates another run's counters.
    pub fn add(&mut self, other: &CompactionStats) {
        self.micros += other.micros;
        self.bytes_read += other.bytes_read;
        self.bytes_written += other.bytes_written;
    }
}
