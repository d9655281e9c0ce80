//! Versioned file metadata — the engine's view of its on-disk state.
//!
//! A [`Version`] is an immutable snapshot of the per-level sorted file
//! lists. Versions are shared through `Arc`: long-running scans and
//! snapshots keep their version alive while the current version moves on,
//! and a version's files cannot be garbage-collected while any reader
//! still references it.
//!
//! [`FileMetaData`] describes one table file: its packed number, size, key
//! bounds, and the statistics compaction heuristics feed on. Metadata is
//! immutable once written and shared across adjacent versions (the file
//! lists are copy-on-write — applying an edit clones the `Arc`s, not the
//! files).
//!
//! Sub-modules:
//!
//! - [`edit`] — [`VersionEdit`], the diff that transitions one version to
//!   the next, and its tag-framed manifest codec.
//! - [`set`] — [`VersionSet`], the owner of the current version, the
//!   manifest log, and compaction picking.

pub mod edit;
pub mod set;


pub use edit::VersionEdit;
pub use set::VersionSet;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::trace;

use crate::config::NUM_LEVELS;
use crate::encoding::{Decode, Encode, EncodingError};
use crate::env::EnvRef;
use crate::files;
use crate::keys::{InternalKey, LookupKey, RollbackMap};
use crate::sstable::{Table, TableError, TableGetResult};
use crate::wal::WalError;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors raised by version bookkeeping, manifest I/O, and recovery.
#[derive(Debug, Error)]
pub enum VersionError {
    /// Underlying I/O error (transient — callers may retry the open).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Manifest log failure.
    #[error("Manifest log error: {0}")]
    Wal(#[from] WalError),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Table open/read failure.
    #[error("Table error: {0}")]
    Table(#[from] TableError),

    /// CURRENT or manifest state is inconsistent; fatal unless the
    /// corruption-tolerant open policy is enabled.
    #[error("Corruption: {0}")]
    Corruption(String),

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// FileMetaData
// ------------------------------------------------------------------------------------------------

/// Metadata of one immutable table file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileMetaData {
    /// Globally unique number: owning tablet id in the high 32 bits,
    /// per-tablet counter in the low 32.
    pub number: u64,

    /// On-disk size in bytes.
    pub file_size: u64,

    /// Smallest internal key in the file.
    pub smallest: InternalKey,

    /// Largest internal key in the file.
    pub largest: InternalKey,

    /// Percentage (0–100) of deletion-tagged entries.
    pub del_percentage: u64,

    /// TTL checkpoint timestamp recorded at build time (0 = none).
    pub ttl_check_ts: u64,

    /// Total entry count.
    pub entry_count: u64,
}

impl Encode for FileMetaData {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.number.encode_to(buf)?;
        self.file_size.encode_to(buf)?;
        self.smallest.encode().encode_to(buf)?;
        self.largest.encode().encode_to(buf)?;
        self.del_percentage.encode_to(buf)?;
        self.ttl_check_ts.encode_to(buf)?;
        self.entry_count.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for FileMetaData {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (number, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (file_size, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (smallest_bytes, n) = <Vec<u8>>::decode_from(&buf[off..])?;
        off += n;
        let (largest_bytes, n) = <Vec<u8>>::decode_from(&buf[off..])?;
        off += n;
        let (del_percentage, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (ttl_check_ts, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (entry_count, n) = u64::decode_from(&buf[off..])?;
        off += n;

        let smallest = InternalKey::decode(&smallest_bytes).ok_or(EncodingError::Custom(
            "unparsable smallest key in file metadata".into(),
        ))?;
        let largest = InternalKey::decode(&largest_bytes).ok_or(EncodingError::Custom(
            "unparsable largest key in file metadata".into(),
        ))?;

        Ok((
            Self {
                number,
                file_size,
                smallest,
                largest,
                del_percentage,
                ttl_check_ts,
                entry_count,
            },
            off,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Table cache
// ------------------------------------------------------------------------------------------------

/// Open-table cache shared by reads and compaction.
///
/// Tables are immutable, so an open handle stays valid for the file's
/// lifetime; entries are evicted when the file is garbage-collected.
pub struct TableCache {
    env: EnvRef,
    dir: PathBuf,
    tables: Mutex<HashMap<u64, Arc<Table>>>,
}

impl TableCache {
    /// Creates a cache for tables under `dir`.
    pub fn new(env: EnvRef, dir: impl Into<PathBuf>) -> Self {
        Self {
            env,
            dir: dir.into(),
            tables: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the open table for `number`, opening it on first use.
    pub fn get(&self, number: u64) -> Result<Arc<Table>, VersionError> {
        let mut tables = self
            .tables
            .lock()
            .map_err(|_| VersionError::Internal("table cache lock poisoned".into()))?;
        if let Some(table) = tables.get(&number) {
            return Ok(Arc::clone(table));
        }
        drop(tables); // do not hold the cache lock across the open

        let path = files::table_file_path(&self.dir, number);
        let table = Arc::new(Table::open(&self.env, &path)?);

        let mut tables = self
            .tables
            .lock()
            .map_err(|_| VersionError::Internal("table cache lock poisoned".into()))?;
        let entry = tables.entry(number).or_insert_with(|| Arc::clone(&table));
        Ok(Arc::clone(entry))
    }

    /// Drops the cached handle for a garbage-collected file.
    pub fn evict(&self, number: u64) {
        if let Ok(mut tables) = self.tables.lock() {
            tables.remove(&number);
        }
    }

    /// Drops any cached handle whose packed number renders to `local_id`
    /// on disk (garbage collection works on directory names).
    pub fn evict_local(&self, local_id: u32) {
        if let Ok(mut tables) = self.tables.lock() {
            tables.retain(|number, _| files::local_file_id(*number) != local_id);
        }
    }

    /// Directory the cached tables live in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

// ------------------------------------------------------------------------------------------------
// Version
// ------------------------------------------------------------------------------------------------

/// Result of a point lookup through one version.
#[derive(Debug, PartialEq)]
pub enum VersionGetResult {
    /// Newest visible entry is a live value.
    Found(Vec<u8>),
    /// Newest visible entry is a deletion marker.
    Deleted,
    /// No file in this version holds a visible entry.
    NotFound,
}

/// An immutable snapshot of the per-level file lists.
pub struct Version {
    /// Files per level. Level 0 is sorted by file number descending
    /// (newest first) and may overlap; levels 1+ are sorted by smallest
    /// key and are disjoint.
    files: Vec<Vec<Arc<FileMetaData>>>,
}

impl Version {
    /// An empty version (fresh database).
    pub fn empty() -> Self {
        Self {
            files: vec![Vec::new(); NUM_LEVELS],
        }
    }

    pub(crate) fn from_files(files: Vec<Vec<Arc<FileMetaData>>>) -> Self {
        debug_assert_eq!(files.len(), NUM_LEVELS);
        Self { files }
    }

    /// Files at `level`.
    pub fn files(&self, level: usize) -> &[Arc<FileMetaData>] {
        &self.files[level]
    }

    /// File count at `level`.
    pub fn num_files(&self, level: usize) -> usize {
        self.files[level].len()
    }

    /// Total bytes at `level`.
    pub fn level_bytes(&self, level: usize) -> u64 {
        self.files[level].iter().map(|f| f.file_size).sum()
    }

    /// Every file number referenced by this version.
    pub fn all_file_numbers(&self) -> impl Iterator<Item = u64> + '_ {
        self.files.iter().flatten().map(|f| f.number)
    }

    /// Looks up `lookup.user_key` through the level hierarchy: level 0
    /// newest-to-oldest, then levels 1+ via binary search on disjoint
    /// ranges. The first visible entry wins.
    pub fn get(
        &self,
        cache: &TableCache,
        lookup: &LookupKey,
        rollbacks: &RollbackMap,
    ) -> Result<VersionGetResult, VersionError> {
        let user_key = lookup.user_key.as_slice();

        // Level 0: overlapping files, newest first (list is kept sorted by
        // file number descending).
        for file in &self.files[0] {
            if user_key < file.smallest.user_key.as_slice()
                || user_key > file.largest.user_key.as_slice()
            {
                continue;
            }
            match cache.get(file.number)?.get(lookup, rollbacks)? {
                TableGetResult::Found { value, .. } => {
                    return Ok(VersionGetResult::Found(value));
                }
                TableGetResult::Deleted { .. } => return Ok(VersionGetResult::Deleted),
                TableGetResult::NotFound => {}
            }
        }

        // Levels 1+: at most one candidate file per level.
        for level in 1..NUM_LEVELS {
            let files = &self.files[level];
            if files.is_empty() {
                continue;
            }
            let pos = files.partition_point(|f| f.largest.user_key.as_slice() < user_key);
            if pos >= files.len() {
                continue;
            }
            let file = &files[pos];
            if user_key < file.smallest.user_key.as_slice() {
                continue;
            }
            match cache.get(file.number)?.get(lookup, rollbacks)? {
                TableGetResult::Found { value, .. } => {
                    return Ok(VersionGetResult::Found(value));
                }
                TableGetResult::Deleted { .. } => return Ok(VersionGetResult::Deleted),
                TableGetResult::NotFound => {}
            }
        }

        Ok(VersionGetResult::NotFound)
    }

    /// Whether any file at `level` overlaps the user-key range
    /// `[smallest, largest]`.
    pub fn overlaps_in_level(&self, level: usize, smallest: &[u8], largest: &[u8]) -> bool {
        if level == 0 {
            return self.files[0].iter().any(|f| {
                f.largest.user_key.as_slice() >= smallest && f.smallest.user_key.as_slice() <= largest
            });
        }
        let files = &self.files[level];
        let pos = files.partition_point(|f| f.largest.user_key.as_slice() < smallest);
        pos < files.len() && files[pos].smallest.user_key.as_slice() <= largest
    }

    /// All files at `level` overlapping `[begin, end]` (user-key bounds;
    /// `None` = unbounded). At level 0 the range grows transitively: an
    /// overlapping file widens the search range, because level-0 files may
    /// overlap each other.
    pub fn overlapping_inputs(
        &self,
        level: usize,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
    ) -> Vec<Arc<FileMetaData>> {
        let mut lo = begin.map(|k| k.user_key.clone());
        let mut hi = end.map(|k| k.user_key.clone());
        let mut inputs: Vec<Arc<FileMetaData>> = Vec::new();

        let mut restart = true;
        while restart {
            restart = false;
            inputs.clear();
            for file in &self.files[level] {
                if let Some(lo) = &lo
                    && file.largest.user_key.as_slice() < lo.as_slice()
                {
                    continue;
                }
                if let Some(hi) = &hi
                    && file.smallest.user_key.as_slice() > hi.as_slice()
                {
                    continue;
                }
                if level == 0 {
                    // A level-0 hit may widen the range; restart the scan
                    // so transitively-overlapping files are included.
                    if let Some(lo_key) = &lo
                        && file.smallest.user_key.as_slice() < lo_key.as_slice()
                    {
                        lo = Some(file.smallest.user_key.clone());
                        restart = true;
                        break;
                    }
                    if let Some(hi_key) = &hi
                        && file.largest.user_key.as_slice() > hi_key.as_slice()
                    {
                        hi = Some(file.largest.user_key.clone());
                        restart = true;
                        break;
                    }
                }
                inputs.push(Arc::clone(file));
            }
        }
        inputs
    }

    /// Picks the output level for a memtable flush covering
    /// `[smallest, largest]`: pushed past level 0 while it overlaps
    /// nothing, up to `max_mem_compact_level`, as long as the grandparent
    /// level would not absorb too much overlap later.
    pub fn pick_level_for_memtable_output(
        &self,
        smallest: &[u8],
        largest: &[u8],
        max_mem_compact_level: usize,
    ) -> usize {
        let mut level = 0;
        if !self.overlaps_in_level(0, smallest, largest) {
            while level < max_mem_compact_level && level + 1 < NUM_LEVELS {
                if self.overlaps_in_level(level + 1, smallest, largest) {
                    break;
                }
                level += 1;
            }
        }
        trace!(level, "picked level for memtable output");
        level
    }
}

// ------------------------------------------------------------------------------------------------
// VersionBuilder — applies edits to a base version
// ------------------------------------------------------------------------------------------------

/// Accumulates [`VersionEdit`]s on top of a base version and materialises
/// the resulting version. Purely additive/subtractive over the per-level
/// file lists.
pub struct VersionBuilder {
    base: Arc<Version>,
    added: Vec<Vec<Arc<FileMetaData>>>,
    deleted: Vec<std::collections::HashSet<u64>>,
}

impl VersionBuilder {
    /// Starts from `base`.
    pub fn new(base: Arc<Version>) -> Self {
        Self {
            base,
            added: vec![Vec::new(); NUM_LEVELS],
            deleted: vec![std::collections::HashSet::new(); NUM_LEVELS],
        }
    }

    /// Applies one edit's file additions and deletions.
    pub fn apply(&mut self, edit: &VersionEdit) -> Result<(), VersionError> {
        for &(level, number) in &edit.deleted_files {
            let level = level as usize;
            if level >= NUM_LEVELS {
                return Err(VersionError::Corruption(format!(
                    "edit deletes file at invalid level {level}"
                )));
            }
            self.deleted[level].insert(number);
        }
        for (level, file) in &edit.new_files {
            let level = *level as usize;
            if level >= NUM_LEVELS {
                return Err(VersionError::Corruption(format!(
                    "edit adds file at invalid level {level}"
                )));
            }
            self.deleted[level].remove(&file.number);
            self.added[level].push(Arc::new(file.clone()));
        }
        Ok(())
    }

    /// Produces the resulting version.
    pub fn build(self) -> Result<Version, VersionError> {
        let mut files: Vec<Vec<Arc<FileMetaData>>> = Vec::with_capacity(NUM_LEVELS);
        for level in 0..NUM_LEVELS {
            let mut merged: Vec<Arc<FileMetaData>> = self.base.files[level]
                .iter()
                .filter(|f| !self.deleted[level].contains(&f.number))
                .cloned()
                .collect();
            merged.extend(
                self.added[level]
                    .iter()
                    .filter(|f| !self.deleted[level].contains(&f.number))
                    .cloned(),
            );

            if level == 0 {
                // Newest flush first.
                merged.sort_by(|a, b| b.number.cmp(&a.number));
            } else {
                merged.sort_by(|a, b| a.smallest.cmp(&b.smallest));
                // Disjointness is a structural invariant of levels 1+.
                for pair in merged.windows(2) {
                    if pair[1].smallest.user_key <= pair[0].largest.user_key {
                        return Err(VersionError::Corruption(format!(
                            "overlapping files {} and {} at level {level}",
                            pair[0].number, pair[1].number
                        )));
                    }
                }
            }
            files.push(merged);
        }
        Ok(Version::from_files(files))
    }
}

// ------------------------------------------------------------------------------------------------
// Level score
// ------------------------------------------------------------------------------------------------

/// Compaction pressure of one level: the level's size relative to its
/// budget. A score ≥ 1.0 means the level needs compacting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelScore {
    /// The level this score describes.
    pub level: usize,
    /// Size over budget: file count over trigger for level 0, bytes over
    /// byte budget for deeper levels.
    pub score: f64,
}

/// Computes per-level compaction scores for `version`.
pub fn compute_scores(version: &Version, config: &crate::config::DbConfig) -> Vec<LevelScore> {
    let mut scores = Vec::with_capacity(NUM_LEVELS - 1);
    for level in 0..NUM_LEVELS - 1 {
        let score = if level == 0 {
            version.num_files(0) as f64 / config.l0_compaction_trigger as f64
        } else {
            version.level_bytes(level) as f64 / config.max_bytes_for_level(level) as f64
        };
        scores.push(LevelScore { level, score });
    }
    scores
}

// ------------------------------------------------------------------------------------------------
// Helpers shared with recovery
// ------------------------------------------------------------------------------------------------

/// Reads the manifest name out of a CURRENT file.
pub(crate) fn read_current_pointer(env: &EnvRef, dir: &Path) -> Result<String, VersionError> {
    let path = files::current_file_path(dir);
    let mut file = env.new_sequential(&path)?;
    let mut contents = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        contents.extend_from_slice(&buf[..n]);
        if contents.len() > 4096 {
            return Err(VersionError::Corruption("CURRENT file too large".into()));
        }
    }
    let text = String::from_utf8(contents)
        .map_err(|_| VersionError::Corruption("CURRENT is not valid UTF-8".into()))?;
    let name = text.trim_end_matches('\n');
    if name.is_empty() || !name.starts_with("MANIFEST-") {
        return Err(VersionError::Corruption(format!(
            "CURRENT names no manifest: {name:?}"
        )));
    }
    Ok(name.to_string())
}

/// Atomically points CURRENT at `manifest_name` (tmp write + rename +
/// directory fsync).
pub(crate) fn set_current_pointer(
    env: &EnvRef,
    dir: &Path,
    manifest_name: &str,
) -> Result<(), VersionError> {
    let tmp = dir.join("CURRENT.tmp");
    let mut file = env.new_writable(&tmp)?;
    file.append(manifest_name.as_bytes())?;
    file.append(b"\n")?;
    file.sync()?;
    drop(file);
    env.rename_file(&tmp, &files::current_file_path(dir))?;
    env.sync_dir(dir)?;
    Ok(())
}
