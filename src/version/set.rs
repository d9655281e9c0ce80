//! The version set — owner of the current version and the manifest log.
//!
//! [`VersionSet`] tracks the live [`Version`], the counters every edit
//! snapshots (next file number, last sequence, log number), and the
//! per-level compaction cursors. All mutating methods are called with the
//! engine's global lock held; the version set itself adds no locking.
//!
//! # Crash atomicity
//!
//! [`VersionSet::log_and_apply`] appends the encoded edit to the durable
//! manifest log **before** swapping in the new version. A crash between
//! the append and the swap is tolerated: reopening replays the manifest
//! and arrives at the same state. A manifest write failure is fatal to the
//! open session — no partial manifest commit is ever visible.
//!
//! # Version lifetime
//!
//! Old versions stay alive while any reader (scan, snapshot, compaction)
//! holds their `Arc`. The set keeps a `Weak` registry so garbage
//! collection can compute the union of files referenced by *any* live
//! version, not just the current one.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use tracing::{debug, info};

use super::{
    FileMetaData, LevelScore, TableCache, Version, VersionBuilder, VersionEdit, VersionError,
    compute_scores, read_current_pointer, set_current_pointer,
};
use crate::compaction::Compaction;
use crate::config::{DbConfig, NUM_LEVELS};
use crate::env::EnvRef;
use crate::files;
use crate::keys::{InternalKey, SequenceNumber};
use crate::wal::{self, Wal};

/// Comparator identity written into every manifest; recovery cross-checks
/// it so a tablet is never opened with a different key order than it was
/// written with.
pub const COMPARATOR_NAME: &str = "stratadb.InternalKeyComparator.v1";

/// Owner of the current version, the manifest log, and compaction picking.
pub struct VersionSet {
    env: EnvRef,
    dir: PathBuf,
    config: DbConfig,
    table_cache: Arc<TableCache>,

    current: Arc<Version>,
    /// Every version ever installed, pruned lazily; used for live-file
    /// accounting.
    live: Vec<Weak<Version>>,

    manifest: Option<Wal<VersionEdit>>,
    manifest_number: u64,
    manifest_bytes: u64,

    /// Local file-number counter (low 32 bits of packed numbers).
    next_file_number: u64,
    last_sequence: SequenceNumber,
    /// Packed number of the data log whose writes are reflected in
    /// `current`.
    log_number: u64,

    /// Per-level cursor where the next size compaction resumes.
    compact_pointers: Vec<Option<InternalKey>>,
}

impl VersionSet {
    /// Creates an in-memory set with an empty version. Callers follow up
    /// with [`VersionSet::create_new`] or [`VersionSet::recover`].
    pub fn new(env: EnvRef, dir: impl Into<PathBuf>, config: DbConfig) -> Self {
        let dir = dir.into();
        let table_cache = Arc::new(TableCache::new(Arc::clone(&env), dir.clone()));
        Self {
            env,
            dir,
            config,
            table_cache,
            current: Arc::new(Version::empty()),
            live: Vec::new(),
            manifest: None,
            manifest_number: 0,
            manifest_bytes: 0,
            next_file_number: 2,
            last_sequence: 0,
            log_number: 0,
            compact_pointers: vec![None; NUM_LEVELS],
        }
    }

    /// Initialises a brand-new database: writes a snapshot manifest and
    /// points CURRENT at it.
    pub fn create_new(&mut self) -> Result<(), VersionError> {
        self.rewrite_manifest()?;
        info!(dir = %self.dir.display(), "initialised new database");
        Ok(())
    }

    /// Recovers state from CURRENT + manifest replay.
    ///
    /// A missing or unparsable CURRENT is `Corruption` (the caller decides
    /// whether its repair policy accepts that); transient storage errors
    /// surface as `Io` so the caller can retry the open instead of
    /// declaring data loss.
    pub fn recover(&mut self) -> Result<(), VersionError> {
        let current_name = match read_current_pointer(&self.env, &self.dir) {
            Ok(name) => name,
            Err(VersionError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(VersionError::Corruption("CURRENT file missing".into()));
            }
            Err(e) => return Err(e),
        };
        let manifest_path = self.dir.join(&current_name);
        if !self.env.file_exists(&manifest_path) {
            return Err(VersionError::Corruption(format!(
                "CURRENT names missing manifest {current_name}"
            )));
        }

        let mut builder = VersionBuilder::new(Arc::new(Version::empty()));
        let mut next_file = None;
        let mut last_sequence = None;
        let mut log_number = None;
        let mut comparator = None;
        let mut edit_count = 0u64;

        for record in wal::replay::<VersionEdit>(&self.env, &manifest_path)? {
            // Any torn record in the manifest is corruption: edits are
            // committed only after a synced append, so a good manifest
            // never ends mid-record.
            let edit = record.map_err(|e| {
                VersionError::Corruption(format!("manifest replay failed: {e}"))
            })?;

            builder.apply(&edit)?;
            if let Some(v) = edit.next_file_number {
                next_file = Some(v);
            }
            if let Some(v) = edit.last_sequence {
                last_sequence = Some(v);
            }
            if let Some(v) = edit.log_number {
                log_number = Some(v);
            }
            if let Some(v) = edit.comparator {
                comparator = Some(v);
            }
            for (level, key) in edit.compact_pointers {
                if (level as usize) < NUM_LEVELS {
                    self.compact_pointers[level as usize] = Some(key);
                }
            }
            edit_count += 1;
        }

        if let Some(name) = &comparator
            && name != COMPARATOR_NAME
        {
            return Err(VersionError::Corruption(format!(
                "comparator mismatch: manifest has {name:?}, engine uses {COMPARATOR_NAME:?}"
            )));
        }

        let version = builder.build()?;
        self.next_file_number = next_file
            .ok_or_else(|| VersionError::Corruption("manifest lacks next file number".into()))?;
        self.last_sequence = last_sequence
            .ok_or_else(|| VersionError::Corruption("manifest lacks last sequence".into()))?;
        self.log_number = log_number.unwrap_or(0);
        self.install(version);

        info!(
            dir = %self.dir.display(),
            edits = edit_count,
            last_sequence = self.last_sequence,
            next_file = self.next_file_number,
            "recovered manifest"
        );

        // Start a fresh manifest so replay cost stays bounded and the old
        // descriptor becomes garbage.
        self.rewrite_manifest()?;
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Accessors
    // --------------------------------------------------------------------------------------------

    /// The current version.
    pub fn current(&self) -> Arc<Version> {
        Arc::clone(&self.current)
    }

    /// Shared open-table cache.
    pub fn table_cache(&self) -> Arc<TableCache> {
        Arc::clone(&self.table_cache)
    }

    /// Last committed sequence number.
    pub fn last_sequence(&self) -> SequenceNumber {
        self.last_sequence
    }

    /// Bumps the last committed sequence number.
    pub fn set_last_sequence(&mut self, seq: SequenceNumber) {
        debug_assert!(seq >= self.last_sequence);
        self.last_sequence = seq;
    }

    /// Packed number of the data log reflected in the current version.
    pub fn log_number(&self) -> u64 {
        self.log_number
    }

    /// Allocates the next packed file number.
    pub fn new_file_number(&mut self) -> u64 {
        let number = files::pack_file_number(self.config.tablet_id, self.next_file_number as u32);
        self.next_file_number += 1;
        number
    }

    /// Raises the local file counter past numbers imported from parent
    /// tablets, so freshly-allocated names never collide with inherited
    /// files.
    pub fn ensure_next_file_at_least(&mut self, local: u64) {
        if local > self.next_file_number {
            self.next_file_number = local;
        }
    }

    /// File count at `level` in the current version.
    pub fn num_level_files(&self, level: usize) -> usize {
        self.current.num_files(level)
    }

    /// Current per-level compaction scores.
    pub fn scores(&self) -> Vec<LevelScore> {
        compute_scores(&self.current, &self.config)
    }

    /// Packed number of the manifest currently being appended to.
    pub fn manifest_number(&self) -> u64 {
        self.manifest_number
    }

    // --------------------------------------------------------------------------------------------
    // log_and_apply
    // --------------------------------------------------------------------------------------------

    /// Commits `edit`: stamps the counter fields, appends the edit to the
    /// durable manifest, and only then installs the resulting version as
    /// current.
    ///
    /// Must be called with the engine's global lock held; the caller
    /// serialises all manifest writers.
    pub fn log_and_apply(&mut self, edit: &mut VersionEdit) -> Result<Arc<Version>, VersionError> {
        // Roll the manifest before it grows unbounded. Rolling first:
        // the roll consumes a file number, and the edit must snapshot the
        // counter *after* that so replay never regresses it.
        if self.manifest_bytes >= self.config.manifest_rollover_bytes {
            self.rewrite_manifest()?;
        }

        if edit.log_number.is_none() {
            edit.log_number = Some(self.log_number);
        }
        edit.next_file_number = Some(self.next_file_number);
        edit.last_sequence = Some(self.last_sequence);

        let mut builder = VersionBuilder::new(Arc::clone(&self.current));
        builder.apply(edit)?;
        let version = builder.build()?;

        let manifest = self
            .manifest
            .as_ref()
            .ok_or_else(|| VersionError::Internal("log_and_apply before manifest init".into()))?;
        let mut encoded = Vec::new();
        VersionEdit::encode_to(edit, &mut encoded)?;
        manifest.append(edit)?;
        self.manifest_bytes += encoded.len() as u64 + 12;

        if let Some(n) = edit.log_number {
            self.log_number = n;
        }
        for (level, key) in &edit.compact_pointers {
            if (*level as usize) < NUM_LEVELS {
                self.compact_pointers[*level as usize] = Some(key.clone());
            }
        }

        let installed = self.install(version);
        debug!(
            added = edit.new_files.len(),
            deleted = edit.deleted_files.len(),
            "applied version edit"
        );
        Ok(installed)
    }

    /// Makes `version` current and registers it for live-file accounting.
    fn install(&mut self, version: Version) -> Arc<Version> {
        let version = Arc::new(version);
        self.live.retain(|w| w.strong_count() > 0);
        self.live.push(Arc::downgrade(&version));
        self.current = Arc::clone(&version);
        version
    }

    /// Starts a fresh manifest containing a snapshot edit of the full
    /// current state, then atomically flips CURRENT.
    fn rewrite_manifest(&mut self) -> Result<(), VersionError> {
        let manifest_number =
            files::pack_file_number(self.config.tablet_id, self.next_file_number as u32);
        self.next_file_number += 1;

        let path = files::manifest_file_path(&self.dir, manifest_number);
        let manifest = Wal::<VersionEdit>::create(&self.env, &path, manifest_number)?;

        let mut snapshot = VersionEdit::new();
        snapshot.comparator = Some(COMPARATOR_NAME.to_string());
        snapshot.log_number = Some(self.log_number);
        snapshot.next_file_number = Some(self.next_file_number);
        snapshot.last_sequence = Some(self.last_sequence);
        for (level, key) in self.compact_pointers.iter().enumerate() {
            if let Some(key) = key {
                snapshot.set_compact_pointer(level as u32, key.clone());
            }
        }
        for level in 0..NUM_LEVELS {
            for file in self.current.files(level) {
                snapshot.add_file(level as u32, file.as_ref().clone());
            }
        }
        manifest.append(&snapshot)?;

        let manifest_name = format!("MANIFEST-{:06}", files::local_file_id(manifest_number));
        set_current_pointer(&self.env, &self.dir, &manifest_name)?;

        self.manifest = Some(manifest);
        self.manifest_number = manifest_number;
        self.manifest_bytes = 0;
        debug!(manifest = %manifest_name, "rolled manifest");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Live-file accounting
    // --------------------------------------------------------------------------------------------

    /// Union of file numbers referenced by any live version.
    pub fn live_file_numbers(&mut self) -> HashSet<u64> {
        self.live.retain(|w| w.strong_count() > 0);
        let mut live = HashSet::new();
        for weak in &self.live {
            if let Some(version) = weak.upgrade() {
                live.extend(version.all_file_numbers());
            }
        }
        live.extend(self.current.all_file_numbers());
        live
    }

    /// Drops the cached table handle for a deleted file.
    pub fn evict_table(&self, number: u64) {
        self.table_cache.evict(number);
    }

    // --------------------------------------------------------------------------------------------
    // Compaction picking
    // --------------------------------------------------------------------------------------------

    /// Picks the next size-triggered compaction, or `None` when every
    /// level scores below 1.0.
    ///
    /// The highest-scoring level wins; its input starts at the level's
    /// compact pointer so repeated compactions rotate through the key
    /// space instead of hammering one range.
    pub fn pick_compaction(&mut self) -> Option<Compaction> {
        let best = self
            .scores()
            .into_iter()
            .max_by(|a, b| a.score.total_cmp(&b.score))?;
        if best.score < 1.0 {
            return None;
        }
        let level = best.level;
        let version = self.current();

        // First file past the cursor, wrapping to the front.
        let mut inputs: Vec<Arc<FileMetaData>> = Vec::new();
        let files = version.files(level);
        if let Some(pointer) = &self.compact_pointers[level] {
            if let Some(file) = files.iter().find(|f| f.largest > *pointer) {
                inputs.push(Arc::clone(file));
            }
        }
        if inputs.is_empty() {
            inputs.push(Arc::clone(files.first()?));
        }

        if level == 0 {
            // Level-0 files overlap each other; widen to the transitive
            // closure so no newer entry is left behind.
            let smallest = inputs[0].smallest.clone();
            let largest = inputs[0].largest.clone();
            inputs = version.overlapping_inputs(0, Some(&smallest), Some(&largest));
        }

        let mut compaction = Compaction::new(&self.config, version, level, inputs, false);
        self.setup_other_inputs(&mut compaction);
        Some(compaction)
    }

    /// Builds a manual compaction over `[begin, end]` at `level`, or
    /// `None` when the range holds no files.
    pub fn compact_range(
        &mut self,
        level: usize,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
    ) -> Option<Compaction> {
        let version = self.current();
        let mut inputs = version.overlapping_inputs(level, begin, end);
        if inputs.is_empty() {
            return None;
        }
        // Keep one manual round bounded: trim the input list once it
        // exceeds the expansion budget (level 0 excepted — its files
        // overlap and must travel together).
        if level > 0 {
            let limit = self.config.expanded_compaction_byte_limit();
            let mut total = 0u64;
            for (i, file) in inputs.iter().enumerate() {
                total += file.file_size;
                if total >= limit {
                    inputs.truncate(i + 1);
                    break;
                }
            }
        }
        let mut compaction = Compaction::new(&self.config, version, level, inputs, true);
        self.setup_other_inputs(&mut compaction);
        Some(compaction)
    }

    /// Expands a compaction with its level+1 overlaps and grandparents,
    /// and advances the level's compact pointer past the chosen inputs.
    fn setup_other_inputs(&mut self, compaction: &mut Compaction) {
        let level = compaction.level;
        let version = compaction.input_version();

        let (smallest, largest) = compaction.input_range(0);
        compaction.set_next_level_inputs(version.overlapping_inputs(
            level + 1,
            Some(&smallest),
            Some(&largest),
        ));

        // Grandparents bound output-file overlap with level+2.
        if level + 2 < NUM_LEVELS {
            let (all_smallest, all_largest) = compaction.total_input_range();
            compaction.set_grandparents(version.overlapping_inputs(
                level + 2,
                Some(&all_smallest),
                Some(&all_largest),
            ));
        }

        let (_, largest) = compaction.input_range(0);
        self.compact_pointers[level] = Some(largest.clone());
        compaction.edit_template.set_compact_pointer(level as u32, largest);
    }

    // --------------------------------------------------------------------------------------------
    // Split support
    // --------------------------------------------------------------------------------------------

    /// Suggests a user key splitting the tablet into two halves of roughly
    /// equal on-disk size, or `None` when there is nothing to split.
    pub fn suggest_split_key(&self) -> Option<Vec<u8>> {
        let mut sized: Vec<(&Arc<FileMetaData>, u64)> = Vec::new();
        let mut total = 0u64;
        for level in 0..NUM_LEVELS {
            for file in self.current.files(level) {
                total += file.file_size;
                sized.push((file, file.file_size));
            }
        }
        if total == 0 {
            return None;
        }
        // Walk files in key order and stop where cumulative size crosses
        // the midpoint.
        sized.sort_by(|a, b| a.0.largest.user_key.cmp(&b.0.largest.user_key));
        let mut acc = 0u64;
        for (file, size) in sized {
            acc += size;
            if acc * 2 >= total {
                return Some(file.largest.user_key.clone());
            }
        }
        None
    }

    /// Tablet directory this set manages.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

// ------------------------------------------------------------------------------------------------
// Read-only manifest loading (parent-tablet import)
// ------------------------------------------------------------------------------------------------

/// Replays another tablet's CURRENT + manifest **without touching it**,
/// returning the `(level, file)` pairs of its recovered version. Used to
/// inherit files from parent tablets during a first load.
pub fn load_manifest_files(
    env: &EnvRef,
    dir: &Path,
) -> Result<Vec<(u32, FileMetaData)>, VersionError> {
    let current_name = read_current_pointer(env, dir)?;
    let manifest_path = dir.join(&current_name);

    let mut builder = VersionBuilder::new(Arc::new(Version::empty()));
    for record in crate::wal::replay::<VersionEdit>(env, &manifest_path)? {
        let edit =
            record.map_err(|e| VersionError::Corruption(format!("parent manifest: {e}")))?;
        builder.apply(&edit)?;
    }
    let version = builder.build()?;

    let mut out = Vec::new();
    for level in 0..NUM_LEVELS {
        for file in version.files(level) {
            out.push((level as u32, file.as_ref().clone()));
        }
    }
    Ok(out)
}
