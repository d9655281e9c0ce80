//! Engine configuration.
//!
//! Every numeric threshold here is policy, not algorithm: the engine's
//! invariants hold for any valid setting. Defaults follow the values the
//! serving layer has run in production.

/// Number of levels in the file hierarchy.
pub const NUM_LEVELS: usize = 7;

/// Which compact strategy the engine instantiates for its compactions.
///
/// Strategies are constructed per compaction worker — never shared — so
/// they may carry scratch state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompactStrategyKind {
    /// Keep every surviving entry as-is.
    #[default]
    Passthrough,
    /// Merge little-endian i64 counter cells for the same user key.
    MergeCounters,
    /// Values carry an expiry-timestamp prefix tag; expired entries are
    /// dropped below the smallest snapshot.
    TtlTagged,
}

/// Configuration for one engine instance (one tablet).
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Identifier of the owning tablet, packed into the high 32 bits of
    /// every file number this engine allocates.
    pub tablet_id: u32,

    /// Tablet directories of 0, 1, or 2 parents to inherit files from on
    /// first load (new tablet, post-split child, post-merge result).
    pub parent_tablets: Vec<std::path::PathBuf>,

    /// Max active-memtable size in bytes before rotation.
    pub write_buffer_size: usize,

    /// Target size of compaction output files in bytes.
    pub max_file_size: u64,

    /// Level-1 byte budget; each deeper level gets ten times more.
    pub max_bytes_for_level_base: u64,

    /// Level-0 file count that makes compaction score reach 1.0.
    pub l0_compaction_trigger: usize,

    /// Level-0 file count at which each write is delayed 1 ms (once).
    pub l0_slowdown_writes_trigger: usize,

    /// Level-0 file count at which writes block until compaction catches
    /// up.
    pub l0_stop_writes_trigger: usize,

    /// Highest level a memtable flush may be placed at when it overlaps
    /// nothing below.
    pub max_mem_compact_level: usize,

    /// Upper bound on concurrently running background compactions.
    pub max_background_compactions: usize,

    /// Upper bound on parallel sub-compactions within one compaction.
    pub max_sub_compactions: usize,

    /// Consecutive background-compaction failures tolerated before the
    /// error latches and compaction is disabled.
    pub max_consecutive_compaction_errors: u64,

    /// Percentile (0–100) of observed TTLs recorded per output table.
    pub ttl_percentage: u32,

    /// Manifest size in bytes after which the descriptor log is rolled.
    pub manifest_rollover_bytes: u64,

    /// Compact strategy instantiated for compactions.
    pub compact_strategy: CompactStrategyKind,

    /// Drop obsolete deletion markers at the base level for their key.
    pub drop_base_level_deletions: bool,

    /// Surface the latched background error to writers.
    pub paranoid_checks: bool,

    /// Tolerate a missing or corrupt CURRENT/manifest at open, starting
    /// from an empty version and accepting data loss.
    pub ignore_corruption_in_open: bool,

    /// Flush the active memtable during phase-1 shutdown.
    pub dump_mem_on_shutdown: bool,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            tablet_id: 1,
            parent_tablets: Vec::new(),
            write_buffer_size: 4 * 1024 * 1024,
            max_file_size: 8 * 1024 * 1024,
            max_bytes_for_level_base: 10 * 1024 * 1024,
            l0_compaction_trigger: 4,
            l0_slowdown_writes_trigger: 8,
            l0_stop_writes_trigger: 12,
            max_mem_compact_level: 2,
            max_background_compactions: 2,
            max_sub_compactions: 4,
            max_consecutive_compaction_errors: 100_000,
            ttl_percentage: 50,
            manifest_rollover_bytes: 4 * 1024 * 1024,
            compact_strategy: CompactStrategyKind::Passthrough,
            drop_base_level_deletions: true,
            paranoid_checks: false,
            ignore_corruption_in_open: false,
            dump_mem_on_shutdown: true,
        }
    }
}

impl DbConfig {
    /// Byte budget for `level`; level 0 is scored by file count instead.
    pub fn max_bytes_for_level(&self, level: usize) -> u64 {
        let mut budget = self.max_bytes_for_level_base;
        for _ in 1..level.max(1) {
            budget = budget.saturating_mul(10);
        }
        budget
    }

    /// Grandparent-overlap budget at which a compaction output is cut.
    pub fn max_grandparent_overlap_bytes(&self) -> u64 {
        10 * self.max_file_size
    }

    /// Input-bytes budget used when expanding level-L inputs.
    pub fn expanded_compaction_byte_limit(&self) -> u64 {
        25 * self.max_file_size
    }
}
