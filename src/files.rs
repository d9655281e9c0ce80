//! Tablet directory layout: file naming, parsing, and number packing.
//!
//! A tablet directory contains:
//!
//! ```text
//! CURRENT                  pointer to the active manifest
//! MANIFEST-<N>             version-edit log
//! <file_number>.sst        sorted table files
//! <file_number>.log        write-ahead log segments
//! LOCK                     advisory single-opener lock
//! __oops                   marker forcing corruption-tolerant open
//! __init_load_filelock     marker for an in-progress first load
//! ```
//!
//! File numbers are globally unique across a cluster: the upper 32 bits
//! carry the owning tablet id, the lower 32 bits a per-tablet counter.
//! Numbers are rendered in decimal on the low 32 bits only, so file names
//! stay short and sortable within a tablet directory.

use std::path::{Path, PathBuf};

/// Pointer file naming the active manifest.
pub const CURRENT_FILE: &str = "CURRENT";

/// Advisory lock file held for the lifetime of an open engine.
pub const LOCK_FILE: &str = "LOCK";

/// Marker forcing a corruption-tolerant open (equivalent to setting
/// `ignore_corruption_in_open`).
pub const OOPS_MARKER: &str = "__oops";

/// Marker created when a first load begins and removed when it commits; its
/// presence at open means the previous load died partway through.
pub const INIT_LOAD_MARKER: &str = "__init_load_filelock";

// ------------------------------------------------------------------------------------------------
// File number packing
// ------------------------------------------------------------------------------------------------

/// Packs `(tablet_id, local_id)` into one globally-unique file number.
pub fn pack_file_number(tablet_id: u32, local_id: u32) -> u64 {
    ((tablet_id as u64) << 32) | local_id as u64
}

/// Splits a packed file number into `(tablet_id, local_id)`.
pub fn unpack_file_number(number: u64) -> (u32, u32) {
    ((number >> 32) as u32, (number & 0xFFFF_FFFF) as u32)
}

/// The per-tablet counter part of a file number.
pub fn local_file_id(number: u64) -> u32 {
    (number & 0xFFFF_FFFF) as u32
}

// ------------------------------------------------------------------------------------------------
// Name construction
// ------------------------------------------------------------------------------------------------

/// `<dir>/CURRENT`
pub fn current_file_path(dir: &Path) -> PathBuf {
    dir.join(CURRENT_FILE)
}

/// `<dir>/MANIFEST-<local id, 6 digits>`
pub fn manifest_file_path(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("MANIFEST-{:06}", local_file_id(number)))
}

/// `<dir>/<local id, 6 digits>.sst`
pub fn table_file_path(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{:06}.sst", local_file_id(number)))
}

/// `<dir>/<local id, 6 digits>.log`
pub fn log_file_path(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{:06}.log", local_file_id(number)))
}

// ------------------------------------------------------------------------------------------------
// Name parsing
// ------------------------------------------------------------------------------------------------

/// The role a file plays inside a tablet directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// `CURRENT` pointer.
    Current,
    /// `LOCK` advisory lock.
    Lock,
    /// `MANIFEST-<n>` version-edit log; carries the local id.
    Manifest(u32),
    /// `<n>.sst` sorted table; carries the local id.
    Table(u32),
    /// `<n>.log` write-ahead log segment; carries the local id.
    Log(u32),
    /// `__oops` or `__init_load_filelock`.
    Marker,
}

/// Classifies a directory entry name; `None` for foreign files (left
/// untouched by garbage collection).
pub fn parse_file_name(name: &str) -> Option<FileKind> {
    match name {
        CURRENT_FILE => return Some(FileKind::Current),
        LOCK_FILE => return Some(FileKind::Lock),
        OOPS_MARKER | INIT_LOAD_MARKER => return Some(FileKind::Marker),
        _ => {}
    }
    if let Some(rest) = name.strip_prefix("MANIFEST-") {
        return rest.parse::<u32>().ok().map(FileKind::Manifest);
    }
    if let Some(rest) = name.strip_suffix(".sst") {
        return rest.parse::<u32>().ok().map(FileKind::Table);
    }
    if let Some(rest) = name.strip_suffix(".log") {
        return rest.parse::<u32>().ok().map(FileKind::Log);
    }
    None
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------
