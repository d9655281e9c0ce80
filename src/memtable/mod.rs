//! Memtable — the in-memory sorted write buffer.
//!
//! A [`MemTable`] maps internal keys to values. At most one memtable is
//! **active** (accepting the single serialized mutation stream) and at most
//! one is **immutable** (frozen, awaiting flush) at any time; the engine's
//! writer queue enforces the single-writer side, this type enforces the
//! frozen side.
//!
//! Ownership is shared through `Arc`: readers, the flush path, and
//! iterators each hold a reference, and the table is reclaimed when the
//! last one drops — no reader ever observes a freed memtable.
//!
//! ## Concurrency
//!
//! The sorted tree lives behind an `RwLock`: many concurrent readers, one
//! writer at a time. Approximate memory usage is tracked in an atomic so
//! the rotation check never takes the tree lock.
//!
//! ## Reads
//!
//! `get` returns the newest entry for a user key at or below the read
//! snapshot, skipping entries inside active rollback intervals. A deletion
//! marker is a *definitive* answer (the key is gone at this layer), which
//! is why the result is a three-way enum rather than an `Option`.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use thiserror::Error;
use tracing::trace;

use crate::keys::{HexKey, InternalKey, LookupKey, RollbackMap, SequenceNumber, ValueType};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`MemTable`] operations.
#[derive(Debug, Error)]
pub enum MemtableError {
    /// A write reached a memtable already marked immutable.
    #[error("memtable is immutable")]
    Immutable,

    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Result of a point lookup
// ------------------------------------------------------------------------------------------------

/// Outcome of a memtable point lookup.
///
/// `Deleted` is as definitive as `Found`: lower layers must not be
/// consulted, because the newest visible entry for the key is a tombstone.
#[derive(Debug, PartialEq)]
pub enum MemGetResult {
    /// Newest visible entry is a live value.
    Found(Vec<u8>),
    /// Newest visible entry is a deletion marker.
    Deleted,
    /// No visible entry for the key in this memtable.
    NotFound,
}

// ------------------------------------------------------------------------------------------------
// MemTable
// ------------------------------------------------------------------------------------------------

/// An in-memory sorted container of internal-key → value entries.
pub struct MemTable {
    /// Sorted entries. Deletion markers store an empty value; the key's
    /// `ValueType` is authoritative.
    tree: RwLock<BTreeMap<InternalKey, Vec<u8>>>,

    /// Approximate bytes held, maintained outside the tree lock so the
    /// rotation check in the write path stays cheap.
    approximate_size: AtomicUsize,

    /// Set once by [`MemTable::mark_immutable`]; writes afterwards fail.
    immutable: AtomicBool,
}

impl MemTable {
    /// Creates an empty memtable.
    pub fn new() -> Self {
        Self {
            tree: RwLock::new(BTreeMap::new()),
            approximate_size: AtomicUsize::new(0),
            immutable: AtomicBool::new(false),
        }
    }

    /// Inserts one entry.
    ///
    /// Callers must hold the engine's single-writer position (writer queue
    /// head or recovery). Sequence numbers are assigned by the caller and
    /// must be unique.
    pub fn add(
        &self,
        sequence: SequenceNumber,
        kind: ValueType,
        user_key: &[u8],
        value: &[u8],
    ) -> Result<(), MemtableError> {
        if self.immutable.load(Ordering::Acquire) {
            return Err(MemtableError::Immutable);
        }

        let key = InternalKey::new(user_key.to_vec(), sequence, kind);
        let entry_size = user_key.len() + value.len() + crate::keys::TRAILER_LEN + 32;

        let mut tree = self
            .tree
            .write()
            .map_err(|_| MemtableError::Internal("memtable lock poisoned".into()))?;
        tree.insert(key, value.to_vec());
        drop(tree);

        self.approximate_size.fetch_add(entry_size, Ordering::Relaxed);

        trace!(
            seq = sequence,
            ?kind,
            key = %HexKey(user_key),
            "memtable add"
        );
        Ok(())
    }

    /// Looks up the newest entry for `lookup.user_key` visible at
    /// `lookup.snapshot`, skipping rollback-dropped sequences.
    pub fn get(
        &self,
        lookup: &LookupKey,
        rollbacks: &RollbackMap,
    ) -> Result<MemGetResult, MemtableError> {
        let tree = self
            .tree
            .read()
            .map_err(|_| MemtableError::Internal("memtable lock poisoned".into()))?;

        // Entries for this user key at or below the snapshot start at the
        // probe key and run while the user key matches (sequence descends).
        let probe = lookup.to_internal();
        for (key, value) in tree.range((Bound::Included(probe), Bound::Unbounded)) {
            if key.user_key != lookup.user_key {
                break;
            }
            if rollbacks.should_drop(key.sequence) {
                continue;
            }
            return Ok(match key.kind {
                ValueType::Value => MemGetResult::Found(value.clone()),
                ValueType::Deletion => MemGetResult::Deleted,
            });
        }
        Ok(MemGetResult::NotFound)
    }

    /// Returns a point-in-time iterator over all entries in internal-key
    /// order.
    ///
    /// The snapshot is materialised under the read lock, so entries added
    /// after this call are not visible through the returned iterator.
    pub fn iter(&self) -> Result<MemTableIterator, MemtableError> {
        let tree = self
            .tree
            .read()
            .map_err(|_| MemtableError::Internal("memtable lock poisoned".into()))?;
        let entries: Vec<(InternalKey, Vec<u8>)> =
            tree.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        Ok(MemTableIterator {
            entries: entries.into_iter(),
        })
    }

    /// Approximate bytes of memory held by entries.
    pub fn approximate_memory_usage(&self) -> usize {
        self.approximate_size.load(Ordering::Relaxed)
    }

    /// True if no entry was ever added.
    pub fn is_empty(&self) -> bool {
        self.tree.read().map(|t| t.is_empty()).unwrap_or(true)
    }

    /// Number of entries (all versions).
    pub fn len(&self) -> usize {
        self.tree.read().map(|t| t.len()).unwrap_or(0)
    }

    /// Freezes the table: all subsequent [`MemTable::add`] calls fail.
    pub fn mark_immutable(&self) {
        self.immutable.store(true, Ordering::Release);
    }

    /// Whether [`MemTable::mark_immutable`] has been called.
    pub fn is_immutable(&self) -> bool {
        self.immutable.load(Ordering::Acquire)
    }
}

impl Default for MemTable {
    fn default() -> Self {
        Self::new()
    }
}

// ------------------------------------------------------------------------------------------------
// Iterator
// ------------------------------------------------------------------------------------------------

/// Owning iterator over a memtable snapshot, in internal-key order.
pub struct MemTableIterator {
    entries: std::vec::IntoIter<(InternalKey, Vec<u8>)>,
}

impl Iterator for MemTableIterator {
    type Item = (InternalKey, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next()
    }
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------
