//! Internal key codec — the engine's true sort key.
//!
//! Every entry the engine stores is addressed by an **internal key**: the
//! caller's byte key (which, for a tablet, already embeds row, column
//! family, qualifier, and timestamp), a monotonically increasing
//! **sequence number** assigned at commit time, and a **value type**
//! discriminating live values from deletion markers.
//!
//! # Ordering
//!
//! Internal keys sort by user key **ascending**, then sequence number
//! **descending**, then value type descending. For a fixed user key the
//! newest write sorts first, so a forward scan naturally sees the most
//! recent version of each key before any older ones.
//!
//! # Byte form
//!
//! ```text
//! [user_key bytes][fixed64 LE: (sequence << 8) | value_type]
//! ```
//!
//! The 8-byte trailer packs the sequence number into the upper 56 bits,
//! which caps sequences at 2^56 - 1 ([`MAX_SEQUENCE`]).
//!
//! # Rollback intervals
//!
//! [`RollbackMap`] records administrative rollback points. An entry whose
//! sequence falls inside any interval `(snapshot_seq, rollback_point]` is
//! treated as if it had never been written: hidden from reads and dropped
//! unconditionally by compaction.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// A monotonically increasing commit sequence number.
///
/// Strictly increasing across the lifetime of a database instance; a write
/// batch commits a contiguous range of sequence numbers atomically.
pub type SequenceNumber = u64;

/// Largest representable sequence number (56 usable bits — the low byte of
/// the packed trailer holds the value type).
pub const MAX_SEQUENCE: SequenceNumber = (1 << 56) - 1;

/// Length in bytes of the packed `(sequence, type)` trailer.
pub const TRAILER_LEN: usize = 8;

// ------------------------------------------------------------------------------------------------
// ValueType
// ------------------------------------------------------------------------------------------------

/// Discriminates live values from deletion markers.
///
/// Numeric values are part of the on-disk format. `Deletion < Value` so
/// that the packed trailer of a Value sorts *after* the trailer of a
/// Deletion at identical `(user_key, sequence)` under the descending
/// trailer order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ValueType {
    /// A deletion marker (tombstone).
    Deletion = 0,
    /// A live value.
    Value = 1,
}

impl ValueType {
    /// Decodes a value type from its wire byte.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ValueType::Deletion),
            1 => Some(ValueType::Value),
            _ => None,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// InternalKey
// ------------------------------------------------------------------------------------------------

/// A fully-qualified engine key: `(user_key, sequence, kind)`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct InternalKey {
    /// The caller-visible byte key.
    pub user_key: Vec<u8>,
    /// Commit sequence number of this entry.
    pub sequence: SequenceNumber,
    /// Whether the entry is a value or a deletion marker.
    pub kind: ValueType,
}

impl InternalKey {
    /// Creates an internal key.
    pub fn new(user_key: impl Into<Vec<u8>>, sequence: SequenceNumber, kind: ValueType) -> Self {
        debug_assert!(sequence <= MAX_SEQUENCE);
        Self {
            user_key: user_key.into(),
            sequence,
            kind,
        }
    }

    /// The largest possible internal key for `user_key`: sorts before every
    /// real entry of that user key (highest sequence first).
    pub fn max_for_key(user_key: impl Into<Vec<u8>>) -> Self {
        Self::new(user_key, MAX_SEQUENCE, ValueType::Value)
    }

    /// Packs the `(sequence, kind)` trailer.
    #[inline]
    fn trailer(&self) -> u64 {
        (self.sequence << 8) | self.kind as u64
    }

    /// Serialises to the on-disk byte form: `user_key ++ fixed64 trailer`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.user_key.len() + TRAILER_LEN);
        out.extend_from_slice(&self.user_key);
        out.extend_from_slice(&self.trailer().to_le_bytes());
        out
    }

    /// Appends the byte form to `buf` without allocating a fresh vector.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.user_key);
        buf.extend_from_slice(&self.trailer().to_le_bytes());
    }

    /// Parses the byte form produced by [`InternalKey::encode`].
    ///
    /// Returns `None` for buffers shorter than the trailer or with an
    /// unknown value-type byte — corrupt keys are surfaced, never hidden.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < TRAILER_LEN {
            return None;
        }
        let split = bytes.len() - TRAILER_LEN;
        let trailer = u64::from_le_bytes(bytes[split..].try_into().ok()?);
        let kind = ValueType::from_u8((trailer & 0xFF) as u8)?;
        Some(Self {
            user_key: bytes[..split].to_vec(),
            sequence: trailer >> 8,
            kind,
        })
    }
}

impl Ord for InternalKey {
    /// User key ascending, then sequence descending, then kind descending.
    fn cmp(&self, other: &Self) -> Ordering {
        self.user_key
            .cmp(&other.user_key)
            .then_with(|| other.sequence.cmp(&self.sequence))
            .then_with(|| other.kind.cmp(&self.kind))
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for InternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "InternalKey({} @ {} {:?})",
            HexKey(&self.user_key),
            self.sequence,
            self.kind
        )
    }
}

// ------------------------------------------------------------------------------------------------
// LookupKey
// ------------------------------------------------------------------------------------------------

/// A point-read probe: the newest entry for `user_key` visible at
/// `snapshot` is the first entry ≥ this key in internal-key order.
#[derive(Debug, Clone)]
pub struct LookupKey {
    /// The user key being probed.
    pub user_key: Vec<u8>,
    /// Read cursor: entries with a higher sequence are invisible.
    pub snapshot: SequenceNumber,
}

impl LookupKey {
    /// Creates a lookup probe for `user_key` at `snapshot`.
    pub fn new(user_key: impl Into<Vec<u8>>, snapshot: SequenceNumber) -> Self {
        Self {
            user_key: user_key.into(),
            snapshot,
        }
    }

    /// The internal key this probe starts searching from.
    pub fn to_internal(&self) -> InternalKey {
        InternalKey::new(self.user_key.clone(), self.snapshot, ValueType::Value)
    }
}

// ------------------------------------------------------------------------------------------------
// RollbackMap
// ------------------------------------------------------------------------------------------------

/// Administrative rollback intervals: `snapshot_seq → rollback_point`.
///
/// An interval `(snapshot_seq, rollback_point]` marks every sequence number
/// inside it as rolled back. Reads skip such entries; compaction drops them
/// unconditionally (visibility rule 1).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackMap {
    points: BTreeMap<SequenceNumber, SequenceNumber>,
}

impl RollbackMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a rollback of everything written after `snapshot_seq` up to
    /// and including `rollback_point`.
    ///
    /// A later rollback with the same `snapshot_seq` widens the interval;
    /// it never narrows (entries already marked dropped stay dropped).
    pub fn insert(&mut self, snapshot_seq: SequenceNumber, rollback_point: SequenceNumber) {
        debug_assert!(rollback_point >= snapshot_seq);
        let slot = self.points.entry(snapshot_seq).or_insert(rollback_point);
        if rollback_point > *slot {
            *slot = rollback_point;
        }
    }

    /// Whether `sequence` falls inside any rollback interval.
    pub fn should_drop(&self, sequence: SequenceNumber) -> bool {
        // Only intervals starting strictly below `sequence` can cover it.
        self.points
            .range(..sequence)
            .any(|(_, &point)| sequence <= point)
    }

    /// True when no rollback intervals are registered.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Iterates `(snapshot_seq, rollback_point)` pairs in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (SequenceNumber, SequenceNumber)> + '_ {
        self.points.iter().map(|(&s, &p)| (s, p))
    }
}

// ------------------------------------------------------------------------------------------------
// Tracing helper
// ------------------------------------------------------------------------------------------------

/// Hex-renders a byte key for log output, truncating long keys.
pub(crate) struct HexKey<'a>(pub &'a [u8]);

impl fmt::Display for HexKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.len() <= 32 {
            for byte in self.0 {
                write!(f, "{:02x}", byte)?;
            }
        } else {
            for byte in &self.0[..16] {
                write!(f, "{:02x}", byte)?;
            }
            write!(f, "...[{} bytes]", self.0.len())?;
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------
