//! Write batches and their log representation.
//!
//! A [`WriteBatch`] collects row mutations that commit atomically: the
//! engine assigns the batch one contiguous range of sequence numbers,
//! appends a single [`LogRecord`] to the write-ahead log, and only then
//! applies the entries to the memtable.
//!
//! Per-entry validation happens when the batch is *built* — an invalid
//! row is rejected by [`WriteBatch::put`]/[`WriteBatch::delete`] without
//! poisoning its siblings, so a committed batch never fails per-row.

use thiserror::Error;

use crate::encoding::{Decode, Encode, EncodingError};
use crate::keys::{SequenceNumber, ValueType};

/// Rejected batch mutations.
#[derive(Debug, Error, PartialEq)]
pub enum BatchError {
    /// Keys must be non-empty.
    #[error("key must not be empty")]
    EmptyKey,
}

/// One mutation inside a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEntry {
    /// Value for a put, deletion marker otherwise.
    pub kind: ValueType,
    /// The user key.
    pub key: Vec<u8>,
    /// The value (empty for deletions).
    pub value: Vec<u8>,
}

/// An atomically-committed group of mutations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    pub(crate) entries: Vec<BatchEntry>,
}

impl WriteBatch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an insert/update.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), BatchError> {
        if key.is_empty() {
            return Err(BatchError::EmptyKey);
        }
        self.entries.push(BatchEntry {
            kind: ValueType::Value,
            key: key.to_vec(),
            value: value.to_vec(),
        });
        Ok(())
    }

    /// Adds a deletion marker.
    pub fn delete(&mut self, key: &[u8]) -> Result<(), BatchError> {
        if key.is_empty() {
            return Err(BatchError::EmptyKey);
        }
        self.entries.push(BatchEntry {
            kind: ValueType::Deletion,
            key: key.to_vec(),
            value: Vec::new(),
        });
        Ok(())
    }

    /// Number of mutations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no mutation was added.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Approximate bytes this batch will occupy in the memtable.
    pub fn approximate_size(&self) -> usize {
        self.entries
            .iter()
            .map(|e| e.key.len() + e.value.len() + 24)
            .sum()
    }
}

// ------------------------------------------------------------------------------------------------
// Log record
// ------------------------------------------------------------------------------------------------

/// One write batch as stored in the data log: the first sequence number of
/// the batch's contiguous range, plus the entries.
///
/// Recovery skips records whose full range is already reflected in the
/// manifest state, making replay idempotent.
#[derive(Debug, PartialEq)]
pub struct LogRecord {
    /// Sequence number assigned to the first entry.
    pub first_sequence: SequenceNumber,
    /// The batch contents, in apply order.
    pub entries: Vec<BatchEntry>,
}

impl LogRecord {
    /// Sequence number of the last entry in the batch.
    pub fn last_sequence(&self) -> SequenceNumber {
        self.first_sequence + self.entries.len().saturating_sub(1) as u64
    }
}

impl Encode for BatchEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        (self.kind as u8).encode_to(buf)?;
        self.key.encode_to(buf)?;
        self.value.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for BatchEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (kind_byte, n) = u8::decode_from(&buf[off..])?;
        off += n;
        let kind = ValueType::from_u8(kind_byte).ok_or(EncodingError::InvalidTag {
            tag: kind_byte as u32,
            type_name: "ValueType",
        })?;
        let (key, n) = <Vec<u8>>::decode_from(&buf[off..])?;
        off += n;
        let (value, n) = <Vec<u8>>::decode_from(&buf[off..])?;
        off += n;
        Ok((Self { kind, key, value }, off))
    }
}

impl Encode for LogRecord {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.first_sequence.encode_to(buf)?;
        crate::encoding::encode_vec(&self.entries, buf)?;
        Ok(())
    }
}

impl Decode for LogRecord {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (first_sequence, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (entries, n) = crate::encoding::decode_vec::<BatchEntry>(&buf[off..])?;
        off += n;
        Ok((
            Self {
                first_sequence,
                entries,
            },
            off,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------
