//! Pluggable compact strategies.
//!
//! A strategy sees every entry the merge loop is about to keep, *after*
//! the engine's own visibility rules ran and *only* when the entry's
//! sequence is at or below the smallest active snapshot (a snapshot reader
//! must never observe a strategy rewriting history above its cut).
//!
//! Strategies are selected once at engine construction
//! ([`CompactStrategyKind`]) and instantiated **per compaction worker**
//! via [`new_strategy`] — instances may keep scratch state and are never
//! shared across threads.

use tracing::warn;

use crate::config::CompactStrategyKind;
use crate::keys::SequenceNumber;

/// Per-entry decision hooks applied during a merge compaction.
pub trait CompactStrategy: Send {
    /// Human-readable name for logs.
    fn name(&self) -> &'static str;

    /// Whether `user_key`'s surviving entry may be dropped outright
    /// (custom GC policies). Called only below the smallest snapshot.
    fn drop_entry(&mut self, user_key: &[u8], sequence: SequenceNumber, value: &[u8]) -> bool {
        let _ = (user_key, sequence, value);
        false
    }

    /// Inspects a value for embedded tags: returns `(deletion_tag, ttl)`.
    /// `ttl` > 0 is an expiry timestamp recorded in the output table's TTL
    /// statistics.
    fn check_tag(&mut self, user_key: &[u8], value: &[u8]) -> (bool, i64) {
        let _ = (user_key, value);
        (false, -1)
    }

    /// Merges `older` into `newer` for the same user key (newest first),
    /// returning the combined value, or `None` when the pair does not
    /// merge (the older entry is then dropped by the hidden-entry rule as
    /// usual).
    fn merge_values(&mut self, user_key: &[u8], newer: &[u8], older: &[u8]) -> Option<Vec<u8>> {
        let _ = (user_key, newer, older);
        None
    }
}

/// Instantiates a fresh strategy for one compaction worker.
pub fn new_strategy(kind: CompactStrategyKind) -> Box<dyn CompactStrategy> {
    match kind {
        CompactStrategyKind::Passthrough => Box::new(Passthrough),
        CompactStrategyKind::MergeCounters => Box::new(MergeCounters),
        CompactStrategyKind::TtlTagged => Box::new(TtlTagged { now: now_millis() }),
    }
}

fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ------------------------------------------------------------------------------------------------
// Passthrough
// ------------------------------------------------------------------------------------------------

/// Keeps every surviving entry as-is.
pub struct Passthrough;

impl CompactStrategy for Passthrough {
    fn name(&self) -> &'static str {
        "passthrough"
    }
}

// ------------------------------------------------------------------------------------------------
// MergeCounters
// ------------------------------------------------------------------------------------------------

/// Merge-on-compaction for counter cells: values are little-endian i64
/// deltas that sum across versions of the same user key.
pub struct MergeCounters;

impl CompactStrategy for MergeCounters {
    fn name(&self) -> &'static str {
        "merge-counters"
    }

    fn merge_values(&mut self, user_key: &[u8], newer: &[u8], older: &[u8]) -> Option<Vec<u8>> {
        let (Some(a), Some(b)) = (decode_counter(newer), decode_counter(older)) else {
            // Mixed counter / non-counter cells under one key: fall back
            // to newest-wins rather than corrupting the value.
            warn!(
                key_len = user_key.len(),
                "non-counter value under counter merge; keeping newest"
            );
            return None;
        };
        Some(a.wrapping_add(b).to_le_bytes().to_vec())
    }
}

fn decode_counter(value: &[u8]) -> Option<i64> {
    Some(i64::from_le_bytes(value.try_into().ok()?))
}

// ------------------------------------------------------------------------------------------------
// TtlTagged
// ------------------------------------------------------------------------------------------------

/// Values carry a 9-byte prefix tag: one flag byte (bit 0 = deletion tag)
/// and a little-endian i64 expiry timestamp in milliseconds (0 = never
/// expires). Expired entries are dropped below the smallest snapshot.
pub struct TtlTagged {
    now: i64,
}

impl TtlTagged {
    const TAG_LEN: usize = 9;
    const FLAG_DELETION: u8 = 0x01;

    fn parse(value: &[u8]) -> Option<(u8, i64)> {
        if value.len() < Self::TAG_LEN {
            return None;
        }
        let flags = value[0];
        let expiry = i64::from_le_bytes(value[1..9].try_into().ok()?);
        Some((flags, expiry))
    }
}

impl CompactStrategy for TtlTagged {
    fn name(&self) -> &'static str {
        "ttl-tagged"
    }

    fn drop_entry(&mut self, _user_key: &[u8], _sequence: SequenceNumber, value: &[u8]) -> bool {
        match Self::parse(value) {
            Some((_, expiry)) => expiry > 0 && expiry <= self.now,
            None => false,
        }
    }

    fn check_tag(&mut self, _user_key: &[u8], value: &[u8]) -> (bool, i64) {
        match Self::parse(value) {
            Some((flags, expiry)) => {
                let del = flags & Self::FLAG_DELETION != 0;
                let ttl = if expiry > 0 { expiry } else { -1 };
                (del, ttl)
            }
            None => (false, -1),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------
