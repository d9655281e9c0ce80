//! Ordered cell streams over open tables.
//!
//! [`TableIterator`] walks a table block by block, decoding one data block
//! at a time so memory stays bounded regardless of table size. I/O or
//! corruption problems do not surface per item — the iterator simply stops
//! and latches the error, which callers collect through
//! [`TableIterator::status`] once iteration ends. Merge loops stay free of
//! per-item `Result` plumbing while still refusing to silently swallow a
//! bad block.

use std::collections::VecDeque;

use super::{Table, TableError};
use crate::keys::InternalKey;

/// Streaming iterator over every cell of a table, in internal-key order.
pub struct TableIterator<'a> {
    table: &'a Table,
    /// Index position of the next block to load.
    next_block: usize,
    /// Decoded cells of the current block.
    current: VecDeque<(InternalKey, Vec<u8>)>,
    /// First error encountered; ends iteration when set.
    status: Option<TableError>,
}

impl<'a> TableIterator<'a> {
    pub(crate) fn new(table: &'a Table) -> Self {
        Self {
            table,
            next_block: 0,
            current: VecDeque::new(),
            status: None,
        }
    }

    /// Positions the iterator at the first cell ≥ `key`.
    pub fn seek(&mut self, key: &InternalKey) {
        self.current.clear();
        self.next_block = self.table.block_position_for(key);
        loop {
            if !self.load_next_block() {
                return;
            }
            while let Some((front, _)) = self.current.front() {
                if front >= key {
                    return;
                }
                self.current.pop_front();
            }
        }
    }

    /// The error that ended iteration early, if any.
    ///
    /// Callers must check this after draining the iterator: a `Some` means
    /// the stream is incomplete and the surrounding operation failed.
    pub fn status(&self) -> Option<&TableError> {
        self.status.as_ref()
    }

    /// Consumes the iterator, yielding the latched error if one occurred.
    pub fn into_status(self) -> Result<(), TableError> {
        match self.status {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Loads the next data block into `current`. Returns false at end of
    /// table or on error (latching `status`).
    fn load_next_block(&mut self) -> bool {
        while self.current.is_empty() {
            if self.status.is_some() || self.next_block >= self.table.block_count() {
                return false;
            }
            match self.table.read_data_block(self.next_block) {
                Ok(cells) => {
                    self.next_block += 1;
                    self.current = cells.into();
                }
                Err(e) => {
                    self.status = Some(e);
                    return false;
                }
            }
        }
        true
    }
}

impl Iterator for TableIterator<'_> {
    type Item = (InternalKey, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.current.is_empty() && !self.load_next_block() {
            return None;
        }
        self.current.pop_front()
    }
}
