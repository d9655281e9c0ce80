//! Sequential table builder.
//!
//! [`TableBuilder`] accepts cells in strict internal-key order and writes
//! the block/filter/properties/index structure described in the
//! [module-level documentation](super). The file is written under a
//! temporary name and renamed into place on [`TableBuilder::finish`], so a
//! crash mid-build never leaves a half-table visible.
//!
//! The builder also accumulates the statistics compaction relies on:
//! deletion-tag counts and TTL expiry timestamps. TTLs are reported by the
//! configured compact strategy via [`TableBuilder::record_ttl`]; at finish
//! time the configured percentile of observed TTLs becomes the table's
//! `ttl_check_ts` checkpoint.

use std::path::{Path, PathBuf};

use crc32fast::Hasher as Crc32;
use tracing::debug;

use super::{
    BLOOM_FALSE_POSITIVE_RATE, BlockHandle, FILTER_BLOCK_NAME, IndexEntry, MetaIndexEntry,
    PROPERTIES_BLOCK_NAME, TABLE_MAGIC, TABLE_VERSION, TableError, TableFooter, TableHeader,
    TableProperties,
};
use crate::encoding::{self, Encode};
use crate::env::{EnvRef, WritableFile};
use crate::keys::InternalKey;

/// Tuning knobs for table construction.
#[derive(Debug, Clone)]
pub struct TableBuilderOptions {
    /// Uncompressed payload size at which a data block is cut (bytes).
    pub block_size: usize,

    /// Percentile (0–100) of observed TTLs recorded as the table's
    /// TTL checkpoint. 50 = median.
    pub ttl_percentage: u32,
}

impl Default for TableBuilderOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            ttl_percentage: 50,
        }
    }
}

/// Everything the caller needs to register the finished file in a manifest
/// edit.
#[derive(Debug, Clone)]
pub struct TableBuildOutput {
    /// Final on-disk size in bytes.
    pub file_size: u64,
    /// Smallest internal key written.
    pub smallest: InternalKey,
    /// Largest internal key written.
    pub largest: InternalKey,
    /// Total cell count.
    pub entry_count: u64,
    /// Percentage (0–100) of deletion-tagged cells.
    pub del_percentage: u64,
    /// TTL checkpoint timestamp (0 when no TTLs were observed).
    pub ttl_check_ts: u64,
}

/// Sequential writer producing one immutable table file.
pub struct TableBuilder {
    env: EnvRef,
    file: Box<dyn WritableFile>,
    tmp_path: PathBuf,
    final_path: PathBuf,
    opts: TableBuilderOptions,

    /// Bytes written so far (next block frame starts here).
    offset: u64,

    /// Encoded cells of the block under construction.
    block: Vec<u8>,
    /// Last key added to the current block (becomes the index entry).
    block_last_key: Option<InternalKey>,
    index: Vec<IndexEntry>,

    /// User keys for the bloom filter, collected until finish (the filter
    /// needs the final count for its sizing).
    bloom_keys: Vec<Vec<u8>>,

    // Statistics.
    entry_count: u64,
    deletion_count: u64,
    ttls: Vec<i64>,
    min_sequence: u64,
    max_sequence: u64,
    smallest: Option<InternalKey>,
    last_key: Option<InternalKey>,
}

impl TableBuilder {
    /// Starts building a table at `path` (written as `path.tmp` until
    /// finished).
    pub fn new(
        env: EnvRef,
        path: impl AsRef<Path>,
        opts: TableBuilderOptions,
    ) -> Result<Self, TableError> {
        let final_path = path.as_ref().to_path_buf();
        let tmp_path = final_path.with_extension("sst.tmp");
        let mut file = env.new_writable(&tmp_path)?;

        // Header with CRC over the zero-crc form.
        let mut header = TableHeader {
            magic: TABLE_MAGIC,
            version: TABLE_VERSION,
            header_crc: 0,
        };
        let mut hasher = Crc32::new();
        hasher.update(&encoding::encode_to_vec(&header)?);
        header.header_crc = hasher.finalize();
        let header_bytes = encoding::encode_to_vec(&header)?;
        file.append(&header_bytes)?;

        Ok(Self {
            env,
            file,
            tmp_path,
            final_path,
            opts,
            offset: header_bytes.len() as u64,
            block: Vec::new(),
            block_last_key: None,
            index: Vec::new(),
            bloom_keys: Vec::new(),
            entry_count: 0,
            deletion_count: 0,
            ttls: Vec::new(),
            min_sequence: u64::MAX,
            max_sequence: 0,
            smallest: None,
            last_key: None,
        })
    }

    /// Appends one cell. Keys must arrive in strictly ascending
    /// internal-key order.
    pub fn add(&mut self, key: &InternalKey, value: &[u8]) -> Result<(), TableError> {
        if let Some(last) = &self.last_key
            && key <= last
        {
            return Err(TableError::OutOfOrder);
        }

        key.encode().encode_to(&mut self.block)?;
        value.encode_to(&mut self.block)?;

        if self.smallest.is_none() {
            self.smallest = Some(key.clone());
        }
        self.last_key = Some(key.clone());
        self.block_last_key = Some(key.clone());
        self.bloom_keys.push(key.user_key.clone());

        self.entry_count += 1;
        if key.kind == crate::keys::ValueType::Deletion {
            self.deletion_count += 1;
        }
        self.min_sequence = self.min_sequence.min(key.sequence);
        self.max_sequence = self.max_sequence.max(key.sequence);

        if self.block.len() >= self.opts.block_size {
            self.flush_block()?;
        }
        Ok(())
    }

    /// Counts a cell as deletion-tagged without it being a deletion marker
    /// (strategy-tagged deletions).
    pub fn record_deletion_tag(&mut self) {
        self.deletion_count += 1;
    }

    /// Records one TTL expiry timestamp observed by the compact strategy.
    pub fn record_ttl(&mut self, ttl: i64) {
        self.ttls.push(ttl);
    }

    /// Cells added so far.
    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Approximate final file size if finished now.
    pub fn file_size_estimate(&self) -> u64 {
        self.offset + self.block.len() as u64
    }

    /// Whether any cell has been added.
    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    /// Writes filter, properties, metaindex, index, and footer, fsyncs,
    /// and renames the file into place.
    pub fn finish(mut self) -> Result<TableBuildOutput, TableError> {
        if self.entry_count == 0 {
            return Err(TableError::Internal("finish() on an empty table".into()));
        }
        self.flush_block()?;

        // Filter block: bloom over user keys, serialized as raw bytes.
        let bloom_bytes = match bloomfilter::Bloom::new_for_fp_rate_with_seed(
            self.bloom_keys.len().max(1),
            BLOOM_FALSE_POSITIVE_RATE,
            &super::BLOOM_SEED,
        ) {
            Ok(mut bloom) => {
                for key in &self.bloom_keys {
                    bloom.set(key);
                }
                bloom.to_bytes()
            }
            // A filter is an optimisation; an unsizable filter degrades to
            // "maybe present" at read time.
            Err(_) => Vec::new(),
        };
        let mut filter_payload = Vec::new();
        bloom_bytes.encode_to(&mut filter_payload)?;
        let filter_handle = self.write_frame(&filter_payload)?;

        // Properties block.
        let smallest = self
            .smallest
            .clone()
            .ok_or_else(|| TableError::Internal("no smallest key".into()))?;
        let largest = self
            .last_key
            .clone()
            .ok_or_else(|| TableError::Internal("no largest key".into()))?;

        let del_percentage = self.deletion_count * 100 / self.entry_count;
        let (ttl_check_ts, ttl_percentage) = self.ttl_checkpoint();

        let properties = TableProperties {
            entry_count: self.entry_count,
            deletion_count: self.deletion_count,
            del_percentage,
            ttl_check_ts,
            ttl_percentage,
            min_sequence: self.min_sequence,
            max_sequence: self.max_sequence,
            smallest_key: smallest.encode(),
            largest_key: largest.encode(),
        };
        let props_payload = encoding::encode_to_vec(&properties)?;
        let props_handle = self.write_frame(&props_payload)?;

        // Metaindex block.
        let meta_entries = vec![
            MetaIndexEntry {
                name: FILTER_BLOCK_NAME.to_string(),
                handle: filter_handle,
            },
            MetaIndexEntry {
                name: PROPERTIES_BLOCK_NAME.to_string(),
                handle: props_handle,
            },
        ];
        let mut metaindex_payload = Vec::new();
        encoding::encode_vec(&meta_entries, &mut metaindex_payload)?;
        let metaindex_handle = self.write_frame(&metaindex_payload)?;

        // Index block.
        let mut index_payload = Vec::new();
        encoding::encode_vec(&self.index, &mut index_payload)?;
        let index_handle = self.write_frame(&index_payload)?;

        // Footer with CRC over the zero-crc form.
        let total_file_size = self.offset + super::FOOTER_SIZE as u64;
        let mut footer = TableFooter {
            metaindex: metaindex_handle,
            index: index_handle,
            total_file_size,
            footer_crc32: 0,
        };
        let mut hasher = Crc32::new();
        hasher.update(&encoding::encode_to_vec(&footer)?);
        footer.footer_crc32 = hasher.finalize();
        self.file.append(&encoding::encode_to_vec(&footer)?)?;
        self.file.sync()?;

        // Atomic publish.
        self.env.rename_file(&self.tmp_path, &self.final_path)?;
        if let Some(parent) = self.final_path.parent() {
            self.env.sync_dir(parent)?;
        }

        debug!(
            path = %self.final_path.display(),
            entries = self.entry_count,
            size = total_file_size,
            del_percentage,
            ttl_check_ts,
            "finished table"
        );

        Ok(TableBuildOutput {
            file_size: total_file_size,
            smallest,
            largest,
            entry_count: self.entry_count,
            del_percentage,
            ttl_check_ts,
        })
    }

    /// Deletes the temporary file, discarding all buffered work.
    pub fn abandon(self) {
        let _ = self.env.delete_file(&self.tmp_path);
    }

    /// Cuts the current data block: frames it, records its index entry.
    fn flush_block(&mut self) -> Result<(), TableError> {
        if self.block.is_empty() {
            return Ok(());
        }
        let payload = std::mem::take(&mut self.block);
        let handle = self.write_frame(&payload)?;
        let last_key = self
            .block_last_key
            .take()
            .ok_or_else(|| TableError::Internal("block without last key".into()))?;
        self.index.push(IndexEntry {
            last_key: last_key.encode(),
            handle,
        });
        Ok(())
    }

    /// Writes one framed block `[u32 len][payload][u32 crc]`, returning its
    /// handle.
    fn write_frame(&mut self, payload: &[u8]) -> Result<BlockHandle, TableError> {
        let len = u32::try_from(payload.len())
            .map_err(|_| TableError::Internal("block exceeds u32::MAX".into()))?;

        let mut hasher = Crc32::new();
        hasher.update(&len.to_le_bytes());
        hasher.update(payload);
        let crc = hasher.finalize();

        let mut frame = Vec::with_capacity(payload.len() + 8);
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(payload);
        frame.extend_from_slice(&crc.to_le_bytes());

        let handle = BlockHandle {
            offset: self.offset,
            size: frame.len() as u64,
        };
        self.file.append(&frame)?;
        self.offset += frame.len() as u64;
        Ok(handle)
    }

    /// Computes the TTL checkpoint: the configured percentile of observed
    /// TTLs, plus the share of entries it covers.
    fn ttl_checkpoint(&mut self) -> (u64, u64) {
        if self.ttls.is_empty() {
            return (0, 0);
        }
        self.ttls.sort_unstable();
        let idx = self.ttls.len() * self.opts.ttl_percentage as usize / 100;
        if idx >= self.ttls.len() {
            return (0, 0);
        }
        let checkpoint = self.ttls[idx].max(0) as u64;
        let percentage = (idx * 100 / self.ttls.len()) as u64;
        (checkpoint, percentage)
    }
}
