//! Sorted table files — the immutable on-disk layer.
//!
//! A table stores internal-key-ordered cells in CRC-protected blocks,
//! with a bloom filter over user keys for cheap negative lookups and a
//! properties block carrying the statistics later consumed by compaction
//! heuristics (entry count, deletion-tag percentage, TTL checkpoint,
//! sequence bounds, key bounds).
//!
//! # On-disk layout
//!
//! ```text
//! [HEADER_BYTES]
//! [DATA_BLOCK_LEN_LE][DATA_BLOCK_BYTES][DATA_BLOCK_CRC32_LE]
//! ...
//! [FILTER_LEN_LE][FILTER_BYTES][FILTER_CRC32_LE]
//! [PROPERTIES_LEN_LE][PROPERTIES_BYTES][PROPERTIES_CRC32_LE]
//! [METAINDEX_LEN_LE][METAINDEX_BYTES][METAINDEX_CRC32_LE]
//! [INDEX_LEN_LE][INDEX_BYTES][INDEX_CRC32_LE]
//! [FOOTER_BYTES]
//! ```
//!
//! - **Header** — magic + version + CRC.
//! - **Data blocks** — consecutive cells `[key: Vec<u8>][value: Vec<u8>]`
//!   where the key is an encoded [`InternalKey`].
//! - **Filter block** — serialized bloom filter over *user* keys.
//! - **Properties block** — table statistics.
//! - **Metaindex block** — named directory of the meta blocks.
//! - **Index block** — last key per data block, enabling binary search.
//! - **Footer** — handles of metaindex and index, total size, CRC.
//!
//! # Concurrency
//!
//! Tables are write-once (built under a temporary name, renamed into
//! place) and thereafter immutable: readers share one open table freely.
//!
//! # Sub-modules
//!
//! - [`builder`] — [`TableBuilder`], the sequential writer.
//! - [`iterator`] — [`TableIterator`], the ordered cell stream.

pub mod builder;
pub mod iterator;


pub use builder::{TableBuildOutput, TableBuilder, TableBuilderOptions};
pub use iterator::TableIterator;

use std::path::Path;

use bloomfilter::Bloom;
use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::debug;

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::env::{EnvRef, RandomAccessFile};
use crate::keys::{InternalKey, LookupKey, RollbackMap, ValueType};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

pub(crate) const TABLE_MAGIC: [u8; 4] = *b"SSTB";
pub(crate) const TABLE_VERSION: u32 = 1;
pub(crate) const BLOOM_FALSE_POSITIVE_RATE: f64 = 0.01;
/// Fixed sip-hash seed so filter bits are a pure function of the key set
/// (tables rebuilt from identical inputs are byte-identical).
pub(crate) const BLOOM_SEED: [u8; 32] = *b"stratadb.bloom.seed.v1..........";
pub(crate) const HEADER_SIZE: usize = 12;
pub(crate) const FOOTER_SIZE: usize = 44;
pub(crate) const BLOCK_FRAME_OVERHEAD: u64 = 8; // u32 length + u32 crc

const FILTER_BLOCK_NAME: &str = "filter.bloom";
const PROPERTIES_BLOCK_NAME: &str = "meta.properties";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by table operations (read, write, build).
#[derive(Debug, Error)]
pub enum TableError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Block, header, or footer checksum mismatch.
    #[error("Checksum mismatch")]
    ChecksumMismatch,

    /// Malformed table structure.
    #[error("Corrupt table: {0}")]
    Corrupt(String),

    /// Keys fed to the builder out of order.
    #[error("keys added out of order")]
    OutOfOrder,

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// On-disk format structures
// ------------------------------------------------------------------------------------------------

/// Table file header with magic, version, and CRC.
#[derive(Default)]
pub(crate) struct TableHeader {
    pub(crate) magic: [u8; 4],
    pub(crate) version: u32,
    pub(crate) header_crc: u32,
}

/// Handle to a framed block: offset of the frame and its total size
/// (length prefix + payload + checksum).
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BlockHandle {
    pub(crate) offset: u64,
    pub(crate) size: u64,
}

/// Index entry: the last internal key (encoded) stored in a data block.
pub(crate) struct IndexEntry {
    pub(crate) last_key: Vec<u8>,
    pub(crate) handle: BlockHandle,
}

/// Named handle inside the metaindex block.
pub(crate) struct MetaIndexEntry {
    pub(crate) name: String,
    pub(crate) handle: BlockHandle,
}

/// Table footer, stored at the very end of the file.
pub(crate) struct TableFooter {
    pub(crate) metaindex: BlockHandle,
    pub(crate) index: BlockHandle,
    pub(crate) total_file_size: u64,
    pub(crate) footer_crc32: u32,
}

/// Table statistics consumed by compaction heuristics and garbage
/// collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableProperties {
    /// Total number of cells.
    pub entry_count: u64,

    /// Number of deletion-tagged cells (deletion markers plus cells the
    /// configured strategy tagged as deletions at build time).
    pub deletion_count: u64,

    /// Percentage (0–100) of deletion-tagged cells.
    pub del_percentage: u64,

    /// Representative TTL checkpoint: the configured percentile of TTL
    /// expiry timestamps observed while building. Zero when no entry
    /// carried a TTL.
    pub ttl_check_ts: u64,

    /// Percentage (0–100) of entries expiring at or before
    /// [`TableProperties::ttl_check_ts`]. Zero when no TTLs were seen.
    pub ttl_percentage: u64,

    /// Smallest sequence number present.
    pub min_sequence: u64,

    /// Largest sequence number present.
    pub max_sequence: u64,

    /// Smallest internal key (encoded) present.
    pub smallest_key: Vec<u8>,

    /// Largest internal key (encoded) present.
    pub largest_key: Vec<u8>,
}

// ------------------------------------------------------------------------------------------------
// Encoding implementations
// ------------------------------------------------------------------------------------------------

impl Encode for TableHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.magic.encode_to(buf)?;
        self.version.encode_to(buf)?;
        self.header_crc.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for TableHeader {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (magic, n) = <[u8; 4]>::decode_from(&buf[off..])?;
        off += n;
        let (version, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (header_crc, n) = u32::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                magic,
                version,
                header_crc,
            },
            off,
        ))
    }
}

impl Encode for BlockHandle {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.offset.encode_to(buf)?;
        self.size.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for BlockHandle {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (offset, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (size, n) = u64::decode_from(&buf[off..])?;
        off += n;
        Ok((Self { offset, size }, off))
    }
}

impl Encode for IndexEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.last_key.encode_to(buf)?;
        self.handle.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for IndexEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (last_key, n) = <Vec<u8>>::decode_from(&buf[off..])?;
        off += n;
        let (handle, n) = BlockHandle::decode_from(&buf[off..])?;
        off += n;
        Ok((Self { last_key, handle }, off))
    }
}

impl Encode for MetaIndexEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.name.encode_to(buf)?;
        self.handle.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for MetaIndexEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (name, n) = String::decode_from(&buf[off..])?;
        off += n;
        let (handle, n) = BlockHandle::decode_from(&buf[off..])?;
        off += n;
        Ok((Self { name, handle }, off))
    }
}

impl Encode for TableFooter {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.metaindex.encode_to(buf)?;
        self.index.encode_to(buf)?;
        self.total_file_size.encode_to(buf)?;
        self.footer_crc32.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for TableFooter {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (metaindex, n) = BlockHandle::decode_from(&buf[off..])?;
        off += n;
        let (index, n) = BlockHandle::decode_from(&buf[off..])?;
        off += n;
        let (total_file_size, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (footer_crc32, n) = u32::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                metaindex,
                index,
                total_file_size,
                footer_crc32,
            },
            off,
        ))
    }
}

impl Encode for TableProperties {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.entry_count.encode_to(buf)?;
        self.deletion_count.encode_to(buf)?;
        self.del_percentage.encode_to(buf)?;
        self.ttl_check_ts.encode_to(buf)?;
        self.ttl_percentage.encode_to(buf)?;
        self.min_sequence.encode_to(buf)?;
        self.max_sequence.encode_to(buf)?;
        self.smallest_key.encode_to(buf)?;
        self.largest_key.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for TableProperties {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (entry_count, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (deletion_count, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (del_percentage, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (ttl_check_ts, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (ttl_percentage, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (min_sequence, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (max_sequence, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (smallest_key, n) = <Vec<u8>>::decode_from(&buf[off..])?;
        off += n;
        let (largest_key, n) = <Vec<u8>>::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                entry_count,
                deletion_count,
                del_percentage,
                ttl_check_ts,
                ttl_percentage,
                min_sequence,
                max_sequence,
                smallest_key,
                largest_key,
            },
            off,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Lookup result
// ------------------------------------------------------------------------------------------------

/// Result of a single key lookup in a table.
#[derive(Debug, PartialEq)]
pub enum TableGetResult {
    /// Newest visible entry at the snapshot is a live value.
    Found {
        /// Stored value.
        value: Vec<u8>,
        /// Sequence of this version.
        sequence: u64,
    },
    /// Newest visible entry at the snapshot is a deletion marker.
    Deleted {
        /// Sequence of the deletion.
        sequence: u64,
    },
    /// This table holds no visible entry for the key.
    NotFound,
}

// ------------------------------------------------------------------------------------------------
// Table — immutable reader
// ------------------------------------------------------------------------------------------------

/// An open, immutable sorted table.
pub struct Table {
    file: Box<dyn RandomAccessFile>,
    bloom: Option<Bloom<Vec<u8>>>,
    properties: TableProperties,
    index: Vec<IndexEntry>,
    footer: TableFooter,
}

impl Table {
    /// Opens a table, verifying header, footer, and meta-block integrity.
    pub fn open(env: &EnvRef, path: &Path) -> Result<Self, TableError> {
        let file = env.new_random_access(path)?;
        let file_len = file.len();
        if (file_len as usize) < HEADER_SIZE + FOOTER_SIZE {
            return Err(TableError::Corrupt("file too small".into()));
        }

        // Header.
        let header_bytes = file.read_at(0, HEADER_SIZE)?;
        let (mut header, _) = encoding::decode_from_slice::<TableHeader>(&header_bytes)?;
        let stored_crc = header.header_crc;
        header.header_crc = 0;
        let mut hasher = Crc32::new();
        hasher.update(&encoding::encode_to_vec(&header)?);
        if hasher.finalize() != stored_crc {
            return Err(TableError::ChecksumMismatch);
        }
        if header.magic != TABLE_MAGIC {
            return Err(TableError::Corrupt("bad magic".into()));
        }
        if header.version != TABLE_VERSION {
            return Err(TableError::Corrupt(format!(
                "unsupported version {}",
                header.version
            )));
        }

        // Footer.
        let footer_bytes = file.read_at(file_len - FOOTER_SIZE as u64, FOOTER_SIZE)?;
        let (footer, _) = encoding::decode_from_slice::<TableFooter>(&footer_bytes)?;
        let verify = TableFooter {
            metaindex: footer.metaindex.clone(),
            index: footer.index.clone(),
            total_file_size: footer.total_file_size,
            footer_crc32: 0,
        };
        let mut hasher = Crc32::new();
        hasher.update(&encoding::encode_to_vec(&verify)?);
        if hasher.finalize() != footer.footer_crc32 {
            return Err(TableError::ChecksumMismatch);
        }
        if footer.total_file_size != file_len {
            return Err(TableError::Corrupt(format!(
                "footer claims {} bytes, file has {}",
                footer.total_file_size, file_len
            )));
        }

        // Metaindex → named meta blocks.
        let metaindex_bytes = read_block(file.as_ref(), &footer.metaindex)?;
        let (meta_entries, _) = encoding::decode_vec::<MetaIndexEntry>(&metaindex_bytes)?;

        let mut bloom = None;
        let mut properties = None;
        for entry in &meta_entries {
            match entry.name.as_str() {
                FILTER_BLOCK_NAME => {
                    let bytes = read_block(file.as_ref(), &entry.handle)?;
                    let (raw, _) = <Vec<u8>>::decode_from(&bytes)?;
                    if !raw.is_empty() {
                        // Corrupt filters degrade to "maybe present" rather
                        // than failing the open.
                        bloom = Bloom::from_slice(&raw).ok();
                    }
                }
                PROPERTIES_BLOCK_NAME => {
                    let bytes = read_block(file.as_ref(), &entry.handle)?;
                    let (props, _) = encoding::decode_from_slice::<TableProperties>(&bytes)?;
                    properties = Some(props);
                }
                _ => {} // unknown meta blocks are skipped
            }
        }
        let properties =
            properties.ok_or_else(|| TableError::Corrupt("missing properties block".into()))?;

        // Index.
        let index_bytes = read_block(file.as_ref(), &footer.index)?;
        let (index, _) = encoding::decode_vec::<IndexEntry>(&index_bytes)?;

        debug!(
            path = %path.display(),
            entries = properties.entry_count,
            blocks = index.len(),
            "opened table"
        );

        Ok(Self {
            file,
            bloom,
            properties,
            index,
            footer,
        })
    }

    /// Table statistics.
    pub fn properties(&self) -> &TableProperties {
        &self.properties
    }

    /// On-disk size in bytes.
    pub fn file_size(&self) -> u64 {
        self.footer.total_file_size
    }

    /// Whether `user_key` *might* exist according to the bloom filter.
    ///
    /// `true` means "maybe"; only `false` is definitive.
    pub fn may_contain(&self, user_key: &[u8]) -> bool {
        match &self.bloom {
            Some(bloom) => bloom.check(&user_key.to_vec()),
            None => true,
        }
    }

    /// Looks up the newest entry for `lookup.user_key` visible at
    /// `lookup.snapshot`, skipping rollback-dropped sequences.
    pub fn get(
        &self,
        lookup: &LookupKey,
        rollbacks: &RollbackMap,
    ) -> Result<TableGetResult, TableError> {
        if !self.may_contain(&lookup.user_key) {
            return Ok(TableGetResult::NotFound);
        }

        let probe = lookup.to_internal();

        // First block whose last key is >= probe. Encoded internal keys do
        // not compare bytewise, so decode the index keys for the search.
        let mut pos = self.index.partition_point(|entry| {
            match InternalKey::decode(&entry.last_key) {
                Some(last) => last < probe,
                None => false,
            }
        });

        while pos < self.index.len() {
            let cells = self.read_data_block(pos)?;
            for (key, value) in cells {
                if key.user_key.as_slice() > lookup.user_key.as_slice() {
                    return Ok(TableGetResult::NotFound);
                }
                if key.user_key != lookup.user_key {
                    continue;
                }
                if key.sequence > lookup.snapshot {
                    continue;
                }
                if rollbacks.should_drop(key.sequence) {
                    continue;
                }
                return Ok(match key.kind {
                    ValueType::Value => TableGetResult::Found {
                        value,
                        sequence: key.sequence,
                    },
                    ValueType::Deletion => TableGetResult::Deleted {
                        sequence: key.sequence,
                    },
                });
            }
            pos += 1;
        }
        Ok(TableGetResult::NotFound)
    }

    /// Ordered iterator over every cell in the table.
    pub fn iter(&self) -> TableIterator<'_> {
        TableIterator::new(self)
    }

    /// Decodes the data block at index position `pos`.
    pub(crate) fn read_data_block(
        &self,
        pos: usize,
    ) -> Result<Vec<(InternalKey, Vec<u8>)>, TableError> {
        let entry = self
            .index
            .get(pos)
            .ok_or_else(|| TableError::Internal("data block index out of range".into()))?;
        let bytes = read_block(self.file.as_ref(), &entry.handle)?;
        decode_cells(&bytes)
    }

    /// Number of data blocks.
    pub(crate) fn block_count(&self) -> usize {
        self.index.len()
    }

    /// Index position of the first block that may contain `key`.
    pub(crate) fn block_position_for(&self, key: &InternalKey) -> usize {
        self.index
            .partition_point(|entry| match InternalKey::decode(&entry.last_key) {
                Some(last) => last < *key,
                None => false,
            })
    }
}

// ------------------------------------------------------------------------------------------------
// Block helpers
// ------------------------------------------------------------------------------------------------

/// Reads one framed block `[u32 len][payload][u32 crc]` and verifies the
/// checksum (computed over `len || payload`).
pub(crate) fn read_block(
    file: &dyn RandomAccessFile,
    handle: &BlockHandle,
) -> Result<Vec<u8>, TableError> {
    let frame = file.read_at(handle.offset, handle.size as usize)?;
    if frame.len() < BLOCK_FRAME_OVERHEAD as usize {
        return Err(TableError::Corrupt("block frame too small".into()));
    }
    let (len, n) = u32::decode_from(&frame)?;
    let len = len as usize;
    if frame.len() != n + len + 4 {
        return Err(TableError::Corrupt("block frame length mismatch".into()));
    }
    let payload = &frame[n..n + len];
    let (stored_crc, _) = u32::decode_from(&frame[n + len..])?;

    let mut hasher = Crc32::new();
    hasher.update(&frame[..n]);
    hasher.update(payload);
    if hasher.finalize() != stored_crc {
        return Err(TableError::ChecksumMismatch);
    }
    Ok(payload.to_vec())
}

/// Decodes consecutive `[key][value]` cells out of a data-block payload.
pub(crate) fn decode_cells(bytes: &[u8]) -> Result<Vec<(InternalKey, Vec<u8>)>, TableError> {
    let mut cells = Vec::new();
    let mut off = 0;
    while off < bytes.len() {
        let (key_bytes, n) = <Vec<u8>>::decode_from(&bytes[off..])?;
        off += n;
        let (value, n) = <Vec<u8>>::decode_from(&bytes[off..])?;
        off += n;
        let key = InternalKey::decode(&key_bytes)
            .ok_or_else(|| TableError::Corrupt("unparsable cell key".into()))?;
        cells.push((key, value));
    }
    Ok(cells)
}
