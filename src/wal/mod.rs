//! Write-ahead logging — a durable, append-only, generic record log.
//!
//! One log type serves two masters: the **data log** (one record per write
//! batch, replayed into a memtable on recovery) and the **manifest log**
//! (one record per version edit, replayed into the file-level state of the
//! database). Both get the same framing, the same CRC protection, and the
//! same torn-write detection.
//!
//! # On-disk layout
//!
//! ```text
//! [HEADER_BYTES][HEADER_CRC32_LE]
//! [REC_LEN_LE][REC_BYTES][REC_CRC32_LE]
//! [REC_LEN_LE][REC_BYTES][REC_CRC32_LE]
//! ...
//! ```
//!
//! - **Header** — a [`LogHeader`] followed by a 4-byte CRC32 checksum.
//! - **Record** — 4-byte little-endian length prefix, encoded record bytes
//!   (crate [`encoding`](crate::encoding) format), and a 4-byte CRC32
//!   computed over `len || record_bytes`.
//!
//! # Guarantees
//!
//! - **Durability:** every [`Wal::append`] fsyncs before returning.
//! - **Integrity:** header and record checksums are verified during replay.
//! - **Torn-write tolerance:** replay stops cleanly at the first truncated
//!   or corrupt record — everything before it is intact, everything after
//!   it was never acknowledged.
//!
//! All I/O goes through the [`Env`](crate::env::Env) abstraction; the
//! engine never assumes local disk.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::env::{EnvRef, SequentialFile, WritableFile};

const U32_SIZE: usize = std::mem::size_of::<u32>();

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by log operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Data integrity failure — checksum did not match.
    #[error("Checksum mismatch")]
    ChecksumMismatch,

    /// Record exceeds the configured maximum size.
    #[error("Record size exceeds limit ({0} bytes)")]
    RecordTooLarge(usize),

    /// Unexpected end-of-file during read.
    #[error("Unexpected end of file")]
    UnexpectedEof,

    /// Log header failed integrity validation.
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// Internal consistency or locking error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Header
// ------------------------------------------------------------------------------------------------

/// Metadata written at the start of every log file.
#[derive(Debug, PartialEq)]
pub struct LogHeader {
    /// Magic constant identifying engine log files (`b"SLOG"`).
    pub magic: [u8; 4],

    /// Log format version.
    pub version: u32,

    /// The file number this log was created as. Cross-checked against the
    /// name the caller opened, so a misplaced rename is caught early.
    pub log_number: u64,
}

impl LogHeader {
    /// Expected 4-byte magic constant.
    pub const MAGIC: [u8; 4] = *b"SLOG";

    /// Current supported version number.
    pub const VERSION: u32 = 1;

    /// Maximum record size accepted by replay (64 MiB). A length prefix
    /// beyond this is treated as corruption, not an allocation request.
    pub const MAX_RECORD_SIZE: usize = 64 * 1024 * 1024;

    /// Serialized header length including its CRC.
    pub const ENCODED_LEN: usize = 4 + 4 + 8 + U32_SIZE;

    fn new(log_number: u64) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            log_number,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, WalError> {
        let mut buf = Vec::with_capacity(Self::ENCODED_LEN);
        self.magic.encode_to(&mut buf)?;
        self.version.encode_to(&mut buf)?;
        self.log_number.encode_to(&mut buf)?;

        let mut hasher = Crc32::new();
        hasher.update(&buf);
        hasher.finalize().encode_to(&mut buf)?;
        Ok(buf)
    }

    fn decode(buf: &[u8]) -> Result<Self, WalError> {
        if buf.len() < Self::ENCODED_LEN {
            return Err(WalError::InvalidHeader("header truncated".into()));
        }
        let body = &buf[..Self::ENCODED_LEN - U32_SIZE];
        let (stored_crc, _) = u32::decode_from(&buf[Self::ENCODED_LEN - U32_SIZE..])?;

        let mut hasher = Crc32::new();
        hasher.update(body);
        if hasher.finalize() != stored_crc {
            return Err(WalError::InvalidHeader("header checksum mismatch".into()));
        }

        let mut off = 0;
        let (magic, n) = <[u8; 4]>::decode_from(&body[off..])?;
        off += n;
        let (version, n) = u32::decode_from(&body[off..])?;
        off += n;
        let (log_number, _) = u64::decode_from(&body[off..])?;

        if magic != Self::MAGIC {
            return Err(WalError::InvalidHeader("bad magic".into()));
        }
        if version != Self::VERSION {
            return Err(WalError::InvalidHeader(format!(
                "unsupported version {version}"
            )));
        }
        Ok(Self {
            magic,
            version,
            log_number,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Record trait
// ------------------------------------------------------------------------------------------------

/// Marker for record types that can travel through a log.
pub trait WalRecordData: Encode + Decode + std::fmt::Debug + Send + Sync {}
impl<T> WalRecordData for T where T: Encode + Decode + std::fmt::Debug + Send + Sync {}

// ------------------------------------------------------------------------------------------------
// Wal — append side
// ------------------------------------------------------------------------------------------------

/// A generic, thread-safe append-only record log.
///
/// See the [module-level documentation](self) for the on-disk format and
/// guarantees.
pub struct Wal<T: WalRecordData> {
    /// Append handle, serialized by a mutex: the head writer and background
    /// flush may both touch the manifest log.
    file: Mutex<Box<dyn WritableFile>>,

    /// Path to the log file on disk.
    path: PathBuf,

    /// The file number this log was created as.
    log_number: u64,

    _phantom: PhantomData<T>,
}

impl<T: WalRecordData> std::fmt::Debug for Wal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("path", &self.path)
            .field("log_number", &self.log_number)
            .finish_non_exhaustive()
    }
}

impl<T: WalRecordData> Wal<T> {
    /// Creates a fresh log file at `path`, writing the header eagerly.
    ///
    /// Truncates any existing file — a log is created exactly once, when
    /// its file number is allocated.
    pub fn create(env: &EnvRef, path: impl AsRef<Path>, log_number: u64) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        let mut file = env.new_writable(&path)?;

        let header = LogHeader::new(log_number);
        file.append(&header.encode()?)?;
        file.sync()?;

        debug!(path = %path.display(), log_number, "created log file");

        Ok(Self {
            file: Mutex::new(file),
            path,
            log_number,
            _phantom: PhantomData,
        })
    }

    /// Reopens an existing log for appending, validating the header.
    pub fn open_for_append(
        env: &EnvRef,
        path: impl AsRef<Path>,
        log_number: u64,
    ) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();

        // Validate the header before touching the append handle.
        let mut reader = env.new_sequential(&path)?;
        let mut header_bytes = vec![0u8; LogHeader::ENCODED_LEN];
        read_exact(reader.as_mut(), &mut header_bytes)?;
        let header = LogHeader::decode(&header_bytes)?;
        if header.log_number != log_number {
            return Err(WalError::InvalidHeader(format!(
                "log {} carries header number {}",
                log_number, header.log_number
            )));
        }

        let file = env.new_appendable(&path)?;
        debug!(path = %path.display(), log_number, "opened log for append");

        Ok(Self {
            file: Mutex::new(file),
            path,
            log_number,
            _phantom: PhantomData,
        })
    }

    /// Appends a single record and fsyncs.
    ///
    /// The record is written as `[u32 len LE][record_bytes][u32 crc32 LE]`
    /// where the CRC covers `len || record_bytes`.
    pub fn append(&self, record: &T) -> Result<(), WalError> {
        let record_bytes = encoding::encode_to_vec(record)?;
        if record_bytes.len() > LogHeader::MAX_RECORD_SIZE {
            return Err(WalError::RecordTooLarge(record_bytes.len()));
        }
        let record_len = record_bytes.len() as u32;

        let mut hasher = Crc32::new();
        hasher.update(&record_len.to_le_bytes());
        hasher.update(&record_bytes);
        let checksum = hasher.finalize();

        let mut frame = Vec::with_capacity(U32_SIZE * 2 + record_bytes.len());
        frame.extend_from_slice(&record_len.to_le_bytes());
        frame.extend_from_slice(&record_bytes);
        frame.extend_from_slice(&checksum.to_le_bytes());

        let mut guard = self
            .file
            .lock()
            .map_err(|_| WalError::Internal("log mutex poisoned".into()))?;
        guard.append(&frame)?;
        guard.sync()?;

        trace!(
            log_number = self.log_number,
            len = record_len,
            checksum = format_args!("{checksum:08x}"),
            "appended log record"
        );
        Ok(())
    }

    /// Forces any buffered bytes to stable storage.
    pub fn sync(&self) -> Result<(), WalError> {
        let mut guard = self
            .file
            .lock()
            .map_err(|_| WalError::Internal("log mutex poisoned".into()))?;
        guard.sync()?;
        Ok(())
    }

    /// The file number this log was created as.
    pub fn log_number(&self) -> u64 {
        self.log_number
    }

    /// Path of the underlying log file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

// ------------------------------------------------------------------------------------------------
// Replay
// ------------------------------------------------------------------------------------------------

/// Opens `path` for replay, validates its header, and returns a streaming
/// record iterator.
///
/// Replay is torn-write tolerant: a truncated or checksum-failing record
/// ends iteration with exactly one `Err` item describing why, after which
/// the iterator is exhausted. Callers decide whether that tail error is
/// acceptable (data log: yes, the tail record was never acknowledged) or
/// fatal (manifest: no).
pub fn replay<T: WalRecordData>(
    env: &EnvRef,
    path: impl AsRef<Path>,
) -> Result<WalIter<T>, WalError> {
    let path = path.as_ref();
    let mut file = env.new_sequential(path)?;

    let mut header_bytes = vec![0u8; LogHeader::ENCODED_LEN];
    read_exact(file.as_mut(), &mut header_bytes)?;
    let header = LogHeader::decode(&header_bytes)?;

    debug!(path = %path.display(), log_number = header.log_number, "replaying log");

    Ok(WalIter {
        file,
        done: false,
        _phantom: PhantomData,
    })
}

/// Streaming replay iterator over one log file.
pub struct WalIter<T: WalRecordData> {
    file: Box<dyn SequentialFile>,
    /// Latched after EOF or the first error; further `next()` returns None.
    done: bool,
    _phantom: PhantomData<T>,
}

impl<T: WalRecordData> std::fmt::Debug for WalIter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalIter")
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl<T: WalRecordData> Iterator for WalIter<T> {
    type Item = Result<T, WalError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        // Length prefix. Clean EOF here means the log simply ended.
        let mut len_bytes = [0u8; U32_SIZE];
        match read_exact_or_eof(self.file.as_mut(), &mut len_bytes) {
            Ok(true) => {}
            Ok(false) => {
                self.done = true;
                return None;
            }
            Err(e) => {
                self.done = true;
                return Some(Err(WalError::Io(e)));
            }
        }

        let record_len = u32::from_le_bytes(len_bytes) as usize;
        if record_len > LogHeader::MAX_RECORD_SIZE {
            self.done = true;
            return Some(Err(WalError::RecordTooLarge(record_len)));
        }

        let mut record_bytes = vec![0u8; record_len];
        if let Err(e) = read_exact(self.file.as_mut(), &mut record_bytes) {
            warn!("truncated log record detected during replay");
            self.done = true;
            return Some(Err(e));
        }

        let mut checksum_bytes = [0u8; U32_SIZE];
        if let Err(e) = read_exact(self.file.as_mut(), &mut checksum_bytes) {
            warn!("truncated log record trailer detected during replay");
            self.done = true;
            return Some(Err(e));
        }
        let stored_checksum = u32::from_le_bytes(checksum_bytes);

        let mut hasher = Crc32::new();
        hasher.update(&len_bytes);
        hasher.update(&record_bytes);
        if hasher.finalize() != stored_checksum {
            error!(len = record_len, "log record checksum mismatch");
            self.done = true;
            return Some(Err(WalError::ChecksumMismatch));
        }

        match encoding::decode_from_slice::<T>(&record_bytes) {
            Ok((record, _)) => Some(Ok(record)),
            Err(e) => {
                self.done = true;
                Some(Err(WalError::Encoding(e)))
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Read helpers over SequentialFile
// ------------------------------------------------------------------------------------------------

/// Fills `buf` completely or returns `UnexpectedEof`.
fn read_exact(file: &mut dyn SequentialFile, buf: &mut [u8]) -> Result<(), WalError> {
    match read_exact_or_eof(file, buf) {
        Ok(true) => Ok(()),
        Ok(false) => Err(WalError::UnexpectedEof),
        Err(e) => Err(WalError::Io(e)),
    }
}

/// Fills `buf` completely (`Ok(true)`), reports clean EOF at offset zero
/// (`Ok(false)`), or fails on a partial read (`Err` of kind UnexpectedEof).
fn read_exact_or_eof(file: &mut dyn SequentialFile, buf: &mut [u8]) -> std::io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "partial record at end of log",
            ));
        }
        filled += n;
    }
    Ok(true)
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------
