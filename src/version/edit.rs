//! Version edits — the diffs recorded in the manifest log.
//!
//! A [`VersionEdit`] describes one transition of the file-level state:
//! files added and deleted per level, plus updated log/sequence/comparator
//! metadata. Applying an edit to a version is purely additive/subtractive
//! over the per-level file lists; an edit is durably appended to the
//! manifest before it is considered committed.
//!
//! # Wire format
//!
//! Each present field is one tagged frame `[u32 tag][u32 len][payload]`
//! (see [`encoding`](crate::encoding)). Repeated fields (compact pointers,
//! deleted files, new files) repeat their tag once per element. Decoding
//! **skips unknown tags**: a manifest written by a newer engine replays
//! cleanly on an older one, with unrecognised fields ignored and every
//! recognised field preserved.

use crate::encoding::{self, Decode, Encode, EncodingError, FieldReader, encode_field};
use crate::keys::{InternalKey, SequenceNumber};

use super::FileMetaData;

// Field tags. Values are part of the on-disk format; never reuse one.
const TAG_COMPARATOR: u32 = 1;
const TAG_LOG_NUMBER: u32 = 2;
const TAG_NEXT_FILE_NUMBER: u32 = 3;
const TAG_LAST_SEQUENCE: u32 = 4;
const TAG_COMPACT_POINTER: u32 = 5;
const TAG_DELETED_FILE: u32 = 6;
const TAG_NEW_FILE: u32 = 7;

/// A diff between two adjacent versions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VersionEdit {
    /// Name of the comparator the database was created with; written once
    /// per manifest and cross-checked on recovery.
    pub comparator: Option<String>,

    /// Write-ahead log number whose contents are fully reflected in the
    /// version this edit produces. Older logs are obsolete.
    pub log_number: Option<u64>,

    /// Next file number to allocate (local counter part).
    pub next_file_number: Option<u64>,

    /// Last committed sequence number.
    pub last_sequence: Option<SequenceNumber>,

    /// Per-level cursor where the next size compaction should start.
    pub compact_pointers: Vec<(u32, InternalKey)>,

    /// Files removed, as `(level, file_number)`.
    pub deleted_files: Vec<(u32, u64)>,

    /// Files added, as `(level, metadata)`.
    pub new_files: Vec<(u32, FileMetaData)>,
}

impl VersionEdit {
    /// An empty edit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the deletion of `number` from `level`.
    pub fn delete_file(&mut self, level: u32, number: u64) {
        self.deleted_files.push((level, number));
    }

    /// Records the addition of `file` at `level`.
    pub fn add_file(&mut self, level: u32, file: FileMetaData) {
        self.new_files.push((level, file));
    }

    /// Records the compaction cursor for `level`.
    pub fn set_compact_pointer(&mut self, level: u32, key: InternalKey) {
        self.compact_pointers.push((level, key));
    }

    /// True when the edit changes nothing.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Serialises the edit as a sequence of tagged fields.
    pub fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        if let Some(comparator) = &self.comparator {
            encode_field(TAG_COMPARATOR, comparator, buf)?;
        }
        if let Some(log_number) = self.log_number {
            encode_field(TAG_LOG_NUMBER, &log_number, buf)?;
        }
        if let Some(next_file_number) = self.next_file_number {
            encode_field(TAG_NEXT_FILE_NUMBER, &next_file_number, buf)?;
        }
        if let Some(last_sequence) = self.last_sequence {
            encode_field(TAG_LAST_SEQUENCE, &last_sequence, buf)?;
        }
        for (level, key) in &self.compact_pointers {
            let mut payload = Vec::new();
            level.encode_to(&mut payload)?;
            key.encode().encode_to(&mut payload)?;
            encode_field(TAG_COMPACT_POINTER, &payload.as_slice(), buf)?;
        }
        for (level, number) in &self.deleted_files {
            let mut payload = Vec::new();
            level.encode_to(&mut payload)?;
            number.encode_to(&mut payload)?;
            encode_field(TAG_DELETED_FILE, &payload.as_slice(), buf)?;
        }
        for (level, file) in &self.new_files {
            let mut payload = Vec::new();
            level.encode_to(&mut payload)?;
            file.encode_to(&mut payload)?;
            encode_field(TAG_NEW_FILE, &payload.as_slice(), buf)?;
        }
        Ok(())
    }

    /// Decodes an edit, ignoring unrecognised tags.
    pub fn decode_from(buf: &[u8]) -> Result<Self, EncodingError> {
        let mut edit = Self::default();
        let mut reader = FieldReader::new(buf);
        while let Some(field) = reader.next_field() {
            let (tag, payload) = field?;
            match tag {
                TAG_COMPARATOR => {
                    let (name, _) = String::decode_from(payload)?;
                    edit.comparator = Some(name);
                }
                TAG_LOG_NUMBER => {
                    let (v, _) = u64::decode_from(payload)?;
                    edit.log_number = Some(v);
                }
                TAG_NEXT_FILE_NUMBER => {
                    let (v, _) = u64::decode_from(payload)?;
                    edit.next_file_number = Some(v);
                }
                TAG_LAST_SEQUENCE => {
                    let (v, _) = u64::decode_from(payload)?;
                    edit.last_sequence = Some(v);
                }
                TAG_COMPACT_POINTER => {
                    let (inner, _) = <Vec<u8>>::decode_from(payload)?;
                    let (level, n) = u32::decode_from(&inner)?;
                    let (key_bytes, _) = <Vec<u8>>::decode_from(&inner[n..])?;
                    let key = InternalKey::decode(&key_bytes).ok_or(EncodingError::Custom(
                        "unparsable compact pointer key".into(),
                    ))?;
                    edit.compact_pointers.push((level, key));
                }
                TAG_DELETED_FILE => {
                    let (inner, _) = <Vec<u8>>::decode_from(payload)?;
                    let (level, n) = u32::decode_from(&inner)?;
                    let (number, _) = u64::decode_from(&inner[n..])?;
                    edit.deleted_files.push((level, number));
                }
                TAG_NEW_FILE => {
                    let (inner, _) = <Vec<u8>>::decode_from(payload)?;
                    let (level, n) = u32::decode_from(&inner)?;
                    let (file, _) = FileMetaData::decode_from(&inner[n..])?;
                    edit.new_files.push((level, file));
                }
                // Unknown tag from a newer engine: payload already skipped
                // by the reader.
                _ => {}
            }
        }
        Ok(edit)
    }
}

// The manifest log stores edits as ordinary records.
impl Encode for VersionEdit {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        VersionEdit::encode_to(self, buf)
    }
}

impl Decode for VersionEdit {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let edit = VersionEdit::decode_from(buf)?;
        Ok((edit, buf.len()))
    }
}
