//! Tests for the tagged-field form used by the manifest edit codec:
//! `[u32 tag][u32 len][payload]` with forward-compatible unknown-tag skip.

use crate::encoding::*;

#[test]
fn roundtrip_single_field() {
    let mut buf = Vec::new();
    encode_field(3, &42u64, &mut buf).unwrap();

    let mut reader = FieldReader::new(&buf);
    let (tag, payload) = reader.next_field().unwrap().unwrap();
    assert_eq!(tag, 3);
    let (value, _) = u64::decode_from(payload).unwrap();
    assert_eq!(value, 42);
    assert!(reader.next_field().is_none());
}

#[test]
fn multiple_fields_in_order() {
    let mut buf = Vec::new();
    encode_field(1, &7u64, &mut buf).unwrap();
    encode_field(2, &b"smallest-key".to_vec(), &mut buf).unwrap();
    encode_field(9, &true, &mut buf).unwrap();

    let mut reader = FieldReader::new(&buf);
    let tags: Vec<u32> = std::iter::from_fn(|| reader.next_field())
        .map(|r| r.unwrap().0)
        .collect();
    assert_eq!(tags, [1, 2, 9]);
}

#[test]
fn unknown_tag_is_skippable() {
    // A reader that only understands tag 1 must be able to step over an
    // interleaved unknown tag and still read the field after it.
    let mut buf = Vec::new();
    encode_field(1, &100u64, &mut buf).unwrap();
    encode_field(0xDEAD, &b"future field payload".to_vec(), &mut buf).unwrap();
    encode_field(1, &200u64, &mut buf).unwrap();

    let mut reader = FieldReader::new(&buf);
    let mut known = Vec::new();
    while let Some(field) = reader.next_field() {
        let (tag, payload) = field.unwrap();
        if tag == 1 {
            let (v, _) = u64::decode_from(payload).unwrap();
            known.push(v);
        }
        // any other tag: ignored, payload skipped by the reader itself
    }
    assert_eq!(known, [100, 200]);
}

#[test]
fn truncated_payload_rejected() {
    let mut buf = Vec::new();
    encode_field(5, &0xFFFF_FFFF_FFFFu64, &mut buf).unwrap();
    buf.truncate(buf.len() - 2); // tear the payload

    let mut reader = FieldReader::new(&buf);
    let err = reader.next_field().unwrap().unwrap_err();
    assert!(matches!(err, EncodingError::UnexpectedEof { .. }));
}

#[test]
fn empty_buffer_yields_no_fields() {
    let mut reader = FieldReader::new(&[]);
    assert!(reader.next_field().is_none());
}
