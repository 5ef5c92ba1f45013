//! CBOR integer-keyed map encode/decode for [`Frame`] (spec.md §4.1).
//!
//! Key numbering is part of the wire contract and MUST NOT change once
//! published: `0=version, 1=frame_type, 2=id, 3=seq, 4=content_type,
//! 5=meta, 6=payload, 7=len, 8=offset, 9=eof, 10=cap, 11=stream_id,
//! 12=media_urn`, plus the dedicated keys 13..16 below for routing_id,
//! chunk_index, chunk_count, checksum.

use ciborium::value::Value as CborValue;
use uuid::Uuid;

use super::frame::{Frame, Meta, PROTOCOL_VERSION};
use super::id::MessageId;
use super::types::FrameType;
use crate::error::Error;

const KEY_VERSION: i64 = 0;
const KEY_FRAME_TYPE: i64 = 1;
const KEY_ID: i64 = 2;
const KEY_SEQ: i64 = 3;
const KEY_CONTENT_TYPE: i64 = 4;
const KEY_META: i64 = 5;
const KEY_PAYLOAD: i64 = 6;
const KEY_LEN: i64 = 7;
const KEY_OFFSET: i64 = 8;
const KEY_EOF: i64 = 9;
const KEY_CAP: i64 = 10;
const KEY_STREAM_ID: i64 = 11;
const KEY_MEDIA_URN: i64 = 12;
const KEY_ROUTING_ID: i64 = 13;
const KEY_CHUNK_INDEX: i64 = 14;
const KEY_CHUNK_COUNT: i64 = 15;
const KEY_CHECKSUM: i64 = 16;

fn encode_message_id(id: &MessageId) -> CborValue {
    match id {
        MessageId::Uuid(u) => CborValue::Bytes(u.as_bytes().to_vec()),
        MessageId::Uint(n) => CborValue::Integer((*n).into()),
    }
}

fn decode_message_id(value: &CborValue) -> crate::error::Result<MessageId> {
    match value {
        CborValue::Bytes(b) if b.len() == 16 => {
            let mut buf = [0u8; 16];
            buf.copy_from_slice(b);
            Ok(MessageId::Uuid(Uuid::from_bytes(buf)))
        }
        CborValue::Bytes(_) => Err(Error::InvalidMessageId),
        CborValue::Integer(i) => {
            let n: i128 = (*i).into();
            u64::try_from(n)
                .map(MessageId::Uint)
                .map_err(|_| Error::InvalidMessageId)
        }
        _ => Err(Error::InvalidMessageId),
    }
}

/// Coerce any CBOR numeric width (int/uint/float) to `i64`, tolerating the
/// variance spec.md §4.1 requires for integer `meta` fields.
fn coerce_i64(value: &CborValue) -> Option<i64> {
    match value {
        CborValue::Integer(i) => i64::try_from(i128::from(*i)).ok(),
        CborValue::Float(f) => Some(*f as i64),
        _ => None,
    }
}

fn u64_key(map: &[(CborValue, CborValue)], key: i64) -> Option<u64> {
    map.iter()
        .find(|(k, _)| matches!(k, CborValue::Integer(i) if i128::from(*i) == i128::from(key)))
        .and_then(|(_, v)| coerce_i64(v))
        .and_then(|n| u64::try_from(n).ok())
}

fn text_key(map: &[(CborValue, CborValue)], key: i64) -> Option<String> {
    map.iter()
        .find(|(k, _)| matches!(k, CborValue::Integer(i) if i128::from(*i) == i128::from(key)))
        .and_then(|(_, v)| v.as_text())
        .map(str::to_string)
}

fn bytes_key(map: &[(CborValue, CborValue)], key: i64) -> Option<Vec<u8>> {
    map.iter()
        .find(|(k, _)| matches!(k, CborValue::Integer(i) if i128::from(*i) == i128::from(key)))
        .and_then(|(_, v)| v.as_bytes())
        .cloned()
}

fn bool_key(map: &[(CborValue, CborValue)], key: i64) -> Option<bool> {
    map.iter()
        .find(|(k, _)| matches!(k, CborValue::Integer(i) if i128::from(*i) == i128::from(key)))
        .and_then(|(_, v)| v.as_bool())
}

fn value_key(map: &[(CborValue, CborValue)], key: i64) -> Option<CborValue> {
    map.iter()
        .find(|(k, _)| matches!(k, CborValue::Integer(i) if i128::from(*i) == i128::from(key)))
        .map(|(_, v)| v.clone())
}

fn message_id_key(map: &[(CborValue, CborValue)], key: i64) -> crate::error::Result<Option<MessageId>> {
    match value_key(map, key) {
        Some(v) => decode_message_id(&v).map(Some),
        None => Ok(None),
    }
}

/// Encode `frame` into a CBOR byte string (without the length prefix; see
/// [`crate::io`] for the framing layer).
pub fn encode(frame: &Frame) -> crate::error::Result<Vec<u8>> {
    let mut entries: Vec<(CborValue, CborValue)> = Vec::new();
    entries.push((
        CborValue::Integer(KEY_VERSION.into()),
        CborValue::Integer(frame.version.into()),
    ));
    entries.push((
        CborValue::Integer(KEY_FRAME_TYPE.into()),
        CborValue::Integer(frame.frame_type.as_u8().into()),
    ));
    entries.push((
        CborValue::Integer(KEY_ID.into()),
        encode_message_id(&frame.id),
    ));
    if frame.seq != 0 {
        entries.push((
            CborValue::Integer(KEY_SEQ.into()),
            CborValue::Integer(frame.seq.into()),
        ));
    }
    if let Some(ct) = &frame.content_type {
        entries.push((
            CborValue::Integer(KEY_CONTENT_TYPE.into()),
            CborValue::Text(ct.clone()),
        ));
    }
    if !frame.meta.is_empty() {
        let map = frame
            .meta
            .iter()
            .map(|(k, v)| (CborValue::Text(k.clone()), v.clone()))
            .collect();
        entries.push((CborValue::Integer(KEY_META.into()), CborValue::Map(map)));
    }
    if let Some(payload) = &frame.payload {
        entries.push((
            CborValue::Integer(KEY_PAYLOAD.into()),
            CborValue::Bytes(payload.clone()),
        ));
    }
    if let Some(len) = frame.len {
        entries.push((
            CborValue::Integer(KEY_LEN.into()),
            CborValue::Integer(len.into()),
        ));
    }
    if let Some(offset) = frame.offset {
        entries.push((
            CborValue::Integer(KEY_OFFSET.into()),
            CborValue::Integer(offset.into()),
        ));
    }
    if frame.eof {
        entries.push((CborValue::Integer(KEY_EOF.into()), CborValue::Bool(true)));
    }
    if let Some(cap) = &frame.cap {
        entries.push((CborValue::Integer(KEY_CAP.into()), CborValue::Text(cap.clone())));
    }
    if let Some(stream_id) = &frame.stream_id {
        entries.push((
            CborValue::Integer(KEY_STREAM_ID.into()),
            CborValue::Text(stream_id.clone()),
        ));
    }
    if let Some(media_urn) = &frame.media_urn {
        entries.push((
            CborValue::Integer(KEY_MEDIA_URN.into()),
            CborValue::Text(media_urn.clone()),
        ));
    }
    if let Some(routing_id) = &frame.routing_id {
        entries.push((
            CborValue::Integer(KEY_ROUTING_ID.into()),
            encode_message_id(routing_id),
        ));
    }
    if let Some(idx) = frame.chunk_index {
        entries.push((
            CborValue::Integer(KEY_CHUNK_INDEX.into()),
            CborValue::Integer(idx.into()),
        ));
    }
    if let Some(count) = frame.chunk_count {
        entries.push((
            CborValue::Integer(KEY_CHUNK_COUNT.into()),
            CborValue::Integer(count.into()),
        ));
    }
    if let Some(checksum) = frame.checksum {
        entries.push((
            CborValue::Integer(KEY_CHECKSUM.into()),
            CborValue::Integer(checksum.into()),
        ));
    }

    let value = CborValue::Map(entries);
    let mut buf = Vec::new();
    ciborium::into_writer(&value, &mut buf).map_err(|e| Error::CborEncode(e.to_string()))?;
    Ok(buf)
}

/// Decode a CBOR byte string into a [`Frame`] (spec.md §4.1's decoder
/// behavior, excluding the length-prefix framing layer).
pub fn decode(bytes: &[u8]) -> crate::error::Result<Frame> {
    let value: CborValue =
        ciborium::from_reader(bytes).map_err(|e| Error::CborDecode(e.to_string()))?;
    let CborValue::Map(map) = value else {
        return Err(Error::MalformedFrame("top-level CBOR value is not a map".into()));
    };

    let version = u64_key(&map, KEY_VERSION)
        .ok_or_else(|| Error::MalformedFrame("missing key 0 (version)".into()))?;
    let version = u8::try_from(version).map_err(|_| Error::UnsupportedVersion(u8::MAX))?;
    if version != PROTOCOL_VERSION {
        return Err(Error::UnsupportedVersion(version));
    }

    let frame_type_raw = u64_key(&map, KEY_FRAME_TYPE)
        .ok_or_else(|| Error::MalformedFrame("missing key 1 (frame_type)".into()))?;
    let frame_type_byte =
        u8::try_from(frame_type_raw).map_err(|_| Error::InvalidFrameType(frame_type_raw))?;
    let frame_type =
        FrameType::from_u8(frame_type_byte).ok_or(Error::InvalidFrameType(frame_type_raw))?;

    let id = message_id_key(&map, KEY_ID)?
        .ok_or_else(|| Error::MalformedFrame("missing key 2 (id)".into()))?;

    let mut frame = Frame::new(frame_type, id);
    frame.seq = u64_key(&map, KEY_SEQ).unwrap_or(0);
    frame.content_type = text_key(&map, KEY_CONTENT_TYPE);
    if let Some(CborValue::Map(meta_entries)) = value_key(&map, KEY_META) {
        let mut meta = Meta::new();
        for (k, v) in meta_entries {
            if let CborValue::Text(key) = k {
                meta.insert(key, v);
            }
        }
        frame.meta = meta;
    }
    frame.payload = bytes_key(&map, KEY_PAYLOAD);
    frame.len = u64_key(&map, KEY_LEN);
    frame.offset = u64_key(&map, KEY_OFFSET);
    frame.eof = bool_key(&map, KEY_EOF).unwrap_or(false);
    frame.cap = text_key(&map, KEY_CAP);
    frame.stream_id = text_key(&map, KEY_STREAM_ID);
    frame.media_urn = text_key(&map, KEY_MEDIA_URN);
    frame.routing_id = message_id_key(&map, KEY_ROUTING_ID)?;
    frame.chunk_index = u64_key(&map, KEY_CHUNK_INDEX);
    frame.chunk_count = u64_key(&map, KEY_CHUNK_COUNT);
    frame.checksum = u64_key(&map, KEY_CHECKSUM);

    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::MessageId;

    fn sample_frame() -> Frame {
        let mut f = Frame::new(FrameType::Chunk, MessageId::new_uuid());
        f.stream_id = Some("s0".into());
        f.payload = Some(b"hello".to_vec());
        f.checksum = Some(crate::checksum::fnv1a64(b"hello"));
        f.chunk_index = Some(0);
        f.seq = 3;
        f
    }

    #[test]
    fn roundtrip_preserves_fields() {
        let frame = sample_frame();
        let bytes = encode(&frame).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn rejects_non_map_top_level() {
        let mut buf = Vec::new();
        ciborium::into_writer(&CborValue::Integer(1.into()), &mut buf).unwrap();
        assert!(decode(&buf).is_err());
    }

    #[test]
    fn rejects_missing_version() {
        let mut buf = Vec::new();
        let value = CborValue::Map(vec![(
            CborValue::Integer(KEY_FRAME_TYPE.into()),
            CborValue::Integer(1.into()),
        )]);
        ciborium::into_writer(&value, &mut buf).unwrap();
        assert!(decode(&buf).is_err());
    }

    #[test]
    fn rejects_reserved_frame_type() {
        let mut buf = Vec::new();
        let value = CborValue::Map(vec![
            (CborValue::Integer(KEY_VERSION.into()), CborValue::Integer(2.into())),
            (CborValue::Integer(KEY_FRAME_TYPE.into()), CborValue::Integer(2.into())),
            (CborValue::Integer(KEY_ID.into()), CborValue::Integer(0.into())),
        ]);
        ciborium::into_writer(&value, &mut buf).unwrap();
        assert!(matches!(decode(&buf), Err(Error::InvalidFrameType(2))));
    }

    #[test]
    fn accepts_uint_and_uuid_ids() {
        let mut buf = Vec::new();
        let value = CborValue::Map(vec![
            (CborValue::Integer(KEY_VERSION.into()), CborValue::Integer(2.into())),
            (CborValue::Integer(KEY_FRAME_TYPE.into()), CborValue::Integer(0.into())),
            (CborValue::Integer(KEY_ID.into()), CborValue::Integer(7.into())),
        ]);
        ciborium::into_writer(&value, &mut buf).unwrap();
        let frame = decode(&buf).unwrap();
        assert_eq!(frame.id, MessageId::Uint(7));
    }

    #[test]
    fn rejects_malformed_uuid_length() {
        let mut buf = Vec::new();
        let value = CborValue::Map(vec![
            (CborValue::Integer(KEY_VERSION.into()), CborValue::Integer(2.into())),
            (CborValue::Integer(KEY_FRAME_TYPE.into()), CborValue::Integer(0.into())),
            (CborValue::Integer(KEY_ID.into()), CborValue::Bytes(vec![0u8; 15])),
        ]);
        ciborium::into_writer(&value, &mut buf).unwrap();
        assert!(decode(&buf).is_err());

        let mut buf17 = Vec::new();
        let value17 = CborValue::Map(vec![
            (CborValue::Integer(KEY_VERSION.into()), CborValue::Integer(2.into())),
            (CborValue::Integer(KEY_FRAME_TYPE.into()), CborValue::Integer(0.into())),
            (CborValue::Integer(KEY_ID.into()), CborValue::Bytes(vec![0u8; 17])),
        ]);
        ciborium::into_writer(&value17, &mut buf17).unwrap();
        assert!(decode(&buf17).is_err());
    }

    #[test]
    fn tolerates_numeric_width_variance_in_meta() {
        let mut buf = Vec::new();
        let value = CborValue::Map(vec![
            (CborValue::Integer(KEY_VERSION.into()), CborValue::Integer(2.into())),
            (CborValue::Integer(KEY_FRAME_TYPE.into()), CborValue::Integer(6.into())),
            (CborValue::Integer(KEY_ID.into()), CborValue::Integer(1.into())),
            (
                CborValue::Integer(KEY_META.into()),
                CborValue::Map(vec![(
                    CborValue::Text("code".into()),
                    CborValue::Float(42.0),
                )]),
            ),
        ]);
        ciborium::into_writer(&value, &mut buf).unwrap();
        let frame = decode(&buf).unwrap();
        assert_eq!(
            frame.meta.get("code").and_then(super::coerce_i64),
            Some(42)
        );
    }

    #[test]
    fn omits_zero_seq_and_false_eof() {
        let mut f = Frame::new(FrameType::Heartbeat, MessageId::Uint(1));
        f.seq = 0;
        f.eof = false;
        let bytes = encode(&f).unwrap();
        let value: CborValue = ciborium::from_reader(bytes.as_slice()).unwrap();
        let CborValue::Map(entries) = value else {
            panic!("expected map");
        };
        assert!(u64_key(&entries, KEY_SEQ).is_none());
        assert!(bool_key(&entries, KEY_EOF).is_none());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn frame_type_strategy() -> impl Strategy<Value = FrameType> {
            prop_oneof![
                Just(FrameType::Hello),
                Just(FrameType::Req),
                Just(FrameType::Chunk),
                Just(FrameType::End),
                Just(FrameType::Log),
                Just(FrameType::Err),
                Just(FrameType::Heartbeat),
                Just(FrameType::StreamStart),
                Just(FrameType::StreamEnd),
                Just(FrameType::RelayNotify),
                Just(FrameType::RelayState),
            ]
        }

        fn message_id_strategy() -> impl Strategy<Value = MessageId> {
            prop_oneof![
                any::<u64>().prop_map(MessageId::Uint),
                any::<[u8; 16]>().prop_map(|b| MessageId::Uuid(Uuid::from_bytes(b))),
            ]
        }

        fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
            prop::collection::vec(any::<u8>(), 0..=512)
        }

        proptest! {
            /// Any frame built from arbitrary field values roundtrips through
            /// encode/decode, modulo the zero-seq/false-eof defaults that
            /// encode omits and decode reconstructs (spec.md §4.1).
            #[test]
            fn prop_roundtrip_preserves_fields(
                frame_type in frame_type_strategy(),
                id in message_id_strategy(),
                seq in any::<u64>(),
                eof in any::<bool>(),
                payload in payload_strategy(),
                chunk_index in any::<u64>(),
                checksum in any::<u64>(),
            ) {
                let mut frame = Frame::new(frame_type, id);
                frame.seq = seq;
                frame.eof = eof;
                frame.payload = Some(payload.clone());
                frame.chunk_index = Some(chunk_index);
                frame.checksum = Some(checksum);

                let bytes = encode(&frame).unwrap();
                let decoded = decode(&bytes).unwrap();

                prop_assert_eq!(decoded, frame);
            }

            /// A CHUNK's stored checksum is exactly the FNV-1a digest of its
            /// payload after a full encode/decode cycle.
            #[test]
            fn prop_chunk_checksum_survives_roundtrip(payload in payload_strategy()) {
                let mut frame = Frame::new(FrameType::Chunk, MessageId::new_uuid());
                frame.stream_id = Some("s0".into());
                frame.chunk_index = Some(0);
                frame.checksum = Some(crate::checksum::fnv1a64(&payload));
                frame.payload = Some(payload.clone());

                let decoded = decode(&encode(&frame).unwrap()).unwrap();
                prop_assert_eq!(decoded.checksum, Some(crate::checksum::fnv1a64(&payload)));
                prop_assert!(decoded.validate_standalone().is_ok());
            }
        }
    }
}
