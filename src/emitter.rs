//! Chunked-response emitter: splits a response payload into
//! STREAM_START / CHUNK* / STREAM_END, and tracks per-request completion so
//! END is only sent once every response stream has closed (spec.md §4.4).

use std::sync::Arc;

use ciborium::value::Value as CborValue;
use tokio::io::AsyncWrite;
use tokio::sync::Mutex as AsyncMutex;

use crate::checksum::fnv1a64;
use crate::frame::{Frame, FrameType, MessageId};
use crate::io::FramedWriter;

/// Split `payload` into chunks of at most `max_chunk` bytes each, writing
/// `STREAM_START`, zero or more `CHUNK`s, then `STREAM_END`.
///
/// Does not emit `END`; callers with multiple response streams must emit
/// all of them before emitting a single `END` (spec.md §4.4 step 4).
pub async fn emit_bytes_stream<W: AsyncWrite + Unpin>(
    writer: &FramedWriter<W>,
    request_id: MessageId,
    routing_id: Option<MessageId>,
    stream_id: &str,
    media_urn: &str,
    payload: &[u8],
    max_chunk: u64,
) -> crate::error::Result<()> {
    let mut start = Frame::new(FrameType::StreamStart, request_id);
    start.routing_id = routing_id;
    start.stream_id = Some(stream_id.to_string());
    start.media_urn = Some(media_urn.to_string());
    if !payload.is_empty() {
        start.len = Some(payload.len() as u64);
    }
    writer.write_frame(start).await?;

    let max_chunk = max_chunk.max(1) as usize;
    let mut chunk_count: u64 = 0;
    for (index, slice) in payload.chunks(max_chunk).enumerate() {
        let mut chunk = Frame::new(FrameType::Chunk, request_id);
        chunk.routing_id = routing_id;
        chunk.stream_id = Some(stream_id.to_string());
        chunk.chunk_index = Some(index as u64);
        chunk.checksum = Some(fnv1a64(slice));
        chunk.payload = Some(slice.to_vec());
        writer.write_frame(chunk).await?;
        chunk_count += 1;
    }

    let mut end = Frame::new(FrameType::StreamEnd, request_id);
    end.routing_id = routing_id;
    end.stream_id = Some(stream_id.to_string());
    end.chunk_count = Some(chunk_count);
    writer.write_frame(end).await
}

/// Encode `value` once as CBOR; if it exceeds `max_chunk` bytes, re-emit it
/// as multiple CHUNKs where each CHUNK payload is itself an independently
/// decodable CBOR value (spec.md §4.4, §9): byte/string values are split
/// before encoding so each slice becomes a complete `bstr`/`tstr`.
fn split_into_decodable_chunks(value: &CborValue, max_chunk: usize) -> crate::error::Result<Vec<Vec<u8>>> {
    let mut whole = Vec::new();
    ciborium::into_writer(value, &mut whole)
        .map_err(|e| crate::error::Error::CborEncode(e.to_string()))?;
    if whole.len() <= max_chunk || max_chunk == 0 {
        return Ok(vec![whole]);
    }

    match value {
        CborValue::Bytes(bytes) => Ok(bytes
            .chunks(max_chunk.max(1))
            .map(|slice| {
                let mut buf = Vec::new();
                ciborium::into_writer(&CborValue::Bytes(slice.to_vec()), &mut buf).expect("cbor encode of bstr cannot fail");
                buf
            })
            .collect()),
        CborValue::Text(text) => {
            // Split on char boundaries so every slice is valid UTF-8.
            let mut out = Vec::new();
            let mut rest = text.as_str();
            while !rest.is_empty() {
                let mut boundary = max_chunk.min(rest.len());
                while boundary > 0 && !rest.is_char_boundary(boundary) {
                    boundary -= 1;
                }
                let boundary = boundary.max(1.min(rest.len()));
                let (head, tail) = rest.split_at(boundary);
                let mut buf = Vec::new();
                ciborium::into_writer(&CborValue::Text(head.to_string()), &mut buf)
                    .map_err(|e| crate::error::Error::CborEncode(e.to_string()))?;
                out.push(buf);
                rest = tail;
            }
            Ok(out)
        }
        CborValue::Array(items) => {
            // Each element is emitted as its own self-describing CBOR item.
            let mut out = Vec::new();
            for item in items {
                let mut buf = Vec::new();
                ciborium::into_writer(item, &mut buf)
                    .map_err(|e| crate::error::Error::CborEncode(e.to_string()))?;
                out.push(buf);
            }
            Ok(out)
        }
        CborValue::Map(entries) => {
            let mut out = Vec::new();
            for (k, v) in entries {
                let mut buf = Vec::new();
                ciborium::into_writer(&CborValue::Map(vec![(k.clone(), v.clone())]), &mut buf)
                    .map_err(|e| crate::error::Error::CborEncode(e.to_string()))?;
                out.push(buf);
            }
            Ok(out)
        }
        // Scalars can't be split further; send as a single oversized chunk.
        _ => Ok(vec![whole]),
    }
}

/// Write `STREAM_START`/`CHUNK`*/`STREAM_END` for one CBOR value under
/// `stream_id`, splitting into independently decodable chunks if the
/// encoded form exceeds `max_chunk` (spec.md §4.4, §9). Shared by
/// [`StreamEmitter::emit_value`] and [`crate::runtime::PeerInvoker::invoke`],
/// which assign `stream_id` differently (a fresh counter vs `arg-{index}`).
pub(crate) async fn emit_cbor_value_stream<W: AsyncWrite + Unpin>(
    writer: &FramedWriter<W>,
    request_id: MessageId,
    routing_id: Option<MessageId>,
    stream_id: &str,
    media_urn: &str,
    value: &CborValue,
    max_chunk: u64,
) -> crate::error::Result<()> {
    let slices = split_into_decodable_chunks(value, max_chunk as usize)?;

    let mut start = Frame::new(FrameType::StreamStart, request_id);
    start.routing_id = routing_id;
    start.stream_id = Some(stream_id.to_string());
    start.media_urn = Some(media_urn.to_string());
    writer.write_frame(start).await?;

    for (index, slice) in slices.iter().enumerate() {
        let mut chunk = Frame::new(FrameType::Chunk, request_id);
        chunk.routing_id = routing_id;
        chunk.stream_id = Some(stream_id.to_string());
        chunk.chunk_index = Some(index as u64);
        chunk.checksum = Some(fnv1a64(slice));
        chunk.payload = Some(slice.clone());
        writer.write_frame(chunk).await?;
    }

    let mut end = Frame::new(FrameType::StreamEnd, request_id);
    end.routing_id = routing_id;
    end.stream_id = Some(stream_id.to_string());
    end.chunk_count = Some(slices.len() as u64);
    writer.write_frame(end).await
}

/// Strip the bstr/tstr envelope a [`StreamEmitter::emit_bytes`]-built CHUNK
/// payload carries, returning its raw bytes (spec.md §8 scenario 1).
pub(crate) fn decode_chunk_payload(payload: &[u8]) -> crate::error::Result<Vec<u8>> {
    let value: CborValue =
        ciborium::from_reader(payload).map_err(|e| crate::error::Error::CborDecode(e.to_string()))?;
    match value {
        CborValue::Bytes(b) => Ok(b),
        CborValue::Text(t) => Ok(t.into_bytes()),
        _ => Err(crate::error::Error::CborDecode("chunk payload was not a bstr/tstr".to_string())),
    }
}

/// Bound to `(request_id, routing_id, max_chunk)`. Handlers call
/// [`StreamEmitter::emit_value`] once per response stream; [`Self::finalize`]
/// writes the final `END` once all streams for the request are closed.
pub struct StreamEmitter<W> {
    writer: FramedWriter<W>,
    request_id: MessageId,
    routing_id: Option<MessageId>,
    max_chunk: u64,
    next_stream: Arc<AsyncMutex<u64>>,
}

impl<W> Clone for StreamEmitter<W> {
    fn clone(&self) -> Self {
        Self {
            writer: self.writer.clone(),
            request_id: self.request_id,
            routing_id: self.routing_id,
            max_chunk: self.max_chunk,
            next_stream: self.next_stream.clone(),
        }
    }
}

impl<W: AsyncWrite + Unpin> StreamEmitter<W> {
    /// Construct an emitter for a single request's response streams.
    #[must_use]
    pub fn new(
        writer: FramedWriter<W>,
        request_id: MessageId,
        routing_id: Option<MessageId>,
        max_chunk: u64,
    ) -> Self {
        Self {
            writer,
            request_id,
            routing_id,
            max_chunk,
            next_stream: Arc::new(AsyncMutex::new(0)),
        }
    }

    async fn fresh_stream_id(&self) -> String {
        let mut next = self.next_stream.lock().await;
        let id = format!("resp-{next}");
        *next += 1;
        id
    }

    /// Emit a byte payload as one response stream, CBOR-encoded as a `bstr`
    /// (spec.md §8 scenario 1: the CHUNK payload CBOR-decodes to the byte
    /// string, not the raw bytes themselves).
    pub async fn emit_bytes(&self, media_urn: &str, payload: &[u8]) -> crate::error::Result<()> {
        self.emit_value(media_urn, &CborValue::Bytes(payload.to_vec())).await
    }

    /// Emit a CBOR value as one response stream, splitting into
    /// independently decodable CHUNKs if the encoded form exceeds
    /// `max_chunk` (spec.md §9).
    pub async fn emit_value(&self, media_urn: &str, value: &CborValue) -> crate::error::Result<()> {
        let stream_id = self.fresh_stream_id().await;
        emit_cbor_value_stream(
            &self.writer,
            self.request_id,
            self.routing_id,
            &stream_id,
            media_urn,
            value,
            self.max_chunk,
        )
        .await
    }

    /// Emit the terminal `END` for this request. Callers must have already
    /// emitted every response stream (spec.md §4.4 step 4).
    pub async fn finalize(&self) -> crate::error::Result<()> {
        let mut end = Frame::new(FrameType::End, self.request_id);
        end.routing_id = self.routing_id;
        self.writer.write_frame(end).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{self as wire, MessageId};

    async fn drain<W: AsyncWrite + Unpin>(_writer: &FramedWriter<W>) {}

    fn parse_written(buf: &[u8]) -> Vec<Frame> {
        let mut out = Vec::new();
        let mut offset = 0;
        while offset < buf.len() {
            let len = u32::from_be_bytes(buf[offset..offset + 4].try_into().unwrap()) as usize;
            offset += 4;
            out.push(wire::decode(&buf[offset..offset + len]).unwrap());
            offset += len;
        }
        out
    }

    #[tokio::test]
    async fn empty_payload_emits_start_end_only() {
        let writer = FramedWriter::new(Vec::<u8>::new());
        let id = MessageId::new_uuid();
        emit_bytes_stream(&writer, id, None, "resp-0", "media:bytes", &[], 100)
            .await
            .unwrap();
        drain(&writer).await;

        let guard = writer_buf(&writer).await;
        let frames = parse_written(&guard);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].frame_type, FrameType::StreamStart);
        assert_eq!(frames[1].frame_type, FrameType::StreamEnd);
        assert_eq!(frames[1].chunk_count, Some(0));
    }

    #[tokio::test]
    async fn exact_multiple_boundary() {
        let writer = FramedWriter::new(Vec::<u8>::new());
        let id = MessageId::new_uuid();
        let payload = vec![7u8; 100];
        emit_bytes_stream(&writer, id, None, "resp-0", "media:bytes", &payload, 100)
            .await
            .unwrap();
        let guard = writer_buf(&writer).await;
        let frames = parse_written(&guard);
        // start, 1 chunk, end
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[1].payload.as_deref(), Some(payload.as_slice()));
    }

    #[tokio::test]
    async fn one_byte_over_boundary_splits_in_two() {
        let writer = FramedWriter::new(Vec::<u8>::new());
        let id = MessageId::new_uuid();
        let payload = vec![7u8; 101];
        emit_bytes_stream(&writer, id, None, "resp-0", "media:bytes", &payload, 100)
            .await
            .unwrap();
        let guard = writer_buf(&writer).await;
        let frames = parse_written(&guard);
        assert_eq!(frames.len(), 4); // start, chunk, chunk, end
        assert_eq!(frames[1].payload.as_ref().unwrap().len(), 100);
        assert_eq!(frames[2].payload.as_ref().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn chunks_reassemble_to_original_payload() {
        let writer = FramedWriter::new(Vec::<u8>::new());
        let id = MessageId::new_uuid();
        let payload: Vec<u8> = (0u16..1000).map(|n| (n % 256) as u8).collect();
        emit_bytes_stream(&writer, id, None, "resp-0", "media:bytes", &payload, 57)
            .await
            .unwrap();
        let guard = writer_buf(&writer).await;
        let frames = parse_written(&guard);
        let mut reassembled = Vec::new();
        for f in &frames {
            if f.frame_type == FrameType::Chunk {
                reassembled.extend_from_slice(f.payload.as_ref().unwrap());
            }
        }
        assert_eq!(reassembled, payload);
    }

    #[tokio::test]
    async fn typed_emission_splits_bytes_into_decodable_chunks() {
        let writer = FramedWriter::new(Vec::<u8>::new());
        let emitter = StreamEmitter::new(writer.clone(), MessageId::new_uuid(), None, 4);
        let value = CborValue::Bytes(b"0123456789".to_vec());
        emitter.emit_value("media:bytes", &value).await.unwrap();

        let guard = writer_buf(&writer).await;
        let frames = parse_written(&guard);
        let mut reassembled = Vec::new();
        for f in &frames {
            if f.frame_type == FrameType::Chunk {
                let decoded: CborValue = ciborium::from_reader(f.payload.as_ref().unwrap().as_slice()).unwrap();
                let CborValue::Bytes(b) = decoded else {
                    panic!("chunk payload must independently decode to a bstr");
                };
                reassembled.extend_from_slice(&b);
            }
        }
        assert_eq!(reassembled, b"0123456789");
    }

    async fn writer_buf(writer: &FramedWriter<Vec<u8>>) -> Vec<u8> {
        writer.snapshot_for_test().await
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
            prop::collection::vec(any::<u8>(), 0..=2000)
        }

        proptest! {
            /// Reassembling a stream's CHUNKs in order always reproduces the
            /// original payload byte-for-byte, for any payload and any
            /// `max_chunk` (spec.md §4.4).
            #[test]
            fn prop_chunks_reassemble_to_original_payload(
                payload in payload_strategy(),
                max_chunk in 1u64..=300,
            ) {
                let rt = tokio::runtime::Runtime::new().unwrap();
                rt.block_on(async {
                    let writer = FramedWriter::new(Vec::<u8>::new());
                    let id = MessageId::new_uuid();
                    emit_bytes_stream(&writer, id, None, "resp-0", "media:bytes", &payload, max_chunk)
                        .await
                        .unwrap();
                    let guard = writer_buf(&writer).await;
                    let frames = parse_written(&guard);

                    prop_assert_eq!(frames.first().unwrap().frame_type, FrameType::StreamStart);
                    prop_assert_eq!(frames.last().unwrap().frame_type, FrameType::StreamEnd);

                    let mut reassembled = Vec::new();
                    for f in &frames {
                        if f.frame_type == FrameType::Chunk {
                            prop_assert_eq!(f.checksum, Some(fnv1a64(f.payload.as_ref().unwrap())));
                            reassembled.extend_from_slice(f.payload.as_ref().unwrap());
                        }
                    }
                    prop_assert_eq!(reassembled, payload);
                    Ok(())
                })?;
            }
        }
    }
}
