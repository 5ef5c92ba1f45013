//! The wire [`Frame`] record (spec.md §3, field table).

use std::collections::BTreeMap;

use ciborium::value::Value as CborValue;

use super::id::MessageId;
use super::types::FrameType;
use crate::error::{Error, ErrorCode};

/// Protocol version carried on every frame. MUST equal 2.
pub const PROTOCOL_VERSION: u8 = 2;

/// `meta` is a map with string keys and CBOR-any values (spec.md §3).
pub type Meta = BTreeMap<String, CborValue>;

/// A single frame on the wire, with every optional field spec.md §3 names.
///
/// Optional fields default to absent; `seq` defaults to `0` and `eof`
/// defaults to `false`, both of which are omitted on encode when at their
/// default (spec.md §4.1).
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// MUST equal [`PROTOCOL_VERSION`].
    pub version: u8,
    /// Frame kind.
    pub frame_type: FrameType,
    /// Correlation id.
    pub id: MessageId,
    /// Per-flow sequence number; 0 for non-flow frames.
    pub seq: u64,
    /// MIME-ish label of the payload.
    pub content_type: Option<String>,
    /// Carries `code`/`message` for ERR/LOG, manifest + limits for
    /// HELLO/RELAY_NOTIFY.
    pub meta: Meta,
    /// Chunk body / end body / RELAY_STATE resource blob.
    pub payload: Option<Vec<u8>>,
    /// Total length hint (first chunk).
    pub len: Option<u64>,
    /// Byte offset. Defined but not consumed by any state machine in this
    /// crate (spec.md §9 Open Questions) — preserved on receive, omitted
    /// on send unless set.
    pub offset: Option<u64>,
    /// True on the final frame of a stream.
    pub eof: bool,
    /// Capability URN (REQ only).
    pub cap: Option<String>,
    /// Required on STREAM_START/CHUNK/STREAM_END.
    pub stream_id: Option<String>,
    /// Required on STREAM_START.
    pub media_urn: Option<String>,
    /// Optional tunneling identifier (XID); preserved across relays.
    pub routing_id: Option<MessageId>,
    /// Required on CHUNK.
    pub chunk_index: Option<u64>,
    /// Required on STREAM_END.
    pub chunk_count: Option<u64>,
    /// Required on CHUNK; FNV-1a of payload.
    pub checksum: Option<u64>,
}

impl Frame {
    /// Construct a minimal, otherwise-empty frame of the given type and id.
    #[must_use]
    pub fn new(frame_type: FrameType, id: MessageId) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            frame_type,
            id,
            seq: 0,
            content_type: None,
            meta: Meta::new(),
            payload: None,
            len: None,
            offset: None,
            eof: false,
            cap: None,
            stream_id: None,
            media_urn: None,
            routing_id: None,
            chunk_index: None,
            chunk_count: None,
            checksum: None,
        }
    }

    /// The flow key component pair this frame contributes to
    /// (`(message_id_str, routing_id_str_or_empty)`, spec.md §3).
    #[must_use]
    pub fn flow_key(&self) -> crate::flow::FlowKey {
        crate::flow::FlowKey::new(
            self.id.as_key(),
            self.routing_id.as_ref().map(MessageId::as_key),
        )
    }

    /// Validate the subset of spec.md §3's invariants that can be checked
    /// from this single frame in isolation (the rest require request-level
    /// state and are enforced by the runtime/router, not the codec).
    pub fn validate_standalone(&self) -> crate::error::Result<()> {
        if self.version != PROTOCOL_VERSION {
            return Err(Error::UnsupportedVersion(self.version));
        }
        match self.frame_type {
            FrameType::Req => {
                if self.cap.as_deref().unwrap_or_default().is_empty() {
                    return Err(Error::protocol(
                        ErrorCode::InvalidRequest,
                        "REQ missing cap",
                    ));
                }
                if self.payload.as_ref().is_some_and(|p| !p.is_empty()) {
                    return Err(Error::protocol(
                        ErrorCode::InvalidRequest,
                        "REQ must carry an empty payload",
                    ));
                }
            }
            FrameType::Chunk => {
                if self.stream_id.is_none() {
                    return Err(Error::protocol(
                        ErrorCode::ProtocolError,
                        "CHUNK missing stream_id",
                    ));
                }
                let Some(checksum) = self.checksum else {
                    return Err(Error::protocol(
                        ErrorCode::CorruptedData,
                        "CHUNK missing checksum",
                    ));
                };
                let payload = self.payload.as_deref().unwrap_or(&[]);
                if crate::checksum::fnv1a64(payload) != checksum {
                    return Err(Error::protocol(
                        ErrorCode::CorruptedData,
                        "CHUNK checksum mismatch",
                    ));
                }
            }
            FrameType::StreamStart => {
                if self.stream_id.is_none() || self.media_urn.is_none() {
                    return Err(Error::protocol(
                        ErrorCode::ProtocolError,
                        "STREAM_START missing stream_id or media_urn",
                    ));
                }
            }
            FrameType::StreamEnd => {
                if self.stream_id.is_none() {
                    return Err(Error::protocol(
                        ErrorCode::ProtocolError,
                        "STREAM_END missing stream_id",
                    ));
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Build an ERR frame correlated to `id`, preserving `routing_id`.
    #[must_use]
    pub fn err(id: MessageId, routing_id: Option<MessageId>, code: ErrorCode, message: &str) -> Self {
        let mut frame = Self::new(FrameType::Err, id);
        frame.routing_id = routing_id;
        frame
            .meta
            .insert("code".to_string(), CborValue::Text(code.as_str().to_string()));
        frame
            .meta
            .insert("message".to_string(), CborValue::Text(message.to_string()));
        frame
    }

    /// Read the `code` field out of an ERR/LOG frame's meta, if present.
    #[must_use]
    pub fn meta_code(&self) -> Option<&str> {
        self.meta.get("code").and_then(CborValue::as_text)
    }

    /// Read the `message` field out of an ERR/LOG frame's meta, if present.
    #[must_use]
    pub fn meta_message(&self) -> Option<&str> {
        self.meta.get("message").and_then(CborValue::as_text)
    }
}
