//! Plugin-initiated peer calls back through the shared writer (spec.md §4.7,
//! `PeerInvoker.Invoke`).

use std::collections::HashMap;
use std::sync::Arc;

use ciborium::value::Value as CborValue;
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::emitter::emit_cbor_value_stream;
use crate::frame::{Frame, FrameType, MessageId};
use crate::io::FramedWriter;

/// CBOR-encode an argument value per its media URN: a `string`/`text` URN
/// produces a `tstr` when the bytes are valid UTF-8, otherwise a `bstr`
/// (spec.md §8 scenario 6: `CHUNK(seq=0, payload=CBOR("hi"), checksum)`).
fn cbor_value_for_media(media_urn: &str, value: &[u8]) -> CborValue {
    if media_urn.contains("string") || media_urn.contains("text") {
        if let Ok(text) = std::str::from_utf8(value) {
            return CborValue::Text(text.to_string());
        }
    }
    CborValue::Bytes(value.to_vec())
}

/// Pending peer calls keyed by request id, each holding the sender half the
/// event loop pushes demuxed response frames into.
pub(crate) type PendingPeerRequests = Arc<AsyncMutex<HashMap<String, mpsc::UnboundedSender<Frame>>>>;

/// One response-stream argument to a peer invocation: its media URN and the
/// raw bytes to carry.
pub struct PeerArg<'a> {
    /// The argument's media URN.
    pub media_urn: &'a str,
    /// The argument's raw bytes.
    pub value: &'a [u8],
}

/// Lets a handler call another capability through the same connection this
/// plugin was invoked on, demultiplexed by the owning event loop.
pub struct PeerInvoker<W> {
    writer: FramedWriter<W>,
    pending: PendingPeerRequests,
    max_chunk: u64,
}

impl<W> Clone for PeerInvoker<W> {
    fn clone(&self) -> Self {
        Self {
            writer: self.writer.clone(),
            pending: self.pending.clone(),
            max_chunk: self.max_chunk,
        }
    }
}

impl<W: AsyncWrite + Unpin> PeerInvoker<W> {
    pub(crate) fn new(writer: FramedWriter<W>, pending: PendingPeerRequests, max_chunk: u64) -> Self {
        Self {
            writer,
            pending,
            max_chunk,
        }
    }

    /// Invoke `cap` with `args`, returning a channel the caller drains for
    /// response frames. The channel closes on the peer's `END`; an `ERR`
    /// arrives as one final frame before closing.
    pub async fn invoke(&self, cap: &str, args: &[PeerArg<'_>]) -> crate::error::Result<mpsc::UnboundedReceiver<Frame>> {
        let request_id = MessageId::new_uuid();
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.lock().await.insert(request_id.as_key(), tx);

        let mut req = Frame::new(FrameType::Req, request_id);
        req.cap = Some(cap.to_string());
        req.content_type = Some("application/cbor".to_string());
        self.writer.write_frame(req).await?;

        for (index, arg) in args.iter().enumerate() {
            let stream_id = format!("arg-{index}");
            let value = cbor_value_for_media(arg.media_urn, arg.value);
            emit_cbor_value_stream(&self.writer, request_id, None, &stream_id, arg.media_urn, &value, self.max_chunk).await?;
        }

        self.writer.write_frame(Frame::new(FrameType::End, request_id)).await?;
        Ok(rx)
    }
}
