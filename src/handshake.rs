//! HELLO exchange: limits negotiation and manifest carriage (spec.md §4.3).

use ciborium::value::Value as CborValue;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Error;
use crate::frame::{Frame, FrameType, MessageId};
use crate::io::{FramedReader, FramedWriter, Limits};

fn limits_to_meta(limits: Limits, manifest: Option<&[u8]>) -> crate::frame::Meta {
    let mut meta = crate::frame::Meta::new();
    meta.insert(
        "max_frame".to_string(),
        CborValue::Integer(limits.max_frame.into()),
    );
    meta.insert(
        "max_chunk".to_string(),
        CborValue::Integer(limits.max_chunk.into()),
    );
    meta.insert(
        "max_reorder_buffer".to_string(),
        CborValue::Integer(limits.max_reorder_buffer.into()),
    );
    meta.insert(
        "version".to_string(),
        CborValue::Integer(crate::frame::PROTOCOL_VERSION.into()),
    );
    if let Some(manifest) = manifest {
        meta.insert("manifest".to_string(), CborValue::Bytes(manifest.to_vec()));
    }
    meta
}

fn limits_from_meta(meta: &crate::frame::Meta) -> Limits {
    let defaults = Limits::default();
    let field = |name: &str, default: u64| -> u64 {
        meta.get(name)
            .and_then(|v| match v {
                CborValue::Integer(i) => u64::try_from(i128::from(*i)).ok(),
                CborValue::Float(f) => Some(*f as u64),
                _ => None,
            })
            .unwrap_or(default)
    };
    Limits {
        max_frame: field("max_frame", defaults.max_frame),
        max_chunk: field("max_chunk", defaults.max_chunk),
        max_reorder_buffer: field("max_reorder_buffer", defaults.max_reorder_buffer),
    }
}

fn manifest_from_meta(meta: &crate::frame::Meta) -> Option<Vec<u8>> {
    match meta.get("manifest") {
        Some(CborValue::Bytes(b)) => Some(b.clone()),
        _ => None,
    }
}

/// Outcome of a completed handshake: the negotiated limits and the peer's
/// manifest bytes (absent on the initiator side, since the initiator sends
/// no manifest).
#[derive(Debug, Clone)]
pub struct HandshakeOutcome {
    /// Element-wise minimum of both sides' advertised limits.
    pub negotiated: Limits,
    /// Opaque JSON manifest bytes from the acceptor, if any.
    pub manifest: Option<Vec<u8>>,
}

/// Perform the host-role side of the handshake: send HELLO with our limits
/// (no manifest), then read the acceptor's HELLO reply.
pub async fn initiate<R, W>(
    reader: &mut FramedReader<R>,
    writer: &FramedWriter<W>,
    my_limits: Limits,
) -> crate::error::Result<HandshakeOutcome>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut hello = Frame::new(FrameType::Hello, MessageId::Uint(0));
    hello.meta = limits_to_meta(my_limits, None);
    writer.write_frame(hello).await?;

    let reply = reader
        .read_frame()
        .await?
        .ok_or_else(|| Error::Handshake("peer closed before replying to HELLO".into()))?;
    if reply.frame_type != FrameType::Hello {
        return Err(Error::Handshake(format!(
            "expected HELLO, got {}",
            reply.frame_type
        )));
    }

    let theirs = limits_from_meta(&reply.meta);
    let negotiated = Limits::negotiate(my_limits, theirs);
    tracing::info!(?negotiated, "handshake negotiated (initiator)");
    reader.set_limits(negotiated);
    writer.set_limits(negotiated).await;

    Ok(HandshakeOutcome {
        negotiated,
        manifest: manifest_from_meta(&reply.meta),
    })
}

/// Perform the plugin-role side of the handshake: read the initiator's
/// HELLO, then reply with our limits and manifest.
pub async fn accept<R, W>(
    reader: &mut FramedReader<R>,
    writer: &FramedWriter<W>,
    my_limits: Limits,
    manifest: &[u8],
) -> crate::error::Result<HandshakeOutcome>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let first = reader
        .read_frame()
        .await?
        .ok_or_else(|| Error::Handshake("peer closed before sending HELLO".into()))?;
    if first.frame_type != FrameType::Hello {
        return Err(Error::Handshake(format!(
            "first frame must be HELLO, got {}",
            first.frame_type
        )));
    }
    let theirs = limits_from_meta(&first.meta);

    let mut reply = Frame::new(FrameType::Hello, MessageId::Uint(0));
    reply.meta = limits_to_meta(my_limits, Some(manifest));
    writer.write_frame(reply).await?;

    let negotiated = Limits::negotiate(my_limits, theirs);
    tracing::info!(?negotiated, "handshake negotiated (acceptor)");
    reader.set_limits(negotiated);
    writer.set_limits(negotiated).await;

    Ok(HandshakeOutcome {
        negotiated,
        manifest: Some(manifest.to_vec()),
    })
}
