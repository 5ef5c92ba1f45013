//! Length-prefixed frame writer (spec.md §4.2, §4.5).
//!
//! The writer owns the [`SeqAssigner`](crate::flow::SeqAssigner) for its
//! direction: every frame is seq-stamped and length-prefixed atomically
//! under one lock, which is what guarantees spec.md §5's per-flow
//! monotonic, gap-free ordering when multiple producer tasks share a
//! writer.

use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use super::limits::Limits;
use crate::error::Error;
use crate::flow::SeqAssigner;
use crate::frame::{self, Frame, HARD_FRAME_LIMIT};

struct Inner<W> {
    sink: W,
    limits: Limits,
}

/// A frame writer safe for concurrent use by multiple producer tasks
/// (spec.md §4.2). Cheaply `Clone`-able; clones share the same lock, sink,
/// and sequence state.
pub struct FramedWriter<W> {
    inner: Arc<Mutex<Inner<W>>>,
    seq: Arc<SeqAssigner>,
}

impl<W> Clone for FramedWriter<W> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            seq: self.seq.clone(),
        }
    }
}

impl<W: AsyncWrite + Unpin> FramedWriter<W> {
    /// Wrap `sink`, starting with the default (pre-negotiation) limits.
    pub fn new(sink: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                sink,
                limits: Limits::default(),
            })),
            seq: Arc::new(SeqAssigner::new()),
        }
    }

    /// Install negotiated limits (called once the handshake completes).
    pub async fn set_limits(&self, limits: Limits) {
        self.inner.lock().await.limits = limits;
    }

    /// Stamp `frame.seq` (if it's a flow frame) and write it, prefixed with
    /// its big-endian length. Refuses frames exceeding the negotiated or
    /// hard size limit without writing anything.
    pub async fn write_frame(&self, mut frame: Frame) -> crate::error::Result<()> {
        self.seq.assign(&mut frame);
        let encoded = frame::encode(&frame)?;
        let mut guard = self.inner.lock().await;
        let limit = (guard.limits.max_frame as usize).min(HARD_FRAME_LIMIT);
        if encoded.len() > limit {
            return Err(Error::FrameTooLarge {
                size: encoded.len(),
                limit,
            });
        }
        let len = u32::try_from(encoded.len())
            .map_err(|_| Error::FrameTooLarge { size: encoded.len(), limit })?;
        guard.sink.write_all(&len.to_be_bytes()).await?;
        guard.sink.write_all(&encoded).await?;
        guard.sink.flush().await?;
        Ok(())
    }
}

impl<W: Clone> FramedWriter<W> {
    /// Snapshot the current contents of the sink. Test-only helper for
    /// writers over an in-memory `Vec<u8>`.
    #[cfg(test)]
    pub(crate) async fn snapshot_for_test(&self) -> W {
        self.inner.lock().await.sink.clone()
    }
}
