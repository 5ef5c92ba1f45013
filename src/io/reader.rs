//! Length-prefixed frame reader (spec.md §4.2).

use tokio::io::{AsyncRead, AsyncReadExt};

use super::limits::Limits;
use crate::error::Error;
use crate::frame::{self, Frame, HARD_FRAME_LIMIT};

/// Reads `u32_be length` + `length bytes of CBOR` frames off an
/// [`AsyncRead`] half, enforcing the negotiated and hard frame size limits.
pub struct FramedReader<R> {
    inner: R,
    limits: Limits,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    /// Wrap `inner`, starting with the default (pre-negotiation) limits.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            limits: Limits::default(),
        }
    }

    /// Install negotiated limits (called once the handshake completes).
    pub fn set_limits(&mut self, limits: Limits) {
        self.limits = limits;
    }

    /// Read the next frame, or `Ok(None)` on clean EOF at a frame boundary.
    ///
    /// A short read mid-length-prefix or mid-body is an I/O error, not EOF
    /// (spec.md §4.2 step 1 and step 3).
    pub async fn read_frame(&mut self) -> crate::error::Result<Option<Frame>> {
        let mut len_buf = [0u8; 4];
        match read_exact_or_eof(&mut self.inner, &mut len_buf).await? {
            ReadOutcome::Eof => return Ok(None),
            ReadOutcome::Full => {}
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let limit = (self.limits.max_frame as usize).min(HARD_FRAME_LIMIT);
        if len > limit {
            return Err(Error::FrameTooLarge { size: len, limit });
        }

        let mut body = vec![0u8; len];
        self.inner.read_exact(&mut body).await?;
        let decoded = frame::decode(&body)?;
        Ok(Some(decoded))
    }
}

enum ReadOutcome {
    Full,
    Eof,
}

/// Like `read_exact`, but a zero-byte read before any bytes are consumed is
/// reported as a clean EOF rather than an `UnexpectedEof` I/O error.
async fn read_exact_or_eof<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> crate::error::Result<ReadOutcome> {
    let mut read = 0;
    while read < buf.len() {
        let n = reader.read(&mut buf[read..]).await?;
        if n == 0 {
            return if read == 0 {
                Ok(ReadOutcome::Eof)
            } else {
                Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "short read in length prefix",
                )))
            };
        }
        read += n;
    }
    Ok(ReadOutcome::Full)
}
