//! bifaci error types

use thiserror::Error;

/// Wire-visible error code taxonomy (ERR.meta.code), fixed by spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Invariant violation: wrong order, missing required field, CHUNK after
    /// STREAM_END, STREAM_START after END, duplicate stream_id, unexpected
    /// HELLO, RELAY_* reaching a leaf runtime.
    ProtocolError,
    /// REQ with missing cap or non-empty payload.
    InvalidRequest,
    /// No route for a cap.
    NoHandler,
    /// Process spawn or post-spawn handshake failed.
    SpawnFailed,
    /// The handler function returned an error.
    HandlerError,
    /// CHUNK checksum mismatch or missing checksum.
    CorruptedData,
    /// The serving plugin terminated with in-flight requests.
    PluginDied,
}

impl ErrorCode {
    /// The wire string carried in `ERR.meta.code`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ProtocolError => "PROTOCOL_ERROR",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::NoHandler => "NO_HANDLER",
            Self::SpawnFailed => "SPAWN_FAILED",
            Self::HandlerError => "HANDLER_ERROR",
            Self::CorruptedData => "CORRUPTED_DATA",
            Self::PluginDied => "PLUGIN_DIED",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local (non-wire) errors produced by this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Underlying transport I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// CBOR payload was not a map, or a required key was missing.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// `frame_type` was the reserved value 2, or > 11.
    #[error("invalid frame type: {0}")]
    InvalidFrameType(u64),

    /// `version` field was not 2.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// `id` was neither a 16-byte byte string nor an unsigned integer.
    #[error("invalid message id encoding")]
    InvalidMessageId,

    /// Frame exceeded the negotiated or hard frame size limit.
    #[error("frame too large: {size} bytes (limit {limit})")]
    FrameTooLarge {
        /// Encoded size in bytes.
        size: usize,
        /// The limit that was exceeded.
        limit: usize,
    },

    /// CBOR encode failure.
    #[error("cbor encode error: {0}")]
    CborEncode(String),

    /// CBOR decode failure.
    #[error("cbor decode error: {0}")]
    CborDecode(String),

    /// The first frame on a direction was not HELLO.
    #[error("handshake error: {0}")]
    Handshake(String),

    /// A protocol-visible failure, carrying the fixed wire code taxonomy.
    #[error("{code}: {message}")]
    Protocol {
        /// Fixed error code.
        code: ErrorCode,
        /// Human-readable detail.
        message: String,
    },
}

impl Error {
    /// Build a [`Error::Protocol`] with the given code and message.
    pub fn protocol(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Protocol {
            code,
            message: message.into(),
        }
    }

    /// The wire error code this failure maps to, if any.
    #[must_use]
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Protocol { code, .. } => Some(*code),
            Self::MalformedFrame(_)
            | Self::InvalidFrameType(_)
            | Self::UnsupportedVersion(_)
            | Self::InvalidMessageId => Some(ErrorCode::ProtocolError),
            _ => None,
        }
    }
}

/// Result type alias used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;
