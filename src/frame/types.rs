//! Frame type tags (spec.md §3).

use std::fmt;

/// Integer tag identifying a frame's role on the wire.
///
/// Wire values are fixed and part of the wire contract: `2` is permanently
/// reserved and MUST be rejected on decode, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Handshake exchange, first frame on each direction.
    Hello = 0,
    /// Capability request.
    Req = 1,
    /// Chunk of a stream's payload.
    Chunk = 3,
    /// Terminal frame for a request.
    End = 4,
    /// Plugin-to-host log side channel.
    Log = 5,
    /// Protocol-visible error.
    Err = 6,
    /// Liveness probe, answered locally.
    Heartbeat = 7,
    /// Opens a stream within a request.
    StreamStart = 8,
    /// Closes a stream within a request.
    StreamEnd = 9,
    /// Relay side channel: capability/manifest advertisement.
    RelayNotify = 10,
    /// Relay side channel: opaque resource state blob.
    RelayState = 11,
}

impl FrameType {
    /// Convert from the wire byte value.
    ///
    /// Returns `None` for the reserved value `2` and any value `> 11`.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Hello,
            1 => Self::Req,
            3 => Self::Chunk,
            4 => Self::End,
            5 => Self::Log,
            6 => Self::Err,
            7 => Self::Heartbeat,
            8 => Self::StreamStart,
            9 => Self::StreamEnd,
            10 => Self::RelayNotify,
            11 => Self::RelayState,
            _ => return None,
        })
    }

    /// Convert to the wire byte value.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Frames that participate in per-flow seq assignment (spec.md §4.5):
    /// everything except HELLO, HEARTBEAT, RELAY_NOTIFY, RELAY_STATE.
    #[must_use]
    pub const fn is_flow_frame(self) -> bool {
        !matches!(
            self,
            Self::Hello | Self::Heartbeat | Self::RelayNotify | Self::RelayState
        )
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Hello => "HELLO",
            Self::Req => "REQ",
            Self::Chunk => "CHUNK",
            Self::End => "END",
            Self::Log => "LOG",
            Self::Err => "ERR",
            Self::Heartbeat => "HEARTBEAT",
            Self::StreamStart => "STREAM_START",
            Self::StreamEnd => "STREAM_END",
            Self::RelayNotify => "RELAY_NOTIFY",
            Self::RelayState => "RELAY_STATE",
        };
        f.write_str(name)
    }
}
