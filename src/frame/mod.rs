//! Wire frame model and CBOR codec (spec.md §3, §4.1).

mod codec;
mod frame;
mod id;
mod types;

pub use codec::{decode, encode};
pub use frame::{Frame, Meta, PROTOCOL_VERSION};
pub use id::{MessageId, ParseMessageIdError};
pub use types::FrameType;

/// Hard ceiling on any frame, regardless of negotiated limits (spec.md §3).
pub const HARD_FRAME_LIMIT: usize = 16 * 1024 * 1024;
