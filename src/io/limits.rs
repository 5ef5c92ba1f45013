//! Negotiated protocol limits (spec.md §3, §4.3).

/// Default negotiated max frame size in bytes.
pub const DEFAULT_MAX_FRAME: u64 = 3_670_016;
/// Default negotiated max chunk size in bytes.
pub const DEFAULT_MAX_CHUNK: u64 = 262_144;
/// Default negotiated reorder buffer slot count.
pub const DEFAULT_MAX_REORDER_BUFFER: u64 = 64;

/// `{ max_frame, max_chunk, max_reorder_buffer }`, all positive integers.
///
/// `max_reorder_buffer` is negotiated but not read by any state machine in
/// this crate (spec.md §9 Open Questions) — carried through regardless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum size of a single frame on the wire, in bytes.
    pub max_frame: u64,
    /// Maximum size of a single CHUNK payload, in bytes.
    pub max_chunk: u64,
    /// Maximum reorder buffer slots.
    pub max_reorder_buffer: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_frame: DEFAULT_MAX_FRAME,
            max_chunk: DEFAULT_MAX_CHUNK,
            max_reorder_buffer: DEFAULT_MAX_REORDER_BUFFER,
        }
    }
}

impl Limits {
    /// Element-wise minimum of two advertised limit sets (spec.md §4.3).
    #[must_use]
    pub fn negotiate(mine: Self, theirs: Self) -> Self {
        Self {
            max_frame: mine.max_frame.min(theirs.max_frame),
            max_chunk: mine.max_chunk.min(theirs.max_chunk),
            max_reorder_buffer: mine.max_reorder_buffer.min(theirs.max_reorder_buffer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiation_takes_elementwise_min() {
        let mine = Limits {
            max_frame: 1000,
            max_chunk: 50,
            max_reorder_buffer: 10,
        };
        let theirs = Limits {
            max_frame: 500,
            max_chunk: 80,
            max_reorder_buffer: 5,
        };
        let negotiated = Limits::negotiate(mine, theirs);
        assert_eq!(negotiated.max_frame, 500);
        assert_eq!(negotiated.max_chunk, 50);
        assert_eq!(negotiated.max_reorder_buffer, 5);
    }

    #[test]
    fn defaults_match_spec() {
        let d = Limits::default();
        assert_eq!(d.max_frame, 3_670_016);
        assert_eq!(d.max_chunk, 262_144);
        assert_eq!(d.max_reorder_buffer, 64);
    }
}
