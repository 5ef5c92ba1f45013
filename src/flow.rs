//! Flow identification and per-flow monotonic sequence assignment
//! (spec.md §3, §4.5).

use std::collections::HashMap;
use std::sync::Mutex;

use crate::frame::{Frame, FrameType};

/// Identifies a seq-ordering flow: `(message_id_str, routing_id_str_or_empty)`.
///
/// Two flows differ iff they differ in either component; the absence of a
/// routing id is itself a distinct flow from any present routing id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowKey {
    message_id: String,
    routing_id: Option<String>,
}

impl FlowKey {
    /// Build a flow key from its components.
    #[must_use]
    pub fn new(message_id: String, routing_id: Option<String>) -> Self {
        Self {
            message_id,
            routing_id,
        }
    }
}

/// Installed between every producer of frames and the network writer.
/// Overwrites `frame.seq` with a gap-free, per-flow monotonic counter
/// starting at 0; non-flow frames pass through untouched.
#[derive(Debug, Default)]
pub struct SeqAssigner {
    counters: Mutex<HashMap<FlowKey, u64>>,
}

impl SeqAssigner {
    /// Construct an assigner with no flows yet observed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next seq number to `frame` in place, and (for a terminal
    /// frame) release the flow's counter.
    ///
    /// Non-flow frames (HELLO, HEARTBEAT, RELAY_NOTIFY, RELAY_STATE) are
    /// left with `seq == 0`.
    pub fn assign(&self, frame: &mut Frame) {
        if !frame.frame_type.is_flow_frame() {
            return;
        }
        let key = frame.flow_key();
        let mut counters = self.counters.lock().expect("seq assigner mutex poisoned");
        let next = counters.entry(key.clone()).or_insert(0);
        frame.seq = *next;
        *next += 1;
        if matches!(frame.frame_type, FrameType::End | FrameType::Err) {
            drop(counters); // release before the nested call below
            self.release(&key);
        }
    }

    /// Remove the counter for a flow (called after a successful write of
    /// its END or ERR frame).
    pub fn release(&self, key: &FlowKey) {
        self.counters
            .lock()
            .expect("seq assigner mutex poisoned")
            .remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::MessageId;

    #[test]
    fn gap_free_monotonic_per_flow() {
        let assigner = SeqAssigner::new();
        let id = MessageId::new_uuid();

        let mut req = Frame::new(FrameType::Req, id);
        req.cap = Some("cap:op=x".into());
        assigner.assign(&mut req);
        assert_eq!(req.seq, 0);

        let mut chunk = Frame::new(FrameType::Chunk, id);
        chunk.stream_id = Some("s0".into());
        assigner.assign(&mut chunk);
        assert_eq!(chunk.seq, 0);

        let mut chunk2 = Frame::new(FrameType::Chunk, id);
        chunk2.stream_id = Some("s0".into());
        assigner.assign(&mut chunk2);
        assert_eq!(chunk2.seq, 1);

        let mut end = Frame::new(FrameType::End, id);
        assigner.assign(&mut end);
        assert_eq!(end.seq, 2);

        // Counter was released; a new request on the same id restarts at 0.
        let mut req2 = Frame::new(FrameType::Req, id);
        req2.cap = Some("cap:op=x".into());
        assigner.assign(&mut req2);
        assert_eq!(req2.seq, 0);
    }

    #[test]
    fn non_flow_frames_untouched() {
        let assigner = SeqAssigner::new();
        let id = MessageId::Uint(0);
        let mut hello = Frame::new(FrameType::Hello, id);
        hello.seq = 7;
        assigner.assign(&mut hello);
        assert_eq!(hello.seq, 7);
    }

    #[test]
    fn distinct_routing_ids_are_distinct_flows() {
        let assigner = SeqAssigner::new();
        let id = MessageId::new_uuid();

        let mut plain = Frame::new(FrameType::Chunk, id);
        plain.stream_id = Some("s".into());
        assigner.assign(&mut plain);
        assert_eq!(plain.seq, 0);

        let mut routed = Frame::new(FrameType::Chunk, id);
        routed.stream_id = Some("s".into());
        routed.routing_id = Some(MessageId::new_uuid());
        assigner.assign(&mut routed);
        assert_eq!(routed.seq, 0);
    }
}
