//! Framed I/O: length-prefix framer with limit enforcement (spec.md §4.2).

mod limits;
mod reader;
mod writer;

pub use limits::{Limits, DEFAULT_MAX_CHUNK, DEFAULT_MAX_FRAME, DEFAULT_MAX_REORDER_BUFFER};
pub use reader::FramedReader;
pub use writer::FramedWriter;
