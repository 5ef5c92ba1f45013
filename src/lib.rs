//! bifaci - length-prefixed CBOR framing and multi-plugin host for a
//! capability-based RPC fabric.
//!
//! This crate provides the wire-level frame codec, the host side that
//! spawns and routes requests to plugin processes over stdio, and the
//! plugin-side runtime those processes embed to serve capabilities.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use bifaci::cap_urn::CapUrn;
//!
//! let urn: CapUrn = "cap:in=\"media:text/plain\";op=echo;out=\"media:text/plain\"".parse()?;
//! assert_eq!(urn.op(), "echo");
//! # Ok::<(), bifaci::error::Error>(())
//! ```
//!
//! # Architecture
//!
//! - [`frame`] - the CBOR wire frame model and codec
//! - [`io`] - length-prefix framing with negotiated limits
//! - [`handshake`] - `HELLO`/`HELLO` limit negotiation
//! - [`checksum`], [`flow`] - `CHUNK` integrity and per-flow sequencing
//! - [`emitter`] - chunked response emission shared by host and runtime
//! - [`cap_urn`], [`manifest`] - capability URNs and manifest parsing
//! - [`host`] - the host side: cap-table routing, spawn, death handling
//! - [`runtime`] - the plugin side: stdio dispatch loop and CLI shim
//! - [`relay`] - slave/master forwarding for nested plugin topologies

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod cap_urn;
pub mod checksum;
pub mod emitter;
pub mod error;
pub mod flow;
pub mod frame;
pub mod handshake;
pub mod host;
pub mod io;
pub mod manifest;
pub mod relay;
pub mod runtime;

pub use error::{Error, ErrorCode, Result};

/// bifaci wire protocol version (spec.md §3, `Frame::meta.version`).
pub const PROTOCOL_VERSION: u8 = frame::PROTOCOL_VERSION;
