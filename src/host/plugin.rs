//! Per-plugin connection state (spec.md §4.6).

use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;

use crate::frame::Frame;
use crate::io::{FramedWriter, Limits};

/// Boxed transport halves, so a [`ManagedPlugin`] can hold either a spawned
/// child process's stdio or a pre-connected duplex half uniformly.
pub(crate) type BoxReader = Box<dyn AsyncRead + Unpin + Send + Sync>;
pub(crate) type BoxWriter = Box<dyn AsyncWrite + Unpin + Send + Sync>;

/// A frame received off a plugin's connection, or its death, pushed onto
/// the router's single event channel by that plugin's reader task.
pub(crate) enum PluginEvent {
    /// A frame the plugin sent.
    Frame { plugin_index: usize, frame: Frame },
    /// The plugin's connection closed or errored.
    Died { plugin_index: usize },
}

/// The live half of a plugin's connection, present once it has completed
/// the handshake and is routable.
pub(crate) struct RunningPlugin {
    pub writer: FramedWriter<BoxWriter>,
    pub negotiated: Limits,
    pub manifest: Option<Vec<u8>>,
    /// `None` for plugins attached over a pre-connected transport rather
    /// than spawned by this host.
    pub child: Option<Child>,
}

/// Lifecycle state of one entry in the host's plugin table.
pub(crate) enum PluginState {
    /// Known (by command or by a pre-connected transport factory) but not
    /// yet spawned; spawned lazily on first matching request.
    Registered,
    /// Handshake completed, routable.
    Running(RunningPlugin),
    /// Spawn failed, handshake failed, or the process exited. Permanent:
    /// a dead plugin is never retried (spec.md §4.6).
    Dead,
}

/// How to bring a [`PluginState::Registered`] plugin up when first needed.
pub(crate) enum Spawn {
    /// Launch `command` with `args`, wiring its stdio.
    Process { command: PathBuf, args: Vec<String> },
    /// Already attached over a pre-connected transport; never re-spawned.
    Preconnected,
}

/// One row of the host's plugin table. `known_caps` starts as whatever the
/// registrant declared and is replaced by the plugin's own manifest once
/// the handshake completes, if it advertised any.
pub(crate) struct PluginSlot {
    pub spawn: Spawn,
    pub known_caps: Vec<String>,
    pub state: PluginState,
}
