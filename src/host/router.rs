//! The multi-plugin host: cap-table routing, on-demand spawn, and death
//! handling (spec.md §4.6).

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};

use super::cap_table::CapTable;
use super::plugin::{BoxReader, BoxWriter, PluginEvent, PluginSlot, PluginState, RunningPlugin, Spawn};
use crate::error::{Error, ErrorCode};
use crate::frame::{Frame, FrameType, MessageId};
use crate::handshake;
use crate::io::{FramedReader, FramedWriter, Limits};
use crate::manifest::ManifestDoc;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Tracks, for an in-flight flow, the plugin on the other end of it: the
/// plugin serving a relay-initiated request, or the plugin that originated
/// a peer-invoked one (spec.md §4.6). `peer_requests` marks the latter
/// case so END/ERR teardown timing can differ (see `handle_relay_frame`
/// and `handle_plugin_frame`).
struct RouteEntry {
    message_id: MessageId,
    routing_id: Option<MessageId>,
    plugin_index: usize,
}

struct HostState {
    plugins: Vec<PluginSlot>,
    cap_table: CapTable,
    request_routing: HashMap<String, RouteEntry>,
    peer_requests: HashSet<String>,
}

/// Multi-plugin router. Owns a cap table, a plugin roster, and the
/// single-lock shared state spec.md §4.6 calls for; cloning shares all of
/// it.
#[derive(Clone)]
pub struct PluginHost {
    state: Arc<Mutex<HostState>>,
    events_tx: mpsc::Sender<PluginEvent>,
    events_rx: Arc<Mutex<mpsc::Receiver<PluginEvent>>>,
    my_limits: Limits,
}

impl PluginHost {
    /// Build an empty host advertising `my_limits` in every handshake.
    #[must_use]
    pub fn new(my_limits: Limits) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(HostState {
                plugins: Vec::new(),
                cap_table: CapTable::new(),
                request_routing: HashMap::new(),
                peer_requests: HashSet::new(),
            })),
            events_tx,
            events_rx: Arc::new(Mutex::new(events_rx)),
            my_limits,
        }
    }

    /// Register a plugin to be spawned as `command args...` the first time
    /// one of `known_caps` is requested. Returns the plugin's index.
    pub async fn register(
        &self,
        command: impl Into<PathBuf>,
        args: Vec<String>,
        known_caps: Vec<String>,
    ) -> usize {
        let mut state = self.state.lock().await;
        let index = state.plugins.len();
        for cap in &known_caps {
            state.cap_table.insert(cap.clone(), index);
        }
        state.plugins.push(PluginSlot {
            spawn: Spawn::Process {
                command: command.into(),
                args,
            },
            known_caps,
            state: PluginState::Registered,
        });
        index
    }

    /// The host's current view of every capability any plugin serves,
    /// as the aggregate `{"caps":[...]}` document spec.md §4.6 exposes.
    /// `null` when no plugin is currently running.
    pub async fn capabilities_json(&self) -> serde_json::Value {
        let state = self.state.lock().await;
        let any_running = state.plugins.iter().any(|p| matches!(p.state, PluginState::Running(_)));
        if any_running {
            ManifestDoc::build(&state.cap_table.all_caps())
        } else {
            serde_json::Value::Null
        }
    }

    /// Attach a plugin over an already-connected transport (e.g. a test
    /// harness's duplex half, or a socket accepted by an embedder), rather
    /// than spawning a child process. Performs the handshake immediately
    /// and returns the new plugin's index.
    pub async fn attach<R, W>(&self, known_caps: Vec<String>, reader: R, writer: W) -> crate::error::Result<usize>
    where
        R: AsyncRead + Unpin + Send + Sync + 'static,
        W: AsyncWrite + Unpin + Send + Sync + 'static,
    {
        let index = {
            let mut state = self.state.lock().await;
            let index = state.plugins.len();
            for cap in &known_caps {
                state.cap_table.insert(cap.clone(), index);
            }
            state.plugins.push(PluginSlot {
                spawn: Spawn::Preconnected,
                known_caps,
                state: PluginState::Registered,
            });
            index
        };
        self.attach_inner(index, Box::new(reader), Box::new(writer), None).await?;
        Ok(index)
    }

    /// Spawn the process backing `index`. On any failure here — not just a
    /// post-spawn handshake failure — the slot is marked `Dead` so a repeat
    /// request for the same cap fails fast instead of re-attempting the
    /// spawn (spec.md §8 scenario 2, "hello_failed").
    async fn spawn_process(&self, index: usize, command: PathBuf, args: Vec<String>) -> crate::error::Result<()> {
        match self.spawn_process_inner(index, command, args).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let mut state = self.state.lock().await;
                state.plugins[index].state = PluginState::Dead;
                state.cap_table.remove_plugin(index);
                Err(e)
            }
        }
    }

    async fn spawn_process_inner(&self, index: usize, command: PathBuf, args: Vec<String>) -> crate::error::Result<()> {
        let mut child = Command::new(&command)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::protocol(ErrorCode::SpawnFailed, format!("spawn {command:?}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::protocol(ErrorCode::SpawnFailed, "child has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::protocol(ErrorCode::SpawnFailed, "child has no stdout"))?;

        self.attach_inner(
            index,
            Box::new(stdout) as BoxReader,
            Box::new(stdin) as BoxWriter,
            Some(child),
        )
        .await
    }

    /// Attach a pre-connected transport (e.g. a test harness's duplex
    /// half) as a plugin that is already registered but not yet running.
    pub(crate) async fn attach_inner(
        &self,
        index: usize,
        reader: BoxReader,
        writer: BoxWriter,
        child: Option<tokio::process::Child>,
    ) -> crate::error::Result<()> {
        let mut framed_reader = FramedReader::new(reader);
        let framed_writer = FramedWriter::new(writer);

        let outcome = match handshake::initiate(&mut framed_reader, &framed_writer, self.my_limits).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let mut state = self.state.lock().await;
                state.plugins[index].state = PluginState::Dead;
                state.cap_table.remove_plugin(index);
                return Err(e);
            }
        };

        let manifest_caps = outcome
            .manifest
            .as_deref()
            .and_then(|bytes| ManifestDoc::parse(bytes).ok())
            .map(|doc| doc.cap_urns());

        {
            let mut state = self.state.lock().await;
            if let Some(caps) = manifest_caps {
                state.cap_table.remove_plugin(index);
                for cap in &caps {
                    state.cap_table.insert(cap.clone(), index);
                }
                state.plugins[index].known_caps = caps;
            }
            state.plugins[index].state = PluginState::Running(RunningPlugin {
                writer: framed_writer,
                negotiated: outcome.negotiated,
                manifest: outcome.manifest,
                child,
            });
        }

        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            loop {
                match framed_reader.read_frame().await {
                    Ok(Some(frame)) => {
                        if events_tx
                            .send(PluginEvent::Frame { plugin_index: index, frame })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Ok(None) => {
                        let _ = events_tx.send(PluginEvent::Died { plugin_index: index }).await;
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(plugin_index = index, error = %e, "plugin read error, treating as death");
                        let _ = events_tx.send(PluginEvent::Died { plugin_index: index }).await;
                        return;
                    }
                }
            }
        });

        Ok(())
    }

    /// Ensure the plugin at `index` is spawned and past its handshake,
    /// spawning it on demand if it's only `Registered` so far. Dead
    /// plugins are never retried.
    async fn ensure_running(&self, index: usize) -> crate::error::Result<()> {
        let spawn = {
            let state = self.state.lock().await;
            match &state.plugins[index].state {
                PluginState::Running(_) => return Ok(()),
                PluginState::Dead => {
                    return Err(Error::protocol(ErrorCode::SpawnFailed, "plugin is dead"));
                }
                PluginState::Registered => match &state.plugins[index].spawn {
                    Spawn::Process { command, args } => Some((command.clone(), args.clone())),
                    Spawn::Preconnected => None,
                },
            }
        };
        match spawn {
            Some((command, args)) => self.spawn_process(index, command, args).await,
            None => Err(Error::protocol(
                ErrorCode::SpawnFailed,
                "preconnected plugin slot was never attached",
            )),
        }
    }

    async fn find_or_spawn_plugin_for_cap(&self, cap: &str) -> crate::error::Result<usize> {
        let candidate = {
            let state = self.state.lock().await;
            state.cap_table.find(cap)
        };
        let Some(index) = candidate else {
            return Err(Error::protocol(ErrorCode::NoHandler, format!("no plugin serves {cap}")));
        };
        self.ensure_running(index).await?;
        Ok(index)
    }

    async fn plugin_writer(&self, index: usize) -> Option<FramedWriter<BoxWriter>> {
        let state = self.state.lock().await;
        match &state.plugins[index].state {
            PluginState::Running(running) => Some(running.writer.clone()),
            _ => None,
        }
    }

    /// Run the router's main loop: pump frames from `relay_reader`
    /// (requests arriving from above, e.g. a relay master or the host's
    /// own caller) to whichever plugin serves them, and pump plugin
    /// responses and peer-invoked requests back out, until `relay_reader`
    /// reaches EOF.
    pub async fn run<R, W>(&self, mut relay_reader: FramedReader<R>, relay_writer: FramedWriter<W>) -> crate::error::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut events_rx = self.events_rx.lock().await;
        let result = loop {
            tokio::select! {
                relay_frame = relay_reader.read_frame() => {
                    match relay_frame {
                        Ok(Some(frame)) => {
                            if let Err(e) = self.handle_relay_frame(frame, &relay_writer).await {
                                break Err(e);
                            }
                        }
                        Ok(None) => break Ok(()),
                        Err(e) => break Err(e),
                    }
                }
                event = events_rx.recv() => {
                    match event {
                        Some(event) => {
                            if let Err(e) = self.handle_plugin_event(event, &relay_writer).await {
                                break Err(e);
                            }
                        }
                        None => break Ok(()),
                    }
                }
            }
        };
        self.shutdown_all().await;
        result
    }

    /// Frames arriving from upstream (a relay master, or this host's
    /// direct caller).
    async fn handle_relay_frame<W>(&self, frame: Frame, relay_writer: &FramedWriter<W>) -> crate::error::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        match frame.frame_type {
            FrameType::Heartbeat => {
                relay_writer.write_frame(Frame::new(FrameType::Heartbeat, frame.id)).await
            }
            FrameType::Req => {
                let id_key = frame.id.as_key();
                let cap = frame.cap.clone().unwrap_or_default();
                match self.find_or_spawn_plugin_for_cap(&cap).await {
                    Ok(plugin_index) => {
                        self.state.lock().await.request_routing.insert(
                            id_key,
                            RouteEntry { message_id: frame.id, routing_id: frame.routing_id, plugin_index },
                        );
                        self.forward_to_plugin(plugin_index, frame, relay_writer).await
                    }
                    Err(e) => {
                        let code = e.code().unwrap_or(ErrorCode::NoHandler);
                        let err = Frame::err(frame.id, frame.routing_id, code, &e.to_string());
                        relay_writer.write_frame(err).await
                    }
                }
            }
            FrameType::StreamStart | FrameType::Chunk | FrameType::StreamEnd => {
                let plugin_index = self.state.lock().await.request_routing.get(&frame.id.as_key()).map(|r| r.plugin_index);
                match plugin_index {
                    Some(index) => self.forward_to_plugin(index, frame, relay_writer).await,
                    None => Ok(()),
                }
            }
            FrameType::End | FrameType::Err => {
                let id_key = frame.id.as_key();
                let plugin_index = self.state.lock().await.request_routing.get(&id_key).map(|r| r.plugin_index);
                let Some(plugin_index) = plugin_index else {
                    return Ok(());
                };
                self.forward_to_plugin(plugin_index, frame, relay_writer).await?;
                // A peer call's response just completed; otherwise the
                // routing entry stays open until the plugin's own END/ERR.
                let mut state = self.state.lock().await;
                if state.peer_requests.remove(&id_key) {
                    state.request_routing.remove(&id_key);
                }
                Ok(())
            }
            FrameType::Hello | FrameType::RelayNotify | FrameType::RelayState => {
                let err = Frame::err(frame.id, frame.routing_id, ErrorCode::ProtocolError, "unexpected frame type on relay connection");
                relay_writer.write_frame(err).await
            }
            FrameType::Log => Ok(()),
        }
    }

    async fn forward_to_plugin<W>(&self, plugin_index: usize, frame: Frame, relay_writer: &FramedWriter<W>) -> crate::error::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        match self.plugin_writer(plugin_index).await {
            Some(writer) => writer.write_frame(frame).await,
            None => {
                let err = Frame::err(frame.id, frame.routing_id, ErrorCode::PluginDied, "plugin died before request could be forwarded");
                relay_writer.write_frame(err).await
            }
        }
    }

    async fn handle_plugin_event<W>(&self, event: PluginEvent, relay_writer: &FramedWriter<W>) -> crate::error::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        match event {
            PluginEvent::Frame { plugin_index, frame } => self.handle_plugin_frame(plugin_index, frame, relay_writer).await,
            PluginEvent::Died { plugin_index } => self.handle_plugin_death(plugin_index, relay_writer).await,
        }
    }

    /// Frames arriving from a plugin's own connection.
    async fn handle_plugin_frame<W>(&self, plugin_index: usize, frame: Frame, relay_writer: &FramedWriter<W>) -> crate::error::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        match frame.frame_type {
            FrameType::Heartbeat => {
                self.forward_to_plugin(plugin_index, Frame::new(FrameType::Heartbeat, frame.id), relay_writer).await
            }
            FrameType::Hello => Ok(()),
            FrameType::Req => {
                // A peer invocation: the plugin is itself issuing a request.
                // The upstream relay resolves it, not this host's own cap
                // table (spec.md §4.6).
                let id_key = frame.id.as_key();
                {
                    let mut state = self.state.lock().await;
                    state.request_routing.insert(
                        id_key.clone(),
                        RouteEntry { message_id: frame.id, routing_id: frame.routing_id, plugin_index },
                    );
                    state.peer_requests.insert(id_key);
                }
                relay_writer.write_frame(frame).await
            }
            FrameType::Log | FrameType::StreamStart | FrameType::Chunk | FrameType::StreamEnd => {
                relay_writer.write_frame(frame).await
            }
            FrameType::End => {
                relay_writer.write_frame(frame.clone()).await?;
                let id_key = frame.id.as_key();
                let mut state = self.state.lock().await;
                if !state.peer_requests.contains(&id_key) {
                    state.request_routing.remove(&id_key);
                }
                Ok(())
            }
            FrameType::Err => {
                relay_writer.write_frame(frame.clone()).await?;
                let id_key = frame.id.as_key();
                let mut state = self.state.lock().await;
                state.request_routing.remove(&id_key);
                state.peer_requests.remove(&id_key);
                Ok(())
            }
            FrameType::RelayNotify | FrameType::RelayState => {
                tracing::warn!(plugin_index, "plugin sent a relay side-channel frame, ignoring");
                Ok(())
            }
        }
    }

    async fn handle_plugin_death<W>(&self, plugin_index: usize, relay_writer: &FramedWriter<W>) -> crate::error::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let orphaned: Vec<(MessageId, Option<MessageId>)> = {
            let mut state = self.state.lock().await;
            let previous = std::mem::replace(&mut state.plugins[plugin_index].state, PluginState::Dead);
            kill_running(previous);
            state.cap_table.remove_plugin(plugin_index);
            let mut orphaned = Vec::new();
            let HostState {
                request_routing,
                peer_requests,
                ..
            } = &mut *state;
            request_routing.retain(|id_key, entry| {
                if entry.plugin_index == plugin_index {
                    orphaned.push((entry.message_id, entry.routing_id));
                    peer_requests.remove(id_key);
                    false
                } else {
                    true
                }
            });
            orphaned
        };
        for (id, routing_id) in orphaned {
            let err = Frame::err(id, routing_id, ErrorCode::PluginDied, "plugin died with an in-flight request");
            relay_writer.write_frame(err).await?;
        }
        Ok(())
    }

    /// Kill every still-running plugin's process (spec.md §5: "on relay
    /// reader EOF the host tears down all plugins"). Called once the relay
    /// connection closes and `run` is about to return.
    async fn shutdown_all(&self) {
        let mut state = self.state.lock().await;
        for slot in &mut state.plugins {
            let previous = std::mem::replace(&mut slot.state, PluginState::Dead);
            kill_running(previous);
        }
    }
}

/// Kill the child process backing a [`PluginState::Running`] slot, if any.
/// A no-op for `Registered`/`Dead`/pre-connected (no child) slots.
fn kill_running(state: PluginState) {
    if let PluginState::Running(mut running) = state {
        if let Some(child) = &mut running.child {
            let _ = child.start_kill();
        }
    }
}
