//! The plugin-side stdio event loop (spec.md §4.7).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use super::peer::{PeerInvoker, PendingPeerRequests};
use crate::cap_urn::CapUrn;
use crate::checksum::fnv1a64;
use crate::emitter::StreamEmitter;
use crate::error::{Error, ErrorCode};
use crate::frame::{Frame, FrameType, MessageId};
use crate::handshake;
use crate::io::{FramedReader, FramedWriter, Limits};

pub(crate) type BoxReader = Box<dyn AsyncRead + Unpin + Send + Sync>;
/// Boxed write half, so every producer (handlers, the heartbeat responder,
/// the peer invoker) can share one writer type regardless of the underlying
/// transport.
pub type BoxWriter = Box<dyn AsyncWrite + Unpin + Send + Sync>;

/// Everything a handler needs: the replayed request frames, a bound emitter
/// for its response streams, and a way to call other capabilities.
pub struct HandlerInput {
    /// Replays, in wire order, every stream this request carried followed
    /// by the terminal `END` frame.
    pub frames: mpsc::UnboundedReceiver<Frame>,
    /// Emits this request's response streams.
    pub emitter: StreamEmitter<BoxWriter>,
    /// Lets the handler invoke other capabilities on the same connection.
    pub peer: PeerInvoker<BoxWriter>,
}

/// The boxed future a [`HandlerFn`] returns.
pub type HandlerFuture = Pin<Box<dyn Future<Output = crate::error::Result<()>> + Send>>;

/// A registered capability handler (spec.md §4.7, "Handler model").
pub type HandlerFn = Arc<dyn Fn(HandlerInput) -> HandlerFuture + Send + Sync>;

struct HandlerEntry {
    urn: CapUrn,
    handler: HandlerFn,
}

struct CollectedStream {
    stream_id: String,
    media_urn: String,
    chunks: Vec<Vec<u8>>,
    complete: bool,
}

struct PendingIncoming {
    routing_id: Option<MessageId>,
    handler: HandlerFn,
    streams: Vec<CollectedStream>,
    ended: bool,
}

impl PendingIncoming {
    fn stream_mut(&mut self, stream_id: &str) -> Option<&mut CollectedStream> {
        self.streams.iter_mut().find(|s| s.stream_id == stream_id)
    }
}

/// The plugin-side runtime: owns the framed reader/writer pair, the
/// capability handler table, and in-flight request bookkeeping.
pub struct PluginRuntime {
    reader: FramedReader<BoxReader>,
    writer: FramedWriter<BoxWriter>,
    limits: Limits,
    manifest_bytes: Vec<u8>,
    handlers: HashMap<String, HandlerEntry>,
    pending_incoming: HashMap<String, PendingIncoming>,
    pending_peer: PendingPeerRequests,
    inflight: Vec<JoinHandle<()>>,
}

impl PluginRuntime {
    /// Wrap an already-negotiated reader/writer pair, skipping the HELLO
    /// exchange. For embedding `PluginRuntime` inside a transport (like
    /// [`super::cli`]'s in-process duplex) that has no handshake of its
    /// own.
    #[must_use]
    pub fn new<R, W>(reader: R, writer: W, limits: Limits, manifest_bytes: Vec<u8>) -> Self
    where
        R: AsyncRead + Unpin + Send + Sync + 'static,
        W: AsyncWrite + Unpin + Send + Sync + 'static,
    {
        let mut framed_reader = FramedReader::new(Box::new(reader) as BoxReader);
        framed_reader.set_limits(limits);
        let framed_writer = FramedWriter::new(Box::new(writer) as BoxWriter);
        Self {
            reader: framed_reader,
            writer: framed_writer,
            limits,
            manifest_bytes,
            handlers: HashMap::new(),
            pending_incoming: HashMap::new(),
            pending_peer: Arc::new(AsyncMutex::new(HashMap::new())),
            inflight: Vec::new(),
        }
    }

    /// Perform the plugin-role HELLO handshake over `reader`/`writer`,
    /// then build a runtime using the negotiated limits (spec.md §4.3,
    /// §4.7). This is the entry point a real stdio plugin process uses.
    pub async fn connect<R, W>(reader: R, writer: W, my_limits: Limits, manifest_bytes: Vec<u8>) -> crate::error::Result<Self>
    where
        R: AsyncRead + Unpin + Send + Sync + 'static,
        W: AsyncWrite + Unpin + Send + Sync + 'static,
    {
        let mut framed_reader = FramedReader::new(Box::new(reader) as BoxReader);
        let framed_writer = FramedWriter::new(Box::new(writer) as BoxWriter);
        let outcome = handshake::accept(&mut framed_reader, &framed_writer, my_limits, &manifest_bytes).await?;
        Ok(Self {
            reader: framed_reader,
            writer: framed_writer,
            limits: outcome.negotiated,
            manifest_bytes,
            handlers: HashMap::new(),
            pending_incoming: HashMap::new(),
            pending_peer: Arc::new(AsyncMutex::new(HashMap::new())),
            inflight: Vec::new(),
        })
    }

    /// Register a handler under `cap`. Call before [`Self::serve`].
    pub fn register(&mut self, cap: &str, handler: HandlerFn) -> crate::error::Result<()> {
        let urn = cap
            .parse::<CapUrn>()
            .map_err(|e| Error::protocol(ErrorCode::InvalidRequest, e.to_string()))?;
        self.handlers.insert(cap.to_string(), HandlerEntry { urn, handler });
        Ok(())
    }

    /// The JSON manifest this runtime was built with.
    #[must_use]
    pub fn manifest_bytes(&self) -> &[u8] {
        &self.manifest_bytes
    }

    fn find_handler(&self, requested: &str) -> Option<HandlerFn> {
        if let Some(entry) = self.handlers.get(requested) {
            return Some(entry.handler.clone());
        }
        let request_urn: CapUrn = requested.parse().ok()?;
        self.handlers
            .values()
            .filter(|entry| request_urn.accepts(&entry.urn))
            .min_by_key(|entry| request_urn.specificity_distance(&entry.urn))
            .map(|entry| entry.handler.clone())
    }

    fn peer_invoker(&self) -> PeerInvoker<BoxWriter> {
        PeerInvoker::new(self.writer.clone(), self.pending_peer.clone(), self.limits.max_chunk)
    }

    /// Run the event loop until EOF, then drain in-flight handlers before
    /// returning. Returns an error only on a fatal protocol violation
    /// (`RELAY_NOTIFY`/`RELAY_STATE` reaching this layer).
    pub async fn serve(mut self) -> crate::error::Result<()> {
        loop {
            let Some(frame) = self.reader.read_frame().await? else {
                break;
            };
            if let Err(fatal) = self.dispatch(frame).await {
                return Err(fatal);
            }
        }
        for task in self.inflight.drain(..) {
            let _ = task.await;
        }
        Ok(())
    }

    async fn dispatch(&mut self, frame: Frame) -> crate::error::Result<()> {
        match frame.frame_type {
            FrameType::Heartbeat => {
                self.writer.write_frame(Frame::new(FrameType::Heartbeat, frame.id)).await
            }
            FrameType::Hello => {
                let err = Frame::err(frame.id, frame.routing_id, ErrorCode::ProtocolError, "unexpected HELLO after handshake");
                self.writer.write_frame(err).await
            }
            FrameType::RelayNotify | FrameType::RelayState => Err(Error::protocol(
                ErrorCode::ProtocolError,
                format!("{} must never reach a leaf runtime", frame.frame_type),
            )),
            FrameType::Req => self.handle_req(frame).await,
            FrameType::StreamStart => self.handle_stream_start(frame).await,
            FrameType::Chunk => self.handle_chunk(frame).await,
            FrameType::StreamEnd => self.handle_stream_end(frame).await,
            FrameType::End => self.handle_end(frame).await,
            FrameType::Err => self.handle_err(frame).await,
            FrameType::Log => Ok(()),
        }
    }

    async fn handle_req(&mut self, frame: Frame) -> crate::error::Result<()> {
        if let Err(e) = frame.validate_standalone() {
            let code = e.code().unwrap_or(ErrorCode::ProtocolError);
            let err = Frame::err(frame.id, frame.routing_id, code, &e.to_string());
            return self.writer.write_frame(err).await;
        }
        let cap = frame.cap.clone().unwrap_or_default();
        let Some(handler) = self.find_handler(&cap) else {
            let err = Frame::err(frame.id, frame.routing_id, ErrorCode::NoHandler, &format!("no handler for {cap}"));
            return self.writer.write_frame(err).await;
        };
        self.pending_incoming.insert(
            frame.id.as_key(),
            PendingIncoming {
                routing_id: frame.routing_id,
                handler,
                streams: Vec::new(),
                ended: false,
            },
        );
        Ok(())
    }

    async fn handle_stream_start(&mut self, frame: Frame) -> crate::error::Result<()> {
        let id_key = frame.id.as_key();
        let Some(pending) = self.pending_incoming.get_mut(&id_key) else {
            self.forward_to_peer(&id_key, frame).await;
            return Ok(());
        };
        let (Some(stream_id), Some(media_urn)) = (frame.stream_id.clone(), frame.media_urn.clone()) else {
            return self.terminate_incoming(&id_key, ErrorCode::ProtocolError, "STREAM_START missing stream_id or media_urn").await;
        };
        if pending.ended {
            return self.terminate_incoming(&id_key, ErrorCode::ProtocolError, "STREAM_START after END").await;
        }
        if pending.stream_mut(&stream_id).is_some() {
            return self.terminate_incoming(&id_key, ErrorCode::ProtocolError, "duplicate stream_id").await;
        }
        pending.streams.push(CollectedStream {
            stream_id,
            media_urn,
            chunks: Vec::new(),
            complete: false,
        });
        Ok(())
    }

    async fn handle_chunk(&mut self, frame: Frame) -> crate::error::Result<()> {
        let id_key = frame.id.as_key();
        let Some(pending) = self.pending_incoming.get_mut(&id_key) else {
            self.forward_to_peer(&id_key, frame).await;
            return Ok(());
        };
        if pending.ended {
            return self.terminate_incoming(&id_key, ErrorCode::ProtocolError, "CHUNK after END").await;
        }
        let Some(stream_id) = frame.stream_id.clone() else {
            return self.terminate_incoming(&id_key, ErrorCode::ProtocolError, "CHUNK missing stream_id").await;
        };
        let Some(checksum) = frame.checksum else {
            return self.terminate_incoming(&id_key, ErrorCode::CorruptedData, "CHUNK missing checksum").await;
        };
        let payload = frame.payload.clone().unwrap_or_default();
        if fnv1a64(&payload) != checksum {
            return self.terminate_incoming(&id_key, ErrorCode::CorruptedData, "CHUNK checksum mismatch").await;
        }
        let Some(stream) = pending.stream_mut(&stream_id) else {
            return self.terminate_incoming(&id_key, ErrorCode::ProtocolError, "CHUNK for unknown stream_id").await;
        };
        if stream.complete {
            return self.terminate_incoming(&id_key, ErrorCode::ProtocolError, "CHUNK after that stream's STREAM_END").await;
        }
        stream.chunks.push(payload);
        Ok(())
    }

    async fn handle_stream_end(&mut self, frame: Frame) -> crate::error::Result<()> {
        let id_key = frame.id.as_key();
        let Some(pending) = self.pending_incoming.get_mut(&id_key) else {
            self.forward_to_peer(&id_key, frame).await;
            return Ok(());
        };
        let Some(stream_id) = frame.stream_id.clone() else {
            return self.terminate_incoming(&id_key, ErrorCode::ProtocolError, "STREAM_END missing stream_id").await;
        };
        let Some(stream) = pending.stream_mut(&stream_id) else {
            return self.terminate_incoming(&id_key, ErrorCode::ProtocolError, "STREAM_END for unknown stream_id").await;
        };
        stream.complete = true;
        Ok(())
    }

    async fn handle_end(&mut self, frame: Frame) -> crate::error::Result<()> {
        let id_key = frame.id.as_key();
        let Some(mut pending) = self.pending_incoming.remove(&id_key) else {
            if let Some(tx) = self.pending_peer.lock().await.remove(&id_key) {
                let _ = tx.send(frame);
            }
            return Ok(());
        };
        pending.ended = true;
        self.spawn_handler(frame.id, pending);
        Ok(())
    }

    async fn handle_err(&mut self, frame: Frame) -> crate::error::Result<()> {
        let id_key = frame.id.as_key();
        self.pending_incoming.remove(&id_key);
        if let Some(tx) = self.pending_peer.lock().await.remove(&id_key) {
            let _ = tx.send(frame);
        }
        Ok(())
    }

    /// Push a response frame for a peer call this plugin originated, or
    /// drop it silently if no such call is pending.
    async fn forward_to_peer(&self, id_key: &str, frame: Frame) {
        if let Some(tx) = self.pending_peer.lock().await.get(id_key) {
            let _ = tx.send(frame);
        }
    }

    async fn terminate_incoming(&mut self, id_key: &str, code: ErrorCode, message: &str) -> crate::error::Result<()> {
        let pending = self.pending_incoming.remove(id_key);
        let routing_id = pending.and_then(|p| p.routing_id);
        let id: MessageId = id_key.parse().map_err(|_| Error::MalformedFrame("routing key is not a MessageId".into()))?;
        let err = Frame::err(id, routing_id, code, message);
        self.writer.write_frame(err).await
    }

    fn spawn_handler(&mut self, request_id: MessageId, pending: PendingIncoming) {
        let (tx, rx) = mpsc::unbounded_channel();
        for frame in replay_frames(request_id, pending.routing_id, &pending.streams, self.limits.max_chunk) {
            let _ = tx.send(frame);
        }

        let emitter = StreamEmitter::new(self.writer.clone(), request_id, pending.routing_id, self.limits.max_chunk);
        let peer = self.peer_invoker();
        let writer = self.writer.clone();
        let handler = pending.handler;
        let routing_id = pending.routing_id;

        let task = tokio::spawn(async move {
            let result = handler(HandlerInput { frames: rx, emitter: emitter.clone(), peer }).await;
            let outcome = match result {
                Ok(()) => emitter.finalize().await,
                Err(e) => {
                    let err = Frame::err(request_id, routing_id, ErrorCode::HandlerError, &e.to_string());
                    writer.write_frame(err).await
                }
            };
            if let Err(e) = outcome {
                tracing::warn!(error = %e, "failed to write handler's terminal frame");
            }
        });
        self.inflight.push(task);
    }
}

/// Replay, in stream order, every collected stream as `STREAM_START`,
/// re-chunked `CHUNK`s, `STREAM_END`, followed by the request's `END`
/// (spec.md §4.7).
fn replay_frames(request_id: MessageId, routing_id: Option<MessageId>, streams: &[CollectedStream], max_chunk: u64) -> Vec<Frame> {
    let max_chunk = max_chunk.max(1) as usize;
    let mut out = Vec::new();
    for stream in streams {
        let mut start = Frame::new(FrameType::StreamStart, request_id);
        start.routing_id = routing_id;
        start.stream_id = Some(stream.stream_id.clone());
        start.media_urn = Some(stream.media_urn.clone());
        out.push(start);

        let whole: Vec<u8> = stream.chunks.concat();
        let mut chunk_count = 0u64;
        for (index, slice) in whole.chunks(max_chunk).enumerate() {
            let mut chunk = Frame::new(FrameType::Chunk, request_id);
            chunk.routing_id = routing_id;
            chunk.stream_id = Some(stream.stream_id.clone());
            chunk.chunk_index = Some(index as u64);
            chunk.checksum = Some(fnv1a64(slice));
            chunk.payload = Some(slice.to_vec());
            out.push(chunk);
            chunk_count += 1;
        }

        let mut end = Frame::new(FrameType::StreamEnd, request_id);
        end.routing_id = routing_id;
        end.stream_id = Some(stream.stream_id.clone());
        end.chunk_count = Some(chunk_count);
        out.push(end);
    }
    let mut end = Frame::new(FrameType::End, request_id);
    end.routing_id = routing_id;
    out.push(end);
    out
}
