//! Relay slave/master: a bidirectional byte forwarder positioned between a
//! remote master and a local runtime, with `RELAY_NOTIFY`/`RELAY_STATE` as a
//! side channel that is never forwarded (spec.md §4.8).

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::Error;
use crate::frame::{Frame, FrameType, MessageId};
use crate::io::{FramedReader, FramedWriter};

/// The manifest + limits a slave advertised in its most recent `RELAY_NOTIFY`.
#[derive(Debug, Clone)]
pub struct RelayAdvertisement {
    /// Opaque aggregate manifest JSON bytes.
    pub manifest: Vec<u8>,
}

fn notify_frame(manifest: &[u8]) -> Frame {
    let mut frame = Frame::new(FrameType::RelayNotify, MessageId::Uint(0));
    frame.payload = Some(manifest.to_vec());
    frame
}

/// Runs on the side embedding a local plugin host/runtime, forwarding to a
/// remote master socket while intercepting `RELAY_STATE` into local storage.
pub struct RelaySlave<R, W> {
    socket_reader: FramedReader<R>,
    socket_writer: FramedWriter<W>,
    /// Most recent `RELAY_STATE` resource blob received from the master.
    resource_state: Arc<AsyncMutex<Option<Vec<u8>>>>,
}

impl<R, W> RelaySlave<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Wrap the socket halves and immediately advertise `manifest` on
    /// connect (spec.md §4.8, "On connect, send RELAY_NOTIFY").
    pub async fn connect(socket_reader: FramedReader<R>, socket_writer: FramedWriter<W>, manifest: &[u8]) -> crate::error::Result<Self> {
        socket_writer.write_frame(notify_frame(manifest)).await?;
        Ok(Self {
            socket_reader,
            socket_writer,
            resource_state: Arc::new(AsyncMutex::new(None)),
        })
    }

    /// Inject a fresh advertisement at any time (the local cap set changed).
    pub async fn notify(&self, manifest: &[u8]) -> crate::error::Result<()> {
        self.socket_writer.write_frame(notify_frame(manifest)).await
    }

    /// The most recently received `RELAY_STATE` blob, if any.
    pub async fn resource_state(&self) -> Option<Vec<u8>> {
        self.resource_state.lock().await.clone()
    }

    /// Read the next frame bound for the local runtime: `RELAY_STATE` is
    /// intercepted and stored rather than returned; everything else passes
    /// through. Returns `None` on socket EOF.
    pub async fn recv_from_master(&mut self) -> crate::error::Result<Option<Frame>> {
        loop {
            let Some(frame) = self.socket_reader.read_frame().await? else {
                return Ok(None);
            };
            if frame.frame_type == FrameType::RelayState {
                *self.resource_state.lock().await = frame.payload.clone();
                continue;
            }
            return Ok(Some(frame));
        }
    }

    /// Forward a frame from the local runtime to the master socket
    /// verbatim.
    pub async fn send_to_master(&self, frame: Frame) -> crate::error::Result<()> {
        self.socket_writer.write_frame(frame).await
    }
}

/// Runs on the remote side: reads one `RELAY_NOTIFY` on connect, then
/// absorbs any later ones transparently while handing back everything else.
pub struct RelayMaster<R> {
    reader: FramedReader<R>,
    advertisement: RelayAdvertisement,
}

impl<R: AsyncRead + Unpin> RelayMaster<R> {
    /// Read exactly one `RELAY_NOTIFY` and store its manifest
    /// (spec.md §4.8, "Master behavior").
    pub async fn connect(mut reader: FramedReader<R>) -> crate::error::Result<Self> {
        let frame = reader
            .read_frame()
            .await?
            .ok_or_else(|| Error::Handshake("slave closed before sending RELAY_NOTIFY".into()))?;
        if frame.frame_type != FrameType::RelayNotify {
            return Err(Error::Handshake(format!("expected RELAY_NOTIFY, got {}", frame.frame_type)));
        }
        Ok(Self {
            reader,
            advertisement: RelayAdvertisement {
                manifest: frame.payload.unwrap_or_default(),
            },
        })
    }

    /// The slave's most recently absorbed advertisement.
    #[must_use]
    pub fn advertisement(&self) -> &RelayAdvertisement {
        &self.advertisement
    }

    /// Read the next non-`RELAY_NOTIFY` frame, absorbing and overwriting
    /// the stored advertisement on every `RELAY_NOTIFY` encountered along
    /// the way. Returns `None` on EOF.
    pub async fn read_frame(&mut self) -> crate::error::Result<Option<Frame>> {
        loop {
            let Some(frame) = self.reader.read_frame().await? else {
                return Ok(None);
            };
            if frame.frame_type == FrameType::RelayNotify {
                self.advertisement = RelayAdvertisement {
                    manifest: frame.payload.unwrap_or_default(),
                };
                continue;
            }
            return Ok(Some(frame));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, split};

    #[tokio::test]
    async fn slave_advertises_manifest_on_connect() {
        let (slave_half, master_half) = duplex(64 * 1024);
        let (slave_read, slave_write) = split(slave_half);
        let (master_read, _master_write) = split(master_half);

        let slave_reader = FramedReader::new(slave_read);
        let slave_writer = FramedWriter::new(slave_write);
        let _slave = RelaySlave::connect(slave_reader, slave_writer, b"{\"caps\":[]}").await.unwrap();

        let master_reader = FramedReader::new(master_read);
        let master = RelayMaster::connect(master_reader).await.unwrap();
        assert_eq!(master.advertisement().manifest, b"{\"caps\":[]}");
    }

    #[tokio::test]
    async fn master_absorbs_later_relay_notify() {
        let (slave_half, master_half) = duplex(64 * 1024);
        let (slave_read, slave_write) = split(slave_half);
        let (master_read, _master_write) = split(master_half);

        let slave_reader = FramedReader::new(slave_read);
        let slave_writer = FramedWriter::new(slave_write);
        let slave = RelaySlave::connect(slave_reader, slave_writer, b"{}").await.unwrap();

        let master_reader = FramedReader::new(master_read);
        let mut master = RelayMaster::connect(master_reader).await.unwrap();

        slave.notify(b"{\"caps\":[{\"urn\":\"cap:op=x\"}]}").await.unwrap();
        slave
            .send_to_master(Frame::new(FrameType::Heartbeat, MessageId::Uint(1)))
            .await
            .unwrap();

        let frame = master.read_frame().await.unwrap().unwrap();
        assert_eq!(frame.frame_type, FrameType::Heartbeat);
        assert_eq!(master.advertisement().manifest, b"{\"caps\":[{\"urn\":\"cap:op=x\"}]}");
    }

    #[tokio::test]
    async fn slave_intercepts_relay_state() {
        let (slave_half, master_half) = duplex(64 * 1024);
        let (slave_read, slave_write) = split(slave_half);
        let (_master_read, master_write) = split(master_half);

        let slave_reader = FramedReader::new(slave_read);
        let slave_writer = FramedWriter::new(slave_write);
        let mut slave = RelaySlave::connect(slave_reader, slave_writer, b"{}").await.unwrap();

        let master_writer = FramedWriter::new(master_write);
        let mut state = Frame::new(FrameType::RelayState, MessageId::Uint(0));
        state.payload = Some(b"resource-blob".to_vec());
        master_writer.write_frame(state).await.unwrap();
        master_writer
            .write_frame(Frame::new(FrameType::Heartbeat, MessageId::Uint(2)))
            .await
            .unwrap();

        let frame = slave.recv_from_master().await.unwrap().unwrap();
        assert_eq!(frame.frame_type, FrameType::Heartbeat);
        assert_eq!(slave.resource_state().await, Some(b"resource-blob".to_vec()));
    }
}
