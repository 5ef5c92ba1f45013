//! A registered plugin whose command can't be spawned yields `SPAWN_FAILED`
//! and is never retried (spec.md §8, "Spawn failure").

use bifaci::error::ErrorCode;
use bifaci::frame::{Frame, FrameType, MessageId};
use bifaci::host::PluginHost;
use bifaci::io::{FramedReader, FramedWriter, Limits};
use tokio::io::{duplex, split};

#[tokio::test]
async fn nonexistent_command_yields_spawn_failed_and_stays_dead() {
    let host = PluginHost::new(Limits::default());
    host.register(
        "/nonexistent/path/does-not-exist-bifaci-test-binary",
        vec![],
        vec!["cap:op=never".into()],
    )
    .await;

    let (relay_half, caller_half) = duplex(64 * 1024);
    let (relay_read, relay_write) = split(relay_half);
    let (caller_read, caller_write) = split(caller_half);
    tokio::spawn(async move {
        host.run(FramedReader::new(relay_read), FramedWriter::new(relay_write)).await
    });

    let caller_writer = FramedWriter::new(caller_write);
    let mut caller_reader = FramedReader::new(caller_read);

    for _ in 0..2 {
        let mut req = Frame::new(FrameType::Req, MessageId::new_uuid());
        req.cap = Some("cap:op=never".into());
        let request_id = req.id;
        caller_writer.write_frame(req).await.unwrap();

        let response = caller_reader.read_frame().await.unwrap().unwrap();
        assert_eq!(response.frame_type, FrameType::Err);
        assert_eq!(response.id, request_id);
        assert_eq!(response.meta_code(), Some(ErrorCode::SpawnFailed.as_str()));
    }
}
