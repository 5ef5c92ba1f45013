//! End-to-end echo through a real `PluginHost` + `PluginRuntime` pair,
//! connected over in-process duplex pipes (spec.md §8, "Echo").

use bifaci::emitter::emit_bytes_stream;
use bifaci::frame::{Frame, FrameType, MessageId};
use bifaci::host::PluginHost;
use bifaci::io::{FramedReader, FramedWriter, Limits};
use bifaci::runtime::{HandlerFn, HandlerFuture, HandlerInput, PluginRuntime};
use ciborium::value::Value as CborValue;
use std::sync::Arc;
use tokio::io::{duplex, split};

/// Strip the bstr/tstr envelope `emitter.emit_bytes` wraps a response CHUNK
/// payload in (spec.md §8 scenario 1).
fn decode_chunk_bytes(payload: &[u8]) -> Vec<u8> {
    match ciborium::from_reader(payload).unwrap() {
        CborValue::Bytes(b) => b,
        CborValue::Text(t) => t.into_bytes(),
        other => panic!("unexpected cbor chunk shape: {other:?}"),
    }
}

fn echo_handler() -> HandlerFn {
    Arc::new(|mut input: HandlerInput| -> HandlerFuture {
        Box::pin(async move {
            let mut payload = Vec::new();
            while let Some(frame) = input.frames.recv().await {
                if frame.frame_type == FrameType::Chunk {
                    payload.extend_from_slice(frame.payload.as_deref().unwrap_or_default());
                }
                if frame.frame_type == FrameType::End {
                    break;
                }
            }
            input.emitter.emit_bytes("media:text/plain", &payload).await
        })
    })
}

#[tokio::test]
async fn full_request_round_trips_payload_through_host_and_plugin() {
    let host = PluginHost::new(Limits::default());

    let (host_half, plugin_half) = duplex(64 * 1024);
    let (host_read, host_write) = split(host_half);
    let (plugin_read, plugin_write) = split(plugin_half);

    let plugin_task = tokio::spawn(async move {
        let mut runtime = PluginRuntime::connect(
            plugin_read,
            plugin_write,
            Limits::default(),
            br#"{"caps":[{"urn":"cap:op=echo"}]}"#.to_vec(),
        )
        .await
        .unwrap();
        runtime.register("cap:op=echo", echo_handler()).unwrap();
        runtime.serve().await.unwrap();
    });

    host.attach(vec![], host_read, host_write).await.unwrap();

    let caps = host.capabilities_json().await;
    assert_eq!(caps["caps"].as_array().unwrap().len(), 1);

    let (caller_half, relay_half) = duplex(64 * 1024);
    let (caller_read, caller_write) = split(caller_half);
    let (relay_read, relay_write) = split(relay_half);
    let relay_reader = FramedReader::new(relay_read);
    let relay_writer = FramedWriter::new(relay_write);
    let run_host = host.clone();
    tokio::spawn(async move { run_host.run(relay_reader, relay_writer).await });

    let caller_writer = FramedWriter::new(caller_write);
    let mut caller_reader = FramedReader::new(caller_read);

    let request_id = MessageId::new_uuid();
    let mut req = Frame::new(FrameType::Req, request_id);
    req.cap = Some("cap:op=echo".into());
    caller_writer.write_frame(req).await.unwrap();

    emit_bytes_stream(&caller_writer, request_id, None, "arg-0", "media:text/plain", b"hello, bifaci", 1000)
        .await
        .unwrap();
    caller_writer.write_frame(Frame::new(FrameType::End, request_id)).await.unwrap();

    let mut reassembled = Vec::new();
    loop {
        let frame = caller_reader.read_frame().await.unwrap().expect("caller stream ended early");
        assert_eq!(frame.id, request_id);
        if frame.frame_type == FrameType::Chunk {
            reassembled.extend_from_slice(&decode_chunk_bytes(frame.payload.as_deref().unwrap_or_default()));
        }
        if frame.frame_type == FrameType::End {
            break;
        }
    }
    assert_eq!(reassembled, b"hello, bifaci");

    drop(caller_writer);
    plugin_task.await.unwrap();
}

#[tokio::test]
async fn large_payload_splits_into_multiple_chunks_and_reassembles() {
    let host = PluginHost::new(Limits::default());

    let (host_half, plugin_half) = duplex(256 * 1024);
    let (host_read, host_write) = split(host_half);
    let (plugin_read, plugin_write) = split(plugin_half);

    let plugin_task = tokio::spawn(async move {
        let mut runtime = PluginRuntime::connect(plugin_read, plugin_write, Limits::default(), br#"{"caps":[]}"#.to_vec())
            .await
            .unwrap();
        runtime.register("cap:op=echo", echo_handler()).unwrap();
        runtime.serve().await.unwrap();
    });

    host.attach(vec!["cap:op=echo".into()], host_read, host_write).await.unwrap();

    let (caller_half, relay_half) = duplex(256 * 1024);
    let (caller_read, caller_write) = split(caller_half);
    let (relay_read, relay_write) = split(relay_half);
    let run_host = host.clone();
    tokio::spawn(async move { run_host.run(FramedReader::new(relay_read), FramedWriter::new(relay_write)).await });

    let caller_writer = FramedWriter::new(caller_write);
    let mut caller_reader = FramedReader::new(caller_read);

    let payload: Vec<u8> = (0u32..5000).map(|n| (n % 251) as u8).collect();
    let request_id = MessageId::new_uuid();
    let mut req = Frame::new(FrameType::Req, request_id);
    req.cap = Some("cap:op=echo".into());
    caller_writer.write_frame(req).await.unwrap();
    emit_bytes_stream(&caller_writer, request_id, None, "arg-0", "media:bytes", &payload, 500)
        .await
        .unwrap();
    caller_writer.write_frame(Frame::new(FrameType::End, request_id)).await.unwrap();

    let mut chunk_count = 0;
    let mut reassembled = Vec::new();
    loop {
        let frame = caller_reader.read_frame().await.unwrap().unwrap();
        if frame.frame_type == FrameType::Chunk {
            chunk_count += 1;
            reassembled.extend_from_slice(&decode_chunk_bytes(frame.payload.as_deref().unwrap_or_default()));
        }
        if frame.frame_type == FrameType::End {
            break;
        }
    }
    assert!(chunk_count > 1, "expected the 5000-byte payload to split across multiple chunks");
    assert_eq!(reassembled, payload);

    drop(caller_writer);
    plugin_task.await.unwrap();
}
