//! Reference plugin built on [`bifaci::runtime`]: registers an `echo` and an
//! `upper` capability and serves them over stdio, or as a CLI when invoked
//! with arguments (spec.md §4.7, §6).

use std::sync::Arc;

use bifaci::error::Result;
use bifaci::frame::FrameType;
use bifaci::io::Limits;
use bifaci::runtime::{self, HandlerFn, HandlerFuture, HandlerInput, PluginRuntime};

const MANIFEST: &[u8] = br#"{
  "caps": [
    {
      "urn": "cap:in=\"media:bytes\";op=echo;out=\"media:bytes\"",
      "command": "echo",
      "args": [
        {"name": "input", "media_urn": "media:bytes", "positional": 0, "stdin": true}
      ]
    },
    {
      "urn": "cap:in=\"media:text/plain\";op=upper;out=\"media:text/plain\"",
      "command": "upper",
      "args": [
        {"name": "text", "media_urn": "media:text/plain", "positional": 0, "stdin": true}
      ]
    }
  ]
}"#;

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
            input.emitter.emit_bytes("media:bytes", &payload).await
        })
    })
}

fn upper_handler() -> HandlerFn {
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
            let text = String::from_utf8_lossy(&payload).to_uppercase();
            input.emitter.emit_bytes("media:text/plain", text.as_bytes()).await
        })
    })
}

fn register(runtime: &mut PluginRuntime) {
    runtime
        .register("cap:in=\"media:bytes\";op=echo;out=\"media:bytes\"", echo_handler())
        .expect("echo cap registers");
    runtime
        .register(
            "cap:in=\"media:text/plain\";op=upper;out=\"media:text/plain\"",
            upper_handler(),
        )
        .expect("upper cap registers");
}

#[tokio::main]
async fn main() -> Result<()> {
    let argv: Vec<String> = std::env::args().collect();
    let limits = Limits::default();

    if argv.len() > 1 {
        let mut stdout = std::io::stdout();
        match runtime::run_cli(&argv[1..], MANIFEST, limits, register, &mut stdout).await? {
            runtime::CliOutcome::Printed => return Ok(()),
            runtime::CliOutcome::Invoked(code) => std::process::exit(code),
            runtime::CliOutcome::RunStdio => {}
        }
    }

    let mut runtime = PluginRuntime::connect(tokio::io::stdin(), tokio::io::stdout(), limits, MANIFEST.to_vec()).await?;
    register(&mut runtime);
    runtime.serve().await
}
