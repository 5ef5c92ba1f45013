//! CLI-mode shim: translates argv + stdin into a synthesized `REQ`/stream/
//! `END` sequence fed through the same handler pipeline stdio mode uses
//! (spec.md §4.7, "CLI mode").

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tokio::io::{duplex, split};

use super::dispatch::PluginRuntime;
use crate::cap_urn::CapUrn;
use crate::emitter::emit_bytes_stream;
use crate::error::Error;
use crate::frame::{Frame, FrameType, MessageId};
use crate::io::{FramedReader, FramedWriter, Limits};

const DUPLEX_CAPACITY: usize = 256 * 1024;

#[derive(Debug, Deserialize)]
struct CliManifest {
    caps: Vec<CliCap>,
}

#[derive(Debug, Deserialize)]
struct CliCap {
    urn: String,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<CliArg>,
}

impl CliCap {
    fn command_name(&self) -> String {
        self.command.clone().unwrap_or_else(|| {
            self.urn
                .parse::<CapUrn>()
                .ok()
                .and_then(|urn| urn.op().map(str::to_string))
                .unwrap_or_else(|| self.urn.clone())
        })
    }
}

#[derive(Debug, Deserialize)]
struct CliArg {
    name: String,
    media_urn: String,
    #[serde(default)]
    positional: Option<usize>,
    #[serde(default)]
    stdin: bool,
    #[serde(default)]
    list: bool,
}

/// What [`run_cli`] decided to do with `argv`.
pub enum CliOutcome {
    /// No argv beyond the program name: caller should fall back to stdio
    /// CBOR mode.
    RunStdio,
    /// A manifest, help text, or command list was printed; nothing was
    /// invoked.
    Printed,
    /// A capability was invoked; the caller should exit with this code.
    Invoked(i32),
}

/// Drive the CLI surface (spec.md §6, "CLI surface of a plugin built on the
/// runtime"). `argv` excludes the program name. `register` populates a
/// fresh [`PluginRuntime`] with the same handlers stdio mode would use.
pub async fn run_cli<W: Write>(
    argv: &[String],
    manifest_bytes: &[u8],
    limits: Limits,
    register: impl FnOnce(&mut PluginRuntime),
    stdout: &mut W,
) -> crate::error::Result<CliOutcome> {
    let Some(first) = argv.first() else {
        return Ok(CliOutcome::RunStdio);
    };

    if first == "manifest" {
        stdout.write_all(manifest_bytes)?;
        return Ok(CliOutcome::Printed);
    }

    let manifest: CliManifest = serde_json::from_slice(manifest_bytes)
        .map_err(|e| Error::MalformedFrame(format!("invalid CLI manifest: {e}")))?;

    if first == "--help" || first == "-h" {
        print_command_list(&manifest, stdout)?;
        return Ok(CliOutcome::Printed);
    }

    let Some(cap) = manifest.caps.iter().find(|c| c.command_name() == *first) else {
        writeln!(stdout, "unknown command: {first}")?;
        return Ok(CliOutcome::Invoked(1));
    };

    let rest = &argv[1..];
    if rest.first().map(String::as_str) == Some("--help") {
        print_cap_help(cap, stdout)?;
        return Ok(CliOutcome::Printed);
    }

    let values = match resolve_args(cap, rest) {
        Ok(values) => values,
        Err(message) => {
            writeln!(stdout, "error: {message}")?;
            return Ok(CliOutcome::Invoked(1));
        }
    };

    let exit_code = invoke(cap, values, limits, register, stdout).await?;
    Ok(CliOutcome::Invoked(exit_code))
}

fn print_command_list<W: Write>(manifest: &CliManifest, out: &mut W) -> std::io::Result<()> {
    writeln!(out, "commands:")?;
    for cap in &manifest.caps {
        writeln!(out, "  {}  ({})", cap.command_name(), cap.urn)?;
    }
    Ok(())
}

fn print_cap_help<W: Write>(cap: &CliCap, out: &mut W) -> std::io::Result<()> {
    writeln!(out, "{}  ({})", cap.command_name(), cap.urn)?;
    for arg in &cap.args {
        let list_tag = if arg.list { " [list]" } else { "" };
        writeln!(out, "  --{} <{}>{}", arg.name, arg.media_urn, list_tag)?;
    }
    Ok(())
}

struct ResolvedArg {
    media_urn: String,
    value: Vec<u8>,
}

enum ArgSource {
    Argv(String),
    Stdin,
}

fn split_flags(rest: &[String]) -> (HashMap<String, String>, Vec<String>) {
    let mut flags = HashMap::new();
    let mut positionals = Vec::new();
    let mut iter = rest.iter().peekable();
    while let Some(token) = iter.next() {
        let Some(body) = token.strip_prefix("--") else {
            positionals.push(token.clone());
            continue;
        };
        if let Some((name, value)) = body.split_once('=') {
            flags.insert(name.to_string(), value.to_string());
        } else if let Some(next) = iter.next() {
            flags.insert(body.to_string(), next.clone());
        } else {
            flags.insert(body.to_string(), String::new());
        }
    }
    (flags, positionals)
}

fn resolve_args(cap: &CliCap, rest: &[String]) -> Result<Vec<ResolvedArg>, String> {
    let (flags, positionals) = split_flags(rest);
    let mut stdin_claimed = false;
    let mut out = Vec::new();

    for arg in &cap.args {
        let source = if let Some(value) = flags.get(&arg.name) {
            ArgSource::Argv(value.clone())
        } else if let Some(value) = arg.positional.and_then(|idx| positionals.get(idx)) {
            ArgSource::Argv(value.clone())
        } else if arg.stdin && !stdin_claimed {
            stdin_claimed = true;
            ArgSource::Stdin
        } else {
            return Err(format!("missing required argument --{}", arg.name));
        };

        match source {
            ArgSource::Stdin => {
                let mut buf = Vec::new();
                std::io::stdin().read_to_end(&mut buf).map_err(|e| e.to_string())?;
                out.push(ResolvedArg {
                    media_urn: arg.media_urn.clone(),
                    value: buf,
                });
            }
            ArgSource::Argv(text) if is_file_path_media(&arg.media_urn) && arg.stdin => {
                if arg.list {
                    for path in expand_glob_list(&text)? {
                        let bytes = std::fs::read(&path).map_err(|e| format!("{}: {e}", path.display()))?;
                        out.push(ResolvedArg {
                            media_urn: arg.media_urn.clone(),
                            value: bytes,
                        });
                    }
                } else {
                    let bytes = std::fs::read(&text).map_err(|e| format!("{text}: {e}"))?;
                    out.push(ResolvedArg {
                        media_urn: arg.media_urn.clone(),
                        value: bytes,
                    });
                }
            }
            ArgSource::Argv(text) => out.push(ResolvedArg {
                media_urn: arg.media_urn.clone(),
                value: text.into_bytes(),
            }),
        }
    }
    Ok(out)
}

fn is_file_path_media(media_urn: &str) -> bool {
    media_urn.starts_with("media:file-path")
}

/// Parse `text` as a JSON array of glob patterns, expand each in order,
/// skip directories, and hard-fail on any literal (non-wildcard) pattern
/// with no match.
fn expand_glob_list(text: &str) -> Result<Vec<PathBuf>, String> {
    let patterns: Vec<String> =
        serde_json::from_str(text).map_err(|e| format!("list argument must be a JSON array of glob patterns: {e}"))?;
    let mut out = Vec::new();
    for pattern in patterns {
        if pattern.contains('*') {
            out.extend(expand_glob(&pattern)?);
        } else {
            let path = PathBuf::from(&pattern);
            if !path.is_file() {
                return Err(format!("{pattern}: no such file"));
            }
            out.push(path);
        }
    }
    Ok(out)
}

/// Minimal component-wise glob: supports at most one `*` wildcard per path
/// component. No recursive `**`, character classes, or `?`.
fn expand_glob(pattern: &str) -> Result<Vec<PathBuf>, String> {
    let path = Path::new(pattern);
    let is_absolute = path.is_absolute();
    let mut current = vec![if is_absolute { PathBuf::from("/") } else { PathBuf::new() }];

    for component in path.components() {
        let component = component.as_os_str().to_string_lossy().into_owned();
        if component == "/" {
            continue;
        }
        let mut next = Vec::new();
        for base in &current {
            if component.contains('*') {
                let entries = std::fs::read_dir(base).map_err(|e| format!("{}: {e}", base.display()))?;
                for entry in entries {
                    let entry = entry.map_err(|e| e.to_string())?;
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if glob_component_matches(&component, &name) {
                        next.push(base.join(&name));
                    }
                }
            } else {
                next.push(base.join(&component));
            }
        }
        current = next;
    }
    current.sort();
    current.retain(|p| p.is_file());
    Ok(current)
}

fn glob_component_matches(pattern: &str, name: &str) -> bool {
    match pattern.split_once('*') {
        Some((prefix, suffix)) => name.starts_with(prefix) && name.ends_with(suffix) && name.len() >= prefix.len() + suffix.len(),
        None => pattern == name,
    }
}

async fn invoke<W: Write>(
    cap: &CliCap,
    values: Vec<ResolvedArg>,
    limits: Limits,
    register: impl FnOnce(&mut PluginRuntime),
    stdout: &mut W,
) -> crate::error::Result<i32> {
    let (runtime_half, driver_half) = duplex(DUPLEX_CAPACITY);
    let (runtime_read, runtime_write) = split(runtime_half);
    let (driver_read, driver_write) = split(driver_half);

    let mut runtime = PluginRuntime::new(runtime_read, runtime_write, limits, Vec::new());
    register(&mut runtime);

    let driver_writer = FramedWriter::new(driver_write);
    let mut driver_reader = FramedReader::new(driver_read);
    driver_reader.set_limits(limits);

    let driver_fut = async {
        let request_id = MessageId::new_uuid();
        let mut req = Frame::new(FrameType::Req, request_id);
        req.cap = Some(cap.urn.clone());
        driver_writer.write_frame(req).await?;

        for (index, value) in values.iter().enumerate() {
            let stream_id = format!("arg-{index}");
            emit_bytes_stream(&driver_writer, request_id, None, &stream_id, &value.media_urn, &value.value, limits.max_chunk).await?;
        }
        driver_writer.write_frame(Frame::new(FrameType::End, request_id)).await?;
        drop(driver_writer);

        let mut exit_code = 0;
        loop {
            let Some(frame) = driver_reader.read_frame().await? else {
                break;
            };
            match frame.frame_type {
                FrameType::Chunk => {
                    if let Some(payload) = frame.payload.as_deref() {
                        stdout.write_all(&crate::emitter::decode_chunk_payload(payload)?)?;
                    }
                }
                FrameType::Err => {
                    writeln!(stdout, "error: {}", frame.meta_message().unwrap_or_default())?;
                    exit_code = 1;
                }
                FrameType::End => break,
                _ => {}
            }
        }
        Ok::<i32, Error>(exit_code)
    };

    let (runtime_result, driver_result) = tokio::join!(runtime.serve(), driver_fut);
    runtime_result?;
    let exit_code = driver_result?;
    Ok(exit_code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_component_matches_prefix_and_suffix() {
        assert!(glob_component_matches("a*.txt", "abc.txt"));
        assert!(!glob_component_matches("a*.txt", "abc.csv"));
        assert!(glob_component_matches("exact", "exact"));
        assert!(!glob_component_matches("exact", "other"));
    }

    #[test]
    fn split_flags_handles_space_and_equals_forms() {
        let rest = vec!["--name".to_string(), "value".to_string(), "--other=x".to_string(), "pos0".to_string()];
        let (flags, positionals) = split_flags(&rest);
        assert_eq!(flags.get("name"), Some(&"value".to_string()));
        assert_eq!(flags.get("other"), Some(&"x".to_string()));
        assert_eq!(positionals, vec!["pos0".to_string()]);
    }

    #[test]
    fn is_file_path_media_matches_prefix() {
        assert!(is_file_path_media("media:file-path"));
        assert!(is_file_path_media("media:file-path;ext=txt"));
        assert!(!is_file_path_media("media:bytes"));
    }
}
