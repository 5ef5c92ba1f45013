//! Plugin-side stdio runtime: the capability dispatch loop, peer-invocation
//! support, and the CLI-mode shim (spec.md §4.7).

mod cli;
mod dispatch;
mod peer;

pub use cli::{run_cli, CliOutcome};
pub use dispatch::{BoxWriter, HandlerFn, HandlerFuture, HandlerInput, PluginRuntime};
pub use peer::{PeerArg, PeerInvoker};
