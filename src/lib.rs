//! A programmable HTTP/WebSocket reverse proxy pipeline: a fixed-but-
//! extensible sequence of named passes that resolve an upstream target,
//! build an outbound request, and relay bytes (or, for upgrades, a spliced
//! bidirectional stream) between client and upstream.

pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod idle;
pub mod outgoing;
pub mod passes;
pub mod pipeline;
pub mod rewrite;
pub mod server;
pub mod target;

pub use config::{AgentPolicy, ProxyOptions, TargetSpec};
pub use error::{PassRegistryError, ProxyError};
pub use events::{EventEmitter, EventSink, ProxyEvent};
pub use passes::{Kind, Pass, PassList, PassRegistry};
pub use server::{ProxyServer, WebArgs, WsArgs};
pub use target::ResolvedTarget;

/// `createServer(options) -> Server` (spec §6 factory function).
pub fn create_server(options: ProxyOptions) -> ProxyServer {
    ProxyServer::new(options)
}
