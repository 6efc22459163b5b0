//! Thin CLI wrapper around the `httprelay` library: wires a `target`,
//! a listen address, and a handful of option flags into a running
//! `ProxyServer`. No proxy logic of its own.

use anyhow::{Context, Result};
use clap::Parser;
use httprelay::{create_server, ProxyOptions};

#[derive(Parser, Debug)]
#[command(name = "relayproxyd", about = "Programmable HTTP/WebSocket reverse proxy")]
struct Args {
    /// Upstream target URL, e.g. http://localhost:8080
    #[arg(long, env = "RELAY_TARGET")]
    target: String,

    /// Address to listen on.
    #[arg(long, env = "RELAY_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on.
    #[arg(long, env = "RELAY_PORT", default_value_t = 8000)]
    port: u16,

    /// Enable WebSocket upgrade handling.
    #[arg(long, env = "RELAY_WS")]
    ws: bool,

    /// Rewrite the outbound Host header to the target's host.
    #[arg(long, env = "RELAY_CHANGE_ORIGIN")]
    change_origin: bool,

    /// Add x-forwarded-{for,port,proto} headers.
    #[arg(long, env = "RELAY_XFWD")]
    xfwd: bool,

    /// Register the bundled 502 default error responder.
    #[arg(long, env = "RELAY_HANDLE_ERRORS", default_value_t = true)]
    handle_errors: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let options = ProxyOptions {
        ws: args.ws,
        change_origin: args.change_origin,
        xfwd: args.xfwd,
        handle_errors: args.handle_errors,
        ..ProxyOptions::with_target(&args.target)
    };

    let server = create_server(options);
    server.on("error", |event| {
        if let httprelay::ProxyEvent::Error { error, .. } = event {
            tracing::error!(%error, "proxy error");
        }
    });

    let addr = server
        .listen(args.port, &args.host)
        .await
        .context("failed to bind listener")?;
    tracing::info!(%addr, target = %args.target, "relayproxyd listening");

    tokio::signal::ctrl_c().await.context("failed to wait for ctrl_c")?;
    tracing::info!("shutting down");
    server.close();

    Ok(())
}
