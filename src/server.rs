//! Server Facade (spec §6): ties the Pass Registry, Pipeline Executor, and
//! event emitter together behind `web`/`ws`/`all`/`listen`/`close`/
//! `before`/`after`/`on`.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::{Request, StatusCode};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::config::ProxyOptions;
use crate::context::{ResponseSlot, Writer};
use crate::events::EventEmitter;
use crate::idle::IdleTimeout;
use crate::outgoing::{boxed, BoxResponse};
use crate::passes::{Kind, PassRegistry};

/// Owns the two `PassList`s, the event emitter, and (once `listen` is
/// called) the bound socket's shutdown handle (spec §3 `Server`).
#[derive(Clone)]
pub struct ProxyServer {
    options: ProxyOptions,
    passes: Arc<std::sync::RwLock<PassRegistry>>,
    events: EventEmitter,
    shutdown: Arc<Notify>,
}

/// Per-call arguments to `web`/`ws`/`all` (spec §6).
pub struct WebArgs<'a> {
    pub req: Request<Incoming>,
    pub client_addr: SocketAddr,
    pub is_encrypted: bool,
    pub options: Option<&'a ProxyOptions>,
}

pub struct WsArgs<'a> {
    pub req: Request<Incoming>,
    pub client_addr: SocketAddr,
    pub is_encrypted: bool,
    pub options: Option<&'a ProxyOptions>,
}

impl ProxyServer {
    /// `createServer(options)` (spec §6): wires the fixed pass lists. Does
    /// not itself validate `target`/`forward` — that precondition is
    /// checked per-call by the Pipeline Executor (spec §4.4 step 3), since
    /// a server may be reused across calls with different per-call options.
    pub fn new(options: ProxyOptions) -> Self {
        let events = EventEmitter::new();
        if options.handle_errors {
            crate::events::install_default_error_responder(&events);
        }
        Self {
            options,
            passes: Arc::new(std::sync::RwLock::new(PassRegistry::new())),
            events,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn before(
        &self,
        kind: Kind,
        anchor: &str,
        stage: crate::passes::Pass,
    ) -> Result<(), crate::error::PassRegistryError> {
        self.passes
            .write()
            .expect("pass registry poisoned")
            .before(kind, anchor, stage)
    }

    pub fn after(
        &self,
        kind: Kind,
        anchor: &str,
        stage: crate::passes::Pass,
    ) -> Result<(), crate::error::PassRegistryError> {
        self.passes
            .write()
            .expect("pass registry poisoned")
            .after(kind, anchor, stage)
    }

    pub fn on<F>(&self, event: &'static str, handler: F)
    where
        F: Fn(&crate::events::ProxyEvent) + Send + Sync + 'static,
    {
        self.events.on(event, handler);
    }

    /// `Server.web({req, res, options})`: runs the `web` pass list and
    /// returns the response it produces.
    pub async fn web(&self, args: WebArgs<'_>) -> BoxResponse {
        let (parts, body) = args.req.into_parts();
        let mut req = Request::from_parts(parts, boxed(body));

        let (slot, rx) = ResponseSlot::new();
        let mut writer = Writer::Response(slot);

        let passes = self.passes.read().expect("pass registry poisoned").web.clone();
        crate::pipeline::run(
            Kind::Web,
            &mut req,
            &mut writer,
            None,
            &self.options,
            args.options,
            &passes,
            &self.events,
            None,
            args.client_addr,
            args.is_encrypted,
        )
        .await;

        rx.await.unwrap_or_else(|_| default_error_response())
    }

    /// `Server.ws({req, socket, head})`: runs the `ws` pass list. The
    /// "socket" here is the hyper connection's own upgrade mechanism: the
    /// response this returns is what the HTTP/1.1 connection sends before
    /// the splice (either a `101` or a passthrough of the upstream's
    /// non-upgrade response).
    pub async fn ws(&self, args: WsArgs<'_>) -> BoxResponse {
        let (parts, body) = args.req.into_parts();
        let mut req = Request::from_parts(parts, boxed(body));

        let (slot, rx) = ResponseSlot::new();
        let mut writer = Writer::Response(slot);

        let passes = self.passes.read().expect("pass registry poisoned").ws.clone();
        crate::pipeline::run(
            Kind::Ws,
            &mut req,
            &mut writer,
            None,
            &self.options,
            args.options,
            &passes,
            &self.events,
            None,
            args.client_addr,
            args.is_encrypted,
        )
        .await;

        rx.await.unwrap_or_else(|_| default_error_response())
    }

    /// `Server.all`: detects `Upgrade: websocket` and routes to `ws` or `web`.
    pub async fn all(
        &self,
        req: Request<Incoming>,
        client_addr: SocketAddr,
        is_encrypted: bool,
        options: Option<&ProxyOptions>,
    ) -> BoxResponse {
        let is_upgrade = req
            .headers()
            .get(http::header::UPGRADE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false);

        if is_upgrade && self.options.ws {
            self.ws(WsArgs {
                req,
                client_addr,
                is_encrypted,
                options,
            })
            .await
        } else {
            self.web(WebArgs {
                req,
                client_addr,
                is_encrypted,
                options,
            })
            .await
        }
    }

    /// `Server.listen(port, hostname)`: binds a TCP listener and serves
    /// connections with auto HTTP/1.1-or-HTTP/2 detection, upgrades enabled
    /// when `options.ws` is set. TLS is applied when `options.ssl` is
    /// present. Grounded on
    /// `apps/server/native/core/src/proxy/server.rs`'s bind/accept-loop
    /// shape, generalized from a fixed port range to a single requested
    /// port/hostname pair (spec §6 doesn't describe retry behavior).
    pub async fn listen(&self, port: u16, hostname: &str) -> std::io::Result<SocketAddr> {
        let addr: SocketAddr = format!("{hostname}:{port}").parse().map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("{e}"))
        })?;
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        info!(addr = %local_addr, "proxy server listening");

        let server = self.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, client_addr)) => {
                                let server = server.clone();
                                tokio::spawn(async move {
                                    server.serve_connection(stream, client_addr).await;
                                });
                            }
                            Err(err) => error!(error = %err, "failed to accept connection"),
                        }
                    }
                    _ = shutdown.notified() => {
                        info!("proxy server shutting down");
                        break;
                    }
                }
            }
        });

        Ok(local_addr)
    }

    async fn serve_connection(&self, stream: TcpStream, client_addr: SocketAddr) {
        let stream = IdleTimeout::new(stream, self.options.timeout);
        match &self.options.ssl {
            Some(tls_config) => {
                let acceptor = tokio_rustls::TlsAcceptor::from(tls_config.clone());
                match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        self.drive_connection(TokioIo::new(tls_stream), client_addr, true)
                            .await;
                    }
                    Err(err) => error!(error = %err, addr = %client_addr, "TLS handshake failed"),
                }
            }
            None => {
                self.drive_connection(TokioIo::new(stream), client_addr, false)
                    .await;
            }
        }
    }

    async fn drive_connection<IO>(&self, io: TokioIo<IO>, client_addr: SocketAddr, is_encrypted: bool)
    where
        IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let server = self.clone();

        let service = hyper::service::service_fn(move |req: Request<Incoming>| {
            let server = server.clone();
            async move { Ok::<_, std::convert::Infallible>(server.all(req, client_addr, is_encrypted, None).await) }
        });

        let result = auto::Builder::new(hyper_util::rt::TokioExecutor::new())
            .serve_connection_with_upgrades(io, service)
            .await;

        if let Err(err) = result {
            debug!(error = %err, addr = %client_addr, "connection closed with error");
        }
    }

    /// `Server.close(cb?)`: signals the accept loop to stop.
    pub fn close(&self) {
        self.shutdown.notify_waiters();
    }
}

impl Drop for ProxyServer {
    fn drop(&mut self) {
        self.close();
    }
}

fn default_error_response() -> BoxResponse {
    http::Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .header(http::header::CONTENT_TYPE, "text/plain")
        .body(crate::outgoing::full_body(Bytes::from_static(b"Bad Gateway")))
        .expect("static bad gateway response is well-formed")
}
