//! `PipelineContext` and the polymorphic `Writer` (spec §9 design notes).

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, Request, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;

use crate::config::ProxyOptions;
use crate::events::EventSink;

/// An in-progress HTTP response the `web` pipeline builds up stage by stage,
/// finally resolved through a channel back to the hyper service handler that
/// is actually responsible for returning a `Response<BoxBody>`.
pub struct ResponseSlot {
    tx: Option<oneshot::Sender<crate::outgoing::BoxResponse>>,
    pub headers_sent: bool,
}

impl ResponseSlot {
    pub fn new() -> (Self, oneshot::Receiver<crate::outgoing::BoxResponse>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Some(tx),
                headers_sent: false,
            },
            rx,
        )
    }

    /// Completes the response exactly once. Calling this a second time is a
    /// pipeline bug (invariant iv, spec §3) and is dropped silently rather
    /// than panicking, since by the time it would happen the client has
    /// already gotten an answer.
    pub fn finish(&mut self, response: crate::outgoing::BoxResponse) {
        self.headers_sent = true;
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(response);
        }
    }
}

/// A raw bidirectional stream — the `ws` pipeline's writer once the upgrade
/// handshake with the client has completed. Boxed so the pipeline doesn't
/// need to know whether it's a `TcpStream`, a `TlsStream`, or a hyper
/// upgraded connection.
pub struct StreamSlot {
    pub io: Box<dyn AsyncReadWrite>,
}

pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncReadWrite for T {}

/// The writer sum type (spec §9): a response object for `web`, a raw stream
/// for `ws`. Exactly one flows through a single pipeline invocation.
pub enum Writer {
    Response(ResponseSlot),
    Stream(StreamSlot),
}

impl Writer {
    pub fn is_response(&self) -> bool {
        matches!(self, Writer::Response(_))
    }

    /// Tears the writer down without completing it — used for `ClientGone`
    /// silent teardown and for the default error responder's
    /// headers-already-sent case (spec §7).
    pub fn destroy(&mut self) {
        match self {
            Writer::Response(slot) => {
                slot.tx = None;
            }
            Writer::Stream(_) => {
                // Dropping the slot's `io` on context teardown closes the
                // socket; nothing to do here beyond marking intent.
            }
        }
    }

    pub fn headers_sent(&self) -> bool {
        match self {
            Writer::Response(slot) => slot.headers_sent,
            Writer::Stream(_) => true,
        }
    }
}

/// The single explicit context threaded through every stage (spec §9,
/// replacing the source's positional/`instanceof`-inferred argument list).
pub struct PipelineContext<'a> {
    pub req: &'a mut Request<crate::outgoing::BoxBody>,
    pub writer: &'a mut Writer,
    pub options: &'a ProxyOptions,
    pub head: Option<Bytes>,
    pub server: &'a dyn EventSink,
    pub error_cb: Option<&'a (dyn Fn(crate::error::ProxyError) + Send + Sync)>,
    pub client_addr: SocketAddr,
    pub is_encrypted: bool,
}

impl<'a> PipelineContext<'a> {
    /// Routes an I/O error to the per-call callback if one was supplied,
    /// else to the server's event channel (spec §7 propagation policy).
    /// Non-reset errors go through `emit_error` so the default-listener
    /// rethrow contract (spec §7: a terminal error with nobody listening
    /// panics rather than vanishing) is actually exercised.
    pub fn report_error(&mut self, error: crate::error::ProxyError) {
        if let Some(cb) = self.error_cb {
            cb(error);
        } else if error.is_reset() {
            self.server.emit(crate::events::ProxyEvent::EconnReset {
                error: Arc::new(error),
            });
        } else {
            self.server.emit_error(error, None, &mut *self.writer);
        }
    }
}

/// Derives the xfwd `x-forwarded-port` default (spec §4.5): from the `Host`
/// header's `:port` capture, else 443 if encrypted else 80.
pub fn inbound_port(headers: &HeaderMap, encrypted: bool) -> u16 {
    headers
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .and_then(|host| host.rsplit_once(':').map(|(_, port)| port))
        .and_then(|port| port.parse().ok())
        .unwrap_or(if encrypted { 443 } else { 80 })
}

pub fn is_switching_protocols(status: StatusCode) -> bool {
    status == StatusCode::SWITCHING_PROTOCOLS
}
