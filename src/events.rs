//! Event vocabulary and the `EventSink` capability (spec §3, §9 design note
//! on breaking the server/pass cycle).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use http::{Request, Response};

use crate::context::Writer;
use crate::error::ProxyError;

/// The fixed event vocabulary the core emits (spec §3).
#[derive(Clone)]
pub enum ProxyEvent {
    Error {
        error: Arc<ProxyError>,
        req: Option<Arc<Request<()>>>,
    },
    ProxyReq {
        outbound: Arc<Request<()>>,
    },
    ProxyRes {
        response: Arc<Response<()>>,
    },
    ProxyReqWs {
        outbound: Arc<Request<()>>,
    },
    Open,
    Close,
    EconnReset {
        error: Arc<ProxyError>,
    },
    End,
    Start,
}

impl ProxyEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ProxyEvent::Error { .. } => "error",
            ProxyEvent::ProxyReq { .. } => "proxyReq",
            ProxyEvent::ProxyRes { .. } => "proxyRes",
            ProxyEvent::ProxyReqWs { .. } => "proxyReqWs",
            ProxyEvent::Open => "open",
            ProxyEvent::Close => "close",
            ProxyEvent::EconnReset { .. } => "econnreset",
            ProxyEvent::End => "end",
            ProxyEvent::Start => "start",
        }
    }
}

type Handler = Arc<dyn Fn(&ProxyEvent) + Send + Sync>;

/// Capability passed to passes in place of the concrete server (spec §9):
/// passes can emit events without holding a reference back to `Server`.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ProxyEvent);

    /// Default `error` responder contract (spec §7 "default-listener
    /// contract"): if nobody is listening, a terminal error rethrows rather
    /// than vanishing silently.
    fn emit_error(&self, error: ProxyError, req: Option<Arc<Request<()>>>, writer: &mut Writer) {
        if self.has_error_listener() {
            self.emit(ProxyEvent::Error {
                error: Arc::new(error),
                req,
            });
        } else {
            writer.destroy();
            panic!("unhandled proxy error: {error}");
        }
    }

    fn has_error_listener(&self) -> bool;
}

/// Concrete `tracing`-backed event emitter, grounded on `ProxyState`'s
/// `Arc<RwLock<...>>` shared-state pattern.
#[derive(Clone, Default)]
pub struct EventEmitter {
    handlers: Arc<RwLock<HashMap<&'static str, Vec<Handler>>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, event: &'static str, handler: F)
    where
        F: Fn(&ProxyEvent) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .expect("event handler map poisoned")
            .entry(event)
            .or_default()
            .push(Arc::new(handler));
    }
}

impl EventSink for EventEmitter {
    fn emit(&self, event: ProxyEvent) {
        let name = event.name();
        match name {
            "error" => tracing::warn!(event = name, "proxy event"),
            "econnreset" => tracing::warn!(event = name, "proxy event"),
            _ => tracing::debug!(event = name, "proxy event"),
        }
        if let Some(handlers) = self.handlers.read().expect("event handler map poisoned").get(name) {
            for handler in handlers {
                handler(&event);
            }
        }
    }

    fn has_error_listener(&self) -> bool {
        self.handlers
            .read()
            .expect("event handler map poisoned")
            .get("error")
            .map(|v| !v.is_empty())
            .unwrap_or(false)
    }
}

/// Marks that the default `502 Bad Gateway` responder (spec §6) should run.
/// The pipeline executor checks `ProxyOptions.handle_errors` directly and
/// writes the response itself (the responder needs the `Writer`, which
/// doesn't travel through the generic handler signature); this registers a
/// listener purely so `has_error_listener` reports `true` and a terminal
/// error doesn't panic the caller's task.
pub fn install_default_error_responder(emitter: &EventEmitter) {
    emitter.on("error", |_event| {
        tracing::error!("unhandled proxy error, default responder engaged");
    });
}
