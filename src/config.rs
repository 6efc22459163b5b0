use std::collections::HashMap;
use std::sync::Arc;

use http::HeaderMap;
use serde::{Deserialize, Serialize};

/// Recognized configuration fields (spec §3). Every field is optional;
/// unknown fields in a deserialized document are ignored rather than
/// rejected, mirroring the source's untyped option bag.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ProxyOptions {
    /// Upstream URL. Required unless `forward` is set.
    #[serde(default)]
    pub target: Option<TargetSpec>,

    /// Side-channel URL; the request is fired but its response discarded.
    #[serde(default)]
    pub forward: Option<TargetSpec>,

    /// TLS material for the listener. Opaque: the core never loads
    /// certificates from disk, it only hands this to the acceptor.
    #[serde(skip)]
    pub ssl: Option<Arc<rustls::ServerConfig>>,

    /// Enable upgrade (WebSocket) handling on the listener.
    #[serde(default)]
    pub ws: bool,

    /// Add `x-forwarded-{for,port,proto}` headers.
    #[serde(default)]
    pub xfwd: bool,

    /// Verify the upstream TLS certificate. `None` defers to the default
    /// (`true`); stored as `Option` so `merged_over` can tell "unset" apart
    /// from an overlay explicitly turning verification off.
    #[serde(default)]
    pub secure: Option<bool>,

    /// Treat the inbound request-target as already absolute.
    #[serde(default)]
    pub to_proxy: bool,

    /// Prepend the target's path to the inbound path. `None` defers to the
    /// default (`true`); see `secure` for why this is an `Option`.
    #[serde(default)]
    pub prepend_path: Option<bool>,

    /// Drop the inbound path entirely.
    #[serde(default)]
    pub ignore_path: bool,

    /// Rewrite the outbound `Host` header to the target host.
    #[serde(default)]
    pub change_origin: bool,

    /// Literal `user:pass` for the outbound `Authorization` header.
    #[serde(default)]
    pub auth: Option<String>,

    /// Headers merged over the inbound headers (overlay wins key-by-key).
    #[serde(skip)]
    pub headers: Option<HeaderMap>,

    /// Bind address for the outbound socket.
    #[serde(default)]
    pub local_address: Option<String>,

    /// Connection-pool policy. `None` means "no pooling": a fresh
    /// connection per request with `Connection: close`.
    #[serde(skip)]
    pub agent: AgentPolicy,

    /// Inbound idle timeout.
    #[serde(default)]
    pub timeout: Option<std::time::Duration>,

    /// Outbound (upstream) idle timeout.
    #[serde(default)]
    pub proxy_timeout: Option<std::time::Duration>,

    /// Redirect-Location rewriting policy.
    #[serde(default)]
    pub host_rewrite: Option<String>,
    #[serde(default)]
    pub auto_rewrite: bool,
    #[serde(default)]
    pub protocol_rewrite: Option<String>,

    /// `Domain=`/`Path=` rewriting for `Set-Cookie` (spec §4.6). Key `"*"`
    /// is the fallback; a `None` replacement removes the attribute.
    #[serde(default)]
    pub cookie_domain_rewrite: Option<HashMap<String, Option<String>>>,
    #[serde(default)]
    pub cookie_path_rewrite: Option<HashMap<String, Option<String>>>,

    /// Skip the response-copy step entirely; the caller handles the
    /// upstream response itself (still emits `proxyRes`).
    #[serde(default)]
    pub self_handle_response: bool,

    /// Register the bundled default `error` listener (502 responder).
    #[serde(default)]
    pub handle_errors: bool,
}

/// Either a pre-parsed target/forward URL or a raw string the Target
/// Resolver (spec §4.1) still needs to parse.
#[derive(Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TargetSpec {
    Raw(String),
    Resolved(Box<crate::target::ResolvedTarget>),
}

/// Connection-pool policy for outbound requests (spec §3 `httpAgent`/
/// `httpsAgent`). The source's "no agent object supplied" case is the
/// common one and means a fresh connection per request with
/// `Connection: close`, so that's the default here too.
#[derive(Clone, Default)]
pub enum AgentPolicy {
    #[default]
    NoPooling,
    Pooled,
}

impl ProxyOptions {
    pub fn with_target(target: impl Into<String>) -> Self {
        Self {
            target: Some(TargetSpec::Raw(target.into())),
            ..Default::default()
        }
    }

    /// Resolved `secure` (spec §3, default `true`).
    pub fn secure(&self) -> bool {
        self.secure.unwrap_or(true)
    }

    /// Resolved `prependPath` (spec §3, default `true`).
    pub fn prepend_path(&self) -> bool {
        self.prepend_path.unwrap_or(true)
    }

    /// Shallow-merge `overlay` over `self`: any field set in `overlay` wins.
    /// Used by the pipeline executor to compose per-call options over the
    /// server's defaults (spec §4.4 step 1).
    pub fn merged_over(&self, overlay: &ProxyOptions) -> ProxyOptions {
        ProxyOptions {
            target: overlay.target.clone().or_else(|| self.target.clone()),
            forward: overlay.forward.clone().or_else(|| self.forward.clone()),
            ssl: overlay.ssl.clone().or_else(|| self.ssl.clone()),
            ws: overlay.ws || self.ws,
            xfwd: overlay.xfwd || self.xfwd,
            secure: overlay.secure.or(self.secure),
            to_proxy: overlay.to_proxy || self.to_proxy,
            prepend_path: overlay.prepend_path.or(self.prepend_path),
            ignore_path: overlay.ignore_path || self.ignore_path,
            change_origin: overlay.change_origin || self.change_origin,
            auth: overlay.auth.clone().or_else(|| self.auth.clone()),
            headers: overlay.headers.clone().or_else(|| self.headers.clone()),
            local_address: overlay
                .local_address
                .clone()
                .or_else(|| self.local_address.clone()),
            agent: overlay.agent.clone(),
            timeout: overlay.timeout.or(self.timeout),
            proxy_timeout: overlay.proxy_timeout.or(self.proxy_timeout),
            host_rewrite: overlay
                .host_rewrite
                .clone()
                .or_else(|| self.host_rewrite.clone()),
            auto_rewrite: overlay.auto_rewrite || self.auto_rewrite,
            protocol_rewrite: overlay
                .protocol_rewrite
                .clone()
                .or_else(|| self.protocol_rewrite.clone()),
            cookie_domain_rewrite: overlay
                .cookie_domain_rewrite
                .clone()
                .or_else(|| self.cookie_domain_rewrite.clone()),
            cookie_path_rewrite: overlay
                .cookie_path_rewrite
                .clone()
                .or_else(|| self.cookie_path_rewrite.clone()),
            self_handle_response: overlay.self_handle_response || self.self_handle_response,
            handle_errors: overlay.handle_errors || self.handle_errors,
        }
    }
}
