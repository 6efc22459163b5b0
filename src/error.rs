/// Error taxonomy for the proxy pipeline (spec §7).
///
/// Setup errors (`MissingTarget`) surface through the event channel; I/O
/// errors (`UpstreamConnect`, `UpstreamReset`, `ForwardError`) surface
/// through the event channel or a per-call error callback; `ClientGone`
/// never surfaces at all — it's silent teardown.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("neither target nor forward is set")]
    MissingTarget,

    #[error("failed to connect to upstream: {0}")]
    UpstreamConnect(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("upstream reset the connection: {0}")]
    UpstreamReset(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("forward request failed: {0}")]
    ForwardError(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("client disconnected before the proxy finished")]
    ClientGone,
}

impl ProxyError {
    pub fn upstream_connect<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        ProxyError::UpstreamConnect(Box::new(err))
    }

    pub fn upstream_reset<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        ProxyError::UpstreamReset(Box::new(err))
    }

    pub fn forward<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        ProxyError::ForwardError(Box::new(err))
    }

    /// Whether this looks like an ECONNRESET-class failure, which the web
    /// stream pass reports as `econnreset` instead of the generic `error`
    /// event (spec §7).
    pub fn is_reset(&self) -> bool {
        matches!(self, ProxyError::UpstreamReset(_))
    }
}

/// Errors from `Server::before`/`Server::after` (spec §7: thrown
/// synchronously, never routed through the event channel).
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PassRegistryError {
    #[error("invalid pass list kind: {0}")]
    InvalidKind(String),

    #[error("no pass named {0:?} in this list")]
    NoSuchPass(String),
}
