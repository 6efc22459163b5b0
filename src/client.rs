//! Outbound HTTP(S) client construction (spec §3 `secure` option, §9
//! ambient TLS requirement). Two shared clients are built lazily and
//! cached: one verifying the upstream certificate against the bundled
//! webpki roots, one that accepts any certificate for `secure: false`
//! targets. Grounded on
//! `examples/karlorz-cmux/apps/server/native/core/src/proxy/client.rs`'s
//! `HttpsConnectorBuilder` wiring and
//! `examples/vishalbelsare-agentgateway/crates/agentgateway/src/transport/tls.rs`'s
//! `NoVerifier` for the insecure posture.

use std::sync::{Arc, Once, OnceLock};
use std::time::Duration;

use hyper::body::Incoming;
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};

use crate::error::ProxyError;
use crate::outgoing::BoxBody;

pub type HttpsClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, BoxBody>;

/// Sends `req` over `client`, bounding the wait with `proxy_timeout` (spec
/// §3 `proxyTimeout`, default unset/unbounded) when set. A timeout elapsing
/// is reported the same way as any other upstream-connect failure, since
/// from the client's perspective both just mean "no usable response came
/// back".
pub async fn send_with_timeout(
    client: &HttpsClient,
    req: http::Request<BoxBody>,
    proxy_timeout: Option<Duration>,
) -> Result<http::Response<Incoming>, ProxyError> {
    let send = client.request(req);
    match proxy_timeout {
        Some(duration) => match tokio::time::timeout(duration, send).await {
            Ok(result) => result.map_err(ProxyError::upstream_connect),
            Err(elapsed) => Err(ProxyError::upstream_connect(elapsed)),
        },
        None => send.await.map_err(ProxyError::upstream_connect),
    }
}

static VERIFIED_CLIENT: OnceLock<HttpsClient> = OnceLock::new();
static INSECURE_CLIENT: OnceLock<HttpsClient> = OnceLock::new();

/// Returns the shared outbound client for the given `secure` posture
/// (spec §3 `secure`, default `true`). Built once per process and
/// cloned per call; `hyper_util::client::legacy::Client` is cheap to
/// clone (it's an `Arc` handle over the connection pool).
pub fn client_for(secure: bool) -> HttpsClient {
    if secure {
        VERIFIED_CLIENT.get_or_init(build_verified).clone()
    } else {
        INSECURE_CLIENT.get_or_init(build_insecure).clone()
    }
}

static INSTALL_PROVIDER: Once = Once::new();

/// `rustls::ClientConfig::builder()` needs a process-level default crypto
/// provider installed exactly once; `aws_lc_rs` is the only backend this
/// crate compiles in (Cargo.toml), so install it here rather than leaving
/// it to whichever caller happens to build a `ClientConfig` first.
fn ensure_crypto_provider() {
    INSTALL_PROVIDER.call_once(|| {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}

fn build_verified() -> HttpsClient {
    ensure_crypto_provider();
    let https = HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .build();
    Client::builder(TokioExecutor::new()).build(https)
}

fn build_insecure() -> HttpsClient {
    ensure_crypto_provider();
    let tls_config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier))
        .with_no_client_auth();

    let https = HttpsConnectorBuilder::new()
        .with_tls_config(tls_config)
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .build();
    Client::builder(TokioExecutor::new()).build(https)
}

/// Accepts any upstream certificate. Only reachable when a caller has
/// explicitly set `secure: false` on `ProxyOptions`.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA1,
            SignatureScheme::ECDSA_SHA1_Legacy,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
