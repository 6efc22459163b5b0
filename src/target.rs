//! Target Resolver (spec §4.1): turns a string target/forward URL into a
//! structured record the Outgoing Request Builder consumes.

use serde::{Deserialize, Serialize};

/// A resolved upstream URL plus the TLS material the Request Builder needs
/// but never inspects itself (loading certs from disk is host glue).
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ResolvedTarget {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub query: Option<String>,

    #[serde(default)]
    pub pfx: Option<Vec<u8>>,
    #[serde(default)]
    pub key: Option<Vec<u8>>,
    #[serde(default)]
    pub cert: Option<Vec<u8>>,
    #[serde(default)]
    pub ca: Option<Vec<u8>>,
    #[serde(default)]
    pub ciphers: Option<String>,
    #[serde(default)]
    pub secure_protocol: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub socket_path: Option<String>,
}

impl ResolvedTarget {
    pub fn is_ssl(&self) -> bool {
        matches!(self.scheme.as_str(), "https" | "wss")
    }
}

/// Parses a string target/forward URL (spec §4.1). Port resolution: explicit
/// port in the URL wins; otherwise 443 for `https`/`wss`, else 80.
pub fn resolve(raw: &str) -> Result<ResolvedTarget, url::ParseError> {
    let parsed = url::Url::parse(raw)?;
    let scheme = parsed.scheme().to_string();
    let host = parsed
        .host_str()
        .map(str::to_string)
        .unwrap_or_default();
    let port = parsed
        .port()
        .unwrap_or(if matches!(scheme.as_str(), "https" | "wss") {
            443
        } else {
            80
        });
    let path = parsed.path().to_string();
    let query = parsed.query().map(str::to_string);

    Ok(ResolvedTarget {
        scheme,
        host,
        port,
        path,
        query,
        ..Default::default()
    })
}

/// Resolves a `TargetSpec` (already-parsed or raw string) into a
/// `ResolvedTarget`, as used by the Pipeline Executor's step 2.
pub fn resolve_spec(
    spec: &crate::config::TargetSpec,
) -> Result<ResolvedTarget, url::ParseError> {
    match spec {
        crate::config::TargetSpec::Raw(raw) => resolve(raw),
        crate::config::TargetSpec::Resolved(resolved) => Ok((**resolved).clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_port_wins() {
        let t = resolve("http://upstream:8080/api").unwrap();
        assert_eq!(t.port, 8080);
        assert_eq!(t.host, "upstream");
        assert_eq!(t.path, "/api");
    }

    #[test]
    fn https_defaults_to_443() {
        let t = resolve("https://upstream/api").unwrap();
        assert_eq!(t.port, 443);
    }

    #[test]
    fn wss_defaults_to_443() {
        let t = resolve("wss://upstream").unwrap();
        assert_eq!(t.port, 443);
    }

    #[test]
    fn http_defaults_to_80() {
        let t = resolve("http://upstream").unwrap();
        assert_eq!(t.port, 80);
    }

    #[test]
    fn ws_defaults_to_80() {
        let t = resolve("ws://upstream").unwrap();
        assert_eq!(t.port, 80);
    }
}
