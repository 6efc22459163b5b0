//! Outgoing Request Builder (spec §4.2): resolved target + inbound request
//! + options → outbound request descriptor.

use base64::Engine;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, AUTHORIZATION, CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, Method, Request, Response};
use http_body_util::{BodyExt, Empty, Full};

use crate::config::ProxyOptions;
use crate::target::ResolvedTarget;

/// Boxed body type used for both inbound and outbound requests/responses,
/// grounded on `crates/cmux-proxy/src/lib.rs`'s own `BoxBody` alias.
pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;
pub type BoxResponse = Response<BoxBody>;

pub fn boxed<B>(body: B) -> BoxBody
where
    B: http_body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    body.map_err(Into::into).boxed()
}

pub fn empty_body() -> BoxBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Which side of an outbound request is being built (spec §4.2 `which`).
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Which {
    Target,
    Forward,
}

/// Everything the Proxy Stages need to actually open a connection: the
/// resolved address plus the request head to send on it.
pub struct OutgoingRequest {
    pub target: ResolvedTarget,
    pub method: Method,
    pub uri: http::Uri,
    pub headers: HeaderMap,
}

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Drops hop-by-hop headers before copying the rest onto the outbound
/// request, grounded on `crates/cmux-proxy/src/lib.rs::strip_hop_by_hop_headers`.
pub fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        if !HOP_BY_HOP.contains(&name.as_str()) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

fn connection_mentions_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .any(|tok| tok.trim().eq_ignore_ascii_case("upgrade"))
        })
        .unwrap_or(false)
}

/// Well-known-port test used by both the `Host`-header rewrite and testable
/// property 1 (spec §8): a port is "non-well-known" if it isn't the
/// scheme's implicit default.
pub fn is_well_known_port(scheme: &str, port: u16) -> bool {
    let default = if matches!(scheme, "https" | "wss") { 443 } else { 80 };
    port == default
}

/// Builds the outbound request head for `target` or `forward` (spec §4.2).
/// Does not dial or send anything; the `stream` passes own that.
pub fn build_outgoing<B>(
    inbound: &Request<B>,
    options: &ProxyOptions,
    target: &ResolvedTarget,
    which: Which,
) -> Result<OutgoingRequest, http::Error> {
    let method = inbound.method().clone();

    let mut headers = strip_hop_by_hop(inbound.headers());
    if let Some(overlay) = &options.headers {
        for (name, value) in overlay.iter() {
            headers.insert(name.clone(), value.clone());
        }
    }

    if let Some(auth) = &options.auth {
        let encoded = base64::engine::general_purpose::STANDARD.encode(auth.as_bytes());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {encoded}"))
                .unwrap_or_else(|_| HeaderValue::from_static("")),
        );
    }

    let pooled = matches!(options.agent, crate::config::AgentPolicy::Pooled);
    if !pooled && !connection_mentions_upgrade(&headers) {
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
    }

    if which == Which::Target && options.change_origin {
        let needs_port = is_well_known_port(&target.scheme, target.port);
        let host_has_port = target.host.contains(':');
        let host_value = if !needs_port && !host_has_port {
            format!("{}:{}", target.host, target.port)
        } else {
            target.host.clone()
        };
        headers.insert(
            HOST,
            HeaderValue::from_str(&host_value).unwrap_or_else(|_| HeaderValue::from_static("")),
        );
    }

    let target_path = if options.prepend_path() {
        target.path.as_str()
    } else {
        ""
    };

    let raw_inbound_path = inbound.uri().to_string();
    let parsed_inbound_path = inbound.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("");
    let inbound_path = if options.to_proxy {
        raw_inbound_path.as_str()
    } else {
        parsed_inbound_path
    };
    let inbound_path = if options.ignore_path { "" } else { inbound_path };

    let joined = url_join(target_path, inbound_path);

    let uri_string = format!(
        "{}://{}:{}{}",
        target.scheme,
        target.host,
        target.port,
        if joined.starts_with('/') || joined.is_empty() {
            joined.clone()
        } else {
            format!("/{joined}")
        }
    );
    let uri: http::Uri = uri_string.parse()?;

    Ok(OutgoingRequest {
        target: target.clone(),
        method,
        uri,
        headers,
    })
}

/// Spec §4.2: `DELETE`/`OPTIONS` with no `Content-Length` get an explicit
/// `Content-Length: 0` and lose `Transfer-Encoding` (web `deleteLength`
/// pass lives here so the builder and the pass agree on one implementation).
pub fn apply_delete_length(method: &Method, headers: &mut HeaderMap) {
    if (method == Method::DELETE || method == Method::OPTIONS)
        && !headers.contains_key(CONTENT_LENGTH)
    {
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
        headers.remove(TRANSFER_ENCODING);
    }
}

/// Appends to a comma-separated header, spec §4.5 xfwd "append semantics":
/// existing value + `,` + new value, empty prefix when header absent.
pub fn append_comma_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    let combined = match headers.get(&name).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.is_empty() => format!("{existing},{value}"),
        _ => value.to_string(),
    };
    if let Ok(hv) = HeaderValue::from_str(&combined) {
        headers.insert(name, hv);
    }
}

/// `urlJoin` (spec §4.2): join with `/`, collapse repeated slashes except
/// after `http:`/`https:`, strip the last argument's query before joining
/// then re-append it.
pub fn url_join(a: &str, b: &str) -> String {
    let (b_path, query) = match b.split_once('?') {
        Some((path, q)) => (path, Some(q)),
        None => (b, None),
    };

    let joined = if a.is_empty() {
        b_path.to_string()
    } else if b_path.is_empty() {
        a.to_string()
    } else {
        format!("{a}/{b_path}")
    };

    let collapsed = collapse_slashes(&joined);

    match query {
        Some(q) => format!("{collapsed}?{q}"),
        None => collapsed,
    }
}

fn collapse_slashes(path: &str) -> String {
    let scheme_end = ["http://", "https://"]
        .iter()
        .find_map(|prefix| path.starts_with(prefix).then(|| prefix.len()));

    match scheme_end {
        Some(end) => {
            let (prefix, rest) = path.split_at(end);
            format!("{prefix}{}", collapse_plain(rest))
        }
        None => collapse_plain(path),
    }
}

fn collapse_plain(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut prev_slash = false;
    for c in path.chars() {
        if c == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_collapses_adjacent_slashes() {
        assert_eq!(url_join("/api/", "/v1/users"), "/api/v1/users");
    }

    #[test]
    fn join_empty_first_arg() {
        assert_eq!(url_join("", "/v1"), "/v1");
    }

    #[test]
    fn join_empty_second_arg() {
        assert_eq!(url_join("/api", ""), "/api");
    }

    #[test]
    fn join_preserves_scheme_double_slash() {
        assert_eq!(url_join("http://host//a", "/b"), "http://host/a/b");
    }

    #[test]
    fn join_keeps_query_from_last_arg() {
        assert_eq!(url_join("/api", "/v1?x=1&y=2"), "/api/v1?x=1&y=2");
    }

    #[test]
    fn delete_without_content_length_gets_zero() {
        let mut headers = HeaderMap::new();
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        apply_delete_length(&Method::DELETE, &mut headers);
        assert_eq!(headers.get(CONTENT_LENGTH).unwrap(), "0");
        assert!(!headers.contains_key(TRANSFER_ENCODING));
    }

    #[test]
    fn get_is_untouched_by_delete_length() {
        let mut headers = HeaderMap::new();
        apply_delete_length(&Method::GET, &mut headers);
        assert!(!headers.contains_key(CONTENT_LENGTH));
    }

    #[test]
    fn xfwd_append_accumulates() {
        let mut headers = HeaderMap::new();
        let name = HeaderName::from_static("x-forwarded-for");
        append_comma_header(&mut headers, name.clone(), "1.1.1.1");
        append_comma_header(&mut headers, name.clone(), "2.2.2.2");
        assert_eq!(headers.get(&name).unwrap(), "1.1.1.1,2.2.2.2");
    }

    #[test]
    fn well_known_port_for_https() {
        assert!(is_well_known_port("https", 443));
        assert!(!is_well_known_port("https", 8443));
    }

    #[test]
    fn well_known_port_for_http() {
        assert!(is_well_known_port("http", 80));
        assert!(!is_well_known_port("http", 8080));
    }

    #[test]
    fn change_origin_rewrites_host_header_to_target() {
        let target = ResolvedTarget {
            scheme: "http".into(),
            host: "upstream.internal".into(),
            port: 8080,
            path: "/api".into(),
            query: None,
            ..Default::default()
        };
        let options = ProxyOptions {
            change_origin: true,
            ..ProxyOptions::with_target("http://upstream.internal:8080/api")
        };
        let inbound = Request::builder()
            .header(HOST, "public.example.com")
            .body(())
            .unwrap();

        let outgoing = build_outgoing(&inbound, &options, &target, Which::Target).unwrap();
        assert_eq!(
            outgoing.headers.get(HOST).unwrap(),
            "upstream.internal:8080"
        );
    }

    #[test]
    fn change_origin_omits_port_when_well_known() {
        let target = ResolvedTarget {
            scheme: "https".into(),
            host: "upstream.internal".into(),
            port: 443,
            path: "/".into(),
            query: None,
            ..Default::default()
        };
        let options = ProxyOptions {
            change_origin: true,
            ..ProxyOptions::with_target("https://upstream.internal/")
        };
        let inbound = Request::builder().body(()).unwrap();

        let outgoing = build_outgoing(&inbound, &options, &target, Which::Target).unwrap();
        assert_eq!(outgoing.headers.get(HOST).unwrap(), "upstream.internal");
    }

    #[test]
    fn default_agent_policy_forces_connection_close() {
        let target = ResolvedTarget {
            scheme: "http".into(),
            host: "upstream".into(),
            port: 80,
            path: "/".into(),
            query: None,
            ..Default::default()
        };
        let options = ProxyOptions::with_target("http://upstream/");
        assert!(matches!(options.agent, crate::config::AgentPolicy::NoPooling));

        let inbound = Request::builder().body(()).unwrap();
        let outgoing = build_outgoing(&inbound, &options, &target, Which::Target).unwrap();
        assert_eq!(outgoing.headers.get(CONNECTION).unwrap(), "close");
    }

    #[test]
    fn pooled_agent_policy_leaves_connection_header_alone() {
        let target = ResolvedTarget {
            scheme: "http".into(),
            host: "upstream".into(),
            port: 80,
            path: "/".into(),
            query: None,
            ..Default::default()
        };
        let options = ProxyOptions {
            agent: crate::config::AgentPolicy::Pooled,
            ..ProxyOptions::with_target("http://upstream/")
        };
        let inbound = Request::builder().body(()).unwrap();
        let outgoing = build_outgoing(&inbound, &options, &target, Which::Target).unwrap();
        assert!(outgoing.headers.get(CONNECTION).is_none());
    }
}
