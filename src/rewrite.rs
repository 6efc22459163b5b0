//! Redirect-Location and Set-Cookie rewriting (spec §4.6), part of the web
//! `stream` pass's response-copy step.

use http::HeaderMap;
use regex::Regex;

use crate::config::ProxyOptions;

/// Rewrites a `Location` header per `hostRewrite`/`autoRewrite`/
/// `protocolRewrite`. Returns `None` when none of the three policies apply
/// (caller keeps the original header untouched).
pub fn rewrite_location(location: &str, options: &ProxyOptions, inbound_headers: &HeaderMap) -> Option<String> {
    if options.host_rewrite.is_none() && !options.auto_rewrite && options.protocol_rewrite.is_none() {
        return None;
    }

    let mut url = url::Url::parse(location).ok()?;

    if let Some(host_rewrite) = &options.host_rewrite {
        let _ = url.set_host(Some(host_rewrite));
    } else if options.auto_rewrite {
        if let Some(inbound_host) = inbound_headers
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
        {
            let (host, port) = match inbound_host.rsplit_once(':') {
                Some((h, p)) => (h, p.parse::<u16>().ok()),
                None => (inbound_host, None),
            };
            let _ = url.set_host(Some(host));
            let _ = url.set_port(port);
        }
    }

    if let Some(protocol) = &options.protocol_rewrite {
        let _ = url.set_scheme(protocol);
    }

    Some(url.to_string())
}

/// Rewrites the `Domain=`/`Path=` attributes of a single `Set-Cookie`
/// value. Keys in the rewrite maps are matched against the attribute's
/// current value; `"*"` is the fallback; a `None` replacement removes the
/// attribute entirely.
pub fn rewrite_set_cookie(cookie: &str, options: &ProxyOptions) -> String {
    let mut out = cookie.to_string();
    if let Some(rules) = &options.cookie_domain_rewrite {
        out = rewrite_attr(&out, "domain", rules);
    }
    if let Some(rules) = &options.cookie_path_rewrite {
        out = rewrite_attr(&out, "path", rules);
    }
    out
}

fn rewrite_attr(cookie: &str, attr: &str, rules: &std::collections::HashMap<String, Option<String>>) -> String {
    let pattern = format!(r"(?i)(;\s*{attr}=)([^;]+)");
    let re = match Regex::new(&pattern) {
        Ok(re) => re,
        Err(_) => return cookie.to_string(),
    };

    let Some(caps) = re.captures(cookie) else {
        return cookie.to_string();
    };
    let current_value = caps.get(2).map(|m| m.as_str()).unwrap_or("");

    match rules.get(current_value).or_else(|| rules.get("*")) {
        None => cookie.to_string(),
        Some(None) => re.replace(cookie, "").to_string(),
        Some(Some(new_value)) => {
            let replaced = format!("${{1}}{new_value}");
            re.replace(cookie, replaced.as_str()).to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn host_header(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::HOST, value.parse().unwrap());
        headers
    }

    #[test]
    fn auto_rewrite_replaces_host() {
        let options = ProxyOptions {
            auto_rewrite: true,
            ..ProxyOptions::with_target("http://u")
        };
        let headers = host_header("public.example");
        let rewritten = rewrite_location("http://internal:9000/x", &options, &headers).unwrap();
        assert_eq!(rewritten, "http://public.example/x");
    }

    #[test]
    fn host_rewrite_overrides_host() {
        let options = ProxyOptions {
            host_rewrite: Some("public.example".to_string()),
            ..ProxyOptions::with_target("http://u")
        };
        let headers = HeaderMap::new();
        let rewritten = rewrite_location("http://internal:9000/x", &options, &headers).unwrap();
        assert_eq!(rewritten, "http://public.example:9000/x");
    }

    #[test]
    fn protocol_rewrite_replaces_scheme() {
        let options = ProxyOptions {
            protocol_rewrite: Some("https".to_string()),
            ..ProxyOptions::with_target("http://u")
        };
        let headers = HeaderMap::new();
        let rewritten = rewrite_location("http://internal/x", &options, &headers).unwrap();
        assert_eq!(rewritten, "https://internal/x");
    }

    #[test]
    fn no_policy_returns_none() {
        let options = ProxyOptions::with_target("http://u");
        let headers = HeaderMap::new();
        assert!(rewrite_location("http://internal/x", &options, &headers).is_none());
    }

    #[test]
    fn cookie_domain_rewritten_by_exact_match() {
        let mut rules = HashMap::new();
        rules.insert("internal.example".to_string(), Some("public.example".to_string()));
        let options = ProxyOptions {
            cookie_domain_rewrite: Some(rules),
            ..ProxyOptions::with_target("http://u")
        };
        let rewritten = rewrite_set_cookie("sid=abc; Domain=internal.example; Path=/", &options);
        assert!(rewritten.contains("Domain=public.example"));
    }

    #[test]
    fn cookie_domain_wildcard_fallback() {
        let mut rules = HashMap::new();
        rules.insert("*".to_string(), Some("public.example".to_string()));
        let options = ProxyOptions {
            cookie_domain_rewrite: Some(rules),
            ..ProxyOptions::with_target("http://u")
        };
        let rewritten = rewrite_set_cookie("sid=abc; Domain=other.example", &options);
        assert!(rewritten.contains("Domain=public.example"));
    }

    #[test]
    fn cookie_domain_null_removes_attribute() {
        let mut rules = HashMap::new();
        rules.insert("internal.example".to_string(), None);
        let options = ProxyOptions {
            cookie_domain_rewrite: Some(rules),
            ..ProxyOptions::with_target("http://u")
        };
        let rewritten = rewrite_set_cookie("sid=abc; Domain=internal.example; Path=/", &options);
        assert!(!rewritten.contains("Domain="));
        assert!(rewritten.contains("Path=/"));
    }
}
