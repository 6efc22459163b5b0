//! Web (plain HTTP) passes, fixed order: `deleteLength`, `timeout`,
//! `xHeaders`, `stream` (spec §4.5).

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use http::header::{HeaderName, LOCATION, SET_COOKIE};
use http::StatusCode;

use super::Pass;
use crate::client::{client_for, send_with_timeout};
use crate::context::{inbound_port, PipelineContext, Writer};
use crate::error::ProxyError;
use crate::outgoing::{apply_delete_length, append_comma_header, boxed, build_outgoing, empty_body, Which};
use crate::rewrite::{rewrite_location, rewrite_set_cookie};

pub fn default_stages() -> Vec<Pass> {
    vec![
        Pass::new("deleteLength", delete_length),
        Pass::new("timeout", timeout),
        Pass::new("xHeaders", x_headers),
        Pass::new("stream", stream),
    ]
}

fn delete_length<'a>(
    ctx: &'a mut PipelineContext<'_>,
) -> Pin<Box<dyn Future<Output = Result<bool, ProxyError>> + Send + 'a>> {
    Box::pin(async move {
        let method = ctx.req.method().clone();
        apply_delete_length(&method, ctx.req.headers_mut());
        Ok(false)
    })
}

fn timeout<'a>(
    ctx: &'a mut PipelineContext<'_>,
) -> Pin<Box<dyn Future<Output = Result<bool, ProxyError>> + Send + 'a>> {
    Box::pin(async move {
        // `options.timeout` (inbound idle timeout) is enforced by wrapping
        // the accepted socket in `IdleTimeout` before the connection is
        // driven (`server.rs::serve_connection`); this stage is a no-op
        // placeholder kept for pass-list position (spec §4.5 fixed order).
        // `options.proxy_timeout` (outbound) is enforced later in `stream`.
        Ok(false)
    })
}

fn x_headers<'a>(
    ctx: &'a mut PipelineContext<'_>,
) -> Pin<Box<dyn Future<Output = Result<bool, ProxyError>> + Send + 'a>> {
    Box::pin(async move {
        if ctx.options.xfwd {
            let addr_ip = ctx.client_addr.ip().to_string();
            let port = inbound_port(ctx.req.headers(), ctx.is_encrypted);
            let proto = if ctx.is_encrypted { "https" } else { "http" };

            let headers = ctx.req.headers_mut();
            append_comma_header(
                headers,
                HeaderName::from_static("x-forwarded-for"),
                &addr_ip,
            );
            append_comma_header(
                headers,
                HeaderName::from_static("x-forwarded-port"),
                &port.to_string(),
            );
            append_comma_header(
                headers,
                HeaderName::from_static("x-forwarded-proto"),
                proto,
            );
        }
        Ok(false)
    })
}

const REWRITTEN_STATUSES: &[StatusCode] = &[
    StatusCode::CREATED,
    StatusCode::MOVED_PERMANENTLY,
    StatusCode::FOUND,
    StatusCode::TEMPORARY_REDIRECT,
    StatusCode::PERMANENT_REDIRECT,
];

fn stream<'a>(
    ctx: &'a mut PipelineContext<'_>,
) -> Pin<Box<dyn Future<Output = Result<bool, ProxyError>> + Send + 'a>> {
    Box::pin(async move {
        let client = client_for(ctx.options.secure());

        // Build the forward side-channel request (if any) up front, as an
        // owned request with no remaining borrow of `ctx`, so it can run
        // concurrently with the target request below without the two
        // stages on `ctx.req` (forward reads it, target consumes its body
        // via `mem::replace`) ever overlapping.
        let forward_request = ctx.options.forward.as_ref().and_then(|forward_spec| {
            let forward_target = crate::target::resolve_spec(forward_spec).ok()?;
            let outgoing = build_outgoing(ctx.req, ctx.options, &forward_target, Which::Forward).ok()?;
            let mut builder = http::Request::builder()
                .method(outgoing.method)
                .uri(outgoing.uri)
                .body(empty_body())
                .ok()?;
            *builder.headers_mut() = outgoing.headers;
            Some(builder)
        });

        // The forward side channel runs independent of the main path (spec
        // §4.5 stream step 1): it is fired here and joined alongside the
        // target request below so a slow or failing forward never blocks
        // or aborts the response the client actually gets, but a failure
        // still reaches `report_error` instead of being swallowed.
        let forward_client = client.clone();
        let forward_timeout = ctx.options.proxy_timeout;
        let forward_fut = async move {
            match forward_request {
                Some(req) => send_with_timeout(&forward_client, req, forward_timeout).await.err(),
                None => None,
            }
        };

        let Some(target_spec) = &ctx.options.target else {
            if let Some(err) = forward_fut.await {
                ctx.report_error(err);
            }
            return Ok(false);
        };
        let target = match crate::target::resolve_spec(target_spec) {
            Ok(t) => t,
            Err(_) => {
                if let Some(err) = forward_fut.await {
                    ctx.report_error(err);
                }
                ctx.report_error(ProxyError::MissingTarget);
                return Ok(true);
            }
        };

        let inbound_headers = ctx.req.headers().clone();

        let outgoing = match build_outgoing(ctx.req, ctx.options, &target, Which::Target) {
            Ok(o) => o,
            Err(err) => {
                if let Some(fwd_err) = forward_fut.await {
                    ctx.report_error(fwd_err);
                }
                ctx.report_error(ProxyError::forward(err));
                return Ok(true);
            }
        };

        let body = std::mem::replace(ctx.req, http::Request::new(empty_body())).into_body();

        let mut req_builder = http::Request::builder()
            .method(outgoing.method.clone())
            .uri(outgoing.uri.clone());
        if let Some(h) = req_builder.headers_mut() {
            *h = outgoing.headers.clone();
        }
        let outbound_req = match req_builder.body(boxed(body)) {
            Ok(r) => r,
            Err(err) => {
                if let Some(fwd_err) = forward_fut.await {
                    ctx.report_error(fwd_err);
                }
                ctx.report_error(ProxyError::forward(err));
                return Ok(true);
            }
        };

        let mut event_req = http::Request::builder()
            .method(outgoing.method)
            .uri(outgoing.uri)
            .body(())
            .unwrap_or_else(|_| http::Request::new(()));
        *event_req.headers_mut() = outgoing.headers;
        ctx.server.emit(crate::events::ProxyEvent::ProxyReq {
            outbound: std::sync::Arc::new(event_req),
        });

        let (forward_outcome, target_outcome) = tokio::join!(
            forward_fut,
            send_with_timeout(&client, outbound_req, ctx.options.proxy_timeout)
        );
        if let Some(err) = forward_outcome {
            ctx.report_error(err);
        }

        let upstream = match target_outcome {
            Ok(resp) => resp,
            Err(err) => {
                ctx.report_error(err);
                if let Writer::Response(slot) = ctx.writer {
                    slot.finish(bad_gateway());
                }
                return Ok(true);
            }
        };

        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        let body = upstream.into_body();

        if REWRITTEN_STATUSES.contains(&status) {
            if let Some(loc) = headers.get(LOCATION).cloned() {
                if let Ok(loc_str) = loc.to_str() {
                    if let Some(rewritten) =
                        rewrite_location(loc_str, ctx.options, &inbound_headers)
                    {
                        if let Ok(hv) = http::HeaderValue::from_str(&rewritten) {
                            headers.insert(LOCATION, hv);
                        }
                    }
                }
            }
        }

        rewrite_set_cookie_headers(&mut headers, ctx.options);

        ctx.server.emit(crate::events::ProxyEvent::ProxyRes {
            response: std::sync::Arc::new(http::Response::new(())),
        });

        if !ctx.options.self_handle_response {
            if let Writer::Response(slot) = ctx.writer {
                let mut response = http::Response::builder().status(status);
                *response.headers_mut().unwrap() = headers;
                let response = response
                    .body(boxed(body))
                    .unwrap_or_else(|_| bad_gateway());
                slot.finish(response);
            }
        }

        // The response body streams to the client after this stage
        // returns, so `end` marks pipeline-observable completion (the
        // response has been fully assembled and handed off) rather than
        // the client having received the last byte.
        ctx.server.emit(crate::events::ProxyEvent::End);

        Ok(true)
    })
}

fn rewrite_set_cookie_headers(headers: &mut http::HeaderMap, options: &crate::config::ProxyOptions) {
    if options.cookie_domain_rewrite.is_none() && options.cookie_path_rewrite.is_none() {
        return;
    }
    let values: Vec<Vec<u8>> = headers
        .get_all(SET_COOKIE)
        .iter()
        .map(|v| v.as_bytes().to_vec())
        .collect();
    if values.is_empty() {
        return;
    }
    headers.remove(SET_COOKIE);
    for raw in values {
        let as_str = String::from_utf8_lossy(&raw).to_string();
        let rewritten = rewrite_set_cookie(&as_str, options);
        if let Ok(hv) = http::HeaderValue::from_str(&rewritten) {
            headers.append(SET_COOKIE, hv);
        }
    }
}

fn bad_gateway() -> crate::outgoing::BoxResponse {
    http::Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .header(http::header::CONTENT_TYPE, "text/plain")
        .body(crate::outgoing::full_body(Bytes::from_static(b"Bad Gateway")))
        .expect("static bad gateway response is well-formed")
}
