//! WebSocket passes, fixed order: `checkMethodAndHeader`, `xHeaders`,
//! `stream` (spec §4.5).

use std::future::Future;
use std::pin::Pin;

use futures_util::future::try_join;
use http::header::{CONNECTION, UPGRADE};
use http::{HeaderValue, Method, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::copy_bidirectional;

use super::Pass;
use crate::client::{client_for, send_with_timeout};
use crate::context::{inbound_port, PipelineContext, Writer};
use crate::error::ProxyError;
use crate::outgoing::{append_comma_header, boxed, build_outgoing, empty_body, Which};

pub fn default_stages() -> Vec<Pass> {
    vec![
        Pass::new("checkMethodAndHeader", check_method_and_header),
        Pass::new("xHeaders", x_headers),
        Pass::new("stream", stream),
    ]
}

fn is_websocket_upgrade(headers: &http::HeaderMap) -> bool {
    headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

fn check_method_and_header<'a>(
    ctx: &'a mut PipelineContext<'_>,
) -> Pin<Box<dyn Future<Output = Result<bool, ProxyError>> + Send + 'a>> {
    Box::pin(async move {
        if ctx.req.method() != Method::GET || !is_websocket_upgrade(ctx.req.headers()) {
            ctx.writer.destroy();
            return Ok(true);
        }
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
            let proto = if ctx.is_encrypted { "wss" } else { "ws" };

            let headers = ctx.req.headers_mut();
            append_comma_header(
                headers,
                http::header::HeaderName::from_static("x-forwarded-for"),
                &addr_ip,
            );
            append_comma_header(
                headers,
                http::header::HeaderName::from_static("x-forwarded-port"),
                &port.to_string(),
            );
            append_comma_header(
                headers,
                http::header::HeaderName::from_static("x-forwarded-proto"),
                proto,
            );
        }
        Ok(false)
    })
}

/// The upgrade-splice stage (spec §4.5 ws `stream`). Forwards the upgrade
/// request to the target over the same hyper client used by the web
/// passes; if the upstream answers `101 Switching Protocols`, relays that
/// response back to the client (completing the client-side upgrade too)
/// and splices both sides together once both upgrades resolve. If the
/// upstream declines, its response is streamed back verbatim instead —
/// grounded on `crates/cmux-proxy/src/lib.rs::handle_upgrade`.
fn stream<'a>(
    ctx: &'a mut PipelineContext<'_>,
) -> Pin<Box<dyn Future<Output = Result<bool, ProxyError>> + Send + 'a>> {
    Box::pin(async move {
        let Some(target_spec) = &ctx.options.target else {
            ctx.report_error(ProxyError::MissingTarget);
            ctx.writer.destroy();
            return Ok(true);
        };
        let target = match crate::target::resolve_spec(target_spec) {
            Ok(t) => t,
            Err(err) => {
                ctx.report_error(ProxyError::upstream_connect(err));
                ctx.writer.destroy();
                return Ok(true);
            }
        };

        let outgoing = match build_outgoing(ctx.req, ctx.options, &target, Which::Target) {
            Ok(o) => o,
            Err(err) => {
                ctx.report_error(ProxyError::forward(err));
                ctx.writer.destroy();
                return Ok(true);
            }
        };

        let client = client_for(ctx.options.secure());

        let mut headers = outgoing.headers;
        headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));

        let mut event_req = http::Request::builder()
            .method(outgoing.method.clone())
            .uri(outgoing.uri.clone())
            .body(())
            .unwrap_or_else(|_| http::Request::new(()));
        *event_req.headers_mut() = headers.clone();
        ctx.server.emit(crate::events::ProxyEvent::ProxyReqWs {
            outbound: std::sync::Arc::new(event_req),
        });

        let mut outbound_req = match http::Request::builder()
            .method(outgoing.method)
            .uri(outgoing.uri)
            .body(empty_body())
        {
            Ok(r) => r,
            Err(err) => {
                ctx.report_error(ProxyError::forward(err));
                ctx.writer.destroy();
                return Ok(true);
            }
        };
        *outbound_req.headers_mut() = headers;

        let client_upgrade = hyper::upgrade::on(&mut *ctx.req);

        let upstream_resp = match send_with_timeout(&client, outbound_req, ctx.options.proxy_timeout).await {
            Ok(resp) => resp,
            Err(err) => {
                ctx.report_error(err);
                ctx.writer.destroy();
                return Ok(true);
            }
        };

        if upstream_resp.status() != StatusCode::SWITCHING_PROTOCOLS {
            // Upstream declined; stream its response back to the client
            // instead of upgrading.
            if let Writer::Response(slot) = ctx.writer {
                let status = upstream_resp.status();
                let headers = upstream_resp.headers().clone();
                let body = upstream_resp.into_body();
                let mut builder = http::Response::builder().status(status);
                if let Some(h) = builder.headers_mut() {
                    *h = headers;
                }
                if let Ok(response) = builder.body(boxed(body)) {
                    slot.finish(response);
                }
            }
            return Ok(true);
        }

        let upstream_status = upstream_resp.status();
        let upstream_headers = upstream_resp.headers().clone();

        if let Writer::Response(slot) = ctx.writer {
            let mut builder = http::Response::builder().status(upstream_status);
            if let Some(h) = builder.headers_mut() {
                *h = upstream_headers;
            }
            if let Ok(response) = builder.body(boxed(empty_body())) {
                slot.finish(response);
            }
        }

        let upstream_upgrade = hyper::upgrade::on(upstream_resp);

        match try_join(client_upgrade, upstream_upgrade).await {
            Ok((client_upgraded, upstream_upgraded)) => {
                ctx.server.emit(crate::events::ProxyEvent::Open);
                let mut client_io = TokioIo::new(client_upgraded);
                let mut upstream_io = TokioIo::new(upstream_upgraded);
                match copy_bidirectional(&mut client_io, &mut upstream_io).await {
                    Ok(_) => ctx.server.emit(crate::events::ProxyEvent::Close),
                    Err(err) => ctx.report_error(ProxyError::upstream_reset(err)),
                }
            }
            Err(err) => {
                ctx.report_error(ProxyError::upstream_connect(err));
            }
        }

        Ok(true)
    })
}
