//! Pipeline Executor (spec §4.4): walks the selected pass list in order,
//! threading one `PipelineContext` through every stage.

use std::net::SocketAddr;

use bytes::Bytes;

use crate::config::ProxyOptions;
use crate::context::{PipelineContext, Writer};
use crate::error::ProxyError;
use crate::events::{EventSink, ProxyEvent};
use crate::outgoing::BoxBody;
use crate::passes::Kind;

/// Runs one pipeline invocation to completion (spec §4.4 steps 1-4).
/// Dispatch is synchronous except for whatever the terminal `stream` stage
/// itself awaits; this function returns once some stage signals halt or the
/// list is exhausted.
pub async fn run(
    kind: Kind,
    req: &mut http::Request<BoxBody>,
    writer: &mut Writer,
    head: Option<Bytes>,
    server_options: &ProxyOptions,
    call_options: Option<&ProxyOptions>,
    passes: &crate::passes::PassList,
    server: &dyn EventSink,
    error_cb: Option<&(dyn Fn(ProxyError) + Send + Sync)>,
    client_addr: SocketAddr,
    is_encrypted: bool,
) {
    let effective_options = match call_options {
        Some(overlay) => server_options.merged_over(overlay),
        None => server_options.clone(),
    };

    if effective_options.target.is_none() && effective_options.forward.is_none() {
        server.emit(ProxyEvent::Error {
            error: std::sync::Arc::new(ProxyError::MissingTarget),
            req: None,
        });
        // No stage will run to answer the request; drop the writer so the
        // caller's receiver resolves instead of waiting forever.
        writer.destroy();
        return;
    }

    let mut ctx = PipelineContext {
        req,
        writer,
        options: &effective_options,
        head,
        server,
        error_cb,
        client_addr,
        is_encrypted,
    };

    for stage in passes.stages() {
        match (stage.run)(&mut ctx).await {
            Ok(true) => break,
            Ok(false) => continue,
            Err(err) => {
                ctx.report_error(err);
                break;
            }
        }
    }
}
