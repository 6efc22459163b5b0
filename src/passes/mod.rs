//! Pass Registry (spec §4.3): two ordered, named stage lists with
//! `before`/`after` insertion.

pub mod web;
pub mod ws;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::PipelineContext;
use crate::error::{PassRegistryError, ProxyError};

/// Which fixed pass list a registry operation targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Web,
    Ws,
}

impl std::str::FromStr for Kind {
    type Err = PassRegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "web" => Ok(Kind::Web),
            "ws" => Ok(Kind::Ws),
            other => Err(PassRegistryError::InvalidKind(other.to_string())),
        }
    }
}

type StageFn =
    for<'a> fn(&'a mut PipelineContext<'_>) -> Pin<Box<dyn Future<Output = Result<bool, ProxyError>> + Send + 'a>>;

/// A named stage. Identity is the name (invariant i, spec §3); anonymous
/// stages (`name == ""`) are permitted but cannot be anchors.
#[derive(Clone)]
pub struct Pass {
    pub name: Arc<str>,
    pub run: StageFn,
}

impl Pass {
    pub fn new(name: &str, run: StageFn) -> Self {
        Self {
            name: Arc::from(name),
            run,
        }
    }
}

/// An ordered sequence of passes with unique names within the list.
#[derive(Clone)]
pub struct PassList {
    stages: Vec<Pass>,
}

impl PassList {
    pub fn new(stages: Vec<Pass>) -> Self {
        Self { stages }
    }

    pub fn stages(&self) -> &[Pass] {
        &self.stages
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|p| &*p.name == name)
    }

    /// Insert `stage` immediately before the pass named `anchor`.
    pub fn before(&mut self, anchor: &str, stage: Pass) -> Result<(), PassRegistryError> {
        let idx = self
            .index_of(anchor)
            .ok_or_else(|| PassRegistryError::NoSuchPass(anchor.to_string()))?;
        self.stages.insert(idx, stage);
        Ok(())
    }

    /// Insert `stage` immediately after the pass named `anchor`. The
    /// source's `after()` advances the index before inserting, which is
    /// equivalent to inserting *before* the following stage rather than
    /// strictly after the anchor; that off-by-one is not reproduced here —
    /// this inserts at `index_of(anchor) + 1` (spec §9 open question).
    pub fn after(&mut self, anchor: &str, stage: Pass) -> Result<(), PassRegistryError> {
        let idx = self
            .index_of(anchor)
            .ok_or_else(|| PassRegistryError::NoSuchPass(anchor.to_string()))?;
        self.stages.insert(idx + 1, stage);
        Ok(())
    }
}

/// Owns the `web` and `ws` pass lists (spec §3 `Server`'s registry half).
#[derive(Clone)]
pub struct PassRegistry {
    pub web: PassList,
    pub ws: PassList,
}

impl Default for PassRegistry {
    fn default() -> Self {
        Self {
            web: PassList::new(web::default_stages()),
            ws: PassList::new(ws::default_stages()),
        }
    }
}

impl PassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn before(&mut self, kind: Kind, anchor: &str, stage: Pass) -> Result<(), PassRegistryError> {
        match kind {
            Kind::Web => self.web.before(anchor, stage),
            Kind::Ws => self.ws.before(anchor, stage),
        }
    }

    pub fn after(&mut self, kind: Kind, anchor: &str, stage: Pass) -> Result<(), PassRegistryError> {
        match kind {
            Kind::Web => self.web.after(anchor, stage),
            Kind::Ws => self.ws.after(anchor, stage),
        }
    }

    pub fn list(&self, kind: Kind) -> &PassList {
        match kind {
            Kind::Web => &self.web,
            Kind::Ws => &self.ws,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::error::ProxyError;

    fn noop<'a>(
        _ctx: &'a mut PipelineContext<'_>,
    ) -> Pin<Box<dyn Future<Output = Result<bool, ProxyError>> + Send + 'a>> {
        Box::pin(async { Ok(false) })
    }

    fn halt<'a>(
        _ctx: &'a mut PipelineContext<'_>,
    ) -> Pin<Box<dyn Future<Output = Result<bool, ProxyError>> + Send + 'a>> {
        Box::pin(async { Ok(true) })
    }

    // `StageFn` is a plain function pointer (no closures), so these record
    // their call into a thread-local rather than captured state. Each test
    // clears it first and runs its whole pipeline on one OS thread (the
    // `#[tokio::test]` current-thread runtime), so there's no cross-test
    // interference.
    thread_local! {
        static CALLS: RefCell<Vec<&'static str>> = RefCell::new(Vec::new());
    }

    fn mark_a<'a>(
        _ctx: &'a mut PipelineContext<'_>,
    ) -> Pin<Box<dyn Future<Output = Result<bool, ProxyError>> + Send + 'a>> {
        Box::pin(async {
            CALLS.with(|c| c.borrow_mut().push("a"));
            Ok(false)
        })
    }

    fn mark_b_halt<'a>(
        _ctx: &'a mut PipelineContext<'_>,
    ) -> Pin<Box<dyn Future<Output = Result<bool, ProxyError>> + Send + 'a>> {
        Box::pin(async {
            CALLS.with(|c| c.borrow_mut().push("b"));
            Ok(true)
        })
    }

    fn mark_c<'a>(
        _ctx: &'a mut PipelineContext<'_>,
    ) -> Pin<Box<dyn Future<Output = Result<bool, ProxyError>> + Send + 'a>> {
        Box::pin(async {
            CALLS.with(|c| c.borrow_mut().push("c"));
            Ok(false)
        })
    }

    fn names(list: &PassList) -> Vec<String> {
        list.stages().iter().map(|p| p.name.to_string()).collect()
    }

    #[test]
    fn before_inserts_ahead_of_anchor() {
        let mut list = PassList::new(vec![
            Pass::new("a", noop),
            Pass::new("b", noop),
            Pass::new("c", noop),
        ]);
        list.before("b", Pass::new("s", noop)).unwrap();
        assert_eq!(names(&list), vec!["a", "s", "b", "c"]);
    }

    #[test]
    fn after_inserts_immediately_after_anchor() {
        let mut list = PassList::new(vec![
            Pass::new("a", noop),
            Pass::new("b", noop),
            Pass::new("c", noop),
        ]);
        list.after("a", Pass::new("s", noop)).unwrap();
        assert_eq!(names(&list), vec!["a", "s", "b", "c"]);
    }

    #[test]
    fn after_on_last_stage_appends() {
        let mut list = PassList::new(vec![Pass::new("a", noop), Pass::new("stream", noop)]);
        list.after("stream", Pass::new("s", noop)).unwrap();
        assert_eq!(names(&list), vec!["a", "stream", "s"]);
    }

    #[test]
    fn missing_anchor_errors() {
        let mut list = PassList::new(vec![Pass::new("a", noop)]);
        let err = list.before("nope", Pass::new("s", noop)).unwrap_err();
        assert_eq!(err, PassRegistryError::NoSuchPass("nope".to_string()));
    }

    #[test]
    fn invalid_kind_parses_as_error() {
        let err: Result<Kind, _> = "http".parse();
        assert_eq!(err.unwrap_err(), PassRegistryError::InvalidKind("http".to_string()));
    }

    #[test]
    fn before_stream_precedes_every_prior_stage() {
        let mut list = PassList::new(vec![
            Pass::new("deleteLength", noop),
            Pass::new("timeout", noop),
            Pass::new("xHeaders", noop),
            Pass::new("stream", noop),
        ]);
        list.before("stream", Pass::new("custom", noop)).unwrap();
        let order = names(&list);
        let custom_idx = order.iter().position(|n| n == "custom").unwrap();
        let stream_idx = order.iter().position(|n| n == "stream").unwrap();
        assert!(custom_idx < stream_idx);
        assert!(order[..custom_idx].iter().all(|n| n != "stream"));
    }

    #[test]
    fn halt_marker_stage_is_constructible() {
        let p = Pass::new("halts", halt);
        assert_eq!(&*p.name, "halts");
    }

    fn blank_context_pieces() -> (
        http::Request<crate::outgoing::BoxBody>,
        crate::context::Writer,
        crate::events::EventEmitter,
    ) {
        let req = http::Request::new(crate::outgoing::empty_body());
        let (slot, _rx) = crate::context::ResponseSlot::new();
        (req, crate::context::Writer::Response(slot), crate::events::EventEmitter::new())
    }

    #[tokio::test]
    async fn pipeline_run_short_circuits_after_halting_stage() {
        CALLS.with(|c| c.borrow_mut().clear());
        let list = PassList::new(vec![
            Pass::new("a", mark_a),
            Pass::new("b", mark_b_halt),
            Pass::new("c", mark_c),
        ]);
        let options = crate::config::ProxyOptions::with_target("http://127.0.0.1:1/");
        let (mut req, mut writer, events) = blank_context_pieces();

        crate::pipeline::run(
            Kind::Web,
            &mut req,
            &mut writer,
            None,
            &options,
            None,
            &list,
            &events,
            None,
            "127.0.0.1:0".parse().unwrap(),
            false,
        )
        .await;

        CALLS.with(|c| assert_eq!(*c.borrow(), vec!["a", "b"]));
    }

    #[tokio::test]
    async fn pipeline_run_applies_call_options_overlay() {
        CALLS.with(|c| c.borrow_mut().clear());
        let list = PassList::new(vec![Pass::new("a", mark_a)]);
        // The server itself has no target configured; only the per-call
        // overlay supplies one, so this also proves `merged_over` (not just
        // `target.is_none()` on the base options) gates the missing-target
        // short circuit in `pipeline::run`.
        let server_options = crate::config::ProxyOptions::default();
        let overlay = crate::config::ProxyOptions::with_target("http://127.0.0.1:1/");
        let (mut req, mut writer, events) = blank_context_pieces();

        crate::pipeline::run(
            Kind::Web,
            &mut req,
            &mut writer,
            None,
            &server_options,
            Some(&overlay),
            &list,
            &events,
            None,
            "127.0.0.1:0".parse().unwrap(),
            false,
        )
        .await;

        CALLS.with(|c| assert_eq!(*c.borrow(), vec!["a"]));
    }
}
