//! Transaction state machine
//!
//! One `Transaction` per HTTP exchange drives the engine through the
//! phase order and holds the verdict. Phases advance strictly
//! monotonically; a denied or errored transaction never reaches the
//! engine again.

use crate::engine::{EngineTransaction, EvalResult, Interruption};
use crate::inspect::body::BodyAccumulator;
use crate::inspect::headers::{self, Endpoint, RequestHead};
use crate::proto::HeaderMap;
use crate::{Result, WafError};
use tracing::{debug, warn};

/// Phase progress of one exchange. Body phases may be absent on the
/// wire (no payload) and then complete trivially.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Init,
    RequestHeadersDone,
    RequestBodyDone,
    ResponseHeadersDone,
    ResponseBodyDone,
    Closed,
}

/// Outcome attached to a transaction after engine evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Allow,
    Deny(Interruption),
    Error(String),
}

impl Verdict {
    pub fn is_allow(&self) -> bool {
        matches!(self, Verdict::Allow)
    }
}

/// Per-exchange state: phase progress, verdict, body buffers and the
/// engine handle. Driven by exactly one stream.
pub struct Transaction {
    id: String,
    phase: Phase,
    verdict: Verdict,
    request_body: BodyAccumulator,
    response_body: BodyAccumulator,
    source: Option<Endpoint>,
    destination: Option<Endpoint>,
    engine: Box<dyn EngineTransaction>,
    finished: bool,
}

impl Transaction {
    pub fn new(id: &str, engine: Box<dyn EngineTransaction>) -> Self {
        Self {
            id: id.to_string(),
            phase: Phase::Init,
            verdict: Verdict::Allow,
            request_body: BodyAccumulator::new(),
            response_body: BodyAccumulator::new(),
            source: None,
            destination: None,
            engine,
            finished: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn verdict(&self) -> &Verdict {
        &self.verdict
    }

    pub fn source(&self) -> Option<&Endpoint> {
        self.source.as_ref()
    }

    pub fn destination(&self) -> Option<&Endpoint> {
        self.destination.as_ref()
    }

    /// Init → RequestHeadersDone. Announces the connection, URI and
    /// virtual host, forwards non-pseudo headers, then evaluates.
    pub fn on_request_headers(
        &mut self,
        head: &RequestHead,
        header_map: &HeaderMap,
    ) -> Result<Verdict> {
        self.expect_phase("request headers", Phase::Init, Phase::Init)?;

        self.source = Some(head.source.clone());
        self.destination = Some(head.destination.clone());

        self.engine.announce_connection(
            &head.source.address,
            head.source.port,
            &head.destination.address,
            head.destination.port,
        );
        self.engine
            .announce_uri(&head.path, &head.method, &head.protocol);
        self.engine.set_virtual_host(&head.virtual_host);
        for (key, value) in headers::forwardable(header_map) {
            self.engine.add_request_header(key, value);
        }

        let result = self.engine.evaluate_request_headers();
        self.settle(result, Phase::RequestHeadersDone);
        Ok(self.verdict.clone())
    }

    /// RequestHeadersDone → RequestBodyDone. Accumulates chunks; the
    /// engine sees the assembled payload once, on end-of-stream.
    pub fn on_request_body(&mut self, chunk: &[u8], end_of_stream: bool) -> Result<Verdict> {
        self.expect_phase("request body", Phase::RequestHeadersDone, Phase::RequestHeadersDone)?;

        self.request_body.append(chunk, end_of_stream);
        if self.request_body.is_complete() {
            let result = self.engine.ingest_request_body(self.request_body.as_bytes());
            if self.settle(result, self.phase) {
                let result = self.engine.evaluate_request_body();
                self.settle(result, Phase::RequestBodyDone);
            }
        }
        Ok(self.verdict.clone())
    }

    /// → ResponseHeadersDone. Accepts a skipped request-body phase
    /// (exchange without a payload).
    pub fn on_response_headers(
        &mut self,
        status: u32,
        protocol: &str,
        header_map: &HeaderMap,
    ) -> Result<Verdict> {
        self.expect_phase(
            "response headers",
            Phase::RequestHeadersDone,
            Phase::RequestBodyDone,
        )?;

        for (key, value) in headers::forwardable(header_map) {
            self.engine.add_response_header(key, value);
        }

        let result = self.engine.evaluate_response_headers(status, protocol);
        self.settle(result, Phase::ResponseHeadersDone);
        Ok(self.verdict.clone())
    }

    /// → ResponseBodyDone. Mirrors the request-body handling for the
    /// outbound payload.
    pub fn on_response_body(&mut self, chunk: &[u8], end_of_stream: bool) -> Result<Verdict> {
        self.expect_phase(
            "response body",
            Phase::ResponseHeadersDone,
            Phase::ResponseHeadersDone,
        )?;

        self.response_body.append(chunk, end_of_stream);
        if self.response_body.is_complete() {
            let result = self
                .engine
                .ingest_response_body(self.response_body.as_bytes());
            if self.settle(result, self.phase) {
                let result = self.engine.evaluate_response_body();
                self.settle(result, Phase::ResponseBodyDone);
            }
        }
        Ok(self.verdict.clone())
    }

    /// Finalizes (engine logging) and releases engine resources.
    /// Runs at most once; teardown failures are logged, never
    /// propagated.
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.phase = Phase::Closed;
        if let Err(e) = self.engine.finalize() {
            warn!(id = %self.id, "transaction finalize failed: {e}");
        }
        if let Err(e) = self.engine.close() {
            warn!(id = %self.id, "transaction close failed: {e}");
        }
    }

    fn expect_phase(&self, event: &'static str, min: Phase, max: Phase) -> Result<()> {
        if self.phase < min || self.phase > max {
            return Err(WafError::OutOfOrder {
                event,
                phase: self.phase,
            });
        }
        Ok(())
    }

    /// Folds an evaluation result into the verdict. An interruption or
    /// engine failure closes the transaction; nothing reaches the
    /// engine afterwards. Returns whether the transaction still
    /// allows.
    fn settle(&mut self, result: EvalResult, next: Phase) -> bool {
        match result {
            Ok(None) => {
                self.phase = next;
                true
            }
            Ok(Some(interruption)) => {
                debug!(id = %self.id, "interruption: {interruption}");
                self.verdict = Verdict::Deny(interruption);
                self.phase = Phase::Closed;
                false
            }
            Err(e) => {
                warn!(id = %self.id, "engine evaluation failed: {e}");
                self.verdict = Verdict::Error(e.to_string());
                self.phase = Phase::Closed;
                false
            }
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::*;
    use crate::engine::RuleEngine;
    use crate::proto::HeaderValue;

    fn request_head() -> RequestHead {
        RequestHead {
            method: "GET".into(),
            path: "/".into(),
            virtual_host: "example.com".into(),
            protocol: "HTTP/2".into(),
            source: Endpoint {
                address: "10.0.0.1".into(),
                port: 5555,
            },
            destination: Endpoint {
                address: "10.0.0.2".into(),
                port: 443,
            },
        }
    }

    fn request_headers() -> HeaderMap {
        HeaderMap {
            headers: vec![
                HeaderValue::new(":method", "GET"),
                HeaderValue::new(":path", "/"),
                HeaderValue::new(":authority", "example.com:443"),
                HeaderValue::new("x-request-id", "abc-1"),
                HeaderValue::new("user-agent", "curl/8.0"),
            ],
        }
    }

    fn transaction(engine: &MockEngine) -> Transaction {
        Transaction::new("abc-1", engine.open_transaction("abc-1"))
    }

    #[test]
    fn test_request_headers_walkthrough() {
        let engine = MockEngine::allowing();
        let mut tx = transaction(&engine);

        let verdict = tx.on_request_headers(&request_head(), &request_headers()).unwrap();
        assert_eq!(verdict, Verdict::Allow);
        assert_eq!(tx.phase(), Phase::RequestHeadersDone);
        assert_eq!(tx.source().unwrap().address, "10.0.0.1");
        assert_eq!(tx.destination().unwrap().port, 443);

        let calls = engine.calls();
        assert_eq!(
            calls,
            vec![
                "open_transaction abc-1".to_string(),
                "announce_connection 10.0.0.1:5555 -> 10.0.0.2:443".to_string(),
                "announce_uri / GET HTTP/2".to_string(),
                "set_virtual_host example.com".to_string(),
                "add_request_header x-request-id=abc-1".to_string(),
                "add_request_header user-agent=curl/8.0".to_string(),
                EVAL_REQUEST_HEADERS.to_string(),
            ]
        );
    }

    #[test]
    fn test_pseudo_headers_never_reach_engine() {
        let engine = MockEngine::allowing();
        let mut tx = transaction(&engine);
        tx.on_request_headers(&request_head(), &request_headers()).unwrap();

        assert!(!engine
            .calls()
            .iter()
            .any(|c| c.starts_with("add_request_header :")));
    }

    #[test]
    fn test_out_of_order_body_rejected() {
        let engine = MockEngine::allowing();
        let mut tx = transaction(&engine);

        let err = tx.on_request_body(b"x", true).unwrap_err();
        assert!(matches!(err, WafError::OutOfOrder { .. }));
        // Nothing was evaluated.
        assert_eq!(engine.calls(), vec!["open_transaction abc-1".to_string()]);
    }

    #[test]
    fn test_second_request_headers_rejected() {
        let engine = MockEngine::allowing();
        let mut tx = transaction(&engine);
        tx.on_request_headers(&request_head(), &request_headers()).unwrap();

        let err = tx
            .on_request_headers(&request_head(), &request_headers())
            .unwrap_err();
        assert!(matches!(err, WafError::OutOfOrder { .. }));
    }

    #[test]
    fn test_body_evaluated_once_regardless_of_chunking() {
        let engine = MockEngine::allowing();
        let mut tx = transaction(&engine);
        tx.on_request_headers(&request_head(), &request_headers()).unwrap();

        tx.on_request_body(b"{\"a\":1", false).unwrap();
        let verdict = tx.on_request_body(b"}", true).unwrap();
        assert_eq!(verdict, Verdict::Allow);
        assert_eq!(tx.phase(), Phase::RequestBodyDone);

        let calls = engine.calls();
        let ingests: Vec<_> = calls
            .iter()
            .filter(|c| c.starts_with("ingest_request_body"))
            .collect();
        assert_eq!(ingests, vec!["ingest_request_body {\"a\":1}"]);
        assert_eq!(
            calls.iter().filter(|c| *c == EVAL_REQUEST_BODY).count(),
            1
        );
    }

    #[test]
    fn test_response_headers_after_skipped_request_body() {
        let engine = MockEngine::allowing();
        let mut tx = transaction(&engine);
        tx.on_request_headers(&request_head(), &request_headers()).unwrap();

        // No request-body event arrived; the response phase is next.
        let headers = HeaderMap {
            headers: vec![
                HeaderValue::new(":status", "200"),
                HeaderValue::new("content-type", "text/html"),
            ],
        };
        let verdict = tx.on_response_headers(200, "HTTP/2", &headers).unwrap();
        assert_eq!(verdict, Verdict::Allow);
        assert_eq!(tx.phase(), Phase::ResponseHeadersDone);
        assert!(engine
            .calls()
            .contains(&"add_response_header content-type=text/html".to_string()));
    }

    #[test]
    fn test_interruption_denies_and_closes() {
        let engine = MockEngine::denying_at(EVAL_REQUEST_HEADERS, 920100);
        let mut tx = transaction(&engine);

        let verdict = tx.on_request_headers(&request_head(), &request_headers()).unwrap();
        match verdict {
            Verdict::Deny(it) => assert_eq!(it.rule_id, 920100),
            other => panic!("expected deny, got {other:?}"),
        }
        assert_eq!(tx.phase(), Phase::Closed);

        // Later phases are rejected without touching the engine.
        let before = engine.calls().len();
        assert!(tx.on_request_body(b"x", true).is_err());
        assert!(tx.on_response_headers(200, "HTTP/2", &HeaderMap::default()).is_err());
        assert_eq!(engine.calls().len(), before);
    }

    #[test]
    fn test_engine_error_fails_closed() {
        let engine = MockEngine::failing_at(EVAL_REQUEST_BODY);
        let mut tx = transaction(&engine);
        tx.on_request_headers(&request_head(), &request_headers()).unwrap();

        let verdict = tx.on_request_body(b"payload", true).unwrap();
        assert!(matches!(verdict, Verdict::Error(_)));
        assert_eq!(tx.phase(), Phase::Closed);
    }

    #[test]
    fn test_response_body_denial() {
        let engine = MockEngine::denying_at(EVAL_RESPONSE_BODY, 953100);
        let mut tx = transaction(&engine);
        tx.on_request_headers(&request_head(), &request_headers()).unwrap();
        tx.on_request_body(b"{}", true).unwrap();
        tx.on_response_headers(200, "HTTP/2", &HeaderMap::default()).unwrap();

        tx.on_response_body(b"<secret>", false).unwrap();
        let verdict = tx.on_response_body(b"</secret>", true).unwrap();
        assert!(matches!(verdict, Verdict::Deny(_)));
        assert_eq!(tx.phase(), Phase::Closed);
    }

    #[test]
    fn test_finish_runs_teardown_once() {
        let engine = MockEngine::allowing();
        let mut tx = transaction(&engine);
        tx.on_request_headers(&request_head(), &request_headers()).unwrap();

        tx.finish();
        tx.finish();
        drop(tx);

        let calls = engine.calls();
        assert_eq!(calls.iter().filter(|c| *c == "finalize").count(), 1);
        assert_eq!(calls.iter().filter(|c| *c == "close").count(), 1);
    }

    #[test]
    fn test_teardown_failures_are_swallowed() {
        let engine = MockEngine::failing_teardown();
        let mut tx = transaction(&engine);
        tx.on_request_headers(&request_head(), &request_headers()).unwrap();

        // Both failures are logged; neither propagates nor panics, and
        // close is still attempted after finalize fails.
        tx.finish();
        assert_eq!(tx.verdict(), &Verdict::Allow);

        let calls = engine.calls();
        assert_eq!(calls.iter().filter(|c| *c == "finalize").count(), 1);
        assert_eq!(calls.iter().filter(|c| *c == "close").count(), 1);
    }

    #[test]
    fn test_drop_triggers_teardown() {
        let engine = MockEngine::allowing();
        {
            let mut tx = transaction(&engine);
            tx.on_request_headers(&request_head(), &request_headers()).unwrap();
        }
        let calls = engine.calls();
        assert!(calls.contains(&"finalize".to_string()));
        assert!(calls.contains(&"close".to_string()));
    }
}
