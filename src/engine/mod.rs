//! Rule-engine contract
//!
//! The adapter drives a rule engine through a narrow per-transaction
//! interface; directive loading and pattern evaluation live entirely
//! behind it. Calls are synchronous and may block, which stalls only
//! the stream making them.

use std::fmt;

/// An engine decision to stop normal processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interruption {
    /// Identity of the rule that matched
    pub rule_id: u32,
    /// Disruptive action requested by the rule (deny, drop, ...)
    pub action: String,
    /// Rule severity
    pub severity: i32,
    /// Human-readable reason
    pub message: String,
}

impl fmt::Display for Interruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rule {} ({})", self.rule_id, self.action)?;
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        Ok(())
    }
}

/// Failure of an evaluation call itself, distinct from a rule match.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct EngineError(pub String);

/// `Ok(None)` is pass-through, `Ok(Some(_))` is an interruption.
pub type EvalResult = std::result::Result<Option<Interruption>, EngineError>;

/// Factory for per-exchange engine transactions.
pub trait RuleEngine: Send + Sync {
    fn open_transaction(&self, id: &str) -> Box<dyn EngineTransaction>;
}

/// One exchange's view of the engine. Methods mirror the phase order
/// the state machine drives; evaluation methods report interruptions.
pub trait EngineTransaction: Send {
    fn announce_connection(&mut self, src_addr: &str, src_port: u32, dst_addr: &str, dst_port: u32);
    fn announce_uri(&mut self, path: &str, method: &str, protocol: &str);
    fn set_virtual_host(&mut self, host: &str);
    fn add_request_header(&mut self, key: &str, value: &str);
    fn add_response_header(&mut self, key: &str, value: &str);

    fn evaluate_request_headers(&mut self) -> EvalResult;
    fn ingest_request_body(&mut self, body: &[u8]) -> EvalResult;
    fn evaluate_request_body(&mut self) -> EvalResult;
    fn evaluate_response_headers(&mut self, status: u32, protocol: &str) -> EvalResult;
    fn ingest_response_body(&mut self, body: &[u8]) -> EvalResult;
    fn evaluate_response_body(&mut self) -> EvalResult;

    /// Flush the engine's audit/logging pipeline for this exchange.
    fn finalize(&mut self) -> std::result::Result<(), EngineError>;
    /// Release engine-side resources.
    fn close(&mut self) -> std::result::Result<(), EngineError>;
}

/// Engine that allows everything. Lets the daemon run before a real
/// rule engine is linked in; `main` warns when it is selected.
pub struct PassthroughEngine;

impl RuleEngine for PassthroughEngine {
    fn open_transaction(&self, _id: &str) -> Box<dyn EngineTransaction> {
        Box::new(PassthroughTransaction)
    }
}

struct PassthroughTransaction;

impl EngineTransaction for PassthroughTransaction {
    fn announce_connection(
        &mut self,
        _src_addr: &str,
        _src_port: u32,
        _dst_addr: &str,
        _dst_port: u32,
    ) {
    }
    fn announce_uri(&mut self, _path: &str, _method: &str, _protocol: &str) {}
    fn set_virtual_host(&mut self, _host: &str) {}
    fn add_request_header(&mut self, _key: &str, _value: &str) {}
    fn add_response_header(&mut self, _key: &str, _value: &str) {}

    fn evaluate_request_headers(&mut self) -> EvalResult {
        Ok(None)
    }
    fn ingest_request_body(&mut self, _body: &[u8]) -> EvalResult {
        Ok(None)
    }
    fn evaluate_request_body(&mut self) -> EvalResult {
        Ok(None)
    }
    fn evaluate_response_headers(&mut self, _status: u32, _protocol: &str) -> EvalResult {
        Ok(None)
    }
    fn ingest_response_body(&mut self, _body: &[u8]) -> EvalResult {
        Ok(None)
    }
    fn evaluate_response_body(&mut self) -> EvalResult {
        Ok(None)
    }

    fn finalize(&mut self) -> std::result::Result<(), EngineError> {
        Ok(())
    }
    fn close(&mut self) -> std::result::Result<(), EngineError> {
        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    //! Scripted engine used by the state-machine and service tests.

    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Hook names used for scripting and call recording.
    pub const EVAL_REQUEST_HEADERS: &str = "evaluate_request_headers";
    pub const EVAL_REQUEST_BODY: &str = "evaluate_request_body";
    pub const EVAL_RESPONSE_HEADERS: &str = "evaluate_response_headers";
    pub const EVAL_RESPONSE_BODY: &str = "evaluate_response_body";

    /// Records every transaction call and yields scripted results at
    /// one hook.
    #[derive(Default)]
    pub struct MockEngine {
        pub calls: Arc<Mutex<Vec<String>>>,
        pub deny_at: Option<(&'static str, u32)>,
        pub error_at: Option<&'static str>,
        pub fail_teardown: bool,
    }

    impl MockEngine {
        pub fn allowing() -> Self {
            Self::default()
        }

        pub fn denying_at(hook: &'static str, rule_id: u32) -> Self {
            Self {
                deny_at: Some((hook, rule_id)),
                ..Self::default()
            }
        }

        pub fn failing_at(hook: &'static str) -> Self {
            Self {
                error_at: Some(hook),
                ..Self::default()
            }
        }

        pub fn failing_teardown() -> Self {
            Self {
                fail_teardown: true,
                ..Self::default()
            }
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    impl RuleEngine for MockEngine {
        fn open_transaction(&self, id: &str) -> Box<dyn EngineTransaction> {
            self.calls.lock().push(format!("open_transaction {id}"));
            Box::new(MockTransaction {
                calls: Arc::clone(&self.calls),
                deny_at: self.deny_at,
                error_at: self.error_at,
                fail_teardown: self.fail_teardown,
            })
        }
    }

    pub struct MockTransaction {
        calls: Arc<Mutex<Vec<String>>>,
        deny_at: Option<(&'static str, u32)>,
        error_at: Option<&'static str>,
        fail_teardown: bool,
    }

    impl MockTransaction {
        fn record(&self, call: String) {
            self.calls.lock().push(call);
        }

        fn scripted(&self, hook: &'static str) -> EvalResult {
            if self.error_at == Some(hook) {
                return Err(EngineError(format!("{hook} exploded")));
            }
            match self.deny_at {
                Some((h, rule_id)) if h == hook => Ok(Some(Interruption {
                    rule_id,
                    action: "deny".into(),
                    severity: 2,
                    message: format!("matched at {hook}"),
                })),
                _ => Ok(None),
            }
        }
    }

    impl EngineTransaction for MockTransaction {
        fn announce_connection(
            &mut self,
            src_addr: &str,
            src_port: u32,
            dst_addr: &str,
            dst_port: u32,
        ) {
            self.record(format!(
                "announce_connection {src_addr}:{src_port} -> {dst_addr}:{dst_port}"
            ));
        }

        fn announce_uri(&mut self, path: &str, method: &str, protocol: &str) {
            self.record(format!("announce_uri {path} {method} {protocol}"));
        }

        fn set_virtual_host(&mut self, host: &str) {
            self.record(format!("set_virtual_host {host}"));
        }

        fn add_request_header(&mut self, key: &str, value: &str) {
            self.record(format!("add_request_header {key}={value}"));
        }

        fn add_response_header(&mut self, key: &str, value: &str) {
            self.record(format!("add_response_header {key}={value}"));
        }

        fn evaluate_request_headers(&mut self) -> EvalResult {
            self.record(EVAL_REQUEST_HEADERS.into());
            self.scripted(EVAL_REQUEST_HEADERS)
        }

        fn ingest_request_body(&mut self, body: &[u8]) -> EvalResult {
            self.record(format!(
                "ingest_request_body {}",
                String::from_utf8_lossy(body)
            ));
            Ok(None)
        }

        fn evaluate_request_body(&mut self) -> EvalResult {
            self.record(EVAL_REQUEST_BODY.into());
            self.scripted(EVAL_REQUEST_BODY)
        }

        fn evaluate_response_headers(&mut self, status: u32, protocol: &str) -> EvalResult {
            self.record(format!("{EVAL_RESPONSE_HEADERS} {status} {protocol}"));
            self.scripted(EVAL_RESPONSE_HEADERS)
        }

        fn ingest_response_body(&mut self, body: &[u8]) -> EvalResult {
            self.record(format!(
                "ingest_response_body {}",
                String::from_utf8_lossy(body)
            ));
            Ok(None)
        }

        fn evaluate_response_body(&mut self) -> EvalResult {
            self.record(EVAL_RESPONSE_BODY.into());
            self.scripted(EVAL_RESPONSE_BODY)
        }

        fn finalize(&mut self) -> std::result::Result<(), EngineError> {
            self.record("finalize".into());
            if self.fail_teardown {
                return Err(EngineError("finalize exploded".into()));
            }
            Ok(())
        }

        fn close(&mut self) -> std::result::Result<(), EngineError> {
            self.record("close".into());
            if self.fail_teardown {
                return Err(EngineError("close exploded".into()));
            }
            Ok(())
        }
    }
}
