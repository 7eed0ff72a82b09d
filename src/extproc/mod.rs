//! Streaming external processor
//!
//! One coordinator per stream: receive a phase event, dispatch it to
//! the bound transaction, send exactly one response back. The drop
//! guard guarantees finalize and registry release on every exit path
//! (clean close, cancellation, denial, transport failure).

pub mod response;

use crate::engine::RuleEngine;
use crate::inspect::headers::{self, RequestHead};
use crate::inspect::registry::TransactionRegistry;
use crate::inspect::transaction::{Transaction, Verdict};
use crate::proto::ext_proc::external_processor_server::ExternalProcessor;
use crate::proto::ext_proc::{
    processing_request::Request as PhaseRequest, HttpBody, HttpHeaders, ProcessingRequest,
    ProcessingResponse,
};
use crate::proto::HeaderMap;
use crate::WafError;
use parking_lot::Mutex;
use response::PhaseEvent;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Code, Request, Response, Status, Streaming};
use tracing::{debug, warn};

type Attributes = HashMap<String, ::prost_types::Struct>;

/// gRPC external-processing service; spawns one coordinator per
/// stream.
pub struct ExtProcService {
    engine: Arc<dyn RuleEngine>,
    registry: Arc<TransactionRegistry>,
}

impl ExtProcService {
    pub fn new(engine: Arc<dyn RuleEngine>, registry: Arc<TransactionRegistry>) -> Self {
        Self { engine, registry }
    }
}

#[tonic::async_trait]
impl ExternalProcessor for ExtProcService {
    type ProcessStream = ReceiverStream<Result<ProcessingResponse, Status>>;

    async fn process(
        &self,
        request: Request<Streaming<ProcessingRequest>>,
    ) -> Result<Response<Self::ProcessStream>, Status> {
        let inbound = request.into_inner();
        let (outbound, rx) = mpsc::channel(4);
        let coordinator =
            StreamCoordinator::new(Arc::clone(&self.engine), Arc::clone(&self.registry));

        tokio::spawn(pump(coordinator, inbound, outbound));

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

/// Receive loop for one stream. Clean end-of-stream and client
/// cancellation both end it without an error; any other transport
/// failure is forwarded before the loop ends. Dropping the coordinator
/// finalizes and releases the bound transaction.
async fn pump<S>(
    mut coordinator: StreamCoordinator,
    mut inbound: S,
    outbound: mpsc::Sender<Result<ProcessingResponse, Status>>,
) where
    S: tokio_stream::Stream<Item = Result<ProcessingRequest, Status>> + Unpin,
{
    use tokio_stream::StreamExt;

    loop {
        match inbound.next().await {
            Some(Ok(event)) => {
                let (reply, done) = coordinator.handle_event(event);
                if outbound.send(Ok(reply)).await.is_err() {
                    break;
                }
                if done {
                    break;
                }
            }
            None => {
                debug!("stream closed by client");
                break;
            }
            Some(Err(status)) if status.code() == Code::Cancelled => {
                debug!("stream canceled by client");
                break;
            }
            Some(Err(status)) => {
                warn!("stream receive failed: {status}");
                let _ = outbound.send(Err(status)).await;
                break;
            }
        }
    }
}

/// Drives one stream: binds the transaction on the first header event
/// and owns it until the stream ends.
struct StreamCoordinator {
    engine: Arc<dyn RuleEngine>,
    registry: Arc<TransactionRegistry>,
    bound: Option<BoundTransaction>,
}

/// Scoped binding of a stream to its transaction. Dropping it runs
/// finalize and releases the registry entry, exactly once, whichever
/// way the stream ends.
struct BoundTransaction {
    id: String,
    tx: Arc<Mutex<Transaction>>,
    registry: Arc<TransactionRegistry>,
}

impl Drop for BoundTransaction {
    fn drop(&mut self) {
        self.tx.lock().finish();
        self.registry.release(&self.id);
    }
}

impl StreamCoordinator {
    fn new(engine: Arc<dyn RuleEngine>, registry: Arc<TransactionRegistry>) -> Self {
        Self {
            engine,
            registry,
            bound: None,
        }
    }

    /// Dispatches one phase event and builds the one response owed for
    /// it. The flag reports whether the stream is finished.
    fn handle_event(&mut self, event: ProcessingRequest) -> (ProcessingResponse, bool) {
        let ProcessingRequest {
            attributes,
            request,
        } = event;
        let Some(request) = request else {
            return (
                response::deny(PhaseEvent::RequestHeaders, "empty phase event"),
                true,
            );
        };

        match request {
            PhaseRequest::RequestHeaders(h) => self.on_request_headers(&attributes, h),
            PhaseRequest::RequestBody(b) => self.on_body(PhaseEvent::RequestBody, b),
            PhaseRequest::ResponseHeaders(h) => self.on_response_headers(&attributes, h),
            PhaseRequest::ResponseBody(b) => self.on_body(PhaseEvent::ResponseBody, b),
            PhaseRequest::RequestTrailers(_) => self.on_trailers(PhaseEvent::RequestTrailers),
            PhaseRequest::ResponseTrailers(_) => self.on_trailers(PhaseEvent::ResponseTrailers),
        }
    }

    fn on_request_headers(
        &mut self,
        attributes: &Attributes,
        event: HttpHeaders,
    ) -> (ProcessingResponse, bool) {
        if self.bound.is_some() {
            // Exactly one header phase per stream is assumed.
            return deny_for(
                PhaseEvent::RequestHeaders,
                &WafError::OutOfOrder {
                    event: "request headers",
                    phase: crate::inspect::transaction::Phase::RequestHeadersDone,
                },
            );
        }

        let header_map = event.headers.unwrap_or_default();
        let Some(id) = headers::header_value(&header_map, headers::CORRELATION_HEADER) else {
            return deny_for(PhaseEvent::RequestHeaders, &WafError::MissingCorrelationId);
        };
        let id = id.to_string();

        let head = match project_head(attributes, &header_map) {
            Ok(head) => head,
            Err(e) => return deny_for(PhaseEvent::RequestHeaders, &e),
        };

        let tx = match self.registry.create(&id, self.engine.as_ref()) {
            Ok(tx) => tx,
            Err(e) => return deny_for(PhaseEvent::RequestHeaders, &e),
        };
        self.bound = Some(BoundTransaction {
            id: id.clone(),
            tx: Arc::clone(&tx),
            registry: Arc::clone(&self.registry),
        });

        let outcome = tx.lock().on_request_headers(&head, &header_map);
        reply(PhaseEvent::RequestHeaders, outcome)
    }

    fn on_response_headers(
        &mut self,
        attributes: &Attributes,
        event: HttpHeaders,
    ) -> (ProcessingResponse, bool) {
        let Some(bound) = &self.bound else {
            return unknown_transaction(PhaseEvent::ResponseHeaders);
        };

        let header_map = event.headers.unwrap_or_default();
        let status = match headers::status_code(&header_map) {
            Ok(status) => status,
            Err(e) => return deny_for(PhaseEvent::ResponseHeaders, &e),
        };
        let protocol = headers::attribute(attributes, headers::ATTR_REQUEST_PROTOCOL)
            .unwrap_or_default()
            .to_string();

        let outcome = bound
            .tx
            .lock()
            .on_response_headers(status, &protocol, &header_map);
        reply(PhaseEvent::ResponseHeaders, outcome)
    }

    fn on_body(&mut self, phase: PhaseEvent, event: HttpBody) -> (ProcessingResponse, bool) {
        let Some(bound) = &self.bound else {
            return unknown_transaction(phase);
        };

        let outcome = match phase {
            PhaseEvent::RequestBody => bound
                .tx
                .lock()
                .on_request_body(&event.body, event.end_of_stream),
            _ => bound
                .tx
                .lock()
                .on_response_body(&event.body, event.end_of_stream),
        };
        reply(phase, outcome)
    }

    fn on_trailers(&mut self, phase: PhaseEvent) -> (ProcessingResponse, bool) {
        if self.bound.is_none() {
            return unknown_transaction(phase);
        }
        // Trailers are acknowledged, not inspected.
        (response::continue_unmodified(phase), false)
    }
}

/// Canonical request attributes for the header phase; the destination
/// endpoint comes from its own attribute key.
fn project_head(attributes: &Attributes, header_map: &HeaderMap) -> crate::Result<RequestHead> {
    let source = headers::parse_endpoint(
        headers::attribute(attributes, headers::ATTR_SOURCE_ADDRESS).unwrap_or_default(),
    )?;
    let destination = headers::parse_endpoint(
        headers::attribute(attributes, headers::ATTR_DESTINATION_ADDRESS).unwrap_or_default(),
    )?;

    let authority = headers::header_value(header_map, ":authority").unwrap_or_default();
    let virtual_host = headers::split_authority(authority)?.to_string();

    Ok(RequestHead {
        method: headers::header_value(header_map, ":method")
            .unwrap_or_default()
            .to_string(),
        path: headers::header_value(header_map, ":path")
            .unwrap_or_default()
            .to_string(),
        virtual_host,
        protocol: headers::attribute(attributes, headers::ATTR_REQUEST_PROTOCOL)
            .unwrap_or_default()
            .to_string(),
        source,
        destination,
    })
}

/// Maps a dispatch outcome onto the wire. Denials and engine errors
/// both fail closed; protocol violations deny as well.
fn reply(phase: PhaseEvent, outcome: crate::Result<Verdict>) -> (ProcessingResponse, bool) {
    match outcome {
        Ok(Verdict::Allow) => (response::continue_unmodified(phase), false),
        Ok(Verdict::Deny(interruption)) => {
            (response::deny(phase, &interruption.to_string()), true)
        }
        Ok(Verdict::Error(message)) => {
            (response::deny(phase, &format!("engine failure: {message}")), true)
        }
        Err(e) => deny_for(phase, &e),
    }
}

fn deny_for(phase: PhaseEvent, error: &WafError) -> (ProcessingResponse, bool) {
    debug!("denying {phase:?} event: {error}");
    (response::deny(phase, &error.to_string()), true)
}

fn unknown_transaction(phase: PhaseEvent) -> (ProcessingResponse, bool) {
    debug!("denying {phase:?} event: no transaction bound to this stream");
    (response::deny(phase, "unknown transaction"), true)
}
