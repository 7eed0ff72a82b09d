//! Response synthesis
//!
//! Pure mapping from (phase event, verdict) to the outgoing protocol
//! message. Denials before anything reached the client terminate
//! immediately; a response-body denial can only scrub the buffered
//! chunk and force the connection shut, because the response headers
//! are already in flight.

use crate::proto::ext_proc::{
    body_mutation, processing_response::Response, BodyMutation, BodyResponse, CommonResponse,
    HeadersResponse, ImmediateResponse, ProcessingResponse, TrailersResponse,
};
use crate::proto::{HeaderMutation, HeaderValue, HeaderValueOption, HttpStatus};

/// HTTP status used for every denial that can still be terminated.
pub const DENY_STATUS: i32 = 403;

/// The phase event being answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    RequestHeaders,
    RequestBody,
    ResponseHeaders,
    ResponseBody,
    RequestTrailers,
    ResponseTrailers,
}

/// Acknowledges the event without modification.
pub fn continue_unmodified(event: PhaseEvent) -> ProcessingResponse {
    let response = match event {
        PhaseEvent::RequestHeaders => Response::RequestHeaders(HeadersResponse::default()),
        PhaseEvent::ResponseHeaders => Response::ResponseHeaders(HeadersResponse::default()),
        PhaseEvent::RequestBody => Response::RequestBody(BodyResponse::default()),
        PhaseEvent::ResponseBody => Response::ResponseBody(BodyResponse::default()),
        PhaseEvent::RequestTrailers => Response::RequestTrailers(TrailersResponse::default()),
        PhaseEvent::ResponseTrailers => Response::ResponseTrailers(TrailersResponse::default()),
    };
    ProcessingResponse {
        response: Some(response),
    }
}

/// Builds the denial for the given phase: immediate termination while
/// that is still possible, body scrubbing once it no longer is.
pub fn deny(event: PhaseEvent, reason: &str) -> ProcessingResponse {
    match event {
        PhaseEvent::ResponseBody => scrub_response_body(),
        _ => immediate_terminate(reason),
    }
}

fn immediate_terminate(reason: &str) -> ProcessingResponse {
    ProcessingResponse {
        response: Some(Response::ImmediateResponse(ImmediateResponse {
            status: Some(HttpStatus { code: DENY_STATUS }),
            headers: Some(set_header("content-type", "text/plain")),
            body: format!("403 Forbidden: blocked by WAF - {reason}").into_bytes(),
            details: String::new(),
        })),
    }
}

fn scrub_response_body() -> ProcessingResponse {
    ProcessingResponse {
        response: Some(Response::ResponseBody(BodyResponse {
            response: Some(CommonResponse {
                status: 0,
                // Scrub the buffered chunk so it never leaks, then
                // force the connection shut after this message.
                body_mutation: Some(BodyMutation {
                    mutation: Some(body_mutation::Mutation::ClearBody(true)),
                }),
                header_mutation: Some(set_header("connection", "close")),
            }),
        })),
    }
}

fn set_header(key: &str, value: &str) -> HeaderMutation {
    HeaderMutation {
        set_headers: vec![HeaderValueOption {
            header: Some(HeaderValue::new(key, value)),
        }],
        remove_headers: Vec::new(),
    }
}
