//! Single-shot authorization ingress
//!
//! The whole request attribute set arrives in one Check call; only the
//! request-header transition of the state machine runs. The reply is a
//! binary allow/deny status, failing closed on engine trouble.

use crate::engine::RuleEngine;
use crate::inspect::headers::{Endpoint, RequestHead};
use crate::inspect::registry::TransactionRegistry;
use crate::inspect::transaction::Verdict;
use crate::proto::ext_authz::authorization_server::Authorization;
use crate::proto::ext_authz::{
    attribute_context, check_response, CheckRequest, CheckResponse, DeniedHttpResponse, RpcStatus,
    RPC_OK, RPC_PERMISSION_DENIED,
};
use crate::proto::{HeaderMap, HeaderValue, HttpStatus};
use crate::WafError;
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

/// gRPC authorization service over the same engine and registry as the
/// streaming path.
pub struct AuthzService {
    engine: Arc<dyn RuleEngine>,
    registry: Arc<TransactionRegistry>,
}

impl AuthzService {
    pub fn new(engine: Arc<dyn RuleEngine>, registry: Arc<TransactionRegistry>) -> Self {
        Self { engine, registry }
    }

    /// Runs the header-phase check for one request. The transaction is
    /// created, evaluated, finalized and released within this call.
    fn check_request(&self, request: CheckRequest) -> crate::Result<Verdict> {
        let attributes = request
            .attributes
            .ok_or(WafError::MissingCorrelationId)?;
        let http = attributes
            .request
            .and_then(|r| r.http)
            .ok_or(WafError::MissingCorrelationId)?;
        if http.id.is_empty() {
            return Err(WafError::MissingCorrelationId);
        }

        let head = RequestHead {
            method: http.method,
            path: http.path,
            virtual_host: http.host,
            protocol: http.protocol,
            source: peer_endpoint(attributes.source),
            destination: peer_endpoint(attributes.destination),
        };
        let header_map = HeaderMap {
            headers: http
                .headers
                .iter()
                .map(|(k, v)| HeaderValue::new(k, v))
                .collect(),
        };

        debug!(
            id = %http.id,
            "check from {}:{} to {}:{}",
            head.source.address, head.source.port,
            head.destination.address, head.destination.port,
        );

        let tx = self.registry.create(&http.id, self.engine.as_ref())?;
        let outcome = tx.lock().on_request_headers(&head, &header_map);
        tx.lock().finish();
        self.registry.release(&http.id);
        outcome
    }
}

#[tonic::async_trait]
impl Authorization for AuthzService {
    async fn check(
        &self,
        request: Request<CheckRequest>,
    ) -> Result<Response<CheckResponse>, Status> {
        let reply = match self.check_request(request.into_inner()) {
            Ok(Verdict::Allow) => allow(),
            Ok(Verdict::Deny(interruption)) => {
                info!("denied by {interruption}");
                deny(format!("denied by {interruption}"))
            }
            Ok(Verdict::Error(message)) => deny(format!("engine failure: {message}")),
            Err(e) => deny(e.to_string()),
        };
        Ok(Response::new(reply))
    }
}

fn peer_endpoint(peer: Option<attribute_context::Peer>) -> Endpoint {
    use crate::proto::ext_authz::{address, socket_address};

    let socket = peer
        .and_then(|p| p.address)
        .and_then(|a| a.address)
        .map(|a| match a {
            address::Address::SocketAddress(s) => s,
        });
    match socket {
        Some(s) => Endpoint {
            address: s.address,
            port: match s.port_specifier {
                Some(socket_address::PortSpecifier::PortValue(port)) => port,
                None => 0,
            },
        },
        None => Endpoint {
            address: String::new(),
            port: 0,
        },
    }
}

fn allow() -> CheckResponse {
    CheckResponse {
        status: Some(RpcStatus {
            code: RPC_OK,
            message: String::new(),
        }),
        http_response: None,
    }
}

/// Every failure mode denies identically: rule match, engine error and
/// protocol violation all fail closed.
fn deny(message: String) -> CheckResponse {
    CheckResponse {
        status: Some(RpcStatus {
            code: RPC_PERMISSION_DENIED,
            message: message.clone(),
        }),
        http_response: Some(check_response::HttpResponse::DeniedResponse(
            DeniedHttpResponse {
                status: Some(HttpStatus { code: 403 }),
                headers: Vec::new(),
                body: format!("403 Forbidden: blocked by WAF - {message}"),
            },
        )),
    }
}
