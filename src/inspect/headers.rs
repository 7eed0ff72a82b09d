//! Header projection
//!
//! Canonical request/response attributes out of a raw header
//! collection, with protocol-reserved pseudo-headers stripped before
//! anything reaches the engine.

use crate::proto::HeaderMap;
use crate::{Result, WafError};
use std::collections::HashMap;

/// Request header carrying the correlation id.
pub const CORRELATION_HEADER: &str = "x-request-id";

/// Attribute namespace the proxy populates for the processing filter.
pub const ATTRIBUTES_NAMESPACE: &str = "envoy.filters.http.ext_proc";

pub const ATTR_SOURCE_ADDRESS: &str = "source.address";
pub const ATTR_DESTINATION_ADDRESS: &str = "destination.address";
pub const ATTR_REQUEST_PROTOCOL: &str = "request.protocol";

/// One side of the connection, captured at the request-header phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub address: String,
    pub port: u32,
}

/// Canonical request attributes announced to the engine.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub virtual_host: String,
    pub protocol: String,
    pub source: Endpoint,
    pub destination: Endpoint,
}

/// Case-insensitive header lookup; falls back to the raw-byte form
/// when the textual value is empty.
pub fn header_value<'a>(headers: &'a HeaderMap, key: &str) -> Option<&'a str> {
    for h in &headers.headers {
        if !h.key.eq_ignore_ascii_case(key) {
            continue;
        }
        if !h.value.is_empty() {
            return Some(&h.value);
        }
        if !h.raw_value.is_empty() {
            return std::str::from_utf8(&h.raw_value).ok();
        }
    }
    None
}

/// Headers safe to forward to the engine: everything except
/// pseudo-headers.
pub fn forwardable(headers: &HeaderMap) -> impl Iterator<Item = (&str, &str)> {
    headers.headers.iter().filter_map(|h| {
        if h.key.starts_with(':') {
            return None;
        }
        let value = if !h.value.is_empty() {
            h.value.as_str()
        } else {
            std::str::from_utf8(&h.raw_value).unwrap_or("")
        };
        Some((h.key.as_str(), value))
    })
}

/// Parses an `address:port` endpoint string.
pub fn parse_endpoint(raw: &str) -> Result<Endpoint> {
    let addr: std::net::SocketAddr = raw
        .parse()
        .map_err(|_| WafError::MalformedAddress(raw.to_string()))?;
    Ok(Endpoint {
        address: addr.ip().to_string(),
        port: addr.port() as u32,
    })
}

/// Splits `host:port` authority into its host part. Bracketed IPv6
/// authorities keep the address inside the brackets.
pub fn split_authority(authority: &str) -> Result<&str> {
    if let Some(rest) = authority.strip_prefix('[') {
        if let Some((host, _)) = rest.split_once(']') {
            return Ok(host);
        }
        return Err(WafError::MissingHost(authority.to_string()));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && !port.is_empty() => Ok(host),
        _ => Err(WafError::MissingHost(authority.to_string())),
    }
}

/// Numeric `:status` pseudo-header of a response-header collection.
pub fn status_code(headers: &HeaderMap) -> Result<u32> {
    let raw = header_value(headers, ":status").unwrap_or("");
    raw.parse()
        .map_err(|_| WafError::MalformedStatus(raw.to_string()))
}

/// String attribute from the processing filter's namespace.
pub fn attribute<'a>(
    attrs: &'a HashMap<String, ::prost_types::Struct>,
    key: &str,
) -> Option<&'a str> {
    let fields = &attrs.get(ATTRIBUTES_NAMESPACE)?.fields;
    match fields.get(key)?.kind.as_ref()? {
        ::prost_types::value::Kind::StringValue(s) => Some(s.as_str()),
        _ => None,
    }
}
