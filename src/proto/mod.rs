//! Envoy inspection protocol types
//!
//! Hand-written prost subset of the `envoy.service.ext_proc.v3` and
//! `envoy.service.auth.v3` surfaces, wide enough for the phase state
//! machine. Server glue follows the tonic-build output shape so the
//! services plug into `tonic::transport::Server`.

pub mod ext_authz;
pub mod ext_proc;

/// Envoy core `HeaderValue`; the textual value is empty when the
/// proxy ships the raw-byte representation instead.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeaderValue {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub value: String,
    #[prost(bytes = "vec", tag = "3")]
    pub raw_value: Vec<u8>,
}

/// Envoy core `HeaderMap`
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeaderMap {
    #[prost(message, repeated, tag = "1")]
    pub headers: Vec<HeaderValue>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeaderValueOption {
    #[prost(message, optional, tag = "1")]
    pub header: Option<HeaderValue>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeaderMutation {
    #[prost(message, repeated, tag = "1")]
    pub set_headers: Vec<HeaderValueOption>,
    #[prost(string, repeated, tag = "2")]
    pub remove_headers: Vec<String>,
}

/// Envoy type `HttpStatus`
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HttpStatus {
    #[prost(int32, tag = "1")]
    pub code: i32,
}

impl HeaderValue {
    pub fn new(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
            raw_value: Vec::new(),
        }
    }
}
