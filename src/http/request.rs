//! Request handling and transformation.
//!
//! # Responsibilities
//! - Generate unique request ID (UUID v4)
//! - Strip reserved headers clients may not set
//! - Name the reserved headers and endpoints of the process boundary
//!
//! # Design Decisions
//! - Request ID added as early as possible for tracing
//! - An incoming `x-request-id` is kept, so IDs flow across services
//! - Everything under `x-fleet-` belongs to the gateway

use axum::http::{HeaderMap, HeaderName, HeaderValue, Request};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use tower_http::request_id::{MakeRequestId, RequestId};
use uuid::Uuid;

pub const X_REQUEST_ID: &str = "x-request-id";

/// Prefix of every header the gateway owns.
pub const RESERVED_PREFIX: &str = "x-fleet-";

/// `<key id> <key>`; grants access to internal endpoints.
pub const X_FLEET_SERVICE_AUTH: &str = "x-fleet-service-auth";
/// User id returned by the auth handler.
pub const X_FLEET_AUTH_UID: &str = "x-fleet-auth-uid";
/// Percent-encoded JSON data returned by the auth handler.
pub const X_FLEET_AUTH_DATA: &str = "x-fleet-auth-data";
/// Name of the matched endpoint.
pub const X_FLEET_ENDPOINT: &str = "x-fleet-endpoint";
/// JSON object of decoded path parameters.
pub const X_FLEET_PATH_PARAMS: &str = "x-fleet-path-params";
/// Time a shutdown hook may take, in milliseconds.
pub const X_FLEET_HOOK_BUDGET_MS: &str = "x-fleet-hook-budget-ms";

/// Readiness endpoint every service exposes.
pub const READY_PATH: &str = "/__fleet/ready";
/// Shutdown hook endpoint.
pub const SHUTDOWN_PATH: &str = "/__fleet/shutdown";
/// Auth handler endpoint on the service owning the auth handler.
pub const AUTHENTICATE_PATH: &str = "/__fleet/authenticate";

/// Non-ASCII bytes, controls, `%` and space are escaped in JSON headers.
const JSON_HEADER: &AsciiSet = &CONTROLS.add(b'%').add(b' ');

/// Encode JSON for a header value; decode with percent-decoding.
pub fn json_header_value(value: &serde_json::Value) -> Option<HeaderValue> {
    let encoded = utf8_percent_encode(&value.to_string(), JSON_HEADER).to_string();
    HeaderValue::from_str(&encoded).ok()
}

/// Generates a UUID v4 request id.
#[derive(Debug, Clone, Copy, Default)]
pub struct FleetRequestId;

impl MakeRequestId for FleetRequestId {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        let id = Uuid::new_v4().to_string();
        HeaderValue::from_str(&id).ok().map(RequestId::new)
    }
}

pub fn x_request_id() -> HeaderName {
    HeaderName::from_static(X_REQUEST_ID)
}

/// Read the request id set by the request-id layer.
pub fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string()
}

/// Remove every `x-fleet-*` header. Returns the inter-service credential,
/// if one was presented, before it is discarded.
pub fn strip_reserved_headers(headers: &mut HeaderMap) -> Option<ServiceCredential> {
    let credential = headers
        .get(X_FLEET_SERVICE_AUTH)
        .and_then(|v| v.to_str().ok())
        .and_then(ServiceCredential::parse);

    let reserved: Vec<HeaderName> = headers
        .keys()
        .filter(|k| k.as_str().starts_with(RESERVED_PREFIX))
        .cloned()
        .collect();
    for name in reserved {
        headers.remove(name);
    }
    credential
}

/// An inter-service key presented as `<id> <key>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceCredential {
    pub id: u32,
    pub key: String,
}

impl ServiceCredential {
    pub fn parse(value: &str) -> Option<Self> {
        let (id, key) = value.trim().split_once(' ')?;
        let key = key.trim();
        if key.is_empty() {
            return None;
        }
        Some(Self {
            id: id.parse().ok()?,
            key: key.to_string(),
        })
    }
}
