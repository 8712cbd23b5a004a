//! Authentication through the fleet's auth handler.
//!
//! The gateway never validates credentials itself. It collects the auth
//! handler's declared parameters from the request and posts them to the
//! reserved `/__fleet/authenticate` endpoint of the service owning the
//! handler:
//!
//! ```text
//! → POST /__fleet/authenticate  {"handler": "AuthHandler", "params": {"token": "..."}}
//! ← 200 {"uid": "user-1", "data": {...}}      authenticated
//! ← 4xx/5xx                                   unauthenticated (401)
//! ```

use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Request};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::http::error::GatewayError;
use crate::http::request::{
    json_header_value, AUTHENTICATE_PATH, X_FLEET_AUTH_DATA, X_FLEET_AUTH_UID, X_REQUEST_ID,
};
use crate::http::server::HttpClient;
use crate::registry::ServiceRegistry;
use crate::routing::router::AuthHandler;

/// Limit on the auth handler's response body.
const MAX_AUTH_RESPONSE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct AuthInfo {
    pub uid: String,
    pub data: Option<Value>,
    uid_header: HeaderValue,
}

impl AuthInfo {
    /// Fails when the uid cannot be carried in a header.
    pub fn new(uid: String, data: Option<Value>) -> Result<Self, GatewayError> {
        let uid_header = HeaderValue::from_str(&uid)
            .map_err(|_| GatewayError::BadGateway("auth handler returned an invalid uid".into()))?;
        Ok(Self {
            uid,
            data,
            uid_header,
        })
    }

    /// Attach the identity to a request forwarded to a service.
    pub fn apply(&self, headers: &mut HeaderMap) {
        headers.insert(X_FLEET_AUTH_UID, self.uid_header.clone());
        if let Some(v) = self.data.as_ref().and_then(json_header_value) {
            headers.insert(X_FLEET_AUTH_DATA, v);
        }
    }
}

#[derive(Serialize)]
struct AuthRequest<'a> {
    handler: &'a str,
    params: Map<String, Value>,
}

#[derive(Deserialize)]
struct AuthResponse {
    uid: String,
    #[serde(default)]
    data: Option<Value>,
}

/// Run the auth handler for one request.
pub async fn authenticate(
    client: &HttpClient,
    registry: &ServiceRegistry,
    handler: &AuthHandler,
    headers: &HeaderMap,
    query: Option<&str>,
    request_id: &str,
    timeout: Duration,
) -> Result<AuthInfo, GatewayError> {
    let params = handler.params.extract(headers, query);
    if !handler.params.is_empty() && params.is_empty() {
        return Err(GatewayError::Unauthenticated("missing credentials".into()));
    }

    let target = registry.select(&handler.service, &[])?;
    let body = serde_json::to_vec(&AuthRequest {
        handler: &handler.name,
        params,
    })
    .map_err(|e| GatewayError::Internal(e.to_string()))?;

    let request = Request::post(format!("http://{}{}", target.addr, AUTHENTICATE_PATH))
        .header(header::CONTENT_TYPE, "application/json")
        .header(X_REQUEST_ID, request_id)
        .body(Body::from(body))
        .map_err(|e| GatewayError::Internal(e.to_string()))?;

    let response = match tokio::time::timeout(timeout, client.request(request)).await {
        Ok(Ok(r)) => r,
        Ok(Err(e)) => {
            tracing::warn!(request_id, service = %handler.service, error = %e, "Auth handler call failed");
            return Err(GatewayError::BadGateway(e.to_string()));
        }
        Err(_) => return Err(GatewayError::GatewayTimeout),
    };

    if !response.status().is_success() {
        tracing::debug!(request_id, status = %response.status(), "Auth handler rejected credentials");
        return Err(GatewayError::Unauthenticated("invalid credentials".into()));
    }

    let bytes = axum::body::to_bytes(Body::new(response.into_body()), MAX_AUTH_RESPONSE)
        .await
        .map_err(|e| GatewayError::BadGateway(e.to_string()))?;
    let parsed: AuthResponse = serde_json::from_slice(&bytes)
        .map_err(|e| GatewayError::BadGateway(format!("invalid auth handler response: {}", e)))?;
    if parsed.uid.is_empty() {
        return Err(GatewayError::Unauthenticated("invalid credentials".into()));
    }

    AuthInfo::new(parsed.uid, parsed.data).map_err(|e| {
        tracing::warn!(request_id, service = %handler.service, "Auth handler returned a uid that is not a valid header value");
        e
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_headers() {
        let info = AuthInfo::new("user-1".into(), Some(serde_json::json!({"name": "Jörg Müller"}))).unwrap();
        let mut headers = HeaderMap::new();
        info.apply(&mut headers);

        assert_eq!(headers[X_FLEET_AUTH_UID], "user-1");
        let data = headers[X_FLEET_AUTH_DATA].to_str().unwrap();
        let decoded = percent_encoding::percent_decode_str(data).decode_utf8().unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(&decoded).unwrap(),
            serde_json::json!({"name": "Jörg Müller"})
        );
    }

    #[test]
    fn test_uid_must_fit_in_a_header() {
        let err = AuthInfo::new("user\n1".into(), None).unwrap_err();
        assert!(matches!(err, GatewayError::BadGateway(_)));
    }
}
