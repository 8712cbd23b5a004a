//! CORS handling for the gateway.
//!
//! # Responsibilities
//! - Answer preflight requests without forwarding them
//! - Add `Access-Control-*` headers to forwarded responses
//!
//! # Design Decisions
//! - Two origin lists: one for requests without credentials, one for
//!   requests carrying cookies or an `Authorization` header
//! - Origins may use a single leading wildcard label (`https://*.example.com`)
//! - Allowed request headers are the policy's plus every header some route
//!   or the auth handler declares; exposed headers likewise

use std::collections::BTreeSet;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Method, Response, StatusCode};

use crate::config::infra::CorsPolicy;
use crate::routing::RouteTable;

const REQUEST_PRIVATE_NETWORK: &str = "access-control-request-private-network";
const ALLOW_PRIVATE_NETWORK: &str = "access-control-allow-private-network";

/// Headers any route may receive.
const ALWAYS_ALLOWED: [&str; 3] = ["authorization", "content-type", "x-request-id"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum OriginMatcher {
    Any,
    Exact(String),
    /// `scheme://*.suffix`, matching one or more labels in place of `*`.
    Subdomain { scheme: String, suffix: String },
}

impl OriginMatcher {
    fn parse(s: &str) -> Self {
        let s = s.trim().to_ascii_lowercase();
        if s == "*" {
            return OriginMatcher::Any;
        }
        if let Some((scheme, rest)) = s.split_once("://*.") {
            return OriginMatcher::Subdomain {
                scheme: format!("{}://", scheme),
                suffix: format!(".{}", rest),
            };
        }
        OriginMatcher::Exact(s)
    }

    fn matches(&self, origin: &str) -> bool {
        match self {
            OriginMatcher::Any => true,
            OriginMatcher::Exact(o) => o == origin,
            OriginMatcher::Subdomain { scheme, suffix } => origin
                .strip_prefix(scheme.as_str())
                .and_then(|host| host.strip_suffix(suffix.as_str()))
                .map(|label| !label.is_empty() && !label.contains('/'))
                .unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Cors {
    policy: CorsPolicy,
    without_credentials: Vec<OriginMatcher>,
    with_credentials: Vec<OriginMatcher>,
}

impl Cors {
    pub fn new(policy: CorsPolicy) -> Self {
        let without_credentials = policy
            .allow_origins_without_credentials
            .iter()
            .map(|o| OriginMatcher::parse(o))
            .collect();
        // A wildcard never grants credentialed access.
        let with_credentials = policy
            .allow_origins_with_credentials
            .iter()
            .map(|o| OriginMatcher::parse(o))
            .filter(|m| *m != OriginMatcher::Any)
            .collect();
        Self {
            policy,
            without_credentials,
            with_credentials,
        }
    }

    pub fn is_preflight(method: &Method, headers: &HeaderMap) -> bool {
        method == Method::OPTIONS
            && headers.contains_key(header::ORIGIN)
            && headers.contains_key(header::ACCESS_CONTROL_REQUEST_METHOD)
    }

    fn allows(&self, origin: &str, credentials: bool) -> bool {
        let origin = origin.to_ascii_lowercase();
        let list = if credentials {
            &self.with_credentials
        } else {
            &self.without_credentials
        };
        list.iter().any(|m| m.matches(&origin))
    }

    fn allowed_request_headers(&self, table: &RouteTable) -> BTreeSet<String> {
        self.policy
            .allow_headers
            .iter()
            .map(|h| h.to_ascii_lowercase())
            .chain(table.request_headers().iter().cloned())
            .chain(ALWAYS_ALLOWED.iter().map(|h| h.to_string()))
            .collect()
    }

    /// Build the response to a preflight request.
    pub fn preflight(&self, headers: &HeaderMap, table: &RouteTable) -> Response<Body> {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::NO_CONTENT;

        let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) else {
            return response;
        };
        let with_credentials = self.allows(origin, true);
        if !with_credentials && !self.allows(origin, false) {
            if self.policy.debug {
                tracing::info!(origin, "CORS preflight rejected: origin not allowed");
            }
            return response;
        }

        let out = response.headers_mut();
        set(out, header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        out.append(header::VARY, HeaderValue::from_static("Origin"));
        if with_credentials {
            out.insert(header::ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
        }
        if let Some(method) = headers.get(header::ACCESS_CONTROL_REQUEST_METHOD) {
            out.insert(header::ACCESS_CONTROL_ALLOW_METHODS, method.clone());
        }

        let requested: Vec<String> = headers
            .get_all(header::ACCESS_CONTROL_REQUEST_HEADERS)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(|h| h.trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        if !requested.is_empty() {
            let any = self.policy.allow_headers.iter().any(|h| h == "*");
            let allowed = self.allowed_request_headers(table);
            let granted: Vec<&str> = requested
                .iter()
                .filter(|h| any || allowed.contains(*h))
                .map(String::as_str)
                .collect();
            if self.policy.debug && granted.len() < requested.len() {
                tracing::info!(origin, requested = ?requested, "CORS preflight: some headers not allowed");
            }
            if !granted.is_empty() {
                set(out, header::ACCESS_CONTROL_ALLOW_HEADERS, &granted.join(", "));
            }
        }

        if self.policy.allow_private_network_access
            && headers
                .get(REQUEST_PRIVATE_NETWORK)
                .map(|v| v.as_bytes().eq_ignore_ascii_case(b"true"))
                .unwrap_or(false)
        {
            out.insert(ALLOW_PRIVATE_NETWORK, HeaderValue::from_static("true"));
        }

        set(out, header::ACCESS_CONTROL_MAX_AGE, &self.policy.max_age_secs.to_string());
        response
    }

    /// Add CORS headers to a forwarded response.
    pub fn apply(&self, request: &HeaderMap, response: &mut HeaderMap, table: &RouteTable) {
        let Some(origin) = request.get(header::ORIGIN).and_then(|v| v.to_str().ok()) else {
            return;
        };
        let credentials =
            request.contains_key(header::COOKIE) || request.contains_key(header::AUTHORIZATION);
        if !self.allows(origin, credentials) {
            if self.policy.debug {
                tracing::info!(origin, credentials, "CORS: origin not allowed");
            }
            return;
        }

        set(response, header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        response.append(header::VARY, HeaderValue::from_static("Origin"));
        if credentials {
            response.insert(header::ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
        }

        let expose: BTreeSet<String> = self
            .policy
            .expose_headers
            .iter()
            .map(|h| h.to_ascii_lowercase())
            .chain(table.response_headers().iter().cloned())
            .collect();
        if !expose.is_empty() {
            let joined = expose.into_iter().collect::<Vec<_>>().join(", ");
            set(response, header::ACCESS_CONTROL_EXPOSE_HEADERS, &joined);
        }
    }
}

fn set(headers: &mut HeaderMap, name: header::HeaderName, value: &str) {
    if let Ok(v) = HeaderValue::from_str(value) {
        headers.insert(name, v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cors() -> Cors {
        Cors::new(CorsPolicy {
            allow_origins_without_credentials: vec!["*".into()],
            allow_origins_with_credentials: vec!["https://*.example.com".into(), "https://app.test".into()],
            allow_headers: vec!["X-Custom".into()],
            expose_headers: vec!["X-Total".into()],
            allow_private_network_access: true,
            ..CorsPolicy::default()
        })
    }

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.append(*k, HeaderValue::from_static(*v));
        }
        h
    }

    #[test]
    fn test_origin_matching() {
        let m = OriginMatcher::parse("https://*.example.com");
        assert!(m.matches("https://app.example.com"));
        assert!(m.matches("https://a.b.example.com"));
        assert!(!m.matches("https://example.com"));
        assert!(!m.matches("http://app.example.com"));
        assert!(!m.matches("https://evil.com/.example.com"));
    }

    #[test]
    fn test_preflight() {
        let req = headers(&[
            ("origin", "https://app.example.com"),
            ("access-control-request-method", "PUT"),
            ("access-control-request-headers", "X-Custom, Content-Type, X-Unknown"),
            ("access-control-request-private-network", "true"),
        ]);
        assert!(Cors::is_preflight(&Method::OPTIONS, &req));

        let resp = cors().preflight(&req, &RouteTable::new());
        let h = resp.headers();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(h["access-control-allow-origin"], "https://app.example.com");
        assert_eq!(h["access-control-allow-credentials"], "true");
        assert_eq!(h["access-control-allow-methods"], "PUT");
        assert_eq!(h["access-control-allow-headers"], "x-custom, content-type");
        assert_eq!(h["access-control-allow-private-network"], "true");
        assert_eq!(h["access-control-max-age"], "7200");
    }

    #[test]
    fn test_credentials_need_credentialed_origin() {
        let c = cors();
        let table = RouteTable::new();

        let mut resp = HeaderMap::new();
        c.apply(&headers(&[("origin", "https://other.org")]), &mut resp, &table);
        assert_eq!(resp["access-control-allow-origin"], "https://other.org");
        assert!(!resp.contains_key("access-control-allow-credentials"));
        assert_eq!(resp["access-control-expose-headers"], "x-total");

        let mut resp = HeaderMap::new();
        c.apply(
            &headers(&[("origin", "https://other.org"), ("cookie", "sid=1")]),
            &mut resp,
            &table,
        );
        assert!(!resp.contains_key("access-control-allow-origin"));

        let mut resp = HeaderMap::new();
        c.apply(
            &headers(&[("origin", "https://app.test"), ("authorization", "Bearer x")]),
            &mut resp,
            &table,
        );
        assert_eq!(resp["access-control-allow-credentials"], "true");
    }

    #[test]
    fn test_wildcard_never_grants_credentials() {
        let c = Cors::new(CorsPolicy {
            allow_origins_with_credentials: vec!["*".into()],
            ..CorsPolicy::default()
        });
        let mut resp = HeaderMap::new();
        c.apply(
            &headers(&[("origin", "https://x.org"), ("cookie", "a=b")]),
            &mut resp,
            &RouteTable::new(),
        );
        assert!(resp.is_empty());
    }
}
