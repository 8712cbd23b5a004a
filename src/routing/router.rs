//! Route lookup and dispatch.
//!
//! # Responsibilities
//! - Compile service route schemas into per-method segment tries
//! - Reject ambiguous patterns when a schema is added
//! - Look up the route for a request and extract its path parameters
//!
//! # Design Decisions
//! - Immutable after construction; updates build a new table (copy-on-write)
//!   that the gateway swaps in atomically
//! - Priority is structural, not registration order: at every segment a
//!   literal beats a parameter, which beats a wildcard. Lookup backtracks, so
//!   a more specific prefix that dead-ends still lets a less specific
//!   route match.
//! - Fallback routes are only consulted when no other route matches; the
//!   deepest applicable fallback wins
//! - Explicit no-match rather than silent default

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use axum::http::Method;
use percent_encoding::percent_decode_str;
use serde::Serialize;

use crate::routing::fields::FieldMap;
use crate::routing::path::{split_path, PathPattern, PatternError, Segment};
use crate::routing::schema::ServiceSchema;

/// Methods an endpoint declared with `*` is registered for.
const ANY_METHODS: [Method; 9] = [
    Method::GET,
    Method::HEAD,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::CONNECT,
    Method::OPTIONS,
    Method::TRACE,
    Method::PATCH,
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("endpoint {service}.{endpoint}: invalid path '{path}': {source}")]
    InvalidPattern {
        service: String,
        endpoint: String,
        path: String,
        #[source]
        source: PatternError,
    },

    #[error("endpoint {service}.{endpoint}: invalid method '{method}'")]
    InvalidMethod {
        service: String,
        endpoint: String,
        method: String,
    },

    #[error("{method} {path} ({service}.{endpoint}) conflicts with {existing}")]
    Conflict {
        method: Method,
        path: String,
        service: String,
        endpoint: String,
        existing: String,
    },

    #[error("service {service} declares an auth handler, but {existing} already does")]
    DuplicateAuthHandler { service: String, existing: String },

    #[error("endpoint {service}.{endpoint}: path field '{field}' is not a parameter of '{path}'")]
    UnknownPathField {
        service: String,
        endpoint: String,
        path: String,
        field: String,
    },
}

/// Whether a route can be reached from outside the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Exposure {
    Public,
    Internal,
}

/// One endpoint of one service, for one method.
#[derive(Debug)]
pub struct RouteDescriptor {
    pub endpoint: String,
    pub service: String,
    pub method: Method,
    pub pattern: PathPattern,
    pub auth: bool,
    pub exposure: Exposure,
    pub request: FieldMap,
    pub response: FieldMap,
}

impl RouteDescriptor {
    fn qualified_name(&self) -> String {
        format!("{}.{}", self.service, self.endpoint)
    }

    pub fn summary(&self) -> RouteSummary {
        RouteSummary {
            service: self.service.clone(),
            endpoint: self.endpoint.clone(),
            method: self.method.to_string(),
            path: self.pattern.to_string(),
            auth: self.auth,
            exposure: self.exposure,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteSummary {
    pub service: String,
    pub endpoint: String,
    pub method: String,
    pub path: String,
    pub auth: bool,
    pub exposure: Exposure,
}

/// The auth handler and the service that owns it.
#[derive(Debug)]
pub struct AuthHandler {
    pub service: String,
    pub name: String,
    pub params: FieldMap,
}

/// Result of a successful lookup.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub route: Arc<RouteDescriptor>,
    /// Path parameters in pattern order, percent-decoded.
    pub params: Vec<(String, String)>,
}

impl RouteMatch {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, Default)]
struct Node {
    literals: HashMap<String, Node>,
    param: Option<Box<Node>>,
    route: Option<Arc<RouteDescriptor>>,
    wildcard: Option<Arc<RouteDescriptor>>,
    fallback: Option<Arc<RouteDescriptor>>,
}

impl Node {
    fn insert(&mut self, segments: &[Segment], route: Arc<RouteDescriptor>) -> Result<(), Arc<RouteDescriptor>> {
        let slot = match segments.split_first() {
            None => &mut self.route,
            Some((Segment::Literal(lit), rest)) => {
                return self.literals.entry(lit.clone()).or_default().insert(rest, route);
            }
            Some((Segment::Param(_), rest)) => {
                return self.param.get_or_insert_with(Default::default).insert(rest, route);
            }
            Some((Segment::Wildcard(_), _)) => &mut self.wildcard,
            Some((Segment::Fallback(_), _)) => &mut self.fallback,
        };
        match slot {
            Some(existing) => Err(existing.clone()),
            None => {
                *slot = Some(route);
                Ok(())
            }
        }
    }

    fn find<'a>(
        &'a self,
        segments: &[&str],
        depth: usize,
        fallback: &mut Option<(usize, &'a Arc<RouteDescriptor>)>,
    ) -> Option<&'a Arc<RouteDescriptor>> {
        if let Some(f) = &self.fallback {
            if fallback.map_or(true, |(d, _)| depth > d) {
                *fallback = Some((depth, f));
            }
        }

        match segments.split_first() {
            None => {
                if let Some(r) = &self.route {
                    return Some(r);
                }
            }
            Some((head, rest)) => {
                if let Some(child) = self.literals.get(*head) {
                    if let Some(r) = child.find(rest, depth + 1, fallback) {
                        return Some(r);
                    }
                }
                if !head.is_empty() {
                    if let Some(child) = &self.param {
                        if let Some(r) = child.find(rest, depth + 1, fallback) {
                            return Some(r);
                        }
                    }
                }
            }
        }

        self.wildcard.as_ref()
    }
}

/// Compiled routes for every service in the fleet.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    trees: HashMap<Method, Node>,
    routes: Vec<Arc<RouteDescriptor>>,
    auth_handler: Option<Arc<AuthHandler>>,
    request_headers: BTreeSet<String>,
    response_headers: BTreeSet<String>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a new table from this one plus `schema`. `self` is untouched on error.
    pub fn with_schema(&self, schema: &ServiceSchema) -> Result<Self, RouteError> {
        let mut next = self.clone();
        next.add_schema(schema)?;
        Ok(next)
    }

    pub fn add_schema(&mut self, schema: &ServiceSchema) -> Result<(), RouteError> {
        let service = &schema.service;

        if let Some(handler) = &schema.auth_handler {
            if let Some(existing) = &self.auth_handler {
                return Err(RouteError::DuplicateAuthHandler {
                    service: service.clone(),
                    existing: existing.service.clone(),
                });
            }
            self.auth_handler = Some(Arc::new(AuthHandler {
                service: service.clone(),
                name: handler.name.clone(),
                params: FieldMap::for_auth(&handler.params),
            }));
        }

        for endpoint in &schema.endpoints {
            let pattern = PathPattern::parse(&endpoint.path).map_err(|source| RouteError::InvalidPattern {
                service: service.clone(),
                endpoint: endpoint.name.clone(),
                path: endpoint.path.clone(),
                source,
            })?;

            let mut methods: Vec<Method> = Vec::new();
            for m in endpoint.method_list() {
                let expanded = if m == "*" {
                    ANY_METHODS.to_vec()
                } else {
                    vec![Method::from_bytes(m.as_bytes()).map_err(|_| RouteError::InvalidMethod {
                        service: service.clone(),
                        endpoint: endpoint.name.clone(),
                        method: m.clone(),
                    })?]
                };
                for method in expanded {
                    if !methods.contains(&method) {
                        methods.push(method);
                    }
                }
            }

            let response = FieldMap::for_response(&endpoint.response);
            for method in methods {
                let request = FieldMap::for_request(&endpoint.request, &method);
                if let Some(field) = request
                    .path_fields()
                    .find(|f| !pattern.param_names().any(|p| p == *f))
                {
                    return Err(RouteError::UnknownPathField {
                        service: service.clone(),
                        endpoint: endpoint.name.clone(),
                        path: endpoint.path.clone(),
                        field: field.to_string(),
                    });
                }
                self.request_headers
                    .extend(request.header_names().map(|h| h.to_ascii_lowercase()));

                let route = Arc::new(RouteDescriptor {
                    endpoint: endpoint.name.clone(),
                    service: service.clone(),
                    method: method.clone(),
                    pattern: pattern.clone(),
                    auth: endpoint.auth,
                    exposure: if endpoint.expose {
                        Exposure::Public
                    } else {
                        Exposure::Internal
                    },
                    request,
                    response: response.clone(),
                });

                self.trees
                    .entry(method.clone())
                    .or_default()
                    .insert(pattern.segments(), route.clone())
                    .map_err(|existing| RouteError::Conflict {
                        method: method.clone(),
                        path: endpoint.path.clone(),
                        service: service.clone(),
                        endpoint: endpoint.name.clone(),
                        existing: format!("{} ({})", existing.pattern, existing.qualified_name()),
                    })?;
                self.routes.push(route);
            }
            self.response_headers
                .extend(response.header_names().map(|h| h.to_ascii_lowercase()));
        }

        if let Some(handler) = &self.auth_handler {
            self.request_headers
                .extend(handler.params.header_names().map(|h| h.to_ascii_lowercase()));
        }

        tracing::info!(service = %service, endpoints = schema.endpoints.len(), "Routes registered");
        Ok(())
    }

    /// Find the route for `method` and `path`.
    pub fn lookup(&self, method: &Method, path: &str) -> Option<RouteMatch> {
        let tree = self.trees.get(method)?;
        let segments = split_path(path);

        let mut fallback = None;
        let route = match tree.find(&segments, 0, &mut fallback) {
            Some(r) => r,
            None => fallback.map(|(_, r)| r)?,
        };

        Some(RouteMatch {
            params: extract_params(&route.pattern, &segments),
            route: route.clone(),
        })
    }

    pub fn routes(&self) -> &[Arc<RouteDescriptor>] {
        &self.routes
    }

    pub fn auth_handler(&self) -> Option<&Arc<AuthHandler>> {
        self.auth_handler.as_ref()
    }

    /// Request headers some route declares, lowercase.
    pub fn request_headers(&self) -> &BTreeSet<String> {
        &self.request_headers
    }

    /// Response headers some route declares, lowercase.
    pub fn response_headers(&self) -> &BTreeSet<String> {
        &self.response_headers
    }
}

fn decode(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}

fn extract_params(pattern: &PathPattern, segments: &[&str]) -> Vec<(String, String)> {
    let mut params = Vec::new();
    for (i, seg) in pattern.segments().iter().enumerate() {
        match seg {
            Segment::Literal(_) => {}
            Segment::Param(name) => {
                if let Some(value) = segments.get(i) {
                    params.push((name.clone(), decode(value)));
                }
            }
            Segment::Wildcard(name) | Segment::Fallback(name) => {
                let rest = segments.get(i..).unwrap_or(&[]);
                params.push((name.clone(), decode(&rest.join("/"))));
            }
        }
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::schema::{EndpointSchema, FieldLocation, FieldSchema};

    fn endpoint(name: &str, method: &str, path: &str) -> EndpointSchema {
        EndpointSchema {
            name: name.into(),
            method: Some(method.into()),
            methods: Vec::new(),
            path: path.into(),
            auth: false,
            expose: true,
            request: Vec::new(),
            response: Vec::new(),
        }
    }

    fn schema(service: &str, endpoints: Vec<EndpointSchema>) -> ServiceSchema {
        ServiceSchema {
            service: service.into(),
            endpoints,
            auth_handler: None,
        }
    }

    fn table(endpoints: Vec<EndpointSchema>) -> RouteTable {
        RouteTable::new().with_schema(&schema("svc", endpoints)).unwrap()
    }

    fn matched(t: &RouteTable, method: Method, path: &str) -> Option<String> {
        t.lookup(&method, path).map(|m| m.route.endpoint.clone())
    }

    #[test]
    fn test_param_and_wildcard_extraction() {
        let t = table(vec![endpoint("Comments", "GET", "/blog/:id/*path")]);
        let m = t.lookup(&Method::GET, "/blog/42/comments/5").unwrap();
        assert_eq!(m.route.endpoint, "Comments");
        assert_eq!(m.param("id"), Some("42"));
        assert_eq!(m.param("path"), Some("comments/5"));
    }

    #[test]
    fn test_literal_beats_param_beats_wildcard() {
        // Registration order deliberately reversed.
        let t = table(vec![
            endpoint("Any", "GET", "/blog/*rest"),
            endpoint("ById", "GET", "/blog/:id"),
            endpoint("Latest", "GET", "/blog/latest"),
        ]);
        assert_eq!(matched(&t, Method::GET, "/blog/latest").as_deref(), Some("Latest"));
        assert_eq!(matched(&t, Method::GET, "/blog/7").as_deref(), Some("ById"));
        assert_eq!(matched(&t, Method::GET, "/blog/7/x").as_deref(), Some("Any"));
        assert_eq!(matched(&t, Method::GET, "/blog").as_deref(), Some("Any"));
    }

    #[test]
    fn test_backtracks_from_dead_end_literal() {
        let t = table(vec![
            endpoint("Edit", "GET", "/posts/new/edit"),
            endpoint("Show", "GET", "/posts/:id"),
        ]);
        assert_eq!(matched(&t, Method::GET, "/posts/new").as_deref(), Some("Show"));
    }

    #[test]
    fn test_fallback_only_when_nothing_matches() {
        let t = table(vec![
            endpoint("Root", "GET", "/!fallback"),
            endpoint("ApiFallback", "GET", "/api/!rest"),
            endpoint("Users", "GET", "/api/users"),
        ]);
        assert_eq!(matched(&t, Method::GET, "/api/users").as_deref(), Some("Users"));
        assert_eq!(matched(&t, Method::GET, "/api/other/x").as_deref(), Some("ApiFallback"));
        assert_eq!(matched(&t, Method::GET, "/static/app.js").as_deref(), Some("Root"));

        let m = t.lookup(&Method::GET, "/static/app.js").unwrap();
        assert_eq!(m.param("fallback"), Some("static/app.js"));
    }

    #[test]
    fn test_params_percent_decoded_and_non_empty() {
        let t = table(vec![endpoint("User", "GET", "/users/:name")]);
        let m = t.lookup(&Method::GET, "/users/j%C3%B6rg").unwrap();
        assert_eq!(m.param("name"), Some("jörg"));
        assert!(t.lookup(&Method::GET, "/users/").is_none());
    }

    #[test]
    fn test_method_specific() {
        let t = table(vec![
            endpoint("Get", "GET", "/items/:id"),
            endpoint("Put", "PUT", "/items/:id"),
        ]);
        assert_eq!(matched(&t, Method::PUT, "/items/1").as_deref(), Some("Put"));
        assert!(t.lookup(&Method::DELETE, "/items/1").is_none());
    }

    #[test]
    fn test_any_method() {
        let mut ep = endpoint("Raw", "*", "/raw/*path");
        ep.method = None;
        let t = table(vec![ep]);
        assert!(t.lookup(&Method::DELETE, "/raw/x").is_some());
        assert!(t.lookup(&Method::PATCH, "/raw").is_some());
    }

    #[test]
    fn test_conflicts_rejected() {
        let err = RouteTable::new()
            .with_schema(&schema(
                "svc",
                vec![endpoint("A", "GET", "/a/:id"), endpoint("B", "GET", "/a/:name")],
            ))
            .unwrap_err();
        assert!(matches!(err, RouteError::Conflict { .. }));

        let base = table(vec![endpoint("A", "GET", "/a/*rest")]);
        let err = base
            .with_schema(&schema("other", vec![endpoint("B", "GET", "/a/*tail")]))
            .unwrap_err();
        assert!(matches!(err, RouteError::Conflict { .. }));
        // The original table is unchanged.
        assert_eq!(base.routes().len(), 1);

        // Different methods never conflict.
        assert!(base
            .with_schema(&schema("other", vec![endpoint("B", "POST", "/a/*tail")]))
            .is_ok());
    }

    #[test]
    fn test_invalid_pattern_and_method() {
        let err = RouteTable::new()
            .with_schema(&schema("svc", vec![endpoint("A", "GET", "/a/*rest/b")]))
            .unwrap_err();
        assert!(matches!(err, RouteError::InvalidPattern { .. }));

        let err = RouteTable::new()
            .with_schema(&schema("svc", vec![endpoint("A", "G ET", "/a")]))
            .unwrap_err();
        assert!(matches!(err, RouteError::InvalidMethod { .. }));
    }

    #[test]
    fn test_unknown_path_field() {
        let mut ep = endpoint("A", "GET", "/a/:id");
        ep.request.push(FieldSchema {
            name: "slug".into(),
            location: Some(FieldLocation::Path),
        });
        let err = RouteTable::new().with_schema(&schema("svc", vec![ep])).unwrap_err();
        assert!(matches!(err, RouteError::UnknownPathField { .. }));
    }

    #[test]
    fn test_exposure_and_headers() {
        let mut internal = endpoint("Internal", "POST", "/internal/sync");
        internal.expose = false;
        internal.request.push(FieldSchema {
            name: "trace".into(),
            location: Some(FieldLocation::Header(Some("X-Trace".into()))),
        });
        let t = table(vec![internal]);
        let m = t.lookup(&Method::POST, "/internal/sync").unwrap();
        assert_eq!(m.route.exposure, Exposure::Internal);
        assert!(t.request_headers().contains("x-trace"));
    }

    #[test]
    fn test_single_auth_handler() {
        use crate::routing::schema::AuthHandlerSchema;
        let mut a = schema("a", vec![]);
        a.auth_handler = Some(AuthHandlerSchema {
            name: "Auth".into(),
            params: Vec::new(),
        });
        let mut b = a.clone();
        b.service = "b".into();

        let t = RouteTable::new().with_schema(&a).unwrap();
        assert_eq!(t.auth_handler().unwrap().service, "a");
        assert!(matches!(
            t.with_schema(&b),
            Err(RouteError::DuplicateAuthHandler { .. })
        ));
    }
}
