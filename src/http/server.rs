//! Gateway HTTP server.
//!
//! # Responsibilities
//! - Bind every configured listener (plain or TLS) up front
//! - Wire up middleware (tracing, request ID, in-flight tracking)
//! - Dispatch requests through the route table to a selected target
//! - Stop accepting on request and report in-flight work for drain
//!
//! # Request Flow
//! ```text
//! preflight? ──▶ CORS answer
//! strip x-fleet-* ─▶ lookup ─▶ internal check ─▶ auth ─▶ buffer body
//!     ─▶ select target ─▶ forward (one retry on connect failure)
//!     ─▶ passive health ─▶ response headers (hop-by-hop, cookies, CORS)
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, State},
    http::{header, request::Parts, HeaderValue, Request, StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use futures_util::StreamExt;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::config::schema::{GatewayConfig, HealthCheckConfig, ListenerConfig};
use crate::config::InfraConfig;
use crate::http::auth::{self, AuthInfo};
use crate::http::cors::Cors;
use crate::http::error::GatewayError;
use crate::http::request::{
    json_header_value, request_id, strip_reserved_headers, x_request_id, FleetRequestId,
    ServiceCredential, X_FLEET_ENDPOINT, X_FLEET_PATH_PARAMS,
};
use crate::http::response::{enforce_cookie_attributes, strip_hop_by_hop};
use crate::net::connection::RequestTracker;
use crate::net::tls::load_tls_config;
use crate::observability::metrics;
use crate::registry::ServiceRegistry;
use crate::routing::{Exposure, RouteMatch, RouteTable};

/// Client used for every call from the gateway to a service.
pub type HttpClient = Client<HttpConnector, Body>;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// Attempts per request; the second is only made after a connect failure.
const MAX_ATTEMPTS: usize = 2;

pub fn build_client(config: &GatewayConfig) -> HttpClient {
    let mut connector = HttpConnector::new();
    connector.set_connect_timeout(Some(Duration::from_secs(config.connect_timeout_secs)));
    connector.set_nodelay(true);
    Client::builder(TokioExecutor::new()).build(connector)
}

/// Application state injected into handlers.
#[derive(Clone)]
pub struct GatewayState {
    pub routes: Arc<ArcSwap<RouteTable>>,
    pub registry: Arc<ServiceRegistry>,
    pub infra: Arc<InfraConfig>,
    pub cors: Arc<Cors>,
    pub client: HttpClient,
    pub config: GatewayConfig,
    pub health: HealthCheckConfig,
}

impl GatewayState {
    pub fn new(
        config: GatewayConfig,
        health: HealthCheckConfig,
        routes: RouteTable,
        registry: Arc<ServiceRegistry>,
        infra: Arc<InfraConfig>,
    ) -> Self {
        Self {
            routes: Arc::new(ArcSwap::from_pointee(routes)),
            registry,
            cors: Arc::new(Cors::new(infra.cors.clone())),
            infra,
            client: build_client(&config),
            config,
            health,
        }
    }
}

enum BoundListener {
    Plain(TcpListener),
    Tls(std::net::TcpListener, RustlsConfig),
}

/// HTTP gateway with its listeners bound but not yet serving.
pub struct Gateway {
    state: GatewayState,
    listeners: Vec<BoundListener>,
    local_addrs: Vec<SocketAddr>,
    tracker: RequestTracker,
}

impl Gateway {
    /// Bind every listener. Nothing is served until [`Gateway::serve`].
    pub async fn bind(state: GatewayState, listeners: &[ListenerConfig]) -> std::io::Result<Self> {
        let mut bound = Vec::with_capacity(listeners.len());
        let mut local_addrs = Vec::with_capacity(listeners.len());

        for listener in listeners {
            let tcp = TcpListener::bind(&listener.bind_address).await?;
            local_addrs.push(tcp.local_addr()?);
            match &listener.tls {
                None => bound.push(BoundListener::Plain(tcp)),
                Some(tls) => {
                    let config = load_tls_config(&tls.cert_path, &tls.key_path).await?;
                    let std_listener = tcp.into_std()?;
                    std_listener.set_nonblocking(true)?;
                    bound.push(BoundListener::Tls(std_listener, config));
                }
            }
        }

        Ok(Self {
            state,
            listeners: bound,
            local_addrs,
            tracker: RequestTracker::new(),
        })
    }

    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn state(&self) -> &GatewayState {
        &self.state
    }

    /// Build the Axum router with all middleware layers.
    pub fn router(&self) -> Router {
        build_router(self.state.clone(), self.tracker.clone())
    }

    /// Start serving on every bound listener.
    pub fn serve(self) -> GatewayHandle {
        let accept = CancellationToken::new();
        let app = self.router();
        let mut tasks = Vec::with_capacity(self.listeners.len());
        let mut tls_handles = Vec::new();

        for (listener, addr) in self.listeners.into_iter().zip(self.local_addrs.iter().copied()) {
            let app = app.clone().into_make_service_with_connect_info::<SocketAddr>();
            match listener {
                BoundListener::Plain(listener) => {
                    let token = accept.clone();
                    tasks.push(tokio::spawn(async move {
                        tracing::info!(address = %addr, "Gateway listening");
                        let result = axum::serve(listener, app)
                            .with_graceful_shutdown(token.cancelled_owned())
                            .await;
                        if let Err(e) = result {
                            tracing::error!(address = %addr, error = %e, "Gateway listener failed");
                        }
                    }));
                }
                BoundListener::Tls(listener, config) => {
                    let handle = axum_server::Handle::new();
                    tls_handles.push(handle.clone());
                    tasks.push(tokio::spawn(async move {
                        tracing::info!(address = %addr, "Gateway listening (TLS)");
                        let result = axum_server::from_tcp_rustls(listener, config)
                            .handle(handle)
                            .serve(app)
                            .await;
                        if let Err(e) = result {
                            tracing::error!(address = %addr, error = %e, "Gateway listener failed");
                        }
                    }));
                }
            }
        }

        GatewayHandle {
            accept,
            tracker: self.tracker,
            tasks,
            tls_handles,
            local_addrs: self.local_addrs,
        }
    }
}

/// Control over a serving gateway.
pub struct GatewayHandle {
    accept: CancellationToken,
    tracker: RequestTracker,
    tasks: Vec<JoinHandle<()>>,
    tls_handles: Vec<axum_server::Handle>,
    local_addrs: Vec<SocketAddr>,
}

impl GatewayHandle {
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Stop accepting new connections. Requests already received keep
    /// running; idle keep-alive connections are closed.
    pub fn stop_accepting(&self) {
        self.accept.cancel();
        for handle in &self.tls_handles {
            handle.graceful_shutdown(None);
        }
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.active_count()
    }

    /// Wait for in-flight requests to finish. Returns false on timeout.
    pub async fn wait_idle_for(&self, limit: Duration) -> bool {
        self.tracker.wait_idle_for(limit).await
    }

    /// Drop every connection immediately.
    pub fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn build_router(state: GatewayState, tracker: RequestTracker) -> Router {
    Router::new()
        .route("/", any(proxy_handler))
        .route("/{*path}", any(proxy_handler))
        .with_state(state)
        .layer(middleware::from_fn_with_state(tracker, track_in_flight))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(SetRequestIdLayer::new(x_request_id(), FleetRequestId))
                .layer(PropagateRequestIdLayer::new(x_request_id())),
        )
}

/// Count the request as in flight until its response body is done.
async fn track_in_flight(
    State(tracker): State<RequestTracker>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let guard = tracker.track();
    let response = next.run(request).await;
    let (parts, body) = response.into_parts();
    let body = Body::from_stream(body.into_data_stream().map(move |chunk| {
        let _held = &guard;
        chunk
    }));
    Response::from_parts(parts, body)
}

/// Main proxy handler.
async fn proxy_handler(State(state): State<GatewayState>, request: Request<Body>) -> Response {
    let start = Instant::now();
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let (mut parts, body) = request.into_parts();
    let request_id = request_id(&parts.headers);
    let routes = state.routes.load_full();

    if Cors::is_preflight(&parts.method, &parts.headers) {
        return state.cors.preflight(&parts.headers, &routes);
    }

    let credential = strip_reserved_headers(&mut parts.headers);

    tracing::debug!(
        request_id = %request_id,
        method = %parts.method,
        path = %parts.uri.path(),
        "Proxying request"
    );

    let mut service = "none";
    let matched = routes.lookup(&parts.method, parts.uri.path());
    let result = match &matched {
        None => Err(not_found(&parts)),
        Some(m) => {
            service = m.route.service.as_str();
            handle(&state, &routes, m, &parts, body, credential, &request_id, peer).await
        }
    };

    let mut response = match result {
        Ok(response) => response,
        Err(e) => {
            if e.status().is_server_error() {
                tracing::warn!(request_id = %request_id, service, error = %e, "Request failed");
            } else {
                tracing::debug!(request_id = %request_id, error = %e, "Request rejected");
            }
            e.into_response()
        }
    };

    state.cors.apply(&parts.headers, response.headers_mut(), &routes);
    if let Ok(v) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(x_request_id(), v);
    }
    metrics::record_request(parts.method.as_str(), response.status().as_u16(), service, start);
    response
}

fn not_found(parts: &Parts) -> GatewayError {
    GatewayError::NotFound {
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle(
    state: &GatewayState,
    routes: &RouteTable,
    matched: &RouteMatch,
    parts: &Parts,
    body: Body,
    credential: Option<ServiceCredential>,
    request_id: &str,
    peer: Option<SocketAddr>,
) -> Result<Response, GatewayError> {
    let route = &matched.route;
    let timeout = Duration::from_secs(state.config.request_timeout_secs);

    // Internal endpoints are invisible without a valid service key.
    if route.exposure == Exposure::Internal {
        let authorized = credential
            .map(|c| state.infra.verify_service_key(c.id, &c.key))
            .unwrap_or(false);
        if !authorized {
            return Err(not_found(parts));
        }
    }

    let auth_info = if route.auth {
        let handler = routes
            .auth_handler()
            .ok_or_else(|| GatewayError::Internal("no auth handler configured".into()))?;
        Some(
            auth::authenticate(
                &state.client,
                &state.registry,
                handler,
                &parts.headers,
                parts.uri.query(),
                request_id,
                timeout,
            )
            .await?,
        )
    } else {
        None
    };

    let limit = state.config.max_body_bytes;
    let body = axum::body::to_bytes(body, limit).await.map_err(|e| {
        tracing::debug!(request_id, error = %e, "Failed to read request body");
        GatewayError::PayloadTooLarge(limit)
    })?;

    forward(state, matched, parts, body, auth_info.as_ref(), request_id, peer).await
}

async fn forward(
    state: &GatewayState,
    matched: &RouteMatch,
    parts: &Parts,
    body: Bytes,
    auth_info: Option<&AuthInfo>,
    request_id: &str,
    peer: Option<SocketAddr>,
) -> Result<Response, GatewayError> {
    let route = &matched.route;
    let timeout = Duration::from_secs(state.config.request_timeout_secs);
    let unhealthy = state.health.unhealthy_threshold as usize;
    let healthy = state.health.healthy_threshold as usize;
    let mut excluded = Vec::new();
    let mut last_error = None;

    for attempt in 1..=MAX_ATTEMPTS {
        let target = match state.registry.select(&route.service, &excluded) {
            Ok(t) => t,
            Err(e) => return Err(last_error.unwrap_or_else(|| e.into())),
        };

        let mut upstream = Request::builder()
            .method(parts.method.clone())
            .uri(upstream_uri(target.addr, &parts.uri)?)
            .body(Body::from(body.clone()))
            .map_err(|e| GatewayError::Internal(e.to_string()))?;
        *upstream.headers_mut() = forwarded_headers(parts, matched, auth_info, request_id, peer);

        match tokio::time::timeout(timeout, state.client.request(upstream)).await {
            Err(_) => {
                target.mark_failure(unhealthy);
                return Err(GatewayError::GatewayTimeout);
            }
            Ok(Err(e)) if e.is_connect() => {
                tracing::warn!(
                    request_id,
                    service = %route.service,
                    target = %target.addr,
                    attempt,
                    error = %e,
                    "Connect to target failed"
                );
                target.mark_failure(unhealthy);
                excluded.push(target.addr);
                last_error = Some(GatewayError::BadGateway(e.to_string()));
            }
            Ok(Err(e)) => {
                target.mark_failure(unhealthy);
                return Err(GatewayError::BadGateway(e.to_string()));
            }
            Ok(Ok(response)) => {
                match response.status() {
                    StatusCode::BAD_GATEWAY
                    | StatusCode::SERVICE_UNAVAILABLE
                    | StatusCode::GATEWAY_TIMEOUT => {
                        target.mark_failure(unhealthy);
                    }
                    _ => {
                        target.mark_success(healthy);
                    }
                }

                let (mut head, incoming) = response.into_parts();
                strip_hop_by_hop(&mut head.headers);
                enforce_cookie_attributes(&mut head.headers, &route.response);

                // The target stays acquired until the body is streamed out.
                let stream = Body::new(incoming).into_data_stream().map(move |chunk| {
                    let _held = &target;
                    chunk
                });
                return Ok(Response::from_parts(head, Body::from_stream(stream)));
            }
        }
    }

    Err(last_error.unwrap_or_else(|| GatewayError::BadGateway("no attempt made".into())))
}

fn upstream_uri(addr: SocketAddr, original: &Uri) -> Result<Uri, GatewayError> {
    let path_and_query = original.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    format!("http://{}{}", addr, path_and_query)
        .parse()
        .map_err(|e: axum::http::uri::InvalidUri| GatewayError::Internal(e.to_string()))
}

/// Headers for the forwarded request. Reserved headers were stripped from
/// `parts` already; only the gateway sets them from here on.
fn forwarded_headers(
    parts: &Parts,
    matched: &RouteMatch,
    auth_info: Option<&AuthInfo>,
    request_id: &str,
    peer: Option<SocketAddr>,
) -> axum::http::HeaderMap {
    let mut headers = parts.headers.clone();
    strip_hop_by_hop(&mut headers);

    if let Some(host) = headers.remove(header::HOST) {
        headers.insert(X_FORWARDED_HOST, host);
    }
    if let Some(peer) = peer {
        let forwarded = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(prior) => format!("{}, {}", prior, peer.ip()),
            None => peer.ip().to_string(),
        };
        if let Ok(v) = HeaderValue::from_str(&forwarded) {
            headers.insert(X_FORWARDED_FOR, v);
        }
    }
    if let Ok(v) = HeaderValue::from_str(request_id) {
        headers.insert(x_request_id(), v);
    }
    if let Ok(v) = HeaderValue::from_str(&matched.route.endpoint) {
        headers.insert(X_FLEET_ENDPOINT, v);
    }
    if !matched.params.is_empty() {
        let params: serde_json::Map<String, serde_json::Value> = matched
            .params
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();
        if let Some(v) = json_header_value(&serde_json::Value::Object(params)) {
            headers.insert(X_FLEET_PATH_PARAMS, v);
        }
    }
    if let Some(info) = auth_info {
        info.apply(&mut headers);
    }
    headers
}
