//! The proxy HTTP server.
//!
//! [`ProxyServer`] mounts a single catch-all handler under the configured path
//! prefix. GET requests are streaming pulls relayed as-is; POST and DELETE are
//! commands that go through the [`RetryController`]. An optional shared secret
//! is checked before anything else happens.
//!
//! ```rust,no_run
//! use relay402::config::ProxyConfig;
//! use relay402::server::ProxyServer;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ProxyConfig::builder()
//!     .upstream_url("https://tools.example/mcp")
//!     .build()?;
//! let mut server = ProxyServer::new(config);
//! let addr = server.start().await?;
//! println!("proxy on http://{addr}/mcp");
//! server.stop().await?;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{Query, Request, State};
use axum::http::header::{AUTHORIZATION, CONTENT_LENGTH};
use axum::http::{HeaderMap, Method};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use futures_util::{FutureExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::ProxyConfig;
use crate::error::{ProxyError, ServerError};
use crate::headers;
use crate::message::JsonRpcMessage;
use crate::payment::{PaymentObserver, PaymentResolver};
use crate::retry::{RetryController, UpstreamCall};
use crate::upstream;

/// Query parameters understood by the proxy handler. Others are ignored.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct InboundQuery {
    /// Dynamic upstream override, checked against the allowlist.
    pub url: Option<String>,
    /// Opaque caller token handed to the resolver and observer.
    pub token: Option<String>,
}

#[derive(Clone)]
struct ProxyState {
    config: Arc<ProxyConfig>,
    controller: RetryController,
    shutdown: CancellationToken,
}

struct Running {
    local_addr: SocketAddr,
    handle: JoinHandle<std::io::Result<()>>,
}

/// Streaming MCP reverse proxy with one-shot payment retry.
pub struct ProxyServer {
    config: Arc<ProxyConfig>,
    client: reqwest::Client,
    resolver: Option<Arc<dyn PaymentResolver>>,
    observer: Option<Arc<dyn PaymentObserver>>,
    shutdown: CancellationToken,
    running: Option<Running>,
}

impl std::fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServer")
            .field("config", &self.config)
            .field("resolver", &self.resolver.is_some())
            .field("observer", &self.observer.is_some())
            .field("local_addr", &self.local_addr())
            .finish_non_exhaustive()
    }
}

impl ProxyServer {
    /// Creates a stopped server.
    #[must_use]
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config: Arc::new(config),
            client: reqwest::Client::new(),
            resolver: None,
            observer: None,
            shutdown: CancellationToken::new(),
            running: None,
        }
    }

    /// Uses a preconfigured HTTP client for upstream calls.
    #[must_use]
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Enables the payment retry with the given resolver.
    #[must_use]
    pub fn with_resolver(mut self, resolver: impl PaymentResolver + 'static) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    /// Reports paid retries to the given observer.
    #[must_use]
    pub fn with_observer(mut self, observer: impl PaymentObserver + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// The configuration the server was built with.
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Address the listener is bound to, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    /// Builds the proxy router, for embedding into a larger application.
    ///
    /// In-flight streams served by this router end when the server is stopped.
    pub fn router(&self) -> Router {
        let state = ProxyState {
            config: Arc::clone(&self.config),
            controller: RetryController::new(self.client.clone(), Arc::clone(&self.config))
                .with_resolver(self.resolver.clone())
                .with_observer(self.observer.clone()),
            shutdown: self.shutdown.clone(),
        };

        let mount = self.config.mount_path();
        let routes = if mount == "/" {
            Router::new()
                .route("/", any(proxy_handler))
                .route("/{*rest}", any(proxy_handler))
        } else {
            Router::new()
                .route(mount, any(proxy_handler))
                .route(&format!("{mount}/{{*rest}}"), any(proxy_handler))
        };

        routes
            .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer))
            .with_state(state)
    }

    /// Binds the listener and starts serving in the background.
    ///
    /// Returns the bound address, which differs from the configured one when
    /// port `0` was requested.
    ///
    /// # Errors
    ///
    /// [`ServerError::AlreadyStarted`] if the server is running, or
    /// [`ServerError::Bind`] if the address cannot be bound.
    pub async fn start(&mut self) -> Result<SocketAddr, ServerError> {
        self.start_with(std::convert::identity).await
    }

    /// Like [`start`](Self::start), but lets `compose` add routes and layers
    /// around the proxy router before serving. Routes added this way are not
    /// subject to the shared-secret check.
    ///
    /// # Errors
    ///
    /// See [`start`](Self::start).
    pub async fn start_with(
        &mut self,
        compose: impl FnOnce(Router) -> Router,
    ) -> Result<SocketAddr, ServerError> {
        if self.running.is_some() {
            return Err(ServerError::AlreadyStarted);
        }
        if self.shutdown.is_cancelled() {
            self.shutdown = CancellationToken::new();
        }

        let addr = self.config.listen();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        let app = compose(self.router());
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
        });

        tracing::info!(
            "Proxy listening on http://{local_addr}{}",
            self.config.mount_path()
        );
        self.running = Some(Running { local_addr, handle });
        Ok(local_addr)
    }

    /// Stops accepting connections, ends open streams and waits for the
    /// serve task. Does nothing if the server is not running.
    ///
    /// # Errors
    ///
    /// Returns the serve loop's failure, if it had one.
    pub async fn stop(&mut self) -> Result<(), ServerError> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        self.shutdown.cancel();
        running.handle.await??;
        tracing::info!("Proxy stopped");
        Ok(())
    }
}

impl Drop for ProxyServer {
    fn drop(&mut self) {
        if self.running.is_some() {
            self.shutdown.cancel();
        }
    }
}

async fn require_bearer(State(state): State<ProxyState>, req: Request, next: Next) -> Response {
    let Some(expected) = state.config.inbound_bearer_token() else {
        return next.run(req).await;
    };

    let presented = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);

    // TODO: compare in constant time once a vetted helper is in the dependency tree.
    if presented == Some(expected) {
        next.run(req).await
    } else {
        tracing::warn!("Rejected request with missing or invalid bearer token");
        ProxyError::Unauthorized.into_response()
    }
}

#[instrument(name = "relay402.request", skip_all, fields(method = %method))]
async fn proxy_handler(
    State(state): State<ProxyState>,
    method: Method,
    Query(query): Query<InboundQuery>,
    inbound: HeaderMap,
    body: Body,
) -> Response {
    let handled = AssertUnwindSafe(handle(state, method, query, inbound, body))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(ProxyError::Internal("request handler panicked".to_owned())));
    match handled {
        Ok(res) => res,
        Err(err) => err.into_response(),
    }
}

async fn handle(
    state: ProxyState,
    method: Method,
    query: InboundQuery,
    inbound: HeaderMap,
    body: Body,
) -> Result<Response, ProxyError> {
    let streaming_pull = method == Method::GET;
    if !streaming_pull && method != Method::POST && method != Method::DELETE {
        return Err(ProxyError::MethodNotAllowed(method));
    }

    let target = upstream::resolve(query.url.as_deref(), &state.config)?;

    let body = if streaming_pull {
        Bytes::new()
    } else {
        read_body(body, &inbound, state.config.max_body_bytes()).await?
    };
    log_message(&body);

    let call = UpstreamCall {
        headers: headers::translate(&inbound, &method, &state.config),
        method,
        target,
        body,
        caller_token: query.token,
    };
    // Dropping this future (caller gone) cancels the request token. Streamed
    // bodies carry their own guard, so the handler's is disarmed on return.
    let cancel = state.shutdown.child_token();
    let guard = cancel.clone().drop_guard();
    let result = state.controller.execute(call, cancel).await;
    guard.disarm();
    result
}

async fn read_body(body: Body, inbound: &HeaderMap, limit: usize) -> Result<Bytes, ProxyError> {
    let declared = inbound
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared.is_some_and(|len| len > limit) {
        return Err(ProxyError::PayloadTooLarge { limit });
    }

    let mut buf = Vec::with_capacity(declared.unwrap_or_default());
    let mut chunks = body.into_data_stream();
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(|err| ProxyError::InvalidBody(err.to_string()))?;
        if buf.len() + chunk.len() > limit {
            return Err(ProxyError::PayloadTooLarge { limit });
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(buf))
}

fn log_message(body: &[u8]) {
    if body.is_empty() {
        return;
    }
    match JsonRpcMessage::parse(body) {
        Some(msg) => {
            let kind = if msg.is_notification() {
                "notification"
            } else if msg.is_request() {
                "request"
            } else {
                "response"
            };
            tracing::debug!(
                kind,
                rpc_method = msg.method.as_deref(),
                rpc_id = ?msg.id,
                "Incoming JSON-RPC message"
            );
        }
        None => tracing::debug!(bytes = body.len(), "Incoming body is not a JSON-RPC 2.0 message"),
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use tower::ServiceExt;

    use super::*;

    fn server(config: ProxyConfig) -> ProxyServer {
        ProxyServer::new(config)
    }

    fn request(method: Method, uri: &str) -> Request {
        axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn unsupported_method_is_405() {
        let app = server(
            ProxyConfig::builder()
                .upstream_url("http://127.0.0.1:9/mcp")
                .build()
                .unwrap(),
        )
        .router();
        let res = app.oneshot(request(Method::PUT, "/mcp")).await.unwrap();
        assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn missing_secret_is_401_before_method_check() {
        let app = server(
            ProxyConfig::builder()
                .upstream_url("http://127.0.0.1:9/mcp")
                .inbound_bearer_token("s3cret")
                .build()
                .unwrap(),
        )
        .router();
        let res = app.oneshot(request(Method::PUT, "/mcp")).await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn foreign_override_is_400() {
        let app = server(
            ProxyConfig::builder()
                .allowed_upstream_hosts(["good.example"])
                .build()
                .unwrap(),
        )
        .router();
        let res = app
            .oneshot(request(Method::POST, "/mcp?url=http://Evil.Example/mcp"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn oversized_body_is_413() {
        let app = server(
            ProxyConfig::builder()
                .upstream_url("http://127.0.0.1:9/mcp")
                .max_body_bytes(8)
                .build()
                .unwrap(),
        )
        .router();
        let req = axum::http::Request::builder()
            .method(Method::POST)
            .uri("/mcp")
            .body(Body::from("0123456789"))
            .unwrap();
        let res = app.oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn unmounted_path_is_404() {
        let app = server(
            ProxyConfig::builder()
                .upstream_url("http://127.0.0.1:9/mcp")
                .build()
                .unwrap(),
        )
        .router();
        let res = app.oneshot(request(Method::GET, "/other")).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stop_without_start_is_noop() {
        let mut server = server(
            ProxyConfig::builder()
                .upstream_url("http://127.0.0.1:9/mcp")
                .build()
                .unwrap(),
        );
        assert!(server.stop().await.is_ok());
        assert!(server.local_addr().is_none());
    }
}
