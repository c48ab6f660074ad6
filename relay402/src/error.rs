//! Error types for the proxy request path and server lifecycle.
//!
//! [`ProxyError`] is the request-path taxonomy; every variant maps to exactly
//! one caller-visible status code through its [`IntoResponse`] impl. Details of
//! upstream and internal failures are logged, never sent to the caller.

use axum::Json;
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Why an upstream target could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BadUpstream {
    /// The `?url=` override is not an absolute URL.
    #[error("invalid upstream url: {0}")]
    InvalidUrl(String),
    /// An override was given but no allowlist is configured.
    #[error("dynamic upstream not permitted")]
    DynamicNotPermitted,
    /// The override's hostname is not on the allowlist.
    #[error("host not allowed: {0}")]
    HostNotAllowed(String),
    /// Neither an override nor a default upstream is available.
    #[error("no upstream available")]
    NoUpstream,
}

/// Errors surfaced on the request path.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Upstream resolution failed (400).
    #[error(transparent)]
    BadUpstream(#[from] BadUpstream),

    /// Missing or invalid shared secret (401).
    #[error("unauthorized")]
    Unauthorized,

    /// Method other than GET, POST or DELETE (405).
    #[error("method {0} is not supported")]
    MethodNotAllowed(Method),

    /// Inbound command body exceeds the configured cap (413).
    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge {
        /// Configured limit in bytes.
        limit: usize,
    },

    /// Inbound body could not be read (400).
    #[error("invalid request body: {0}")]
    InvalidBody(String),

    /// Network-level failure talking to the upstream (502).
    #[error("upstream transport failure: {0}")]
    UpstreamTransport(#[source] reqwest::Error),

    /// The upstream did not answer within the per-attempt deadline (502).
    #[error("upstream did not respond within {0:?}")]
    UpstreamTimeout(std::time::Duration),

    /// The client went away while the request was in flight.
    #[error("request cancelled by client")]
    Cancelled,

    /// Unexpected proxy-internal failure (500).
    #[error("internal proxy error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// Returns the status code this error is reported with.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadUpstream(_) | Self::InvalidBody(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::UpstreamTransport(_) | Self::UpstreamTimeout(_) => StatusCode::BAD_GATEWAY,
            // 499: client closed request.
            Self::Cancelled => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            Self::BadUpstream(err) => (
                status,
                Json(json!({ "error": "Bad Request", "message": err.to_string() })),
            )
                .into_response(),
            Self::InvalidBody(msg) => (
                status,
                Json(json!({ "error": "Bad Request", "message": msg })),
            )
                .into_response(),
            Self::Unauthorized => (status, "Unauthorized").into_response(),
            Self::MethodNotAllowed(method) => {
                let body = Json(json!({
                    "error": "Method Not Allowed",
                    "message": format!(
                        "Method {method} is not supported. Use GET for event streams or POST/DELETE for JSON-RPC."
                    ),
                }));
                let mut res = (status, body).into_response();
                res.headers_mut()
                    .insert(header::ALLOW, HeaderValue::from_static("GET, POST, DELETE"));
                res
            }
            Self::PayloadTooLarge { limit } => (
                status,
                Json(json!({
                    "error": "Payload Too Large",
                    "message": format!("request body exceeds {limit} bytes"),
                })),
            )
                .into_response(),
            Self::UpstreamTransport(_) | Self::UpstreamTimeout(_) => {
                tracing::error!(error = %self, "Upstream unreachable");
                (
                    status,
                    Json(json!({ "error": "Bad Gateway", "message": "upstream unavailable" })),
                )
                    .into_response()
            }
            Self::Cancelled => status.into_response(),
            Self::Internal(detail) => {
                tracing::error!(%detail, "Internal proxy error");
                (status, "Internal Server Error").into_response()
            }
        }
    }
}

/// Errors raised while building a [`ProxyConfig`](crate::config::ProxyConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Neither a default upstream nor an allowlist was configured.
    #[error("either a default upstream url or an upstream host allowlist is required")]
    NoUpstream,
    /// The default upstream URL could not be parsed.
    #[error("invalid upstream url {url}: {source}")]
    InvalidUpstreamUrl {
        /// The rejected input.
        url: String,
        /// The underlying parse error.
        #[source]
        source: url::ParseError,
    },
    /// A bearer token contains characters not allowed in a header value.
    #[error("bearer token is not a valid header value")]
    InvalidBearerToken,
}

/// Errors raised by [`ProxyServer`](crate::server::ProxyServer) lifecycle calls.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// `start` was called on a running server.
    #[error("proxy server already started")]
    AlreadyStarted,
    /// The listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: std::net::SocketAddr,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The serve loop ended with an I/O error.
    #[error("proxy server failed: {0}")]
    Serve(#[from] std::io::Error),
    /// The serve task panicked or was aborted.
    #[error("proxy server task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_upstream_maps_to_400() {
        let err = ProxyError::from(BadUpstream::HostNotAllowed("evil.example".into()));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.to_string(), "host not allowed: evil.example");
    }

    #[test]
    fn method_not_allowed_sets_allow_header() {
        let res = ProxyError::MethodNotAllowed(Method::PUT).into_response();
        assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(res.headers()[header::ALLOW], "GET, POST, DELETE");
    }

    #[test]
    fn internal_error_hides_detail() {
        let res = ProxyError::Internal("secret stack".into()).into_response();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
