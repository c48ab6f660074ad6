//! HTTP header names, media types and protocol defaults used by the proxy.

/// Header carrying the resolver's payment credential on the retried request
/// (proxy → upstream). Never accepted from the caller.
pub const PAYMENT_CREDENTIAL_HEADER: &str = "x-payment";

/// Header carrying the MCP protocol revision negotiated with the upstream.
pub const PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";

/// Protocol revision stamped on outbound requests that do not carry one.
pub const DEFAULT_PROTOCOL_VERSION: &str = "2025-06-18";

/// Media type of server-sent event streams.
pub const EVENT_STREAM_MEDIA_TYPE: &str = "text/event-stream";

/// Media type of JSON-RPC command replies.
pub const JSON_MEDIA_TYPE: &str = "application/json";

/// HTTP 402 Payment Required status code.
pub const HTTP_STATUS_PAYMENT_REQUIRED: u16 = 402;

/// Query parameter selecting a dynamic upstream.
pub const UPSTREAM_QUERY_PARAM: &str = "url";

/// Query parameter carrying the opaque caller token.
pub const TOKEN_QUERY_PARAM: &str = "token";

/// Default port of the proxy listener (bound on loopback).
pub const DEFAULT_LISTEN_PORT: u16 = 4001;

/// Default mount path of the proxy handler.
pub const DEFAULT_MOUNT_PATH: &str = "/mcp";

/// Default cap on buffered inbound command bodies (4 MiB).
pub const DEFAULT_MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Request headers that are never copied to the upstream.
///
/// `accept-encoding` is replaced with `identity` so bodies can be inspected,
/// and `content-length` is recomputed by the HTTP client from the body.
pub const STRIPPED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "transfer-encoding",
    "accept-encoding",
    "content-length",
    PAYMENT_CREDENTIAL_HEADER,
];

/// Response headers that are never copied back to the caller.
pub const STRIPPED_RESPONSE_HEADERS: &[&str] = &[
    "transfer-encoding",
    "connection",
    "keep-alive",
    "content-length",
    PAYMENT_CREDENTIAL_HEADER,
];
