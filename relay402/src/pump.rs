//! Upstream → caller response relay.
//!
//! Event streams are forwarded chunk by chunk as they arrive and are never
//! buffered; everything else is read fully and re-sent with a recomputed
//! `Content-Length`. Relaying never fails: once streaming has started a read
//! error can only end the connection.

use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::{Body, Bytes};
use axum::http::header::{CACHE_CONTROL, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt, TryStreamExt};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::constants::{EVENT_STREAM_MEDIA_TYPE, STRIPPED_RESPONSE_HEADERS};
use crate::error::ProxyError;

/// Returns `true` if the content type announces a server-sent event stream.
pub fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains(EVENT_STREAM_MEDIA_TYPE))
}

/// Copies upstream headers minus the ones the proxy recomputes or must not echo.
fn relayable_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream {
        if STRIPPED_RESPONSE_HEADERS.contains(&name.as_str()) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// A fully read upstream response.
///
/// Payment challenges are held in this form so they can be parsed for the
/// resolver and still be relayed unchanged if no retry happens.
#[derive(Debug, Clone)]
pub struct BufferedResponse {
    /// Upstream status.
    pub status: StatusCode,
    /// Upstream headers, already filtered for relaying.
    pub headers: HeaderMap,
    /// Complete upstream body.
    pub body: Bytes,
}

impl BufferedResponse {
    /// Reads the whole upstream body.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the body cannot be read.
    pub async fn read(upstream: reqwest::Response) -> Result<Self, reqwest::Error> {
        let status = upstream.status();
        let headers = relayable_headers(upstream.headers());
        let body = upstream.bytes().await?;
        Ok(Self {
            status,
            headers,
            body,
        })
    }
}

impl IntoResponse for BufferedResponse {
    fn into_response(self) -> Response {
        let mut headers = self.headers;
        headers.insert(CONTENT_LENGTH, HeaderValue::from(self.body.len()));
        let mut res = Response::new(Body::from(self.body));
        *res.status_mut() = self.status;
        *res.headers_mut() = headers;
        res
    }
}

/// Relays an upstream response to the caller.
///
/// For event streams the returned body owns `cancel`'s drop guard: when the
/// caller goes away the body is dropped and the request token is cancelled.
/// Cancelling the token from elsewhere (e.g. server shutdown) ends the stream
/// cleanly.
pub async fn relay(upstream: reqwest::Response, cancel: CancellationToken) -> Response {
    if is_event_stream(upstream.headers()) {
        return relay_stream(upstream, cancel);
    }

    let status = upstream.status();
    match BufferedResponse::read(upstream).await {
        Ok(buffered) => buffered.into_response(),
        Err(err) if status == StatusCode::ACCEPTED => {
            tracing::debug!(error = %err, "Ignoring unreadable 202 body");
            let mut res = StatusCode::ACCEPTED.into_response();
            res.headers_mut()
                .insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
            res
        }
        Err(err) => ProxyError::UpstreamTransport(err).into_response(),
    }
}

fn relay_stream(upstream: reqwest::Response, cancel: CancellationToken) -> Response {
    let status = upstream.status();
    let mut headers = relayable_headers(upstream.headers());
    if !headers.contains_key(CACHE_CONTROL) {
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    }
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));

    let guard = cancel.clone().drop_guard();
    let chunks = upstream
        .bytes_stream()
        .inspect_err(|err| tracing::warn!(error = %err, "Event stream from upstream broke off"))
        .take_until(cancel.cancelled_owned())
        .boxed();

    let mut res = Response::new(Body::from_stream(GuardedStream {
        inner: chunks,
        _guard: guard,
    }));
    *res.status_mut() = status;
    *res.headers_mut() = headers;
    res
}

/// Keeps the request's [`DropGuard`] alive for as long as the body streams.
struct GuardedStream {
    inner: BoxStream<'static, Result<Bytes, reqwest::Error>>,
    _guard: DropGuard,
}

impl Stream for GuardedStream {
    type Item = Result<Bytes, reqwest::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}
