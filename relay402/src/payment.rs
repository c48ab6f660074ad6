//! Payment challenge types and the injected resolver/observer seams.
//!
//! When the upstream answers a command with `402 Payment Required`, the proxy
//! hands a [`CredentialRequest`] to a [`PaymentResolver`]. If the resolver
//! produces a credential the request is retried once and a single
//! [`PaymentEvent`] is delivered to the [`PaymentObserver`].
//!
//! Both seams are object-safe traits returning boxed futures, so any async
//! source (an HTTP signer, a local wallet, a test closure) can be plugged in.
//! [`resolver_fn`] and [`observer_fn`] adapt plain async closures.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// A pinned, boxed, `Send` future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Everything a resolver needs to decide whether and how to pay.
///
/// Built from the first `402` response and discarded once the request ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRequest {
    /// The caller's request body as JSON, or `null` if it was empty or malformed.
    pub original_message: Value,
    /// The upstream's challenge body. Non-JSON bodies appear as `{"raw": "<text>"}`.
    pub challenge_payload: Value,
    /// The resolved upstream URL the request was sent to.
    pub upstream_url: String,
    /// Opaque `?token=` value supplied by the caller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_token: Option<String>,
}

/// Terminal classification of a proxied command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetryOutcome {
    /// The first response was relayed; no retry happened.
    ///
    /// Never carried by a [`PaymentEvent`], which only exists once a retry
    /// was sent. Used to label the non-retry path in logs.
    Delivered,
    /// The retry produced a response other than a new challenge.
    RetriedSuccess,
    /// The retry was answered with another `402`.
    RetriedChallenge,
    /// The retry never produced a response.
    RetryTransportError,
}

impl RetryOutcome {
    /// Returns the wire name of the outcome.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::RetriedSuccess => "retried-success",
            Self::RetriedChallenge => "retried-challenge",
            Self::RetryTransportError => "retry-transport-error",
        }
    }
}

impl fmt::Display for RetryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Report of one paid retry, delivered to the observer exactly once.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentEvent {
    /// Upstream the retry was sent to.
    pub upstream_url: String,
    /// Opaque caller token, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_token: Option<String>,
    /// The caller's request body as JSON, or `null`.
    pub original_message: Value,
    /// Credential attached to the retry.
    pub credential: String,
    /// Challenge payload of the first `402`.
    pub challenge_payload: Value,
    /// Challenge payload of the retry, when the retry was challenged again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_challenge_payload: Option<Value>,
    /// Status of the retry response, when one arrived.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_status: Option<u16>,
    /// Transport error of the retry, when no response arrived.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_error: Option<String>,
    /// Classification of the retry.
    pub outcome: RetryOutcome,
}

impl fmt::Debug for PaymentEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaymentEvent")
            .field("upstream_url", &self.upstream_url)
            .field("caller_token", &self.caller_token.as_ref().map(|_| "<redacted>"))
            .field("original_message", &self.original_message)
            .field("credential", &"<redacted>")
            .field("challenge_payload", &self.challenge_payload)
            .field("retry_challenge_payload", &self.retry_challenge_payload)
            .field("result_status", &self.result_status)
            .field("result_error", &self.result_error)
            .field("outcome", &self.outcome)
            .finish()
    }
}

/// Failure reported by a [`PaymentResolver`]. The proxy treats it as a decline.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ResolverError {
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl ResolverError {
    /// Creates an error with a message only.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Creates an error wrapping an underlying cause.
    #[must_use]
    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Failure reported by a [`PaymentObserver`]. Logged and otherwise ignored.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ObserverError {
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl ObserverError {
    /// Creates an error with a message only.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Creates an error wrapping an underlying cause.
    #[must_use]
    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Turns a payment challenge into a credential.
///
/// Returning `Ok(None)` (or an empty string) declines payment and the original
/// `402` is relayed to the caller unchanged.
pub trait PaymentResolver: Send + Sync {
    /// Produces a credential for the challenge, or declines.
    fn resolve<'a>(
        &'a self,
        request: &'a CredentialRequest,
    ) -> BoxFuture<'a, Result<Option<String>, ResolverError>>;
}

/// Receives the outcome of every paid retry.
pub trait PaymentObserver: Send + Sync {
    /// Called once after the retry's terminal status is known.
    fn on_payment_event<'a>(
        &'a self,
        event: &'a PaymentEvent,
    ) -> BoxFuture<'a, Result<(), ObserverError>>;
}

/// [`PaymentResolver`] backed by an async closure. See [`resolver_fn`].
pub struct FnResolver<F>(F);

impl<F> fmt::Debug for FnResolver<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnResolver")
    }
}

/// Wraps an async closure as a [`PaymentResolver`].
///
/// ```rust
/// use relay402::payment::{CredentialRequest, ResolverError, resolver_fn};
///
/// let resolver = resolver_fn(|request: CredentialRequest| async move {
///     Ok::<_, ResolverError>(request.caller_token.map(|token| format!("signed:{token}")))
/// });
/// # let _ = resolver;
/// ```
pub const fn resolver_fn<F, Fut>(f: F) -> FnResolver<F>
where
    F: Fn(CredentialRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<String>, ResolverError>> + Send + 'static,
{
    FnResolver(f)
}

impl<F, Fut> PaymentResolver for FnResolver<F>
where
    F: Fn(CredentialRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<String>, ResolverError>> + Send + 'static,
{
    fn resolve<'a>(
        &'a self,
        request: &'a CredentialRequest,
    ) -> BoxFuture<'a, Result<Option<String>, ResolverError>> {
        Box::pin((self.0)(request.clone()))
    }
}

/// [`PaymentObserver`] backed by an async closure. See [`observer_fn`].
pub struct FnObserver<F>(F);

impl<F> fmt::Debug for FnObserver<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnObserver")
    }
}

/// Wraps an async closure as a [`PaymentObserver`].
pub const fn observer_fn<F, Fut>(f: F) -> FnObserver<F>
where
    F: Fn(PaymentEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ObserverError>> + Send + 'static,
{
    FnObserver(f)
}

impl<F, Fut> PaymentObserver for FnObserver<F>
where
    F: Fn(PaymentEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ObserverError>> + Send + 'static,
{
    fn on_payment_event<'a>(
        &'a self,
        event: &'a PaymentEvent,
    ) -> BoxFuture<'a, Result<(), ObserverError>> {
        Box::pin((self.0)(event.clone()))
    }
}

/// Parses a challenge body.
///
/// JSON bodies are returned as-is; anything else is wrapped as
/// `{"raw": "<text>"}`. A missing or non-array `accepts` field is tolerated
/// with a warning so the resolver still gets to see the challenge.
pub fn parse_challenge(body: &[u8]) -> Value {
    let payload = serde_json::from_slice::<Value>(body)
        .unwrap_or_else(|_| json!({ "raw": String::from_utf8_lossy(body) }));
    if !payload.get("accepts").is_some_and(Value::is_array) {
        tracing::warn!("Payment challenge carries no accepts array");
    }
    payload
}

/// Parses the caller's request body, yielding `null` for empty or malformed input.
pub fn parse_message(body: &[u8]) -> Value {
    serde_json::from_slice(body).unwrap_or(Value::Null)
}
