//! One-shot payment retry around an upstream command call.
//!
//! [`RetryController::execute`] sends the request once. A `402 Payment
//! Required` answer to a command is buffered and offered to the configured
//! [`PaymentResolver`]; if it returns a credential the same request is sent
//! exactly once more with the credential attached, and the
//! [`PaymentObserver`] learns how that retry ended. Every other response is
//! relayed as it arrives.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::response::{IntoResponse, Response};
use futures_util::FutureExt;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, instrument};

use crate::config::ProxyConfig;
use crate::constants::{HTTP_STATUS_PAYMENT_REQUIRED, PAYMENT_CREDENTIAL_HEADER};
use crate::error::ProxyError;
use crate::payment::{
    CredentialRequest, PaymentEvent, PaymentObserver, PaymentResolver, RetryOutcome,
    parse_challenge, parse_message,
};
use crate::pump::{self, BufferedResponse};
use crate::upstream::UpstreamTarget;

/// A fully prepared upstream request, replayable for the retry.
#[derive(Debug, Clone)]
pub struct UpstreamCall {
    /// Inbound method, forwarded unchanged.
    pub method: Method,
    /// Resolved target.
    pub target: UpstreamTarget,
    /// Translated outbound headers, without any payment credential.
    pub headers: HeaderMap,
    /// Inbound body; empty for streaming pulls.
    pub body: Bytes,
    /// Opaque `?token=` value.
    pub caller_token: Option<String>,
}

/// How the retry attempt ended, before it is relayed.
enum RetryReply {
    Streamed(reqwest::Response),
    Challenged(BufferedResponse),
    Failed(ProxyError),
}

/// Drives the first attempt, the optional paid retry and the final relay.
#[derive(Clone)]
pub struct RetryController {
    client: reqwest::Client,
    config: Arc<ProxyConfig>,
    resolver: Option<Arc<dyn PaymentResolver>>,
    observer: Option<Arc<dyn PaymentObserver>>,
}

impl std::fmt::Debug for RetryController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryController")
            .field("config", &self.config)
            .field("resolver", &self.resolver.as_ref().map(|_| "<dyn PaymentResolver>"))
            .field("observer", &self.observer.as_ref().map(|_| "<dyn PaymentObserver>"))
            .finish_non_exhaustive()
    }
}

impl RetryController {
    /// Creates a controller without resolver or observer.
    #[must_use]
    pub const fn new(client: reqwest::Client, config: Arc<ProxyConfig>) -> Self {
        Self {
            client,
            config,
            resolver: None,
            observer: None,
        }
    }

    /// Installs the credential resolver. Without one, challenges are relayed as-is.
    #[must_use]
    pub fn with_resolver(mut self, resolver: Option<Arc<dyn PaymentResolver>>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Installs the payment event observer.
    #[must_use]
    pub fn with_observer(mut self, observer: Option<Arc<dyn PaymentObserver>>) -> Self {
        self.observer = observer;
        self
    }

    /// Forwards `call` and returns the response to relay to the caller.
    ///
    /// Streaming pulls (GET) never enter the challenge protocol.
    ///
    /// # Errors
    ///
    /// - [`ProxyError::UpstreamTransport`] or [`ProxyError::UpstreamTimeout`]
    ///   when an attempt produced no response
    /// - [`ProxyError::Cancelled`] when `cancel` fired while work was in flight
    /// - [`ProxyError::Internal`] when the detached retry task panicked
    #[instrument(
        name = "relay402.retry",
        skip_all,
        fields(method = %call.method, upstream = %call.target)
    )]
    pub async fn execute(
        &self,
        call: UpstreamCall,
        cancel: CancellationToken,
    ) -> Result<Response, ProxyError> {
        let first = self.send(&call, None, &cancel).await?;

        // Event-stream challenges are never buffered; they are relayed as-is.
        let challenged = call.method != Method::GET
            && first.status().as_u16() == HTTP_STATUS_PAYMENT_REQUIRED
            && !pump::is_event_stream(first.headers());
        let resolver = match &self.resolver {
            Some(resolver) if challenged => Arc::clone(resolver),
            _ => {
                tracing::debug!(
                    outcome = %RetryOutcome::Delivered,
                    status = %first.status(),
                    "Relaying upstream response"
                );
                return Ok(pump::relay(first, cancel).await);
            }
        };

        let challenge = read_buffered(first, &cancel).await?;
        tracing::info!("Upstream requires payment, requesting credential");

        let request = CredentialRequest {
            original_message: parse_message(&call.body),
            challenge_payload: parse_challenge(&challenge.body),
            upstream_url: call.target.to_string(),
            caller_token: call.caller_token.clone(),
        };

        let Some(credential) = request_credential(resolver.as_ref(), &request, &cancel).await?
        else {
            return Ok(challenge.into_response());
        };
        let Ok(mut header) = HeaderValue::from_str(&credential) else {
            tracing::warn!("Resolver returned a credential that is not a valid header value");
            return Ok(challenge.into_response());
        };
        header.set_sensitive(true);

        let event = PaymentEvent {
            upstream_url: request.upstream_url,
            caller_token: request.caller_token,
            original_message: request.original_message,
            credential,
            challenge_payload: request.challenge_payload,
            retry_challenge_payload: None,
            result_status: None,
            result_error: None,
            outcome: RetryOutcome::RetryTransportError,
        };

        // Detached so the observer hears about a presented credential even
        // when the caller disconnects mid-retry.
        let paid = tokio::spawn(
            self.clone()
                .paid_retry(call, header, event, cancel.clone())
                .in_current_span(),
        );
        match paid.await {
            Ok(RetryReply::Streamed(res)) => Ok(pump::relay(res, cancel).await),
            Ok(RetryReply::Challenged(buffered)) => Ok(buffered.into_response()),
            Ok(RetryReply::Failed(err)) => Err(err),
            Err(err) => Err(ProxyError::Internal(format!("paid retry task failed: {err}"))),
        }
    }

    /// Sends the retry, classifies it into `event` and notifies the observer
    /// exactly once before handing the reply back.
    async fn paid_retry(
        self,
        call: UpstreamCall,
        credential: HeaderValue,
        mut event: PaymentEvent,
        cancel: CancellationToken,
    ) -> RetryReply {
        tracing::info!("Retrying with payment credential");
        let reply = match self.send(&call, Some(credential), &cancel).await {
            Ok(res) if res.status().as_u16() == HTTP_STATUS_PAYMENT_REQUIRED => {
                event.outcome = RetryOutcome::RetriedChallenge;
                event.result_status = Some(HTTP_STATUS_PAYMENT_REQUIRED);
                if pump::is_event_stream(res.headers()) {
                    RetryReply::Streamed(res)
                } else {
                    match read_buffered(res, &cancel).await {
                        Ok(buffered) => {
                            event.retry_challenge_payload = Some(parse_challenge(&buffered.body));
                            RetryReply::Challenged(buffered)
                        }
                        Err(err) => RetryReply::Failed(err),
                    }
                }
            }
            Ok(res) => {
                event.outcome = RetryOutcome::RetriedSuccess;
                event.result_status = Some(res.status().as_u16());
                RetryReply::Streamed(res)
            }
            Err(err) => {
                event.result_error = Some(err.to_string());
                RetryReply::Failed(err)
            }
        };

        if let Some(status) = event.result_status.filter(|s| !is_paid_success(*s)) {
            tracing::warn!(status, "Paid retry did not succeed");
        }

        if let Some(observer) = &self.observer {
            notify(observer.as_ref(), &event).await;
        }
        reply
    }

    /// Sends one attempt. The per-attempt deadline covers the wait for response
    /// headers only, so long-lived event streams are not cut off.
    async fn send(
        &self,
        call: &UpstreamCall,
        credential: Option<HeaderValue>,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, ProxyError> {
        let mut headers = call.headers.clone();
        if let Some(credential) = credential {
            headers.insert(HeaderName::from_static(PAYMENT_CREDENTIAL_HEADER), credential);
        }

        let mut builder = self
            .client
            .request(call.method.clone(), call.target.url().clone())
            .headers(headers);
        if !call.body.is_empty() {
            builder = builder.body(call.body.clone());
        }

        let attempt = with_deadline(builder.send(), self.config.attempt_timeout());
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ProxyError::Cancelled),
            res = attempt => res,
        }
    }
}

async fn with_deadline<F>(send: F, deadline: Option<Duration>) -> Result<reqwest::Response, ProxyError>
where
    F: Future<Output = Result<reqwest::Response, reqwest::Error>>,
{
    match deadline {
        Some(limit) => tokio::time::timeout(limit, send)
            .await
            .map_err(|_| ProxyError::UpstreamTimeout(limit))?
            .map_err(ProxyError::UpstreamTransport),
        None => send.await.map_err(ProxyError::UpstreamTransport),
    }
}

async fn read_buffered(
    res: reqwest::Response,
    cancel: &CancellationToken,
) -> Result<BufferedResponse, ProxyError> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(ProxyError::Cancelled),
        read = BufferedResponse::read(res) => read.map_err(ProxyError::UpstreamTransport),
    }
}

/// Asks the resolver for a credential. Failures and panics count as a decline;
/// only cancellation is reported as an error.
async fn request_credential(
    resolver: &dyn PaymentResolver,
    request: &CredentialRequest,
    cancel: &CancellationToken,
) -> Result<Option<String>, ProxyError> {
    let resolved = tokio::select! {
        biased;
        () = cancel.cancelled() => return Err(ProxyError::Cancelled),
        resolved = AssertUnwindSafe(resolver.resolve(request)).catch_unwind() => resolved,
    };

    match resolved {
        Ok(Ok(Some(credential))) if !credential.is_empty() => Ok(Some(credential)),
        Ok(Ok(_)) => {
            tracing::info!("Resolver declined payment, relaying challenge");
            Ok(None)
        }
        Ok(Err(err)) => {
            tracing::warn!(error = %err, "Resolver failed, relaying challenge");
            Ok(None)
        }
        Err(_) => {
            tracing::error!("Resolver panicked, relaying challenge");
            Ok(None)
        }
    }
}

/// Delivers the event, swallowing observer failures and panics.
async fn notify(observer: &dyn PaymentObserver, event: &PaymentEvent) {
    match AssertUnwindSafe(observer.on_payment_event(event))
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::warn!(error = %err, "Payment observer failed"),
        Err(_) => tracing::error!("Payment observer panicked"),
    }
}

fn is_paid_success(status: u16) -> bool {
    StatusCode::from_u16(status).is_ok_and(|s| s.is_success())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;
    use wiremock::matchers::{header, header_exists, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::payment::{BoxFuture, ObserverError, ResolverError, observer_fn, resolver_fn};
    use crate::upstream;

    struct Recorder(Mutex<Vec<PaymentEvent>>);

    impl PaymentObserver for Recorder {
        fn on_payment_event<'a>(
            &'a self,
            event: &'a PaymentEvent,
        ) -> BoxFuture<'a, Result<(), ObserverError>> {
            self.0.lock().unwrap().push(event.clone());
            Box::pin(async { Ok(()) })
        }
    }

    struct Panicking;

    impl PaymentResolver for Panicking {
        fn resolve<'a>(
            &'a self,
            _request: &'a CredentialRequest,
        ) -> BoxFuture<'a, Result<Option<String>, ResolverError>> {
            Box::pin(async { explode() })
        }
    }

    fn explode() -> Result<Option<String>, ResolverError> {
        panic!("resolver bug")
    }

    fn call(server: &MockServer) -> (UpstreamCall, Arc<ProxyConfig>) {
        let config = Arc::new(
            ProxyConfig::builder()
                .upstream_url(format!("{}/mcp", server.uri()))
                .build()
                .unwrap(),
        );
        let call = UpstreamCall {
            method: Method::POST,
            target: upstream::resolve(None, &config).unwrap(),
            headers: HeaderMap::new(),
            body: Bytes::from_static(br#"{"jsonrpc":"2.0","id":1,"method":"tools/call"}"#),
            caller_token: Some("caller-1".into()),
        };
        (call, config)
    }

    async fn challenge_then(server: &MockServer, retry: ResponseTemplate) {
        Mock::given(method("POST"))
            .and(header("x-payment", "cred-123"))
            .respond_with(retry)
            .expect(1)
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(402).set_body_json(json!({ "accepts": [{ "network": "fuji" }] })),
            )
            .mount(server)
            .await;
    }

    fn paying() -> Option<Arc<dyn PaymentResolver>> {
        Some(Arc::new(resolver_fn(|_request: CredentialRequest| async {
            Ok::<_, ResolverError>(Some("cred-123".to_owned()))
        })))
    }

    #[tokio::test]
    async fn retries_once_and_reports_success() {
        let server = MockServer::start().await;
        challenge_then(&server, ResponseTemplate::new(200).set_body_json(json!({ "result": "ok" }))).await;
        let (call, config) = call(&server);
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));

        let controller = RetryController::new(reqwest::Client::new(), config)
            .with_resolver(paying())
            .with_observer(Some(Arc::clone(&recorder) as Arc<dyn PaymentObserver>));
        let res = controller.execute(call, CancellationToken::new()).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let events = recorder.0.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].credential, "cred-123");
        assert_eq!(events[0].result_status, Some(200));
        assert_eq!(events[0].outcome, RetryOutcome::RetriedSuccess);
        assert_eq!(events[0].caller_token.as_deref(), Some("caller-1"));
        assert_eq!(events[0].original_message["id"], 1);
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn relays_second_challenge() {
        let server = MockServer::start().await;
        challenge_then(
            &server,
            ResponseTemplate::new(402).set_body_json(json!({ "accepts": [], "error": "insufficient" })),
        )
        .await;
        let (call, config) = call(&server);
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));

        let controller = RetryController::new(reqwest::Client::new(), config)
            .with_resolver(paying())
            .with_observer(Some(Arc::clone(&recorder) as Arc<dyn PaymentObserver>));
        let res = controller.execute(call, CancellationToken::new()).await.unwrap();
        assert_eq!(res.status(), StatusCode::PAYMENT_REQUIRED);
        let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        assert_eq!(serde_json::from_slice::<serde_json::Value>(&body).unwrap()["error"], "insufficient");

        let events = recorder.0.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].outcome, RetryOutcome::RetriedChallenge);
        assert_eq!(events[0].retry_challenge_payload.as_ref().unwrap()["error"], "insufficient");
    }

    #[tokio::test]
    async fn failing_resolver_relays_original_challenge() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(402).set_body_string("pay first"))
            .expect(1)
            .mount(&server)
            .await;
        let (call, config) = call(&server);
        let resolver: Arc<dyn PaymentResolver> = Arc::new(resolver_fn(|_r: CredentialRequest| async {
            Err::<Option<String>, _>(ResolverError::new("wallet locked"))
        }));

        let controller = RetryController::new(reqwest::Client::new(), config).with_resolver(Some(resolver));
        let res = controller.execute(call, CancellationToken::new()).await.unwrap();
        assert_eq!(res.status(), StatusCode::PAYMENT_REQUIRED);
        let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"pay first");
    }

    #[tokio::test]
    async fn panicking_resolver_counts_as_decline() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(402))
            .expect(1)
            .mount(&server)
            .await;
        let (call, config) = call(&server);
        let controller =
            RetryController::new(reqwest::Client::new(), config).with_resolver(Some(Arc::new(Panicking)));
        let res = controller.execute(call, CancellationToken::new()).await.unwrap();
        assert_eq!(res.status(), StatusCode::PAYMENT_REQUIRED);
    }

    #[tokio::test]
    async fn observer_failure_does_not_affect_response() {
        let server = MockServer::start().await;
        challenge_then(&server, ResponseTemplate::new(200).set_body_string("ok")).await;
        let (call, config) = call(&server);
        let observer: Arc<dyn PaymentObserver> = Arc::new(observer_fn(|_e: PaymentEvent| async {
            Err::<(), _>(ObserverError::new("sink down"))
        }));

        let controller = RetryController::new(reqwest::Client::new(), config)
            .with_resolver(paying())
            .with_observer(Some(observer));
        let res = controller.execute(call, CancellationToken::new()).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn streaming_pull_never_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(402))
            .expect(1)
            .mount(&server)
            .await;
        let (mut call, config) = call(&server);
        call.method = Method::GET;
        call.body = Bytes::new();

        let controller = RetryController::new(reqwest::Client::new(), config).with_resolver(paying());
        let res = controller.execute(call, CancellationToken::new()).await.unwrap();
        assert_eq!(res.status(), StatusCode::PAYMENT_REQUIRED);
    }

    #[tokio::test]
    async fn first_attempt_never_carries_credential() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header_exists("x-payment"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        let (call, config) = call(&server);

        let controller = RetryController::new(reqwest::Client::new(), config).with_resolver(paying());
        let res = controller.execute(call, CancellationToken::new()).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_sending() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let (call, config) = call(&server);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let controller = RetryController::new(reqwest::Client::new(), config);
        let err = controller.execute(call, cancel).await.unwrap_err();
        assert!(matches!(err, ProxyError::Cancelled));
    }

    #[tokio::test]
    async fn slow_upstream_hits_attempt_deadline() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;
        let config = Arc::new(
            ProxyConfig::builder()
                .upstream_url(server.uri())
                .attempt_timeout(Duration::from_millis(50))
                .build()
                .unwrap(),
        );
        let call = UpstreamCall {
            method: Method::POST,
            target: upstream::resolve(None, &config).unwrap(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            caller_token: None,
        };

        let controller = RetryController::new(reqwest::Client::new(), config);
        let err = controller.execute(call, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamTimeout(_)));
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn event_stream_challenge_is_relayed_without_resolving() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(402)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string("event: payment\ndata: {}\n\n"),
            )
            .expect(1)
            .mount(&server)
            .await;
        let (call, config) = call(&server);
        let asked = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&asked);
        let resolver: Arc<dyn PaymentResolver> = Arc::new(resolver_fn(move |_r: CredentialRequest| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, ResolverError>(Some("cred-123".to_owned())) }
        }));

        let controller = RetryController::new(reqwest::Client::new(), config).with_resolver(Some(resolver));
        let res = controller.execute(call, CancellationToken::new()).await.unwrap();
        assert_eq!(res.status(), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(res.headers()["cache-control"], "no-cache");
        let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"event: payment\ndata: {}\n\n");
        assert_eq!(asked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn observer_fires_when_caller_abandons_retry() {
        let server = MockServer::start().await;
        challenge_then(
            &server,
            ResponseTemplate::new(200)
                .set_body_string("late")
                .set_delay(Duration::from_millis(1500)),
        )
        .await;
        let (call, config) = call(&server);
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));

        let controller = RetryController::new(reqwest::Client::new(), config)
            .with_resolver(paying())
            .with_observer(Some(Arc::clone(&recorder) as Arc<dyn PaymentObserver>));
        let abandoned = tokio::time::timeout(
            Duration::from_millis(300),
            controller.execute(call, CancellationToken::new()),
        )
        .await;
        assert!(abandoned.is_err());

        for _ in 0..50 {
            if !recorder.0.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let events = recorder.0.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].outcome, RetryOutcome::RetriedSuccess);
        assert_eq!(events[0].result_status, Some(200));
    }
}
