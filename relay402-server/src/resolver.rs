//! HTTP-based payment resolver.
//!
//! [`RemoteResolver`] forwards each payment challenge to a signer service
//! and attaches whatever credential it returns. The signer receives the
//! [`CredentialRequest`] as JSON and answers with
//! `{"credential": "<value>"}`. A `204 No Content`, a `null` credential or an
//! empty string declines payment.

use std::fmt;
use std::time::Duration;

use relay402::payment::BoxFuture;
use relay402::{CredentialRequest, PaymentResolver, ResolverError};
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, HeaderValue};
use serde::Deserialize;
use url::Url;

use crate::config::ResolverConfig;
use crate::error::{ConfigError, RemoteResolverError};

#[derive(Debug, Deserialize)]
struct CredentialResponse {
    #[serde(default)]
    credential: Option<String>,
}

/// Resolver that asks a remote signer service for credentials.
#[derive(Clone)]
pub struct RemoteResolver {
    client: reqwest::Client,
    url: Url,
    authorization: Option<HeaderValue>,
    timeout: Option<Duration>,
}

impl fmt::Debug for RemoteResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteResolver")
            .field("url", &self.url.as_str())
            .field("authorization", &self.authorization.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RemoteResolver {
    /// Creates a resolver posting to `url`.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteResolverError::UrlParse`] if `url` is not a valid URL.
    pub fn try_new(url: &str) -> Result<Self, RemoteResolverError> {
        Ok(Self {
            client: reqwest::Client::new(),
            url: Url::parse(url)?,
            authorization: None,
            timeout: None,
        })
    }

    /// Builds a resolver from the `[resolver]` configuration section.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an unusable URL or token.
    pub fn from_config(config: &ResolverConfig) -> Result<Self, ConfigError> {
        let mut resolver = Self::try_new(config.url.trim()).map_err(|e| ConfigError::Invalid {
            field: "resolver.url",
            reason: e.to_string(),
        })?;
        if let Some(token) = config.token()? {
            resolver = resolver
                .with_bearer_token(token)
                .ok_or_else(|| ConfigError::Invalid {
                    field: "resolver.bearer_token",
                    reason: "not a valid header value".to_owned(),
                })?;
        }
        Ok(resolver.with_timeout(config.timeout()))
    }

    /// Uses a custom HTTP client.
    #[must_use]
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Sends `Authorization: Bearer <token>` with every request.
    ///
    /// Returns `None` if `token` contains invalid header characters.
    #[must_use]
    pub fn with_bearer_token(mut self, token: &str) -> Option<Self> {
        let mut value = HeaderValue::from_str(&format!("Bearer {token}")).ok()?;
        value.set_sensitive(true);
        self.authorization = Some(value);
        Some(self)
    }

    /// Sets a per-request timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Endpoint the credential requests are posted to.
    pub const fn url(&self) -> &Url {
        &self.url
    }

    /// Posts `request` and returns the credential, if the signer issued one.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteResolverError`] on transport failures, unexpected
    /// statuses and malformed bodies.
    pub async fn fetch(
        &self,
        request: &CredentialRequest,
    ) -> Result<Option<String>, RemoteResolverError> {
        let mut req = self.client.post(self.url.clone()).json(request);
        if let Some(authorization) = &self.authorization {
            req = req.header(AUTHORIZATION, authorization.clone());
        }
        if let Some(timeout) = self.timeout {
            req = req.timeout(timeout);
        }
        let response = req.send().await.map_err(RemoteResolverError::Http)?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::OK => {
                let body = response
                    .json::<CredentialResponse>()
                    .await
                    .map_err(RemoteResolverError::JsonDeserialization)?;
                Ok(body.credential.filter(|c| !c.is_empty()))
            }
            status => {
                let body = response.text().await.map_err(RemoteResolverError::Http)?;
                Err(RemoteResolverError::HttpStatus { status, body })
            }
        }
    }
}

impl PaymentResolver for RemoteResolver {
    fn resolve<'a>(
        &'a self,
        request: &'a CredentialRequest,
    ) -> BoxFuture<'a, Result<Option<String>, ResolverError>> {
        Box::pin(async move {
            let credential = self
                .fetch(request)
                .await
                .map_err(|e| ResolverError::with_source("remote resolver failed", e))?;
            tracing::debug!(
                upstream = %request.upstream_url,
                issued = credential.is_some(),
                "Remote resolver answered"
            );
            Ok(credential)
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn request() -> CredentialRequest {
        CredentialRequest {
            original_message: json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/call" }),
            challenge_payload: json!({ "accepts": [] }),
            upstream_url: "https://tools.example.com/mcp".to_owned(),
            caller_token: Some("caller".to_owned()),
        }
    }

    async fn resolver_for(server: &MockServer) -> RemoteResolver {
        RemoteResolver::try_new(&format!("{}/credential", server.uri())).unwrap()
    }

    #[tokio::test]
    async fn returns_issued_credential() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/credential"))
            .and(header("authorization", "Bearer signer-token"))
            .and(body_partial_json(json!({
                "upstreamUrl": "https://tools.example.com/mcp",
                "callerToken": "caller",
                "challengePayload": { "accepts": [] }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "credential": "cred" })))
            .expect(1)
            .mount(&server)
            .await;

        let resolver = resolver_for(&server)
            .await
            .with_bearer_token("signer-token")
            .unwrap();
        let credential = resolver.resolve(&request()).await.unwrap();
        assert_eq!(credential.as_deref(), Some("cred"));
    }

    #[tokio::test]
    async fn no_content_declines() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let resolver = resolver_for(&server).await;
        assert_eq!(resolver.resolve(&request()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn null_or_empty_credential_declines() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "credential": null })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "credential": "" })))
            .mount(&server)
            .await;

        let resolver = resolver_for(&server).await;
        assert_eq!(resolver.resolve(&request()).await.unwrap(), None);
        assert_eq!(resolver.resolve(&request()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn error_status_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("signer down"))
            .mount(&server)
            .await;

        let err = resolver_for(&server).await.fetch(&request()).await.unwrap_err();
        assert!(matches!(
            err,
            RemoteResolverError::HttpStatus { status: StatusCode::SERVICE_UNAVAILABLE, ref body }
                if body == "signer down"
        ));
    }

    #[tokio::test]
    async fn malformed_body_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = resolver_for(&server).await.fetch(&request()).await.unwrap_err();
        assert!(matches!(err, RemoteResolverError::JsonDeserialization(_)));
    }

    #[tokio::test]
    async fn timeout_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(204).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let resolver = resolver_for(&server)
            .await
            .with_timeout(Duration::from_millis(50));
        assert!(resolver.resolve(&request()).await.is_err());
    }

    #[test]
    fn rejects_bad_url() {
        assert!(matches!(
            RemoteResolver::try_new("not a url"),
            Err(RemoteResolverError::UrlParse(_))
        ));
    }

    #[test]
    fn debug_redacts_token() {
        let resolver = RemoteResolver::try_new("http://signer/credential")
            .unwrap()
            .with_bearer_token("hidden")
            .unwrap();
        assert!(!format!("{resolver:?}").contains("hidden"));
    }
}
