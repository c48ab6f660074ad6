//! Proxy configuration.
//!
//! [`ProxyConfig`] is immutable once built and shared read-only by every
//! request task. Build it with [`ProxyConfig::builder`]:
//!
//! ```rust
//! use relay402::config::ProxyConfig;
//!
//! let config = ProxyConfig::builder()
//!     .upstream_url("https://tools.example/mcp")
//!     .allowed_upstream_hosts(["tools.example", "Mirror.Example"])
//!     .mount_path("/mcp")
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(config.allowed_upstream_hosts(), ["tools.example", "mirror.example"]);
//! ```

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use http::HeaderValue;
use url::Url;

use crate::constants::{
    DEFAULT_LISTEN_PORT, DEFAULT_MAX_BODY_BYTES, DEFAULT_MOUNT_PATH, DEFAULT_PROTOCOL_VERSION,
};
use crate::error::ConfigError;

/// Read-only proxy configuration.
#[derive(Clone)]
pub struct ProxyConfig {
    upstream_url: Option<Url>,
    allowed_upstream_hosts: Vec<String>,
    listen: SocketAddr,
    mount_path: String,
    inbound_bearer_token: Option<String>,
    upstream_authorization: Option<HeaderValue>,
    protocol_version: String,
    max_body_bytes: usize,
    attempt_timeout: Option<Duration>,
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("upstream_url", &self.upstream_url.as_ref().map(Url::as_str))
            .field("allowed_upstream_hosts", &self.allowed_upstream_hosts)
            .field("listen", &self.listen)
            .field("mount_path", &self.mount_path)
            .field("inbound_bearer_token", &self.inbound_bearer_token.as_ref().map(|_| "<redacted>"))
            .field("upstream_authorization", &self.upstream_authorization.as_ref().map(|_| "<redacted>"))
            .field("protocol_version", &self.protocol_version)
            .field("max_body_bytes", &self.max_body_bytes)
            .field("attempt_timeout", &self.attempt_timeout)
            .finish()
    }
}

impl ProxyConfig {
    /// Starts a new builder with default settings.
    #[must_use]
    pub fn builder() -> ProxyConfigBuilder {
        ProxyConfigBuilder::default()
    }

    /// Statically configured default upstream, if any.
    pub const fn upstream_url(&self) -> Option<&Url> {
        self.upstream_url.as_ref()
    }

    /// Normalized (trimmed, lower-cased) allowlist for `?url=` overrides.
    /// Empty means dynamic upstreams are not permitted.
    pub fn allowed_upstream_hosts(&self) -> &[String] {
        &self.allowed_upstream_hosts
    }

    /// Address the listener binds to.
    pub const fn listen(&self) -> SocketAddr {
        self.listen
    }

    /// Path prefix the proxy handler is mounted under.
    pub fn mount_path(&self) -> &str {
        &self.mount_path
    }

    /// Shared secret expected as `Authorization: Bearer <secret>` on inbound requests.
    pub fn inbound_bearer_token(&self) -> Option<&str> {
        self.inbound_bearer_token.as_deref()
    }

    /// Precomputed `Authorization` value sent to the upstream, if configured.
    pub const fn upstream_authorization(&self) -> Option<&HeaderValue> {
        self.upstream_authorization.as_ref()
    }

    /// Protocol revision stamped on requests that lack one.
    pub fn protocol_version(&self) -> &str {
        &self.protocol_version
    }

    /// Maximum inbound command body size in bytes.
    pub const fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    /// Optional deadline applied to each upstream attempt.
    pub const fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout
    }
}

/// Builder for [`ProxyConfig`].
#[derive(Debug, Clone)]
pub struct ProxyConfigBuilder {
    upstream_url: Option<String>,
    allowed_upstream_hosts: Vec<String>,
    listen: SocketAddr,
    mount_path: String,
    inbound_bearer_token: Option<String>,
    upstream_bearer_token: Option<String>,
    protocol_version: String,
    max_body_bytes: usize,
    attempt_timeout: Option<Duration>,
}

impl Default for ProxyConfigBuilder {
    fn default() -> Self {
        Self {
            upstream_url: None,
            allowed_upstream_hosts: Vec::new(),
            listen: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_LISTEN_PORT)),
            mount_path: DEFAULT_MOUNT_PATH.to_owned(),
            inbound_bearer_token: None,
            upstream_bearer_token: None,
            protocol_version: DEFAULT_PROTOCOL_VERSION.to_owned(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            attempt_timeout: None,
        }
    }
}

impl ProxyConfigBuilder {
    /// Sets the default upstream URL.
    #[must_use]
    pub fn upstream_url(mut self, url: impl Into<String>) -> Self {
        self.upstream_url = Some(url.into());
        self
    }

    /// Sets the hosts a `?url=` override may point at.
    #[must_use]
    pub fn allowed_upstream_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_upstream_hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the listener address.
    #[must_use]
    pub const fn listen(mut self, addr: SocketAddr) -> Self {
        self.listen = addr;
        self
    }

    /// Sets the mount path.
    #[must_use]
    pub fn mount_path(mut self, path: impl Into<String>) -> Self {
        self.mount_path = path.into();
        self
    }

    /// Requires inbound requests to present this shared secret.
    #[must_use]
    pub fn inbound_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.inbound_bearer_token = Some(token.into());
        self
    }

    /// Sends this token as `Authorization: Bearer <token>` to the upstream.
    #[must_use]
    pub fn upstream_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.upstream_bearer_token = Some(token.into());
        self
    }

    /// Overrides the default protocol revision.
    #[must_use]
    pub fn protocol_version(mut self, version: impl Into<String>) -> Self {
        self.protocol_version = version.into();
        self
    }

    /// Sets the inbound body cap.
    #[must_use]
    pub const fn max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    /// Applies a deadline to every upstream attempt.
    #[must_use]
    pub const fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Validates and freezes the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoUpstream`] when neither a default upstream nor an
    /// allowlist is configured, [`ConfigError::InvalidUpstreamUrl`] when the
    /// default upstream does not parse, and [`ConfigError::InvalidBearerToken`]
    /// when the upstream token cannot be sent as a header.
    pub fn build(self) -> Result<ProxyConfig, ConfigError> {
        let upstream_url = self
            .upstream_url
            .filter(|u| !u.trim().is_empty())
            .map(|raw| {
                Url::parse(raw.trim()).map_err(|source| ConfigError::InvalidUpstreamUrl {
                    url: raw.clone(),
                    source,
                })
            })
            .transpose()?;

        let allowed_upstream_hosts: Vec<String> = self
            .allowed_upstream_hosts
            .iter()
            .map(|h| h.trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();

        if upstream_url.is_none() && allowed_upstream_hosts.is_empty() {
            return Err(ConfigError::NoUpstream);
        }

        let upstream_authorization = self
            .upstream_bearer_token
            .filter(|t| !t.is_empty())
            .map(|token| {
                HeaderValue::from_str(&format!("Bearer {token}"))
                    .map(|mut v| {
                        v.set_sensitive(true);
                        v
                    })
                    .map_err(|_| ConfigError::InvalidBearerToken)
            })
            .transpose()?;

        Ok(ProxyConfig {
            upstream_url,
            allowed_upstream_hosts,
            listen: self.listen,
            mount_path: normalize_mount_path(&self.mount_path),
            inbound_bearer_token: self.inbound_bearer_token.filter(|t| !t.is_empty()),
            upstream_authorization,
            protocol_version: self.protocol_version,
            max_body_bytes: self.max_body_bytes,
            attempt_timeout: self.attempt_timeout,
        })
    }
}

/// Ensures a leading slash and strips trailing ones; `""` and `"/"` become `"/"`.
fn normalize_mount_path(path: &str) -> String {
    let trimmed = path.trim().trim_matches('/');
    if trimmed.is_empty() {
        "/".to_owned()
    } else {
        format!("/{trimmed}")
    }
}
