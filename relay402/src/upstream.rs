//! Upstream target resolution.
//!
//! A request either names its upstream through the `?url=` override, which
//! must match the configured host allowlist, or falls back to the static
//! default. Resolution fails closed.

use std::fmt;

use url::Url;

use crate::config::ProxyConfig;
use crate::error::BadUpstream;

/// A resolved absolute upstream URL.
///
/// Only constructed by [`resolve`], so every value is either the configured
/// default or an allowlisted override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget(Url);

impl UpstreamTarget {
    /// Returns the target URL.
    pub const fn url(&self) -> &Url {
        &self.0
    }

    /// Returns the target as a string slice.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for UpstreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

/// Picks the upstream for a request.
///
/// An empty override counts as absent.
///
/// # Errors
///
/// - [`BadUpstream::InvalidUrl`] if the override is not an absolute http(s) URL
/// - [`BadUpstream::DynamicNotPermitted`] if an override is given without an allowlist
/// - [`BadUpstream::HostNotAllowed`] if the override's host is not allowlisted
/// - [`BadUpstream::NoUpstream`] if there is neither an override nor a default
pub fn resolve(
    override_url: Option<&str>,
    config: &ProxyConfig,
) -> Result<UpstreamTarget, BadUpstream> {
    if let Some(raw) = override_url.filter(|raw| !raw.is_empty()) {
        let candidate = Url::parse(raw).map_err(|_| BadUpstream::InvalidUrl(raw.to_owned()))?;
        if !matches!(candidate.scheme(), "http" | "https") {
            return Err(BadUpstream::InvalidUrl(raw.to_owned()));
        }

        let allowlist = config.allowed_upstream_hosts();
        if allowlist.is_empty() {
            return Err(BadUpstream::DynamicNotPermitted);
        }

        let hostname = candidate.host_str().unwrap_or_default().to_ascii_lowercase();
        if !allowlist.iter().any(|allowed| *allowed == hostname) {
            return Err(BadUpstream::HostNotAllowed(hostname));
        }

        return Ok(UpstreamTarget(candidate));
    }

    config
        .upstream_url()
        .cloned()
        .map(UpstreamTarget)
        .ok_or(BadUpstream::NoUpstream)
}
