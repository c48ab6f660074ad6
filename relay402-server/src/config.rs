//! Proxy server configuration.
//!
//! Loads configuration from a TOML file with support for environment variable
//! expansion in string values. Variables use `$VAR` or `${VAR}` syntax.
//!
//! # Example Configuration
//!
//! ```toml
//! host = "0.0.0.0"
//! port = 4001
//! mount_path = "/mcp"
//! upstream_url = "https://tools.example.com/mcp"
//! allowed_upstream_hosts = ["tools.example.com", "paid.example.com"]
//! inbound_bearer_token = "$PROXY_SECRET"
//! upstream_bearer_token = "${UPSTREAM_TOKEN}"
//! attempt_timeout_secs = 30
//!
//! [resolver]
//! url = "http://127.0.0.1:4021/credential"
//! bearer_token = "$SIGNER_TOKEN"
//! timeout_secs = 10
//! ```
//!
//! # Environment Variables
//!
//! - `CONFIG` - Path to configuration file (default: `config.toml`)
//! - `HOST` - Override server bind address
//! - `PORT` - Override server port
//! - Secrets referenced by `$VAR` in the config file

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use relay402::ProxyConfig;
use relay402::constants::{
    DEFAULT_LISTEN_PORT, DEFAULT_MAX_BODY_BYTES, DEFAULT_MOUNT_PATH, DEFAULT_PROTOCOL_VERSION,
};
use serde::Deserialize;

use crate::error::ConfigError;

/// Default remote resolver timeout in seconds.
pub const DEFAULT_RESOLVER_TIMEOUT_SECS: u64 = 10;

/// Command-line arguments of the `relay402` binary.
#[derive(Debug, Clone, Parser)]
#[command(name = "relay402", version, about = "Streaming MCP proxy with x402 payment retry")]
pub struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "CONFIG", default_value = "config.toml")]
    pub config: PathBuf,

    /// Override the bind address
    #[arg(long, env = "HOST")]
    pub host: Option<IpAddr>,

    /// Override the listen port
    #[arg(short, long, env = "PORT")]
    pub port: Option<u16>,
}

/// Top-level server configuration.
#[derive(Clone, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (default: `127.0.0.1`).
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Server port (default: `4001`).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Path the proxy is mounted at (default: `/mcp`).
    #[serde(default = "default_mount_path")]
    pub mount_path: String,

    /// Upstream used when a request carries no `?url=` override.
    #[serde(default)]
    pub upstream_url: Option<String>,

    /// Hosts a `?url=` override may point at.
    #[serde(default)]
    pub allowed_upstream_hosts: Vec<String>,

    /// Shared secret callers must present as `Authorization: Bearer`.
    #[serde(default)]
    pub inbound_bearer_token: Option<String>,

    /// Bearer token sent to the upstream.
    #[serde(default)]
    pub upstream_bearer_token: Option<String>,

    /// Protocol revision stamped on requests that lack one.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,

    /// Largest accepted request body in bytes.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Deadline for the upstream to answer each attempt, in seconds.
    #[serde(default)]
    pub attempt_timeout_secs: Option<u64>,

    /// Remote credential resolver. Without it payment challenges are relayed.
    #[serde(default)]
    pub resolver: Option<ResolverConfig>,
}

/// `[resolver]` section.
#[derive(Clone, Deserialize)]
pub struct ResolverConfig {
    /// Endpoint the credential request is posted to.
    pub url: String,

    /// Bearer token sent to the resolver.
    #[serde(default)]
    pub bearer_token: Option<String>,

    /// Request timeout in seconds (default: `10`).
    #[serde(default = "default_resolver_timeout_secs")]
    pub timeout_secs: u64,
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("mount_path", &self.mount_path)
            .field("upstream_url", &self.upstream_url)
            .field("allowed_upstream_hosts", &self.allowed_upstream_hosts)
            .field("inbound_bearer_token", &redacted(self.inbound_bearer_token.as_ref()))
            .field("upstream_bearer_token", &redacted(self.upstream_bearer_token.as_ref()))
            .field("protocol_version", &self.protocol_version)
            .field("max_body_bytes", &self.max_body_bytes)
            .field("attempt_timeout_secs", &self.attempt_timeout_secs)
            .field("resolver", &self.resolver)
            .finish()
    }
}

impl fmt::Debug for ResolverConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolverConfig")
            .field("url", &self.url)
            .field("bearer_token", &redacted(self.bearer_token.as_ref()))
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

fn redacted(value: Option<&String>) -> Option<&'static str> {
    value.map(|_| "<redacted>")
}

const fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

const fn default_port() -> u16 {
    DEFAULT_LISTEN_PORT
}

fn default_mount_path() -> String {
    DEFAULT_MOUNT_PATH.to_owned()
}

fn default_protocol_version() -> String {
    DEFAULT_PROTOCOL_VERSION.to_owned()
}

const fn default_max_body_bytes() -> usize {
    DEFAULT_MAX_BODY_BYTES
}

const fn default_resolver_timeout_secs() -> u64 {
    DEFAULT_RESOLVER_TIMEOUT_SECS
}

impl ServerConfig {
    /// Loads configuration from a specific file path.
    ///
    /// A missing file yields the defaults. `$VAR` / `${VAR}` references are
    /// expanded from the process environment before parsing.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = if path.exists() {
            std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            tracing::warn!(path = %path.display(), "Config file not found, using defaults");
            String::new()
        };
        Self::parse(&content, |name| std::env::var(name).ok())
    }

    /// Parses TOML after expanding variables through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed TOML.
    pub fn parse(
        content: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(content, lookup);
        Ok(toml::from_str(&expanded)?)
    }

    /// Applies command-line overrides for the bind address.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(host) = cli.host {
            self.host = host;
        }
        if let Some(port) = cli.port {
            self.port = port;
        }
    }

    /// Socket address the proxy listens on.
    pub const fn listen(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Builds the library configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when a secret still references an
    /// unset variable, and [`ConfigError::Proxy`] when validation fails.
    pub fn proxy_config(&self) -> Result<ProxyConfig, ConfigError> {
        let mut builder = ProxyConfig::builder()
            .listen(self.listen())
            .mount_path(self.mount_path.as_str())
            .allowed_upstream_hosts(self.allowed_upstream_hosts.iter().map(String::as_str))
            .protocol_version(self.protocol_version.as_str())
            .max_body_bytes(self.max_body_bytes);

        if let Some(url) = &self.upstream_url {
            builder = builder.upstream_url(url.as_str());
        }
        if let Some(token) = secret("inbound_bearer_token", self.inbound_bearer_token.as_ref())? {
            builder = builder.inbound_bearer_token(token);
        }
        if let Some(token) = secret("upstream_bearer_token", self.upstream_bearer_token.as_ref())? {
            builder = builder.upstream_bearer_token(token);
        }
        if let Some(secs) = self.attempt_timeout_secs {
            if secs == 0 {
                return Err(ConfigError::Invalid {
                    field: "attempt_timeout_secs",
                    reason: "must be greater than zero".to_owned(),
                });
            }
            builder = builder.attempt_timeout(Duration::from_secs(secs));
        }

        Ok(builder.build()?)
    }
}

impl ResolverConfig {
    /// Resolver bearer token, if one is configured.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the token references an unset
    /// variable.
    pub fn token(&self) -> Result<Option<&str>, ConfigError> {
        secret("resolver.bearer_token", self.bearer_token.as_ref())
    }

    /// Request timeout.
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Empty secrets count as unset; unexpanded references are rejected.
fn secret<'a>(
    field: &'static str,
    value: Option<&'a String>,
) -> Result<Option<&'a str>, ConfigError> {
    let Some(value) = value.map(|v| v.trim()).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    if value.starts_with('$') {
        return Err(ConfigError::Invalid {
            field,
            reason: format!("environment variable {value} is not set"),
        });
    }
    Ok(Some(value))
}

/// Expands `$VAR` and `${VAR}` patterns in a string through `lookup`.
///
/// Unresolved variables are left as-is.
fn expand_env_vars(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' {
            result.push(ch);
            continue;
        }

        let braced = chars.peek() == Some(&'{');
        if braced {
            chars.next();
        }

        let mut var_name = String::new();
        while let Some(&c) = chars.peek() {
            if braced {
                if c == '}' {
                    chars.next();
                    break;
                }
            } else if !c.is_ascii_alphanumeric() && c != '_' {
                break;
            }
            var_name.push(c);
            chars.next();
        }

        match lookup(&var_name).filter(|_| !var_name.is_empty()) {
            Some(val) => result.push_str(&val),
            None => {
                result.push('$');
                if braced {
                    result.push('{');
                }
                result.push_str(&var_name);
                if braced && !var_name.is_empty() {
                    result.push('}');
                }
            }
        }
    }

    result
}
