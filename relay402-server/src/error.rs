//! Server-side error types.

use std::path::PathBuf;

use reqwest::StatusCode;

/// Errors raised while loading the server configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file exists but could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File that was being read.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid TOML or has the wrong shape.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    /// A field holds a value that cannot be used.
    #[error("invalid value for `{field}`: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
    /// The proxy section failed validation.
    #[error(transparent)]
    Proxy(#[from] relay402::ConfigError),
}

/// Errors raised by [`RemoteResolver`](crate::resolver::RemoteResolver).
#[derive(Debug, thiserror::Error)]
pub enum RemoteResolverError {
    /// Resolver endpoint URL could not be parsed.
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[source] reqwest::Error),
    /// Resolver answered with a status other than 200 or 204.
    #[error("Unexpected HTTP status {status}: {body}")]
    HttpStatus {
        /// The HTTP status code.
        status: StatusCode,
        /// The response body.
        body: String,
    },
    /// Response body was not the expected JSON.
    #[error("Failed to deserialize JSON: {0}")]
    JsonDeserialization(#[source] reqwest::Error),
}
