//! Standalone relay402 proxy server.
//!
//! Wraps the [`relay402`] proxy with a TOML configuration file, a remote
//! credential resolver, a tracing payment observer and signal-driven
//! shutdown. The `relay402` binary in this crate wires them together.
//!
//! # Modules
//!
//! - [`config`] - Server configuration with environment variable expansion
//! - [`error`] - Configuration and remote resolver errors
//! - [`observer`] - Payment observer that logs retries
//! - [`resolver`] - Credential resolver backed by a signer service
//! - [`routes`] - Health route and HTTP layers
//! - [`util`] - Shutdown signal handling

pub mod config;
pub mod error;
pub mod observer;
pub mod resolver;
pub mod routes;
pub mod util;

pub use config::{Cli, ResolverConfig, ServerConfig};
pub use error::{ConfigError, RemoteResolverError};
pub use observer::TracingObserver;
pub use resolver::RemoteResolver;
