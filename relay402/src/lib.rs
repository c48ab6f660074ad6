#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Streaming MCP reverse proxy with one-shot x402 payment retry.
//!
//! The proxy sits between MCP clients and an upstream Streamable-HTTP MCP
//! server. Server-sent event streams are relayed chunk by chunk. When a
//! command is answered with `402 Payment Required`, an injected
//! [`PaymentResolver`] may supply a credential; the command is then retried
//! exactly once with the credential attached and an injected
//! [`PaymentObserver`] is told how the retry ended.
//!
//! # Overview
//!
//! ```text
//! caller ──► ProxyServer ──► upstream::resolve ──► headers::translate
//!                                   │
//!                                   ▼
//!                          RetryController ──► first attempt ──► 402? ──► resolver ──► retry
//!                                   │
//!                                   ▼
//!                               pump::relay ──► caller
//! ```
//!
//! # Modules
//!
//! - [`config`] - Immutable proxy configuration and its builder
//! - [`constants`] - Header names, media types and defaults
//! - [`error`] - Request-path, configuration and lifecycle errors
//! - [`headers`] - Outbound header derivation
//! - [`message`] - JSON-RPC 2.0 envelope used for request logging
//! - [`payment`] - Challenge types and the resolver/observer seams
//! - [`pump`] - Upstream response relay (streaming and buffered)
//! - [`retry`] - First attempt, payment retry and observer notification
//! - [`server`] - Listener, routing, shared-secret check and lifecycle
//! - [`task_store`] - Bounded in-memory agent task store
//! - [`upstream`] - Upstream target resolution and allowlist checks

pub mod config;
pub mod constants;
pub mod error;
pub mod headers;
pub mod message;
pub mod payment;
pub mod pump;
pub mod retry;
pub mod server;
pub mod task_store;
pub mod upstream;

pub use config::{ProxyConfig, ProxyConfigBuilder};
pub use error::{BadUpstream, ConfigError, ProxyError, ServerError};
pub use payment::{
    CredentialRequest, ObserverError, PaymentEvent, PaymentObserver, PaymentResolver,
    ResolverError, RetryOutcome, observer_fn, resolver_fn,
};
pub use server::ProxyServer;
pub use task_store::{Task, TaskState, TaskStore};
