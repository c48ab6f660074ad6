//! relay402 proxy server.
//!
//! # Usage
//!
//! ```bash
//! # Run with default config (config.toml in current directory)
//! cargo run -p relay402-server --release
//!
//! # Run with custom config path
//! relay402 --config /path/to/config.toml
//!
//! # Configure logging level
//! RUST_LOG=relay402=debug relay402
//! ```
//!
//! # Environment Variables
//!
//! - `CONFIG` - Path to TOML configuration file (default: `config.toml`)
//! - `HOST` - Override bind address (default: `127.0.0.1`)
//! - `PORT` - Override port (default: `4001`)
//! - `RUST_LOG` - Log level filter (default: `info`)

use clap::Parser;
use relay402::ProxyServer;
use tracing_subscriber::EnvFilter;

use relay402_server::util::SigDown;
use relay402_server::{Cli, RemoteResolver, ServerConfig, TracingObserver, routes};

#[tokio::main]
async fn main() {
    // Secrets referenced from the config file may live in .env
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run(Cli::parse()).await {
        tracing::error!("Proxy failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = ServerConfig::load_from(&cli.config)?;
    config.apply_cli(&cli);
    tracing::info!(
        listen = %config.listen(),
        mount_path = %config.mount_path,
        upstream = config.upstream_url.as_deref().unwrap_or("-"),
        allowed_hosts = config.allowed_upstream_hosts.len(),
        resolver = config.resolver.is_some(),
        "Loaded configuration"
    );

    let mut server = ProxyServer::new(config.proxy_config()?).with_observer(TracingObserver);
    match &config.resolver {
        Some(resolver_config) => {
            let resolver = RemoteResolver::from_config(resolver_config)?;
            tracing::info!(url = %resolver.url(), "Payment challenges go to remote resolver");
            server = server.with_resolver(resolver);
        }
        None => {
            tracing::warn!("No [resolver] configured, payment challenges will be relayed as-is");
        }
    }

    let sig_down = SigDown::try_new()?;
    server.start_with(routes::compose).await?;

    sig_down.recv().await;
    tracing::info!("Shutting down");
    server.stop().await?;
    Ok(())
}
