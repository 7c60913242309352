mod auth;
mod body;
mod buffer_pool;
mod config;
mod connection;
mod decoy;
mod dispatch;
mod forward;
mod headers;
mod proxy_protocol;
mod server;
mod stream;
mod tls;
mod tunnel;

#[cfg(test)]
mod test_support;

use crate::config::{Cli, ProxyConfig};
use crate::server::{drain, ProxyServer, SHUTDOWN_GRACE};
use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("decoy_proxy=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    color_eyre::install()?;

    let args = Cli::parse();
    let config = Arc::new(ProxyConfig::from_cli(&args)?);

    let server = ProxyServer::new(Arc::clone(&config))?;
    let sessions = server.sessions();

    let listener = TcpListener::bind(config.listen_addr.as_str())
        .await
        .wrap_err_with(|| format!("Failed to listen on {}", config.listen_addr))?;

    info!(
        "Listening on {}, upstream to {}.",
        config.listen_addr, config.upstream_addr
    );
    if config.tls.is_some() {
        info!("TLS enabled, offering h2 and http/1.1");
    }
    if config.auth.is_empty() {
        warn!("No proxy identities configured, all traffic goes to the decoy");
    } else {
        info!("{} proxy identities loaded", config.auth.len());
    }

    // Graceful shutdown signal handling
    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for CTRL+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    server.run(listener, shutdown).await;
    drain(&sessions, SHUTDOWN_GRACE).await;
    info!("Server shutdown complete");

    Ok(())
}
