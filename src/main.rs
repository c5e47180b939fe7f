use anyhow::{Context, Result};
use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tower_http::timeout::TimeoutLayer;
use tracing::{error, info};

use std::net::SocketAddr;

use pkgserve::{validate_config, AppConfig, PackageServer, REQUEST_TIMEOUT};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/pkgserve/config.yml".to_string());

    let config_data = tokio::fs::read_to_string(&config_path)
        .await
        .with_context(|| format!("failed to read config {}", config_path))?;
    let config: AppConfig = serde_yaml::from_str(&config_data)?;

    validate_config(&config)?;

    let server = PackageServer::new(config.clone())?;

    // Every path goes through the normalizer; /health is the one exception.
    let app = Router::new()
        .route("/health", get(PackageServer::handle_health))
        .fallback(PackageServer::handle_request)
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(server.clone());

    let listen_addrs = if config.server.listen.is_empty() {
        vec!["0.0.0.0".to_string()]
    } else {
        config.server.listen.clone()
    };

    let addr_str = format!("{}:{}", listen_addrs[0], config.server.port);
    let addr: SocketAddr = addr_str.parse().context("invalid listen address")?;

    info!("Listening on {}", addr);

    let listener = TcpListener::bind(addr).await.context("failed to bind to address")?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server failed")?;

    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to create SIGTERM handler: {:?}", e);
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to create SIGINT handler: {:?}", e);
            return;
        }
    };

    select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
}
