//! Liveness endpoint for container platforms.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{routing::get, Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: &'static str,
    service: &'static str,
}

async fn health() -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "healthy",
        service: env!("CARGO_PKG_NAME"),
    })
}

pub fn router() -> Router {
    Router::new().route("/health", get(health))
}

/// Serve `/health` on `0.0.0.0:port` until the process exits.
pub async fn serve(port: u16) -> Result<()> {
    let address = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(address)
        .await
        .with_context(|| format!("Failed to bind health check server on {}", address))?;
    serve_on(listener).await
}

pub async fn serve_on(listener: TcpListener) -> Result<()> {
    let address = listener.local_addr().context("Health listener has no address")?;
    info!("Health check server started on {}", address);
    axum::serve(listener, router())
        .await
        .context("Health check server error")?;
    Ok(())
}
