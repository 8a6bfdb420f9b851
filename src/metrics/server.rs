//! Prometheus recorder and the standalone metrics endpoint.
//!
//! The endpoint exposes `/metrics` in text format and a trivial `/health`
//! probe. The trigger service can mount the same routes through [`routes`].

use axum::{Extension, Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use snafu::prelude::*;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::{MetricsError, PrometheusInitSnafu};

/// Install the global Prometheus recorder without starting a listener.
pub fn install_recorder() -> Result<PrometheusHandle, MetricsError> {
    PrometheusBuilder::new()
        .install_recorder()
        .context(PrometheusInitSnafu)
}

/// Install the recorder and serve it on `addr` in the background.
///
/// The returned handle can be shared with other routers that want to
/// render the same registry.
pub fn init(addr: SocketAddr) -> Result<PrometheusHandle, MetricsError> {
    let handle = install_recorder()?;
    tokio::spawn(run_server(addr, handle.clone()));
    Ok(handle)
}

/// Router exposing `/metrics` and `/health` for the given handle.
pub fn routes(handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(Extension(handle))
}

async fn run_server(addr: SocketAddr, handle: PrometheusHandle) {
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind metrics server to {}: {}", addr, e);
            return;
        }
    };

    info!("Metrics endpoint listening on {}", addr);
    if let Err(e) = axum::serve(listener, routes(handle)).await {
        error!("Metrics server error: {}", e);
    }
}

async fn metrics_handler(Extension(handle): Extension<PrometheusHandle>) -> String {
    handle.render()
}

async fn health_handler() -> &'static str {
    "ok\n"
}
