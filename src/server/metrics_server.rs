// src/server/metrics_server.rs

use crate::core::buffer;
use crate::core::metrics::{BUFFER_USED_BYTES, CACHE_BLOCKS, CACHE_BYTES, gather_metrics};
use crate::core::store::CachedStore;
use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use std::net::SocketAddr;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Handles HTTP requests to the /metrics endpoint.
///
/// It updates the cache gauges before gathering all registered metrics
/// and encoding them in the Prometheus text format.
async fn metrics_handler(store: CachedStore) -> impl IntoResponse {
    let (blocks, bytes) = store.cache_manager().stats();
    CACHE_BLOCKS.set(blocks as f64);
    CACHE_BYTES.set(bytes as f64);
    BUFFER_USED_BYTES.set(buffer::used_memory() as f64);

    let body = gather_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
}

/// Runs a simple HTTP server to expose Prometheus metrics on /metrics.
pub async fn run_metrics_server(
    store: CachedStore,
    port: u16,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let app = Router::new().route("/metrics", get(move || metrics_handler(store.clone())));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(
        "Prometheus metrics server listening on http://{}/metrics",
        addr
    );

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind metrics server on port {}: {}", port, e);
            return;
        }
    };

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await.ok();
            info!("Metrics server shutting down.");
        })
        .await;
    if let Err(e) = result {
        error!("Metrics server error: {}", e);
    }
}
