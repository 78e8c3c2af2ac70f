//! HTTP exposition endpoint.
//!
//! Serves the shared registry at `/metrics` for Prometheus scrapes.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse},
    routing::get,
    Router,
};
use prometheus::TEXT_FORMAT;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::error::{ExporterError, Result};
use crate::metrics::Metrics;

const LANDING_PAGE: &str = "<html>\
<head><title>Netatmo Exporter</title></head>\
<body><h1>Netatmo Exporter</h1><p><a href=\"/metrics\">Metrics</a></p></body>\
</html>";

/// Build the router serving `/` and `/metrics`.
pub fn router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/", get(landing))
        .route("/metrics", get(scrape))
        .with_state(metrics)
}

/// GET / - Link to the metrics page
async fn landing() -> Html<&'static str> {
    Html(LANDING_PAGE)
}

/// GET /metrics - Text exposition of every series
async fn scrape(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    match metrics.encode() {
        Ok(text) => (StatusCode::OK, [(header::CONTENT_TYPE, TEXT_FORMAT)], text),
        Err(e) => {
            log::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain")],
                e.to_string(),
            )
        }
    }
}

/// Bind the metrics listener. Split from [`serve`] so callers learn about a
/// busy port before the poll loop starts.
pub async fn bind(port: u16) -> Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    TcpListener::bind(addr)
        .await
        .map_err(|e| ExporterError::Server(format!("failed to bind {}: {}", addr, e)))
}

/// Serve the registry until the shutdown signal fires.
pub async fn serve(
    listener: TcpListener,
    metrics: Arc<Metrics>,
    mut shutdown_rx: watch::Receiver<()>,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        log::info!("Metrics endpoint listening on http://{}/metrics", addr);
    }

    axum::serve(listener, router(metrics))
        .with_graceful_shutdown(async move {
            shutdown_rx.changed().await.ok();
        })
        .await
        .map_err(|e| ExporterError::Server(e.to_string()))?;

    log::info!("Metrics endpoint stopped.");
    Ok(())
}
