use anyhow::Result;
use axum::http::{header::HeaderName, HeaderMap, HeaderValue, StatusCode};
use axum::{extract::Extension, routing::get, AddExtensionLayer, Router};
use futures::prelude::*;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::server::get_metrics_recorder;

/// Spawn a prometheus scrape endpoint over the global lease metrics recorder.
pub fn spawn_prom_server(config: &Config, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<Result<()>> {
    let handle = get_metrics_recorder(config).handle();
    let app = Router::new()
        .route("/metrics", get(prometheus_scrape))
        .layer(AddExtensionLayer::new(handle));
    let server = axum::Server::bind(&([0, 0, 0, 0], config.metrics_port).into())
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move {
            let _res = shutdown.recv().await;
        });
    tracing::info!(port = config.metrics_port, "lease metrics are being served at /metrics");
    tokio::spawn(server.map_err(anyhow::Error::from))
}

/// Render the current state of all lease & reader metrics.
async fn prometheus_scrape(Extension(handle): Extension<PrometheusHandle>) -> (StatusCode, HeaderMap, String) {
    let mut headers = HeaderMap::new();
    headers.insert(HeaderName::from_static("content-type"), HeaderValue::from_static("text/plain; version=0.0.4"));
    (StatusCode::OK, headers, handle.render())
}
