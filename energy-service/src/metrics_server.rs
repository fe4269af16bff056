use std::net::SocketAddr;

use anyhow::Context;
use axum::{http::StatusCode, routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use tokio_util::sync::CancellationToken;

static PROM_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder and serve `/metrics` until `shutdown`.
pub async fn init(bind_addr: &str, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr: SocketAddr = bind_addr
        .parse()
        .with_context(|| format!("invalid metrics bind address {bind_addr}"))?;

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus metrics recorder")?;
    // Only the first call wins; the recorder is process-wide.
    let _ = PROM_HANDLE.set(handle);
    describe();

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind metrics listener")?;

    tokio::spawn(async move {
        let app = Router::new().route("/metrics", get(metrics_handler));
        let serve = axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move { shutdown.cancelled().await });
        if let Err(e) = serve.await {
            tracing::error!(error = %e, "metrics server error");
        }
    });

    Ok(())
}

fn describe() {
    metrics::describe_counter!("ingest_batches_total", "Batches ingested");
    metrics::describe_counter!("ingest_records_processed_total", "Readings written to the store");
    metrics::describe_counter!("ingest_anomalies_total", "Anomalous readings written");
    metrics::describe_counter!("ingest_record_errors_total", "Readings rejected or not written, by kind");
    metrics::describe_counter!("ingest_store_retries_total", "Store writes retried after a transient failure");
    metrics::describe_histogram!("ingest_batch_duration_seconds", "Wall time to ingest one batch");
    metrics::describe_counter!("api_requests_total", "Query API requests, by endpoint");
    metrics::describe_counter!("api_store_errors_total", "Query API requests failed by the store");
}

async fn metrics_handler() -> Result<String, StatusCode> {
    PROM_HANDLE
        .get()
        .map(PrometheusHandle::render)
        .ok_or(StatusCode::SERVICE_UNAVAILABLE)
}
