use std::sync::Arc;

use anyhow::{Context, Result};
use energy_client::QueryService;
use energy_service::{
    api,
    config::AppConfig,
    metrics_server,
    observability,
    pipeline::{Ingestor, Pipeline},
    sources::HttpBatchSource,
    store,
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;
    let shutdown = CancellationToken::new();

    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr, shutdown.clone()).await?;
    }

    let store = store::open(&cfg.store).await?;

    // Ingest side: HTTP batches -> validation/classification -> store.
    let source = HttpBatchSource::bind(
        &cfg.ingest.bind_addr,
        cfg.ingest.channel_capacity,
        cfg.ingest.max_body_bytes,
        shutdown.clone(),
    )
    .await?;
    let pipeline = Pipeline {
        source,
        ingestor: Arc::new(Ingestor::new(store.clone(), cfg.ingest.options())),
        max_concurrent_batches: cfg.ingest.max_concurrent_batches,
    };

    // Query side.
    let api_listener = tokio::net::TcpListener::bind(&cfg.api.bind_addr)
        .await
        .with_context(|| format!("failed to bind query API on {}", cfg.api.bind_addr))?;
    tracing::info!(addr = %cfg.api.bind_addr, "query API listening");
    let app = api::router(QueryService::new(store.clone()), cfg.api.max_limit);
    let api_shutdown = shutdown.clone();
    let api_server = tokio::spawn(async move {
        axum::serve(api_listener, app.into_make_service())
            .with_graceful_shutdown(async move { api_shutdown.cancelled().await })
            .await
    });

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("shutdown requested");
                signal_token.cancel();
            }
            Err(e) => tracing::error!(error = %e, "failed to listen for shutdown signal"),
        }
    });

    // Returns once the ingest server has stopped and in-flight batches are done.
    let summary = pipeline.run().await;
    tracing::info!(
        batches = summary.batches,
        failed_batches = summary.failed_batches,
        processed = summary.processed_count,
        anomalies = summary.anomaly_count,
        record_errors = summary.record_errors,
        "ingest pipeline stopped"
    );

    api_server.await?.context("query API server error")?;
    store.close().await;

    Ok(())
}
