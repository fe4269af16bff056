use anyhow::{bail, Result};
use energy_service::{
    config::AppConfig,
    observability,
    pipeline::{Ingestor, Pipeline},
    sources::BatchFileSource,
    store,
};
use std::{env, path::PathBuf, sync::Arc};

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let paths: Vec<PathBuf> = env::args().skip(1).map(PathBuf::from).collect();
    if paths.is_empty() {
        bail!("usage: ingest_batch_file <batch.json | staging_dir>...");
    }

    // Point ENERGY_CONFIG at the same store the service reads from.
    let cfg = AppConfig::load()?;
    let store = store::open(&cfg.store).await?;

    let pipeline = Pipeline {
        source: BatchFileSource::new(paths),
        ingestor: Arc::new(Ingestor::new(store.clone(), cfg.ingest.options())),
        max_concurrent_batches: cfg.ingest.max_concurrent_batches,
    };
    let summary = pipeline.run().await;
    store.close().await;

    println!("{}", serde_json::to_string_pretty(&summary)?);

    if summary.failed_batches > 0 {
        bail!("{} batch file(s) could not be read", summary.failed_batches);
    }
    Ok(())
}
