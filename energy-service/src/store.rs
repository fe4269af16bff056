use std::sync::Arc;

use anyhow::Context;
use energy_client::{EnergyStore, MemoryStore, QuestDbStore};

use crate::config::{StoreConfig, StoreKind};

/// Open the process-wide store handle. Call once at start-up and
/// [`EnergyStore::close`] it on shutdown.
pub async fn open(cfg: &StoreConfig) -> anyhow::Result<Arc<dyn EnergyStore>> {
    match cfg.kind {
        StoreKind::Memory => {
            let mut store = MemoryStore::new().with_scan_page_size(cfg.scan_page_size);
            if let Some(max_records) = cfg.max_records {
                store = store.with_max_records(max_records);
            }
            tracing::info!(max_records = ?cfg.max_records, "using in-memory store");
            Ok(Arc::new(store))
        }
        StoreKind::Questdb => {
            let uri = cfg
                .uri
                .as_deref()
                .context("store.uri is required for questdb")?;
            let store = QuestDbStore::connect(uri, cfg.max_connections)
                .await
                .context("failed to connect to QuestDB")?
                .with_scan_page_size(cfg.scan_page_size);
            store.ensure_schema().await.context("failed to create energy_records table")?;
            tracing::info!(max_connections = cfg.max_connections, "connected to QuestDB");
            Ok(Arc::new(store))
        }
    }
}
