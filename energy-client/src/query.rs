//! Read-side shaping over an [`EnergyStore`].
//!
//! `analytics_summary` walks the whole store through `scan_all`, so its cost
//! is linear in the total number of records. A per-site counter table would
//! remove that ceiling; it is not maintained here.

use std::{collections::BTreeMap, sync::Arc};

use bigdecimal::BigDecimal;
use futures::TryStreamExt;
use serde::Serialize;
use time::OffsetDateTime;

use crate::{
    db::{EnergyStore, RangeQuery, StoreError},
    domain::EnergyRecord,
};

pub const DEFAULT_SITE_DATA_LIMIT: usize = 100;
pub const DEFAULT_ANOMALY_LIMIT: usize = 50;

#[derive(Debug, Clone, Serialize)]
pub struct SiteData {
    pub site_id: String,
    pub record_count: usize,
    pub data: Vec<EnergyRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SiteAnomalies {
    pub site_id: String,
    pub anomaly_count: usize,
    pub anomalies: Vec<EnergyRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SiteCatalog {
    pub sites: Vec<String>,
    pub site_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SiteStatistics {
    pub records: u64,
    pub anomalies: u64,
    pub total_generated: BigDecimal,
    pub total_consumed: BigDecimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyticsSummary {
    pub total_records: u64,
    pub total_anomalies: u64,
    /// Percentage of anomalous records; `0` for an empty store.
    pub anomaly_rate: f64,
    pub site_count: usize,
    pub site_statistics: BTreeMap<String, SiteStatistics>,
}

impl AnalyticsSummary {
    fn from_statistics(site_statistics: BTreeMap<String, SiteStatistics>) -> Self {
        let total_records: u64 = site_statistics.values().map(|s| s.records).sum();
        let total_anomalies: u64 = site_statistics.values().map(|s| s.anomalies).sum();
        let anomaly_rate = if total_records == 0 {
            0.0
        } else {
            total_anomalies as f64 * 100.0 / total_records as f64
        };

        Self {
            total_records,
            total_anomalies,
            anomaly_rate,
            site_count: site_statistics.len(),
            site_statistics,
        }
    }
}

#[derive(Clone)]
pub struct QueryService {
    store: Arc<dyn EnergyStore>,
}

impl QueryService {
    pub fn new(store: Arc<dyn EnergyStore>) -> Self {
        Self { store }
    }

    /// Most recent records of a site inside an inclusive, optionally open range.
    pub async fn site_data(
        &self,
        site_id: &str,
        start: Option<OffsetDateTime>,
        end: Option<OffsetDateTime>,
        limit: usize,
    ) -> Result<SiteData, StoreError> {
        let data = self
            .store
            .query_range(site_id, &RangeQuery::between(start, end, limit))
            .await?;

        Ok(SiteData {
            site_id: site_id.to_string(),
            record_count: data.len(),
            data,
        })
    }

    pub async fn site_anomalies(&self, site_id: &str, limit: usize) -> Result<SiteAnomalies, StoreError> {
        let anomalies = self.store.query_anomalies(site_id, limit).await?;

        Ok(SiteAnomalies {
            site_id: site_id.to_string(),
            anomaly_count: anomalies.len(),
            anomalies,
        })
    }

    pub async fn all_sites(&self) -> Result<SiteCatalog, StoreError> {
        // BTreeSet iteration is already lexicographic.
        let sites: Vec<String> = self.store.list_sites().await?.into_iter().collect();

        Ok(SiteCatalog {
            site_count: sites.len(),
            sites,
        })
    }

    /// Single pass over the whole store.
    pub async fn analytics_summary(&self) -> Result<AnalyticsSummary, StoreError> {
        let site_statistics = self
            .store
            .scan_all()
            .try_fold(BTreeMap::<String, SiteStatistics>::new(), |mut acc, record| async move {
                let stats = acc.entry(record.site_id().to_string()).or_default();
                stats.records += 1;
                if record.anomaly() {
                    stats.anomalies += 1;
                }
                stats.total_generated += record.energy_generated_kwh();
                stats.total_consumed += record.energy_consumed_kwh();
                Ok(acc)
            })
            .await?;

        tracing::debug!(sites = site_statistics.len(), "analytics summary computed");
        Ok(AnalyticsSummary::from_statistics(site_statistics))
    }
}
