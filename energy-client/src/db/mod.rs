//! Key-range storage for classified readings.
//!
//! Records are partitioned by `site_id` and ordered by `timestamp` inside a
//! partition. Per-site reads are range scans; the only full-store path is
//! [`EnergyStore::scan_all`], which grows linearly with the total number of
//! stored records and is reserved for aggregate summaries.

pub mod memory;
pub mod questdb;

use std::{collections::BTreeSet, pin::Pin};

use futures::Stream;
use time::OffsetDateTime;

use crate::domain::EnergyRecord;

pub use memory::MemoryStore;
pub use questdb::QuestDbStore;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store capacity of {limit} records exceeded")]
    CapacityExceeded { limit: usize },
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether repeating the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::WorkerCrashed => Self::Unavailable(e.to_string()),
            other => Self::Backend(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Order {
    Ascending,
    #[default]
    Descending,
}

/// Parameters for a single-site range scan. Both bounds are inclusive; an
/// absent bound leaves that side open.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeQuery {
    pub start: Option<OffsetDateTime>,
    pub end: Option<OffsetDateTime>,
    pub limit: usize,
    pub order: Order,
}

impl RangeQuery {
    pub fn latest(limit: usize) -> Self {
        Self {
            start: None,
            end: None,
            limit,
            order: Order::Descending,
        }
    }

    pub fn between(start: Option<OffsetDateTime>, end: Option<OffsetDateTime>, limit: usize) -> Self {
        Self {
            start,
            end,
            ..Self::latest(limit)
        }
    }

    pub fn contains(&self, ts: OffsetDateTime) -> bool {
        self.start.map_or(true, |s| ts >= s) && self.end.map_or(true, |e| ts <= e)
    }
}

pub type RecordStream<'a> = Pin<Box<dyn Stream<Item = Result<EnergyRecord, StoreError>> + Send + 'a>>;

#[async_trait::async_trait]
pub trait EnergyStore: Send + Sync {
    /// Idempotent upsert keyed by `(site_id, timestamp)`; last write wins.
    async fn put(&self, record: EnergyRecord) -> Result<(), StoreError>;

    /// Up to `query.limit` records of one site inside the range, in
    /// `query.order`. A site without matches yields an empty vector.
    async fn query_range(&self, site_id: &str, query: &RangeQuery) -> Result<Vec<EnergyRecord>, StoreError>;

    /// Most recent anomalous records of one site, newest first.
    async fn query_anomalies(&self, site_id: &str, limit: usize) -> Result<Vec<EnergyRecord>, StoreError>;

    async fn list_sites(&self) -> Result<BTreeSet<String>, StoreError>;

    /// Every stored record, in no particular order. Restartable only from the
    /// beginning; implementations page internally to bound memory.
    fn scan_all(&self) -> RecordStream<'_>;

    async fn record_count(&self) -> Result<u64, StoreError>;

    /// Release backend resources. Called once on shutdown.
    async fn close(&self) {}
}
