use std::{
    collections::{BTreeMap, BTreeSet},
    ops::Bound,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use time::OffsetDateTime;

use super::{EnergyStore, Order, RangeQuery, RecordStream, StoreError};
use crate::domain::EnergyRecord;

pub const DEFAULT_SCAN_PAGE_SIZE: usize = 1000;

type Partition = BTreeMap<OffsetDateTime, EnergyRecord>;

#[derive(Default)]
struct Inner {
    partitions: BTreeMap<String, Partition>,
    len: usize,
}

/// In-process store: one ordered partition per site.
///
/// Locks are held only for the copy-out of a single call (or a single scan
/// page), never across an await point, so readers see writes as soon as each
/// `put` returns and a long aggregate scan does not stall ingestion.
pub struct MemoryStore {
    inner: RwLock<Inner>,
    max_records: Option<usize>,
    scan_page_size: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            max_records: None,
            scan_page_size: DEFAULT_SCAN_PAGE_SIZE,
        }
    }

    /// Reject novel keys once `max_records` distinct keys are stored.
    /// Overwrites of existing keys are always accepted.
    pub fn with_max_records(mut self, max_records: usize) -> Self {
        self.max_records = Some(max_records);
        self
    }

    pub fn with_scan_page_size(mut self, scan_page_size: usize) -> Self {
        self.scan_page_size = scan_page_size.max(1);
        self
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, StoreError> {
        self.inner
            .read()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, StoreError> {
        self.inner
            .write()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    /// Copy out the next scan page, strictly after `cursor` in
    /// `(site_id, timestamp)` order.
    fn page_after(&self, cursor: Option<&(String, OffsetDateTime)>) -> Result<Vec<EnergyRecord>, StoreError> {
        let inner = self.read()?;
        let mut page = Vec::with_capacity(self.scan_page_size);

        let first_site = match cursor {
            Some((site, _)) => Bound::Included(site.as_str()),
            None => Bound::Unbounded,
        };

        for (site, partition) in inner.partitions.range::<str, _>((first_site, Bound::Unbounded)) {
            let records: Box<dyn Iterator<Item = &EnergyRecord>> = match cursor {
                Some((cursor_site, cursor_ts)) if cursor_site == site => Box::new(
                    partition
                        .range((Bound::Excluded(*cursor_ts), Bound::Unbounded))
                        .map(|(_, r)| r),
                ),
                _ => Box::new(partition.values()),
            };

            for record in records {
                if page.len() == self.scan_page_size {
                    return Ok(page);
                }
                page.push(record.clone());
            }
        }

        Ok(page)
    }
}

#[async_trait::async_trait]
impl EnergyStore for MemoryStore {
    async fn put(&self, record: EnergyRecord) -> Result<(), StoreError> {
        let mut inner = self.write()?;

        let exists = inner
            .partitions
            .get(record.site_id())
            .is_some_and(|p| p.contains_key(&record.timestamp()));

        if !exists {
            if let Some(limit) = self.max_records {
                if inner.len >= limit {
                    return Err(StoreError::CapacityExceeded { limit });
                }
            }
            inner.len += 1;
        }

        inner
            .partitions
            .entry(record.site_id().to_string())
            .or_default()
            .insert(record.timestamp(), record);

        Ok(())
    }

    async fn query_range(&self, site_id: &str, query: &RangeQuery) -> Result<Vec<EnergyRecord>, StoreError> {
        if let (Some(start), Some(end)) = (query.start, query.end) {
            if start > end {
                return Ok(Vec::new());
            }
        }

        let inner = self.read()?;
        let Some(partition) = inner.partitions.get(site_id) else {
            return Ok(Vec::new());
        };

        let lower = query.start.map_or(Bound::Unbounded, Bound::Included);
        let upper = query.end.map_or(Bound::Unbounded, Bound::Included);
        let range = partition.range((lower, upper)).map(|(_, r)| r.clone());

        let records = match query.order {
            Order::Descending => range.rev().take(query.limit).collect(),
            Order::Ascending => range.take(query.limit).collect(),
        };
        Ok(records)
    }

    async fn query_anomalies(&self, site_id: &str, limit: usize) -> Result<Vec<EnergyRecord>, StoreError> {
        let inner = self.read()?;
        let Some(partition) = inner.partitions.get(site_id) else {
            return Ok(Vec::new());
        };

        Ok(partition
            .values()
            .rev()
            .filter(|r| r.anomaly())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list_sites(&self) -> Result<BTreeSet<String>, StoreError> {
        let inner = self.read()?;
        Ok(inner
            .partitions
            .iter()
            .filter(|(_, p)| !p.is_empty())
            .map(|(site, _)| site.clone())
            .collect())
    }

    fn scan_all(&self) -> RecordStream<'_> {
        let s = async_stream::stream! {
            let mut cursor: Option<(String, OffsetDateTime)> = None;
            loop {
                let page = match self.page_after(cursor.as_ref()) {
                    Ok(page) => page,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                };
                let last_page = page.len() < self.scan_page_size;
                cursor = page.last().map(|r| (r.site_id().to_string(), r.timestamp()));

                for record in page {
                    yield Ok(record);
                }
                if last_page {
                    break;
                }
            }
        };

        Box::pin(s)
    }

    async fn record_count(&self) -> Result<u64, StoreError> {
        Ok(self.read()?.len as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bigdecimal::BigDecimal;
    use futures::TryStreamExt;
    use std::str::FromStr;
    use time::{macros::datetime, Duration};

    fn reading(site: &str, ts: OffsetDateTime, generated: &str, consumed: &str) -> EnergyRecord {
        EnergyRecord::classified(
            site,
            ts,
            BigDecimal::from_str(generated).unwrap(),
            BigDecimal::from_str(consumed).unwrap(),
            datetime!(2024-05-02 00:00:00 UTC),
        )
    }

    fn t(minutes: i64) -> OffsetDateTime {
        datetime!(2024-05-01 00:00:00 UTC) + Duration::minutes(minutes)
    }

    #[tokio::test]
    async fn put_is_last_write_wins() {
        let store = MemoryStore::new();
        store.put(reading("A", t(0), "10", "5")).await.unwrap();
        store.put(reading("A", t(0), "20", "5")).await.unwrap();

        assert_eq!(store.record_count().await.unwrap(), 1);
        let rows = store.query_range("A", &RangeQuery::latest(10)).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].energy_generated_kwh(), &BigDecimal::from(20));
        assert_eq!(rows[0].net_energy_kwh(), &BigDecimal::from(15));
    }

    #[tokio::test]
    async fn range_is_newest_first_and_limited() {
        let store = MemoryStore::new();
        for m in [0, 10, 20] {
            store.put(reading("A", t(m), "1", "1")).await.unwrap();
        }

        let rows = store.query_range("A", &RangeQuery::latest(2)).await.unwrap();
        let stamps: Vec<_> = rows.iter().map(|r| r.timestamp()).collect();
        assert_eq!(stamps, vec![t(20), t(10)]);

        let mut asc = RangeQuery::latest(10);
        asc.order = Order::Ascending;
        let rows = store.query_range("A", &asc).await.unwrap();
        assert_eq!(rows.first().map(|r| r.timestamp()), Some(t(0)));
    }

    #[tokio::test]
    async fn range_bounds_are_inclusive() {
        let store = MemoryStore::new();
        for m in [0, 10, 20, 30] {
            store.put(reading("A", t(m), "1", "1")).await.unwrap();
        }

        let rows = store
            .query_range("A", &RangeQuery::between(Some(t(10)), Some(t(20)), 100))
            .await
            .unwrap();
        let stamps: Vec<_> = rows.iter().map(|r| r.timestamp()).collect();
        assert_eq!(stamps, vec![t(20), t(10)]);

        let rows = store
            .query_range("A", &RangeQuery::between(Some(t(25)), None, 100))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn inverted_or_unknown_ranges_are_empty() {
        let store = MemoryStore::new();
        store.put(reading("A", t(0), "1", "1")).await.unwrap();

        let inverted = RangeQuery::between(Some(t(10)), Some(t(0)), 10);
        assert!(store.query_range("A", &inverted).await.unwrap().is_empty());
        assert!(store.query_range("nope", &RangeQuery::latest(10)).await.unwrap().is_empty());
        assert!(store.query_anomalies("nope", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn anomalies_are_filtered_before_limit() {
        let store = MemoryStore::new();
        store.put(reading("A", t(0), "-1", "1")).await.unwrap();
        store.put(reading("A", t(10), "1", "1")).await.unwrap();
        store.put(reading("A", t(20), "1", "1500")).await.unwrap();
        store.put(reading("A", t(30), "1", "1")).await.unwrap();

        let rows = store.query_anomalies("A", 10).await.unwrap();
        let stamps: Vec<_> = rows.iter().map(|r| r.timestamp()).collect();
        assert_eq!(stamps, vec![t(20), t(0)]);

        assert_eq!(store.query_anomalies("A", 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn capacity_rejects_only_novel_keys() {
        let store = MemoryStore::new().with_max_records(1);
        store.put(reading("A", t(0), "1", "1")).await.unwrap();

        let err = store.put(reading("B", t(0), "1", "1")).await.unwrap_err();
        assert_eq!(err, StoreError::CapacityExceeded { limit: 1 });
        assert!(!store.list_sites().await.unwrap().contains("B"));

        store.put(reading("A", t(0), "2", "1")).await.unwrap();
        assert_eq!(store.record_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn list_sites_is_distinct() {
        let store = MemoryStore::new();
        store.put(reading("B", t(0), "1", "1")).await.unwrap();
        store.put(reading("A", t(0), "1", "1")).await.unwrap();
        store.put(reading("A", t(1), "1", "1")).await.unwrap();

        let sites: Vec<_> = store.list_sites().await.unwrap().into_iter().collect();
        assert_eq!(sites, vec!["A".to_string(), "B".to_string()]);
    }

    #[tokio::test]
    async fn scan_pages_across_partitions_without_gaps() {
        let store = MemoryStore::new().with_scan_page_size(2);
        for site in ["A", "B", "C"] {
            for m in 0..3 {
                store.put(reading(site, t(m), "1", "1")).await.unwrap();
            }
        }

        let all: Vec<EnergyRecord> = store.scan_all().try_collect().await.unwrap();
        assert_eq!(all.len(), 9);

        let mut keys: Vec<_> = all.iter().map(|r| (r.site_id().to_string(), r.timestamp())).collect();
        keys.dedup();
        assert_eq!(keys.len(), 9);
    }

    #[tokio::test]
    async fn scan_of_empty_store_ends_immediately() {
        let store = MemoryStore::new();
        let all: Vec<EnergyRecord> = store.scan_all().try_collect().await.unwrap();
        assert!(all.is_empty());
    }
}
