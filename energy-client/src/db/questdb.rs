use std::collections::BTreeSet;

use bigdecimal::BigDecimal;
use sqlx::{
    postgres::{PgPool, PgPoolOptions},
    Postgres, QueryBuilder,
};
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

use super::{memory::DEFAULT_SCAN_PAGE_SIZE, EnergyStore, Order, RangeQuery, RecordStream, StoreError};
use crate::domain::EnergyRecord;

/// WAL table with a designated timestamp; `DEDUP UPSERT KEYS` makes a repeated
/// `(ts, site_id)` replace the earlier row instead of appending a duplicate.
/// Quantity columns match `QUANTITY_PRECISION`/`QUANTITY_SCALE`, which
/// validation enforces.
pub const CREATE_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS energy_records (
    ts TIMESTAMP,
    site_id SYMBOL,
    energy_generated_kwh DECIMAL(38, 12),
    energy_consumed_kwh DECIMAL(38, 12),
    net_energy_kwh DECIMAL(38, 12),
    anomaly BOOLEAN,
    processed_at TIMESTAMP
) TIMESTAMP(ts) PARTITION BY DAY WAL
DEDUP UPSERT KEYS(ts, site_id)
"#;

// Derived columns are not read back; they are recomputed from the raw pair.
const SELECT_RECORDS: &str =
    "SELECT ts, site_id, energy_generated_kwh, energy_consumed_kwh, processed_at FROM energy_records ";

#[derive(Debug, sqlx::FromRow)]
struct EnergyRow {
    ts: PrimitiveDateTime,
    site_id: String,
    energy_generated_kwh: BigDecimal,
    energy_consumed_kwh: BigDecimal,
    processed_at: PrimitiveDateTime,
}

impl From<EnergyRow> for EnergyRecord {
    fn from(row: EnergyRow) -> Self {
        EnergyRecord::classified(
            row.site_id,
            row.ts.assume_utc(),
            row.energy_generated_kwh,
            row.energy_consumed_kwh,
            row.processed_at.assume_utc(),
        )
    }
}

fn utc_naive(ts: OffsetDateTime) -> PrimitiveDateTime {
    let utc = ts.to_offset(UtcOffset::UTC);
    PrimitiveDateTime::new(utc.date(), utc.time())
}

/// QuestDB over the Postgres wire protocol.
pub struct QuestDbStore {
    pool: PgPool,
    scan_page_size: usize,
}

impl QuestDbStore {
    pub async fn connect(uri: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(uri)
            .await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            scan_page_size: DEFAULT_SCAN_PAGE_SIZE,
        }
    }

    pub fn with_scan_page_size(mut self, scan_page_size: usize) -> Self {
        self.scan_page_size = scan_page_size.max(1);
        self
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_TABLE_SQL).execute(&self.pool).await?;
        Ok(())
    }
}

fn insert_query(record: &EnergyRecord) -> QueryBuilder<'_, Postgres> {
    let mut builder = QueryBuilder::<Postgres>::new(
        "INSERT INTO energy_records (ts, site_id, energy_generated_kwh, energy_consumed_kwh, \
         net_energy_kwh, anomaly, processed_at) ",
    );
    builder.push_values(std::iter::once(record), |mut b, r| {
        b.push_bind(utc_naive(r.timestamp()))
            .push_bind(r.site_id())
            .push_bind(r.energy_generated_kwh())
            .push_bind(r.energy_consumed_kwh())
            .push_bind(r.net_energy_kwh())
            .push_bind(r.anomaly())
            .push_bind(utc_naive(r.processed_at()));
    });
    builder
}

fn range_query<'a>(site_id: &'a str, query: &RangeQuery) -> QueryBuilder<'a, Postgres> {
    let mut builder = QueryBuilder::<Postgres>::new(SELECT_RECORDS);
    builder.push("WHERE site_id = ").push_bind(site_id);
    if let Some(start) = query.start {
        builder.push(" AND ts >= ").push_bind(utc_naive(start));
    }
    if let Some(end) = query.end {
        builder.push(" AND ts <= ").push_bind(utc_naive(end));
    }
    builder.push(match query.order {
        Order::Descending => " ORDER BY ts DESC",
        Order::Ascending => " ORDER BY ts ASC",
    });
    builder.push(format_args!(" LIMIT {}", query.limit));
    builder
}

fn anomalies_query(site_id: &str, limit: usize) -> QueryBuilder<'_, Postgres> {
    let mut builder = QueryBuilder::<Postgres>::new(SELECT_RECORDS);
    builder
        .push("WHERE site_id = ")
        .push_bind(site_id)
        .push(" AND anomaly = true ORDER BY ts DESC")
        .push(format_args!(" LIMIT {limit}"));
    builder
}

/// Key of the last row a scan page returned.
type ScanCursor = (PrimitiveDateTime, String);

// Pages resume strictly after the last `(ts, site_id)` seen, so rows inserted
// mid-scan never shift a page boundary.
fn scan_page_query(after: Option<ScanCursor>, page_size: usize) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::<Postgres>::new(SELECT_RECORDS);
    if let Some((ts, site_id)) = after {
        builder
            .push("WHERE ts > ")
            .push_bind(ts)
            .push(" OR (ts = ")
            .push_bind(ts)
            .push(" AND site_id > ")
            .push_bind(site_id)
            .push(") ");
    }
    builder.push(format_args!("ORDER BY ts, site_id LIMIT {page_size}"));
    builder
}

#[async_trait::async_trait]
impl EnergyStore for QuestDbStore {
    async fn put(&self, record: EnergyRecord) -> Result<(), StoreError> {
        insert_query(&record).build().execute(&self.pool).await?;
        Ok(())
    }

    async fn query_range(&self, site_id: &str, query: &RangeQuery) -> Result<Vec<EnergyRecord>, StoreError> {
        if query.limit == 0 {
            return Ok(Vec::new());
        }
        if let (Some(start), Some(end)) = (query.start, query.end) {
            if start > end {
                return Ok(Vec::new());
            }
        }

        let rows = range_query(site_id, query)
            .build_query_as::<EnergyRow>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(EnergyRecord::from).collect())
    }

    async fn query_anomalies(&self, site_id: &str, limit: usize) -> Result<Vec<EnergyRecord>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let rows = anomalies_query(site_id, limit)
            .build_query_as::<EnergyRow>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(EnergyRecord::from).collect())
    }

    async fn list_sites(&self) -> Result<BTreeSet<String>, StoreError> {
        let sites = sqlx::query_scalar::<_, String>("SELECT DISTINCT site_id FROM energy_records")
            .fetch_all(&self.pool)
            .await?;
        Ok(sites.into_iter().collect())
    }

    fn scan_all(&self) -> RecordStream<'_> {
        let s = async_stream::try_stream! {
            let mut cursor: Option<ScanCursor> = None;
            loop {
                let mut query = scan_page_query(cursor.take(), self.scan_page_size);
                let rows = query
                    .build_query_as::<EnergyRow>()
                    .fetch_all(&self.pool)
                    .await
                    .map_err(StoreError::from)?;

                let fetched = rows.len();
                cursor = rows.last().map(|row| (row.ts, row.site_id.clone()));
                for row in rows {
                    yield EnergyRecord::from(row);
                }
                if fetched < self.scan_page_size {
                    break;
                }
            }
        };

        Box::pin(s)
    }

    async fn record_count(&self) -> Result<u64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT count(*) FROM energy_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
