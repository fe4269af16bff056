use std::{
    collections::HashMap,
    pin::Pin,
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};

use energy_client::{EnergyRecord, EnergyStore, StoreError};
use futures::{stream, Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::oneshot;

use crate::transform::validate_reading;

#[derive(Debug)]
pub struct Envelope<T> {
    pub payload: T,
    pub received_at: SystemTime,
}

/// One producer batch as handed over by a source.
#[derive(Debug)]
pub struct RawBatch {
    /// Where the batch came from (`http`, a file path); used in logs only.
    pub origin: String,
    pub readings: Vec<Value>,
    /// Receives the batch's report once ingestion finishes.
    pub reply: Option<oneshot::Sender<IngestReport>>,
}

impl RawBatch {
    pub fn new(origin: impl Into<String>, readings: Vec<Value>) -> Self {
        Self {
            origin: origin.into(),
            readings,
            reply: None,
        }
    }

    /// Content hash of the readings. A retried batch logs the same id.
    pub fn batch_id(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for reading in &self.readings {
            let text = reading.to_string();
            hasher.update(&(text.len() as u64).to_le_bytes());
            hasher.update(text.as_bytes());
        }
        hasher.finalize().to_hex()[..16].to_string()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("source error: {0}")]
    Source(String),
}

#[async_trait::async_trait]
pub trait Source<T>: Send + Sync {
    async fn stream(
        &self,
    ) -> Pin<Box<dyn Stream<Item = Result<Envelope<T>, PipelineError>> + Send>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordError {
    /// Position of the reading in its batch.
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub message: String,
    pub processed_count: usize,
    pub anomaly_count: usize,
    /// In input order.
    pub errors: Vec<RecordError>,
}

#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Writes in flight at once within one batch.
    pub write_concurrency: usize,
    /// Extra attempts for a write that failed with a transient store error.
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            write_concurrency: 8,
            max_retries: 2,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

/// Validate, classify and upsert one batch at a time.
///
/// A bad reading or a failed write only costs that reading: it is recorded in
/// the report and the rest of the batch proceeds. Writes are idempotent, so a
/// caller may resubmit the whole batch.
pub struct Ingestor {
    store: Arc<dyn EnergyStore>,
    options: IngestOptions,
}

impl Ingestor {
    pub fn new(store: Arc<dyn EnergyStore>, options: IngestOptions) -> Self {
        Self { store, options }
    }

    pub async fn ingest(&self, batch: Vec<Value>) -> IngestReport {
        let started = Instant::now();
        let processed_at = OffsetDateTime::now_utc();

        let mut outcomes: Vec<Option<Result<bool, RecordError>>> = vec![None; batch.len()];
        let mut chains: Vec<Vec<(usize, EnergyRecord)>> = Vec::new();
        let mut chain_of: HashMap<(String, OffsetDateTime), usize> = HashMap::new();
        for (index, raw) in batch.into_iter().enumerate() {
            match self.prepare_record(index, &raw, processed_at) {
                Ok(record) => {
                    let key = (record.site_id().to_string(), record.timestamp());
                    let slot = *chain_of.entry(key).or_insert_with(|| {
                        chains.push(Vec::new());
                        chains.len() - 1
                    });
                    chains[slot].push((index, record));
                }
                Err(e) => outcomes[index] = Some(Err(e)),
            }
        }

        // Readings sharing a key are written one after another in input order,
        // so the last one wins; distinct keys are written concurrently.
        let written: Vec<Vec<(usize, Result<bool, RecordError>)>> = stream::iter(chains)
            .map(|chain| self.write_chain(chain))
            .buffer_unordered(self.options.write_concurrency.max(1))
            .collect()
            .await;
        for (index, outcome) in written.into_iter().flatten() {
            outcomes[index] = Some(outcome);
        }

        let mut report = IngestReport::default();
        for outcome in outcomes.into_iter().flatten() {
            match outcome {
                Ok(anomaly) => {
                    report.processed_count += 1;
                    if anomaly {
                        report.anomaly_count += 1;
                    }
                }
                Err(e) => report.errors.push(e),
            }
        }
        report.message = format!("Successfully processed {} records", report.processed_count);

        metrics::counter!("ingest_batches_total").increment(1);
        metrics::counter!("ingest_records_processed_total").increment(report.processed_count as u64);
        metrics::counter!("ingest_anomalies_total").increment(report.anomaly_count as u64);
        metrics::histogram!("ingest_batch_duration_seconds").record(started.elapsed().as_secs_f64());

        report
    }

    fn prepare_record(
        &self,
        index: usize,
        raw: &Value,
        processed_at: OffsetDateTime,
    ) -> Result<EnergyRecord, RecordError> {
        let reading = validate_reading(raw).map_err(|e| {
            metrics::counter!("ingest_record_errors_total", "kind" => e.kind()).increment(1);
            tracing::debug!(index, error = %e, "rejected reading");
            RecordError {
                index,
                reason: e.to_string(),
            }
        })?;
        Ok(reading.classify(processed_at))
    }

    async fn write_chain(
        &self,
        chain: Vec<(usize, EnergyRecord)>,
    ) -> Vec<(usize, Result<bool, RecordError>)> {
        let mut outcomes = Vec::with_capacity(chain.len());
        for (index, record) in chain {
            outcomes.push((index, self.store_record(index, record).await));
        }
        outcomes
    }

    /// `Ok(anomaly)` once the record is stored.
    async fn store_record(&self, index: usize, record: EnergyRecord) -> Result<bool, RecordError> {
        let anomaly = record.anomaly();
        if anomaly {
            tracing::warn!(
                site_id = record.site_id(),
                timestamp = %record.timestamp(),
                generated = %record.energy_generated_kwh(),
                consumed = %record.energy_consumed_kwh(),
                "anomaly detected"
            );
        }

        self.put_with_retry(record).await.map_err(|e| {
            metrics::counter!("ingest_record_errors_total", "kind" => "store").increment(1);
            RecordError {
                index,
                reason: e.to_string(),
            }
        })?;

        Ok(anomaly)
    }

    async fn put_with_retry(&self, record: EnergyRecord) -> Result<(), StoreError> {
        let mut attempt: u32 = 0;
        loop {
            match self.store.put(record.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.options.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        error = %e,
                        attempt,
                        site_id = record.site_id(),
                        "store write failed, retrying with backoff"
                    );
                    metrics::counter!("ingest_store_retries_total").increment(1);
                    tokio::time::sleep(self.options.retry_backoff * attempt).await;
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        site_id = record.site_id(),
                        timestamp = %record.timestamp(),
                        "store write failed, giving up"
                    );
                    return Err(e);
                }
            }
        }
    }
}

/// Totals across every batch a pipeline run consumed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineSummary {
    pub batches: usize,
    /// Batches the source could not deliver (unreadable, not a JSON array).
    pub failed_batches: usize,
    pub processed_count: usize,
    pub anomaly_count: usize,
    pub record_errors: usize,
}

impl PipelineSummary {
    fn absorb(&mut self, report: &IngestReport) {
        self.batches += 1;
        self.processed_count += report.processed_count;
        self.anomaly_count += report.anomaly_count;
        self.record_errors += report.errors.len();
    }
}

pub struct Pipeline<S> {
    pub source: S,
    pub ingestor: Arc<Ingestor>,
    /// Batches ingested concurrently; batches never coordinate with each other.
    pub max_concurrent_batches: usize,
}

impl<S> Pipeline<S>
where
    S: Source<RawBatch> + Send + Sync + 'static,
{
    /// Drain the source. Returns once the source stream ends.
    pub async fn run(self) -> PipelineSummary {
        let stream = self.source.stream().await;
        let ingestor = self.ingestor;

        stream
            .map(|item| {
                let ingestor = ingestor.clone();
                async move {
                    match item {
                        Ok(env) => Some(ingest_envelope(&ingestor, env).await),
                        Err(e) => {
                            tracing::error!(error = %e, "error in upstream source, batch skipped");
                            None
                        }
                    }
                }
            })
            .buffer_unordered(self.max_concurrent_batches.max(1))
            .fold(PipelineSummary::default(), |mut summary, outcome| async move {
                match outcome {
                    Some(report) => summary.absorb(&report),
                    None => summary.failed_batches += 1,
                }
                summary
            })
            .await
    }
}

async fn ingest_envelope(ingestor: &Ingestor, env: Envelope<RawBatch>) -> IngestReport {
    let batch = env.payload;
    let batch_id = batch.batch_id();
    tracing::info!(
        batch_id = %batch_id,
        origin = %batch.origin,
        records = batch.readings.len(),
        "processing batch"
    );

    let report = ingestor.ingest(batch.readings).await;

    let latency = SystemTime::now()
        .duration_since(env.received_at)
        .unwrap_or_default();
    tracing::info!(
        batch_id = %batch_id,
        processed = report.processed_count,
        anomalies = report.anomaly_count,
        errors = report.errors.len(),
        latency_ms = latency.as_millis() as u64,
        "batch ingested"
    );

    if let Some(reply) = batch.reply {
        if reply.send(report.clone()).is_err() {
            tracing::debug!(batch_id = %batch_id, "batch submitter went away before the report");
        }
    }
    report
}
