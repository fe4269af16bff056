use std::{str::FromStr, sync::Arc};

use bigdecimal::BigDecimal;
use energy_client::{EnergyStore, MemoryStore, QueryService, RangeQuery};
use energy_service::{
    pipeline::{IngestOptions, Ingestor, Pipeline},
    sources::BatchFileSource,
};
use serde_json::{json, Value};
use time::macros::datetime;

fn reading(site: &str, ts: &str, generated: f64, consumed: f64) -> Value {
    json!({
        "site_id": site,
        "timestamp": ts,
        "energy_generated_kwh": generated,
        "energy_consumed_kwh": consumed,
    })
}

fn setup() -> (Arc<MemoryStore>, Ingestor, QueryService) {
    let store = Arc::new(MemoryStore::new().with_scan_page_size(2));
    let ingestor = Ingestor::new(store.clone(), IngestOptions::default());
    let queries = QueryService::new(store.clone());
    (store, ingestor, queries)
}

#[tokio::test]
async fn reingesting_a_key_keeps_one_record_with_latest_fields() {
    let (store, ingestor, queries) = setup();

    ingestor
        .ingest(vec![reading("SITE_001", "2024-05-01T10:00:00Z", 120.5, 80.0)])
        .await;
    let second = ingestor
        .ingest(vec![reading("SITE_001", "2024-05-01T10:00:00Z", 1500.0, 80.0)])
        .await;
    assert_eq!(second.processed_count, 1);

    assert_eq!(store.record_count().await.unwrap(), 1);
    let data = queries.site_data("SITE_001", None, None, 100).await.unwrap();
    assert_eq!(data.record_count, 1);
    let rec = &data.data[0];
    assert_eq!(rec.energy_generated_kwh(), &BigDecimal::from(1500));
    assert_eq!(rec.net_energy_kwh(), &BigDecimal::from(1420));
    assert!(rec.anomaly());
}

#[tokio::test]
async fn equivalent_instants_address_the_same_key() {
    let (store, ingestor, _) = setup();

    ingestor
        .ingest(vec![
            reading("SITE_001", "2024-05-01T10:00:00Z", 1.0, 1.0),
            reading("SITE_001", "2024-05-01T12:00:00+02:00", 2.0, 1.0),
        ])
        .await;

    assert_eq!(store.record_count().await.unwrap(), 1);
}

#[tokio::test]
async fn repeated_keys_in_one_batch_match_a_sequential_run() {
    let (store, ingestor, queries) = setup();

    // Interleave many distinct keys with rewrites of one key so several
    // writes are in flight at once.
    let mut batch = Vec::new();
    for minute in 0..20 {
        batch.push(reading("SITE_002", &format!("2024-05-01T10:{minute:02}:00Z"), 1.0, 1.0));
        batch.push(reading("SITE_001", "2024-05-01T10:00:00Z", f64::from(minute), 1.0));
    }
    let report = ingestor.ingest(batch).await;
    assert_eq!(report.processed_count, 40);

    assert_eq!(store.record_count().await.unwrap(), 21);
    let data = queries.site_data("SITE_001", None, None, 100).await.unwrap();
    assert_eq!(data.record_count, 1);
    assert_eq!(data.data[0].energy_generated_kwh(), &BigDecimal::from(19));
}

#[tokio::test]
async fn one_malformed_record_does_not_sink_the_batch() {
    let (store, ingestor, _) = setup();

    let report = ingestor
        .ingest(vec![
            reading("SITE_001", "2024-05-01T10:00:00Z", 100.0, 50.0),
            reading("SITE_001", "2024-05-01T10:15:00Z", 110.0, 55.0),
            json!({
                "site_id": "SITE_001",
                "timestamp": "2024-05-01T10:30:00Z",
                "energy_consumed_kwh": 60.0
            }),
            reading("SITE_002", "2024-05-01T10:00:00Z", 90.0, 45.0),
            reading("SITE_002", "2024-05-01T10:15:00Z", 95.0, 40.0),
        ])
        .await;

    assert_eq!(report.processed_count, 4);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].index, 2);
    assert!(report.errors[0].reason.contains("energy_generated_kwh"));

    assert_eq!(store.record_count().await.unwrap(), 4);
    let missing = store
        .query_range(
            "SITE_001",
            &RangeQuery::between(Some(datetime!(2024-05-01 10:30:00 UTC)), None, 10),
        )
        .await
        .unwrap();
    assert!(missing.is_empty());
}

#[tokio::test]
async fn range_query_returns_newest_first() {
    let (_, ingestor, queries) = setup();

    ingestor
        .ingest(vec![
            reading("SITE_001", "2024-05-01T10:00:00Z", 1.0, 1.0),
            reading("SITE_001", "2024-05-01T10:30:00Z", 1.0, 1.0),
            reading("SITE_001", "2024-05-01T10:15:00Z", 1.0, 1.0),
        ])
        .await;

    let data = queries.site_data("SITE_001", None, None, 2).await.unwrap();
    let stamps: Vec<_> = data.data.iter().map(|r| r.timestamp()).collect();
    assert_eq!(
        stamps,
        vec![
            datetime!(2024-05-01 10:30:00 UTC),
            datetime!(2024-05-01 10:15:00 UTC)
        ]
    );
}

#[tokio::test]
async fn summary_matches_ingested_batch() {
    let (_, ingestor, queries) = setup();

    let report = ingestor
        .ingest(vec![
            reading("A", "2024-05-01T10:00:00Z", -2.0, 10.0),
            reading("A", "2024-05-01T10:15:00Z", 50.0, 1000.5),
            reading("A", "2024-05-01T10:30:00Z", 40.0, 30.0),
            reading("B", "2024-05-01T10:00:00Z", 60.0, 20.0),
            reading("B", "2024-05-01T10:15:00Z", 70.0, 25.0),
        ])
        .await;
    assert_eq!(report.anomaly_count, 2);

    let summary = queries.analytics_summary().await.unwrap();
    assert_eq!(summary.total_records, 5);
    assert_eq!(summary.total_anomalies, 2);
    assert_eq!(summary.anomaly_rate, 40.0);
    assert_eq!(summary.site_count, 2);

    let a = &summary.site_statistics["A"];
    assert_eq!((a.records, a.anomalies), (3, 2));
    assert_eq!(a.total_generated, BigDecimal::from(88));
    assert_eq!(a.total_consumed, BigDecimal::from_str("1040.5").unwrap());
    assert_eq!(summary.site_statistics["B"].anomalies, 0);
}

#[tokio::test]
async fn summary_of_empty_store() {
    let (_, _, queries) = setup();
    let summary = queries.analytics_summary().await.unwrap();
    assert_eq!(summary.total_records, 0);
    assert_eq!(summary.anomaly_rate, 0.0);
}

#[tokio::test]
async fn site_catalog_is_sorted_without_duplicates() {
    let (_, ingestor, queries) = setup();

    ingestor
        .ingest(vec![
            reading("SITE_005", "2024-05-01T10:00:00Z", 1.0, 1.0),
            reading("SITE_002", "2024-05-01T10:00:00Z", 1.0, 1.0),
            reading("SITE_005", "2024-05-01T10:15:00Z", 1.0, 1.0),
            reading("SITE_002", "2024-05-01T10:15:00Z", 1.0, 1.0),
            reading("SITE_003", "2024-05-01T10:00:00Z", 1.0, 1.0),
        ])
        .await;

    let catalog = queries.all_sites().await.unwrap();
    assert_eq!(catalog.sites, vec!["SITE_002", "SITE_003", "SITE_005"]);
    assert_eq!(catalog.site_count, 3);
}

#[tokio::test]
async fn staged_files_flow_through_the_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("energy_data_20240501_100000.json"),
        serde_json::to_string(&vec![
            reading("SITE_001", "2024-05-01T10:00:00Z", 120.0, 60.0),
            reading("SITE_002", "2024-05-01T10:00:00Z", 5.0, -3.0),
        ])
        .unwrap(),
    )
    .unwrap();
    std::fs::write(
        dir.path().join("energy_data_20240501_101500.json"),
        serde_json::to_string(&vec![reading("SITE_001", "2024-05-01T10:15:00Z", 130.0, 70.0)]).unwrap(),
    )
    .unwrap();

    let (store, ingestor, queries) = setup();
    let pipeline = Pipeline {
        source: BatchFileSource::new([dir.path()]),
        ingestor: Arc::new(ingestor),
        max_concurrent_batches: 2,
    };
    let summary = pipeline.run().await;

    assert_eq!(summary.batches, 2);
    assert_eq!(summary.processed_count, 3);
    assert_eq!(summary.anomaly_count, 1);
    assert_eq!(store.record_count().await.unwrap(), 3);

    let anomalies = queries.site_anomalies("SITE_002", 50).await.unwrap();
    assert_eq!(anomalies.anomaly_count, 1);
}
