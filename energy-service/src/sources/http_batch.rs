use std::{net::SocketAddr, sync::Arc, time::SystemTime};

use axum::{
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::pipeline::{Envelope, IngestReport, PipelineError, RawBatch, Source};

#[derive(Clone)]
struct SharedSender {
    tx: mpsc::Sender<Envelope<RawBatch>>,
}

/// `POST /ingest` with a JSON array of readings; answers with the batch's
/// [`IngestReport`] once it has been ingested.
///
/// The stream ends after the HTTP server shuts down and drops its sender.
pub struct HttpBatchSource {
    receiver: Arc<tokio::sync::Mutex<Option<mpsc::Receiver<Envelope<RawBatch>>>>>,
    local_addr: SocketAddr,
}

impl HttpBatchSource {
    pub async fn bind(
        bind_addr: &str,
        channel_capacity: usize,
        max_body_bytes: usize,
        shutdown: CancellationToken,
    ) -> Result<Self, PipelineError> {
        let (tx, rx) = mpsc::channel(channel_capacity.max(1));
        let app = router(tx, max_body_bytes);

        let addr: SocketAddr = bind_addr
            .parse()
            .map_err(|e| PipelineError::Source(format!("invalid bind addr: {e}")))?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| PipelineError::Source(format!("failed to bind ingest listener: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| PipelineError::Source(e.to_string()))?;

        tokio::spawn(async move {
            let serve = axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = serve.await {
                tracing::error!(error = %e, "HTTP ingest server error");
            }
        });
        tracing::info!(addr = %local_addr, "HTTP ingest listening");

        Ok(Self {
            receiver: Arc::new(tokio::sync::Mutex::new(Some(rx))),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

fn router(tx: mpsc::Sender<Envelope<RawBatch>>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/ingest", post(ingest_batch))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(SharedSender { tx })
}

#[async_trait::async_trait]
impl Source<RawBatch> for HttpBatchSource {
    async fn stream(
        &self,
    ) -> std::pin::Pin<Box<dyn Stream<Item = Result<Envelope<RawBatch>, PipelineError>> + Send>> {
        match self.receiver.lock().await.take() {
            Some(rx) => Box::pin(ReceiverStream::new(rx).map(Ok)),
            None => Box::pin(futures::stream::once(async {
                Err(PipelineError::Source(
                    "HTTP batch stream already taken; only one consumer supported".to_string(),
                ))
            })),
        }
    }
}

async fn ingest_batch(
    State(sender): State<SharedSender>,
    Json(readings): Json<Vec<Value>>,
) -> Result<Json<IngestReport>, StatusCode> {
    metrics::counter!("http_ingest_requests_total").increment(1);

    let (reply_tx, reply_rx) = oneshot::channel();
    let env = Envelope {
        payload: RawBatch {
            origin: "http".to_string(),
            readings,
            reply: Some(reply_tx),
        },
        received_at: SystemTime::now(),
    };

    if sender.tx.send(env).await.is_err() {
        metrics::counter!("http_ingest_failed_total").increment(1);
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    reply_rx.await.map(Json).map_err(|_| {
        metrics::counter!("http_ingest_failed_total").increment(1);
        StatusCode::SERVICE_UNAVAILABLE
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use tower::ServiceExt;

    fn post_json(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/ingest")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn replies_with_the_batch_report() {
        let (tx, mut rx) = mpsc::channel::<Envelope<RawBatch>>(4);
        tokio::spawn(async move {
            while let Some(env) = rx.recv().await {
                let batch: RawBatch = env.payload;
                let report = IngestReport {
                    processed_count: batch.readings.len(),
                    ..IngestReport::default()
                };
                if let Some(reply) = batch.reply {
                    let _ = reply.send(report);
                }
            }
        });

        let resp = router(tx, 1024 * 1024)
            .oneshot(post_json(r#"[{"site_id": "A"}, {"site_id": "B"}]"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["processed_count"], 2);
    }

    #[tokio::test]
    async fn non_array_body_is_rejected() {
        let (tx, _rx) = mpsc::channel(1);
        let resp = router(tx, 1024)
            .oneshot(post_json(r#"{"site_id": "A"}"#))
            .await
            .unwrap();
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let (tx, _rx) = mpsc::channel(1);
        let body = format!("[{}]", vec!["1"; 200].join(","));
        let resp = router(tx, 64).oneshot(post_json(&body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn closed_pipeline_is_unavailable() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let resp = router(tx, 1024).oneshot(post_json("[]")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn stream_can_only_be_taken_once() {
        let source = HttpBatchSource::bind("127.0.0.1:0", 1, 1024, CancellationToken::new())
            .await
            .unwrap();
        assert_ne!(source.local_addr().port(), 0);

        let _first = source.stream().await;
        let mut second = source.stream().await;
        assert!(matches!(second.next().await, Some(Err(PipelineError::Source(_)))));
    }
}
