//! Read-only HTTP surface over [`QueryService`].

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use energy_client::{
    query::{AnalyticsSummary, SiteAnomalies, SiteCatalog, SiteData, DEFAULT_ANOMALY_LIMIT, DEFAULT_SITE_DATA_LIMIT},
    QueryService, StoreError,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tower_http::cors::CorsLayer;

use crate::transform::parse_timestamp;

#[derive(Clone)]
struct ApiState {
    queries: QueryService,
    max_limit: usize,
}

impl ApiState {
    fn limit(&self, requested: Option<&str>, default: usize) -> Result<usize, ApiError> {
        let limit = match requested {
            None => default,
            Some(text) => text.trim().parse::<usize>().map_err(|_| ApiError::BadRequest {
                param: "limit",
                reason: format!("`{text}` is not a non-negative integer"),
            })?,
        };
        Ok(limit.min(self.max_limit))
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("invalid {param}: {reason}")]
    BadRequest { param: &'static str, reason: String },
    #[error("Error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Store(e) => {
                tracing::error!(error = %e, "query failed in store");
                metrics::counter!("api_store_errors_total").increment(1);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(ErrorBody { detail: self.to_string() })).into_response()
    }
}

pub fn router(queries: QueryService, max_limit: usize) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/sites", get(all_sites))
        .route("/sites/:site_id/data", get(site_data))
        .route("/sites/:site_id/anomalies", get(site_anomalies))
        .route("/analytics/summary", get(analytics_summary))
        .layer(CorsLayer::permissive())
        .with_state(ApiState { queries, max_limit })
}

#[derive(Serialize)]
struct RootResponse {
    message: &'static str,
    version: &'static str,
}

async fn root() -> Json<RootResponse> {
    Json(RootResponse {
        message: "Renewable Energy Data API",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        timestamp: OffsetDateTime::now_utc(),
    })
}

#[derive(Debug, Deserialize)]
struct SiteDataParams {
    start_time: Option<String>,
    end_time: Option<String>,
    limit: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LimitParams {
    limit: Option<String>,
}

fn time_param(param: &'static str, value: Option<&str>) -> Result<Option<OffsetDateTime>, ApiError> {
    value
        .map(|text| {
            parse_timestamp(text).map_err(|e| ApiError::BadRequest {
                param,
                reason: e.to_string(),
            })
        })
        .transpose()
}

async fn site_data(
    State(state): State<ApiState>,
    Path(site_id): Path<String>,
    Query(params): Query<SiteDataParams>,
) -> Result<Json<SiteData>, ApiError> {
    metrics::counter!("api_requests_total", "endpoint" => "site_data").increment(1);

    let start = time_param("start_time", params.start_time.as_deref())?;
    let end = time_param("end_time", params.end_time.as_deref())?;
    let limit = state.limit(params.limit.as_deref(), DEFAULT_SITE_DATA_LIMIT)?;

    Ok(Json(state.queries.site_data(&site_id, start, end, limit).await?))
}

async fn site_anomalies(
    State(state): State<ApiState>,
    Path(site_id): Path<String>,
    Query(params): Query<LimitParams>,
) -> Result<Json<SiteAnomalies>, ApiError> {
    metrics::counter!("api_requests_total", "endpoint" => "site_anomalies").increment(1);

    let limit = state.limit(params.limit.as_deref(), DEFAULT_ANOMALY_LIMIT)?;
    Ok(Json(state.queries.site_anomalies(&site_id, limit).await?))
}

async fn all_sites(State(state): State<ApiState>) -> Result<Json<SiteCatalog>, ApiError> {
    metrics::counter!("api_requests_total", "endpoint" => "sites").increment(1);
    Ok(Json(state.queries.all_sites().await?))
}

async fn analytics_summary(State(state): State<ApiState>) -> Result<Json<AnalyticsSummary>, ApiError> {
    metrics::counter!("api_requests_total", "endpoint" => "analytics_summary").increment(1);
    Ok(Json(state.queries.analytics_summary().await?))
}
