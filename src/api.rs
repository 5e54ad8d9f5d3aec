//! HTTP interface

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use crate::{
    codec,
    errors::TrackerError,
    models::{
        parse_timestamp, HistoryPoint, HistoryResponse, LocationResponse, TrackResponse,
        UploadBatch, UploadResponse,
    },
    pipeline::IngestPipeline,
};

/// Error returned to HTTP clients as `{"error": ...}`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<TrackerError> for ApiError {
    fn from(e: TrackerError) -> Self {
        match e {
            TrackerError::Validation(message) => Self::new(StatusCode::BAD_REQUEST, message),
            TrackerError::DeviceUnknown(_) => Self::new(StatusCode::NOT_FOUND, "Device not found"),
            other => {
                error!("Request failed: {}", other);
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<IngestPipeline>,
    /// Devices that reported within this window are online
    pub freshness_window: Duration,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/gps/upload", post(upload))
        .route("/api/devices/:device_id", get(device))
        .route("/api/devices/:device_id/location", get(latest_location))
        .route("/api/devices/:device_id/history", get(history))
        .route("/api/devices/:device_id/track", get(track))
        .route("/api/storage", get(storage))
        .with_state(state)
}

/// Parse an upload body, rejecting missing `device_id` or `locations`
fn parse_upload(body: &[u8]) -> Result<(String, Vec<crate::models::RawFix>), TrackerError> {
    let batch: UploadBatch = serde_json::from_slice(body)
        .map_err(|e| TrackerError::Validation(format!("Malformed upload: {}", e)))?;
    match (batch.device_id, batch.locations) {
        (Some(device_id), Some(locations)) if !device_id.is_empty() && !locations.is_empty() => {
            Ok((device_id, locations))
        }
        _ => Err(TrackerError::Validation(
            "Missing required parameters".to_string(),
        )),
    }
}

async fn upload(
    State(AppState { pipeline, .. }): State<AppState>,
    body: Bytes,
) -> Result<Json<UploadResponse>, ApiError> {
    let (device_id, locations) = parse_upload(&body)?;
    let report = pipeline.ingest_batch(&device_id, locations).await?;
    Ok(Json(UploadResponse {
        status: "success",
        processed_count: report.accepted_count,
        timestamp: report.completed_at,
    }))
}

async fn device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let record = state
        .pipeline
        .directory()
        .resolve(&device_id)
        .await?
        .ok_or_else(|| TrackerError::DeviceUnknown(device_id.clone()))?;
    let status = record.status(Utc::now(), state.freshness_window);
    let latest = state.pipeline.store().latest(&device_id).map(|fix| {
        json!({
            "latitude": fix.latitude,
            "longitude": fix.longitude,
            "timestamp": fix.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        })
    });

    Ok(Json(json!({
        "device_id": record.device_id,
        "device_name": record.name,
        "status": status,
        "last_seen": record
            .last_seen
            .map(|at| at.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        "latest_location": latest,
    })))
}

async fn latest_location(
    State(AppState { pipeline, .. }): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<LocationResponse>, ApiError> {
    match pipeline.store().latest(&device_id) {
        Some(fix) => Ok(Json(LocationResponse::new(&device_id, &fix))),
        None => Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "Device location not found",
        )),
    }
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    start_date: Option<String>,
    end_date: Option<String>,
}

fn parse_bound(value: Option<&str>, name: &str) -> Result<Option<chrono::DateTime<Utc>>, ApiError> {
    value
        .map(|value| {
            parse_timestamp(value).ok_or_else(|| {
                ApiError::new(StatusCode::BAD_REQUEST, format!("Invalid {}", name))
            })
        })
        .transpose()
}

async fn history(
    State(AppState { pipeline, .. }): State<AppState>,
    Path(device_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let start = parse_bound(query.start_date.as_deref(), "start_date")?;
    let end = parse_bound(query.end_date.as_deref(), "end_date")?;

    let history: Vec<HistoryPoint> = pipeline
        .store()
        .history(&device_id, start, end)
        .iter()
        .map(HistoryPoint::from)
        .collect();
    Ok(Json(HistoryResponse {
        device_id,
        total_points: history.len(),
        history,
    }))
}

async fn track(
    State(AppState { pipeline, .. }): State<AppState>,
    Path(device_id): Path<String>,
) -> Json<TrackResponse> {
    let fixes = pipeline.store().history(&device_id, None, None);
    Json(TrackResponse {
        total_points: fixes.len(),
        track: codec::encode(&fixes).into_string(),
        device_id,
    })
}

async fn storage(State(AppState { pipeline, .. }): State<AppState>) -> Result<Response, ApiError> {
    let sample = pipeline.monitor().sample_blocking().await?;
    Ok(Json(json!({
        "usage_percent": sample.usage_percent,
        "free_gb": sample.free_gb(),
        "total_gb": sample.total_gb(),
        "used_bytes": sample.used_bytes,
        "alert_threshold_percent": pipeline.monitor().threshold_percent(),
    }))
    .into_response())
}
