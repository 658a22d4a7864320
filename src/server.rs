//! HTTP surface: multipart ingest and the legacy batch trigger.

use crate::batch::{BatchCompressor, BatchSummary};
use crate::cancel::CancelFlag;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::ingest::{FieldFailure, IngestPipeline};
use crate::publisher::{publish, PublishedPaths};
use crate::receiver::{UploadReceiver, UploadSchema};
use axum::{
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use axum_extra::extract::Multipart;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<PipelineConfig>,
    pub receiver: Arc<UploadReceiver>,
    pub pipeline: Arc<IngestPipeline>,
    pub batch: Arc<BatchCompressor>,
    batch_running: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(config: PipelineConfig, schema: UploadSchema) -> Result<Self> {
        Ok(Self {
            receiver: Arc::new(UploadReceiver::new(schema, &config.staging_dir)),
            pipeline: Arc::new(IngestPipeline::new(&config)?),
            batch: Arc::new(BatchCompressor::new(&config)?),
            config: Arc::new(config),
            batch_running: Arc::new(Mutex::new(())),
        })
    }
}

#[derive(Debug)]
pub enum ApiError {
    Pipeline(PipelineError),
    BatchRunning,
    Worker(String),
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        Self::Pipeline(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, field) = match &self {
            Self::Pipeline(PipelineError::Validation(v)) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "VALIDATION_ERROR",
                v.to_string(),
                Some(v.field().to_string()),
            ),
            Self::Pipeline(e @ PipelineError::Multipart(_)) => {
                (StatusCode::BAD_REQUEST, "MALFORMED_REQUEST", e.to_string(), None)
            }
            Self::Pipeline(e) => {
                log::error!("❌ API: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "PIPELINE_ERROR",
                    e.to_string(),
                    None,
                )
            }
            Self::BatchRunning => (
                StatusCode::CONFLICT,
                "BATCH_RUNNING",
                "A legacy compression run is already in progress".to_string(),
                None,
            ),
            Self::Worker(msg) => {
                log::error!("❌ API: worker failed: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "WORKER_FAILED",
                    msg.clone(),
                    None,
                )
            }
        };

        let mut body = serde_json::json!({
            "error": code,
            "message": message,
        });
        if let Some(field) = field {
            body["field"] = serde_json::Value::String(field);
        }
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    #[serde(flatten)]
    pub paths: PublishedPaths,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<FieldFailure>,
}

async fn upload_api(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let cancel = CancelFlag::new();
    let guard = cancel.cancel_on_drop();

    let staged = state.receiver.receive(multipart).await?;
    let report = state.pipeline.process(staged, cancel).await;
    guard.disarm();

    let status = if report.stored.is_empty() && !report.failures.is_empty() {
        StatusCode::UNPROCESSABLE_ENTITY
    } else {
        StatusCode::OK
    };
    let response = UploadResponse {
        paths: publish(&report.stored),
        failures: report.failures,
    };
    Ok((status, Json(response)).into_response())
}

async fn compress_legacy_api(
    State(state): State<AppState>,
) -> Result<Json<BatchSummary>, ApiError> {
    let running = state
        .batch_running
        .clone()
        .try_lock_owned()
        .map_err(|_| ApiError::BatchRunning)?;

    let cancel = CancelFlag::new();
    let guard = cancel.cancel_on_drop();
    let batch = Arc::clone(&state.batch);
    let dir = state.config.legacy_dir.clone();

    let summary = tokio::task::spawn_blocking(move || {
        // held until the run ends, even if the request goes away
        let _running = running;
        batch.run(&dir, &cancel)
    })
    .await
    .map_err(|e| ApiError::Worker(e.to_string()))??;
    guard.disarm();

    Ok(Json(summary))
}

pub fn router(state: AppState) -> Router {
    let body_limit = state.config.max_request_bytes();
    Router::new()
        .route("/api/uploads", post(upload_api))
        .route("/api/admin/compress-legacy", post(compress_legacy_api))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
        .with_state(state)
}
