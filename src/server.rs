//! HTTP JSON API.
//!
//! Thin axum layer over [`DedupeService`]. Every route is scoped by
//! organization id in the path.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/orgs/{org}/ingest` | Pull pages from the content source |
//! | `POST` | `/orgs/{org}/scan` | Run a similarity scan |
//! | `GET`  | `/orgs/{org}/duplicates` | Pending duplicate pairs |
//! | `GET`  | `/orgs/{org}/duplicates/summary` | Pending/resolved counts |
//! | `POST` | `/orgs/{org}/duplicates/{pair_id}/resolve` | Mark a pair resolved |
//! | `POST` | `/orgs/{org}/merges` | Apply a merge |
//! | `GET`  | `/orgs/{org}/merges` | Merge history, newest first |
//! | `GET`  | `/orgs/{org}/merges/{id}/undo-check` | Validate an undo |
//! | `POST` | `/orgs/{org}/merges/{id}/undo` | Undo a merge |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "not found: merge operation 42" } }
//! ```
//!
//! Merge and undo answer `200` with `success: false` for refusals
//! (unknown ids, wrong state, blocked undo); only infrastructure failures
//! use error statuses.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use dedupe_harness_core::error::DedupeError;
use dedupe_harness_core::models::{DuplicatePair, MergeOperation};
use dedupe_harness_core::undo::UndoCheck;

use crate::config::Config;
use crate::ingest::IngestReport;
use crate::pair_cache::PairSummary;
use crate::scan::{ScanOptions, ScanReport};
use crate::service::{DedupeService, MergeOutcome, UndoOutcome};

type AppState = Arc<DedupeService>;

/// Build the router. Exposed separately from [`run_server`] so tests can
/// serve it on an ephemeral port.
pub fn router(service: Arc<DedupeService>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/orgs/{org}/ingest", post(handle_ingest))
        .route("/orgs/{org}/scan", post(handle_scan))
        .route("/orgs/{org}/duplicates", get(handle_list_duplicates))
        .route("/orgs/{org}/duplicates/summary", get(handle_summary))
        .route(
            "/orgs/{org}/duplicates/{pair_id}/resolve",
            post(handle_resolve),
        )
        .route(
            "/orgs/{org}/merges",
            get(handle_history).post(handle_merge),
        )
        .route("/orgs/{org}/merges/{id}/undo-check", get(handle_undo_check))
        .route("/orgs/{org}/merges/{id}/undo", post(handle_undo))
        .layer(cors)
        .with_state(service)
}

/// Start the API server on `[server].bind`. Runs until the process exits.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let service = Arc::new(DedupeService::from_config(config).await?);
    let app = router(service);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "API server listening");
    println!("Dedupe API listening on http://{}", config.server.bind);
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<DedupeError> for AppError {
    fn from(err: DedupeError) -> Self {
        let status = match &err {
            DedupeError::NotFound(_) => StatusCode::NOT_FOUND,
            DedupeError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            DedupeError::InvalidState(_) | DedupeError::SequentialUndoRequired { .. } => {
                StatusCode::CONFLICT
            }
            DedupeError::ExternalSystemFailure { .. } => StatusCode::BAD_GATEWAY,
            DedupeError::PartialFailure { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::warn!(error = %err, "request failed");
        }
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Ingest, scan, and duplicates ============

async fn handle_ingest(
    State(service): State<AppState>,
    Path(org): Path<String>,
) -> Result<Json<IngestReport>, AppError> {
    Ok(Json(service.ingest(&org).await?))
}

#[derive(Debug, Default, Deserialize)]
struct ScanRequest {
    #[serde(default)]
    threshold: Option<f32>,
    #[serde(default)]
    update_existing: bool,
}

async fn handle_scan(
    State(service): State<AppState>,
    Path(org): Path<String>,
    body: Option<Json<ScanRequest>>,
) -> Result<Json<ScanReport>, AppError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let report = service
        .scan(
            &org,
            ScanOptions {
                threshold: request.threshold,
                update_existing: request.update_existing,
            },
        )
        .await?;
    Ok(Json(report))
}

#[derive(Serialize)]
struct DuplicatesResponse {
    pairs: Vec<DuplicatePair>,
}

async fn handle_list_duplicates(
    State(service): State<AppState>,
    Path(org): Path<String>,
) -> Result<Json<DuplicatesResponse>, AppError> {
    let pairs = service.list_duplicates(&org).await?;
    Ok(Json(DuplicatesResponse { pairs }))
}

async fn handle_summary(
    State(service): State<AppState>,
    Path(org): Path<String>,
) -> Result<Json<PairSummary>, AppError> {
    Ok(Json(service.summary(&org).await?))
}

#[derive(Serialize)]
struct ResolveResponse {
    resolved: bool,
}

async fn handle_resolve(
    State(service): State<AppState>,
    Path((org, pair_id)): Path<(String, u64)>,
) -> Result<Json<ResolveResponse>, AppError> {
    let resolved = service.resolve_pair(&org, pair_id).await?;
    Ok(Json(ResolveResponse { resolved }))
}

// ============ Merges ============

#[derive(Debug, Deserialize)]
struct MergeRequest {
    kept_id: String,
    removed_id: String,
    merged_content: String,
}

async fn handle_merge(
    State(service): State<AppState>,
    Path(org): Path<String>,
    Json(request): Json<MergeRequest>,
) -> Result<Json<MergeOutcome>, AppError> {
    if request.merged_content.trim().is_empty() {
        return Err(DedupeError::InvalidInput("merged_content must not be empty".into()).into());
    }
    let outcome = service
        .apply_merge(
            &org,
            &request.kept_id,
            &request.removed_id,
            &request.merged_content,
        )
        .await?;
    Ok(Json(outcome))
}

#[derive(Serialize)]
struct HistoryResponse {
    operations: Vec<MergeOperation>,
}

async fn handle_history(
    State(service): State<AppState>,
    Path(org): Path<String>,
) -> Result<Json<HistoryResponse>, AppError> {
    let operations = service.merge_history(&org).await?;
    Ok(Json(HistoryResponse { operations }))
}

async fn handle_undo_check(
    State(service): State<AppState>,
    Path((org, id)): Path<(String, String)>,
) -> Result<Json<UndoCheck>, AppError> {
    Ok(Json(service.validate_undo(&org, &id).await?))
}

async fn handle_undo(
    State(service): State<AppState>,
    Path((org, id)): Path<(String, String)>,
) -> Result<Json<UndoOutcome>, AppError> {
    Ok(Json(service.undo(&org, &id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_statuses() {
        let cases = [
            (DedupeError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (DedupeError::InvalidInput("x".into()), StatusCode::BAD_REQUEST),
            (DedupeError::InvalidState("x".into()), StatusCode::CONFLICT),
            (
                DedupeError::external(
                    dedupe_harness_core::error::ExternalSystem::ContentSource,
                    "down",
                ),
                StatusCode::BAD_GATEWAY,
            ),
        ];
        for (err, status) in cases {
            let code = err.code();
            let app: AppError = err.into();
            assert_eq!(app.status, status);
            assert_eq!(app.code, code);
        }
    }
}
