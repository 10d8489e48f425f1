//! Operational lane controls. Mounted under `/admin` behind `ADMIN_TOKEN`.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use tracing::info;

use pagewatch_infra::jobs::{CancelOutcome, JobId, JobSummary, Lane};

use crate::app::{dto, errors, AppServices};

const DEFAULT_RETRY_LIMIT: usize = 100;
const DEFAULT_REAP_GRACE_SECS: u64 = 24 * 60 * 60;

pub fn router() -> Router {
    Router::new()
        .route("/lanes/:lane", get(lane_status))
        .route("/lanes/:lane/retry", post(retry_failed))
        .route("/lanes/:lane/pause", post(pause))
        .route("/lanes/:lane/resume", post(resume))
        .route("/lanes/:lane/reap", post(reap))
        .route("/lanes/:lane/jobs/:job_id", get(get_job).delete(cancel_job))
}

fn parse_lane(raw: &str) -> Result<Lane, axum::response::Response> {
    Lane::parse(raw).ok_or_else(|| {
        errors::json_error(
            StatusCode::BAD_REQUEST,
            "invalid_lane",
            "lane must be one of: capture, diff, notify",
        )
    })
}

pub async fn lane_status(
    Extension(services): Extension<Arc<AppServices>>,
    Path(lane): Path<String>,
) -> axum::response::Response {
    let lane = match parse_lane(&lane) {
        Ok(lane) => lane,
        Err(resp) => return resp,
    };
    match services.orchestrator.lane_status(lane).await {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

pub async fn retry_failed(
    Extension(services): Extension<Arc<AppServices>>,
    Path(lane): Path<String>,
    body: Option<Json<dto::RetryRequest>>,
) -> axum::response::Response {
    let lane = match parse_lane(&lane) {
        Ok(lane) => lane,
        Err(resp) => return resp,
    };
    let limit = body
        .and_then(|Json(b)| b.limit)
        .unwrap_or(DEFAULT_RETRY_LIMIT);
    match services.lifecycle.retry_failed(lane, limit).await {
        Ok(ids) => (StatusCode::OK, Json(serde_json::json!({ "retried": ids }))).into_response(),
        Err(e) => errors::lifecycle_error_to_response(e),
    }
}

pub async fn pause(
    Extension(services): Extension<Arc<AppServices>>,
    Path(lane): Path<String>,
) -> axum::response::Response {
    let lane = match parse_lane(&lane) {
        Ok(lane) => lane,
        Err(resp) => return resp,
    };
    match services.orchestrator.pause(lane).await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({ "lane": lane, "paused": true }))).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

pub async fn resume(
    Extension(services): Extension<Arc<AppServices>>,
    Path(lane): Path<String>,
) -> axum::response::Response {
    let lane = match parse_lane(&lane) {
        Ok(lane) => lane,
        Err(resp) => return resp,
    };
    match services.orchestrator.resume(lane).await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({ "lane": lane, "paused": false }))).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

pub async fn reap(
    Extension(services): Extension<Arc<AppServices>>,
    Path(lane): Path<String>,
    body: Option<Json<dto::ReapRequest>>,
) -> axum::response::Response {
    let lane = match parse_lane(&lane) {
        Ok(lane) => lane,
        Err(resp) => return resp,
    };
    let grace_secs = body
        .and_then(|Json(b)| b.grace_secs)
        .unwrap_or(DEFAULT_REAP_GRACE_SECS);
    match services.orchestrator.reap(lane, Duration::from_secs(grace_secs)).await {
        Ok(removed) => (StatusCode::OK, Json(serde_json::json!({ "removed": removed }))).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path((lane, job_id)): Path<(String, String)>,
) -> axum::response::Response {
    let lane = match parse_lane(&lane) {
        Ok(lane) => lane,
        Err(resp) => return resp,
    };
    match services.orchestrator.job(lane, &JobId::from(job_id)).await {
        Ok(Some(job)) => (StatusCode::OK, Json(JobSummary::from(job))).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "job not found"),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

/// Cancellation is cooperative: an active job runs to completion.
pub async fn cancel_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path((lane, job_id)): Path<(String, String)>,
) -> axum::response::Response {
    let lane = match parse_lane(&lane) {
        Ok(lane) => lane,
        Err(resp) => return resp,
    };
    let job_id = JobId::from(job_id);
    match services.orchestrator.cancel(lane, &job_id).await {
        Ok(CancelOutcome::NotFound) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "job not found"),
        Ok(outcome) => {
            info!(lane = %lane, job_id = %job_id, outcome = ?outcome, "job cancel requested");
            (StatusCode::OK, Json(serde_json::json!({ "job_id": job_id, "outcome": outcome }))).into_response()
        }
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}
