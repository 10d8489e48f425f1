use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use pagewatch_core::model::ApprovalAction;
use pagewatch_core::ScreenshotId;
use pagewatch_infra::lifecycle::RerunTrigger;

use crate::app::routes::common::parse_id;
use crate::app::{dto, errors, AppServices};
use crate::context::{PrincipalContext, RequestTenant};

pub fn router() -> Router {
    Router::new()
        .route("/:id", get(get_screenshot))
        .route("/:id/rerun", post(rerun))
        .route("/:id/diff", get(latest_diff))
        .route(
            "/:id/schedule",
            get(get_schedule).put(put_schedule).delete(delete_schedule),
        )
        .route("/:id/approval", post(apply_approval))
        .route("/:id/approvals", get(list_approvals))
}

fn screenshot_id(raw: &str) -> Result<ScreenshotId, axum::response::Response> {
    parse_id(raw)
}

fn not_found(what: &str) -> axum::response::Response {
    errors::json_error(StatusCode::NOT_FOUND, "not_found", format!("{what} not found"))
}

pub async fn get_screenshot(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<RequestTenant>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match screenshot_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services
        .tenants
        .with_tenant(tenant.as_str(), |scope| async move { scope.screenshot(id).await })
        .await
    {
        Ok(Some(screenshot)) => (StatusCode::OK, Json(screenshot)).into_response(),
        Ok(None) => not_found("screenshot"),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// Forced single re-run; always queues a new capture job.
pub async fn rerun(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<RequestTenant>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match screenshot_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services
        .lifecycle
        .rerun(tenant.as_str(), id, RerunTrigger::Manual)
        .await
    {
        Ok(submission) => (StatusCode::ACCEPTED, Json(dto::submission_to_json(&submission))).into_response(),
        Err(e) => errors::lifecycle_error_to_response(e),
    }
}

pub async fn latest_diff(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<RequestTenant>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match screenshot_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services
        .tenants
        .with_tenant(tenant.as_str(), |scope| async move { scope.latest_diff(id).await })
        .await
    {
        Ok(Some(diff)) => (StatusCode::OK, Json(diff)).into_response(),
        Ok(None) => not_found("diff"),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn get_schedule(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<RequestTenant>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match screenshot_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.orchestrator.schedule(id).await {
        Ok(Some(entry)) if entry.tenant_id == *tenant.tenant_id() => (StatusCode::OK, Json(entry)).into_response(),
        Ok(_) => not_found("schedule"),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

pub async fn put_schedule(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<RequestTenant>,
    Path(id): Path<String>,
    Json(body): Json<dto::ScheduleRequest>,
) -> axum::response::Response {
    let id = match screenshot_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.lifecycle.schedule(tenant.as_str(), id, &body.cron).await {
        Ok(entry) => (StatusCode::OK, Json(entry)).into_response(),
        Err(e) => errors::lifecycle_error_to_response(e),
    }
}

pub async fn delete_schedule(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<RequestTenant>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match screenshot_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.lifecycle.unschedule(tenant.as_str(), id).await {
        Ok(removed) => (StatusCode::OK, Json(serde_json::json!({ "removed": removed }))).into_response(),
        Err(e) => errors::lifecycle_error_to_response(e),
    }
}

/// Approve, reject or reset. Requires `x-principal-id`.
pub async fn apply_approval(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<RequestTenant>,
    principal: Option<Extension<PrincipalContext>>,
    Path(id): Path<String>,
    Json(body): Json<dto::ApprovalRequest>,
) -> axum::response::Response {
    let Some(Extension(principal)) = principal else {
        return errors::json_error(
            StatusCode::UNAUTHORIZED,
            "missing_principal",
            "x-principal-id header is required",
        );
    };
    let id = match screenshot_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let Some(action) = ApprovalAction::parse(body.action.trim()) else {
        return errors::json_error(
            StatusCode::BAD_REQUEST,
            "invalid_action",
            "action must be one of: approved, rejected, pending",
        );
    };

    match services
        .lifecycle
        .apply_approval(tenant.as_str(), id, action, principal.principal_id(), body.reason)
        .await
    {
        Ok(screenshot) => (StatusCode::OK, Json(screenshot)).into_response(),
        Err(e) => errors::lifecycle_error_to_response(e),
    }
}

pub async fn list_approvals(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<RequestTenant>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match screenshot_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let result = services
        .tenants
        .with_tenant(tenant.as_str(), |scope| async move {
            if scope.screenshot(id).await?.is_none() {
                return Ok(None);
            }
            scope.approval_events(id).await.map(Some)
        })
        .await;
    match result {
        Ok(Some(items)) => (StatusCode::OK, Json(serde_json::json!({ "items": items }))).into_response(),
        Ok(None) => not_found("screenshot"),
        Err(e) => errors::store_error_to_response(e),
    }
}
