use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use pagewatch_core::model::{NewProject, NewScreenshot};
use pagewatch_core::ProjectId;

use crate::app::routes::common::parse_id;
use crate::app::{dto, errors, AppServices};
use crate::context::RequestTenant;

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_project).get(list_projects))
        .route("/:id", get(get_project))
        .route("/:id/screenshots", post(create_screenshot).get(list_screenshots))
        .route("/:id/run", post(run_project))
}

pub async fn create_project(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<RequestTenant>,
    Json(body): Json<NewProject>,
) -> axum::response::Response {
    match services
        .tenants
        .with_tenant(tenant.as_str(), |scope| async move { scope.create_project(body).await })
        .await
    {
        Ok(project) => (StatusCode::CREATED, Json(project)).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn list_projects(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<RequestTenant>,
) -> axum::response::Response {
    match services
        .tenants
        .with_tenant(tenant.as_str(), |scope| async move { scope.projects().await })
        .await
    {
        Ok(items) => (StatusCode::OK, Json(serde_json::json!({ "items": items }))).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn get_project(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<RequestTenant>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: ProjectId = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services
        .tenants
        .with_tenant(tenant.as_str(), |scope| async move { scope.project(id).await })
        .await
    {
        Ok(Some(project)) => (StatusCode::OK, Json(project)).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "project not found"),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn create_screenshot(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<RequestTenant>,
    Path(id): Path<String>,
    Json(body): Json<NewScreenshot>,
) -> axum::response::Response {
    let project_id: ProjectId = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services
        .tenants
        .with_tenant(tenant.as_str(), |scope| async move {
            scope.create_screenshot(project_id, body).await
        })
        .await
    {
        Ok(screenshot) => (StatusCode::CREATED, Json(screenshot)).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn list_screenshots(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<RequestTenant>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let project_id: ProjectId = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let result = services
        .tenants
        .with_tenant(tenant.as_str(), |scope| async move {
            if scope.project(project_id).await?.is_none() {
                return Ok(None);
            }
            scope.screenshots(project_id).await.map(Some)
        })
        .await;
    match result {
        Ok(Some(items)) => (StatusCode::OK, Json(serde_json::json!({ "items": items }))).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "project not found"),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// Bulk run: one deduplicating capture per screenshot in the project.
pub async fn run_project(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<RequestTenant>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let project_id: ProjectId = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.lifecycle.bulk_run(tenant.as_str(), project_id).await {
        Ok(items) => {
            let items: Vec<_> = items.into_iter().map(dto::bulk_item_to_json).collect();
            (StatusCode::ACCEPTED, Json(serde_json::json!({ "items": items }))).into_response()
        }
        Err(e) => errors::lifecycle_error_to_response(e),
    }
}
