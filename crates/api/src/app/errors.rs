use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use pagewatch_core::{DomainError, TenantContextError};
use pagewatch_infra::jobs::{OrchestratorError, QueueError};
use pagewatch_infra::lifecycle::LifecycleError;
use pagewatch_infra::tenancy::StoreError;

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    let message = err.to_string();
    match err {
        DomainError::Validation(_) => json_error(StatusCode::BAD_REQUEST, "validation_error", message),
        DomainError::InvalidId(_) => json_error(StatusCode::BAD_REQUEST, "invalid_id", message),
        DomainError::InvalidTransition(_) => json_error(StatusCode::CONFLICT, "invalid_transition", message),
        DomainError::NotFound => json_error(StatusCode::NOT_FOUND, "not_found", message),
        DomainError::Conflict(_) => json_error(StatusCode::CONFLICT, "conflict", message),
    }
}

pub fn tenant_error_to_response(err: TenantContextError) -> axum::response::Response {
    let code = match err {
        TenantContextError::MissingTenant => "missing_tenant",
        TenantContextError::UnknownTenant(_) => "unknown_tenant",
        TenantContextError::Mismatch { .. } => "tenant_isolation",
    };
    json_error(StatusCode::UNAUTHORIZED, code, err.to_string())
}

pub fn store_error_to_response(err: StoreError) -> axum::response::Response {
    let message = err.to_string();
    match err {
        StoreError::NotFound => json_error(StatusCode::NOT_FOUND, "not_found", message),
        StoreError::TenantIsolation(e) => tenant_error_to_response(e),
        StoreError::Conflict(_) => json_error(StatusCode::CONFLICT, "conflict", message),
        StoreError::Quota(_) => json_error(StatusCode::TOO_MANY_REQUESTS, "quota_exceeded", message),
        StoreError::Domain(e) => domain_error_to_response(e),
        StoreError::Backend(_) => {
            tracing::error!(error = %message, "storage backend error");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "storage_unavailable", message)
        }
    }
}

pub fn orchestrator_error_to_response(err: OrchestratorError) -> axum::response::Response {
    let message = err.to_string();
    match err {
        OrchestratorError::Validation(e) => domain_error_to_response(e),
        OrchestratorError::Queue(QueueError::NotFound(_)) => json_error(StatusCode::NOT_FOUND, "not_found", message),
        OrchestratorError::Queue(QueueError::Duplicate(_) | QueueError::NotActive(_) | QueueError::Conflict(_)) => {
            json_error(StatusCode::CONFLICT, "conflict", message)
        }
        OrchestratorError::Queue(QueueError::Backend(_)) => {
            tracing::error!(error = %message, "queue backend error");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "queue_unavailable", message)
        }
    }
}

pub fn lifecycle_error_to_response(err: LifecycleError) -> axum::response::Response {
    match err {
        LifecycleError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", err.to_string()),
        LifecycleError::Domain(e) => domain_error_to_response(e),
        LifecycleError::Store(e) => store_error_to_response(e),
        LifecycleError::Orchestrator(e) => orchestrator_error_to_response(e),
        LifecycleError::Collaborator(e) => json_error(StatusCode::BAD_GATEWAY, "collaborator_error", e.to_string()),
    }
}
