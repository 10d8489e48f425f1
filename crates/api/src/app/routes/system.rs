use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};

use crate::app::{errors, AppServices};
use crate::context::RequestTenant;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// Plan limits and current usage for the calling tenant.
pub async fn quota(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<RequestTenant>,
) -> axum::response::Response {
    match services
        .tenants
        .with_tenant(tenant.as_str(), |scope| async move { scope.check_quota().await })
        .await
    {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}
