use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};
use tracing::info;

use pagewatch_infra::tenancy::IdentityEvent;

use crate::app::{dto, errors, AppServices};

/// Identity-provider user lifecycle events. The tenant comes from the event
/// body; signature verification happens before the request reaches us.
pub async fn identity(
    Extension(services): Extension<Arc<AppServices>>,
    Json(event): Json<IdentityEvent>,
) -> axum::response::Response {
    let tenant_id = event.tenant_id().clone();
    match services.tenants.apply_identity_event(event).await {
        Ok(outcome) => {
            info!(tenant_id = %tenant_id, "identity event applied");
            (StatusCode::OK, Json(dto::identity_outcome_to_json(outcome))).into_response()
        }
        Err(e) => errors::store_error_to_response(e),
    }
}
