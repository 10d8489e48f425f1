use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};

use pagewatch_core::TenantId;

use crate::app::errors::json_error;
use crate::context::{PrincipalContext, RequestTenant};

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const PRINCIPAL_HEADER: &str = "x-principal-id";

/// Resolves the tenant (and principal, if sent) for tenant-scoped routes.
pub async fn tenant_middleware(mut req: axum::http::Request<axum::body::Body>, next: Next) -> Response {
    let tenant_id = match header(req.headers(), TENANT_HEADER).map(TenantId::parse) {
        Some(Ok(tenant_id)) => tenant_id,
        Some(Err(err)) => return json_error(StatusCode::UNAUTHORIZED, "missing_tenant", err.to_string()),
        None => {
            return json_error(
                StatusCode::UNAUTHORIZED,
                "missing_tenant",
                format!("{TENANT_HEADER} header is required"),
            );
        }
    };
    let principal = header(req.headers(), PRINCIPAL_HEADER).map(PrincipalContext::new);

    req.extensions_mut().insert(RequestTenant::new(tenant_id));
    if let Some(principal) = principal {
        req.extensions_mut().insert(principal);
    }

    next.run(req).await
}

#[derive(Clone)]
pub struct AdminState {
    pub token: Arc<str>,
}

/// Bearer-token check for operational routes.
pub async fn admin_middleware(
    State(state): State<AdminState>,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = extract_bearer(req.headers())?;
    if token != state.token.as_ref() {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn extract_bearer(headers: &HeaderMap) -> Result<&str, StatusCode> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let header = header.to_str().map_err(|_| StatusCode::UNAUTHORIZED)?;

    let header = header
        .strip_prefix("Bearer ")
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let token = header.trim();
    if token.is_empty() {
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(token)
}
