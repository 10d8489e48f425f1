//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: infrastructure wiring (tenant store, lanes, lifecycle, workers)
//! - `routes/`: HTTP routes + handlers (one file per area)
//! - `dto.rs`: request bodies and JSON mapping helpers
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{
    Extension, Router,
    routing::{get, post},
};
use tower::ServiceBuilder;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::AppServices;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
///
/// Admin routes are only mounted when `admin_token` is set.
pub fn build_app(services: Arc<AppServices>, admin_token: Option<String>) -> Router {
    // Tenant routes: require x-tenant-id.
    let tenant_routes = routes::router().route_layer(axum::middleware::from_fn(middleware::tenant_middleware));

    let mut app = Router::new()
        .route("/health", get(routes::system::health))
        .route("/webhooks/identity", post(routes::webhooks::identity))
        .merge(tenant_routes);

    if let Some(token) = admin_token {
        let admin_state = middleware::AdminState { token: token.into() };
        app = app.nest(
            "/admin",
            routes::admin::router().route_layer(axum::middleware::from_fn_with_state(
                admin_state,
                middleware::admin_middleware,
            )),
        );
    }

    app.layer(ServiceBuilder::new().layer(Extension(services)))
}
