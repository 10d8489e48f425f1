use axum::{Router, routing::get};

pub mod admin;
pub mod common;
pub mod projects;
pub mod screenshots;
pub mod system;
pub mod webhooks;

/// Router for all tenant-scoped endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/quota", get(system::quota))
        .nest("/projects", projects::router())
        .nest("/screenshots", screenshots::router())
}
