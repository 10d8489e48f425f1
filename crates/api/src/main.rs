use std::sync::Arc;

use pagewatch_api::app::{build_app, services};
use pagewatch_api::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    pagewatch_observability::init();

    let services = Arc::new(services::build_services(&config).await?);
    let workers = services::start_workers(&services, &config)?;

    if config.admin_token.is_none() {
        tracing::warn!("ADMIN_TOKEN not set; admin routes are disabled");
    }
    let app = build_app(Arc::clone(&services), config.admin_token.clone());

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    workers.shutdown().await;
    Ok(())
}
