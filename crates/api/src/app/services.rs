//! Infrastructure wiring: tenant store, job lanes, lifecycle and workers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::PgPool;
use tracing::{info, warn};

use pagewatch_infra::collaborators::{BlobStore, HttpBlobStore, MemoryBlobStore, RenderServiceClient};
use pagewatch_infra::jobs::{
    InMemoryQueue, JobOrchestrator, Lane, OrchestratorConfig, PostgresJobStore, QueueBackend, RetryPolicy,
    ScheduleRegistry, ScheduleStore,
};
use pagewatch_infra::lifecycle::CaptureLifecycle;
use pagewatch_infra::notify::{NotificationRouter, NotificationSink, TracingSink, WebhookSink};
use pagewatch_infra::tenancy::{InMemoryTenantStore, PostgresTenantStore, TenantContext, TenantStore};
use pagewatch_infra::workers::{
    CaptureHandler, DiffHandler, NotifyHandler, WorkerPool, WorkerPoolConfig, WorkerPoolHandle,
};

use crate::config::AppConfig;

/// Shared handles used by every route.
#[derive(Clone)]
pub struct AppServices {
    pub tenants: TenantContext,
    pub orchestrator: Arc<JobOrchestrator>,
    pub lifecycle: Arc<CaptureLifecycle>,
}

impl AppServices {
    pub fn new(
        store: Arc<dyn TenantStore>,
        queue: Arc<dyn QueueBackend>,
        schedules: Arc<dyn ScheduleStore>,
        orchestrator: OrchestratorConfig,
    ) -> Self {
        let tenants = TenantContext::new(store);
        let orchestrator = Arc::new(JobOrchestrator::new(queue, orchestrator).with_schedules(schedules));
        let lifecycle = Arc::new(CaptureLifecycle::new(tenants.clone(), Arc::clone(&orchestrator)));
        Self {
            tenants,
            orchestrator,
            lifecycle,
        }
    }

    /// In-memory store, lanes and schedules with default retry budgets (dev/test).
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryTenantStore::new()),
            Arc::new(InMemoryQueue::new()),
            Arc::new(ScheduleRegistry::new()),
            OrchestratorConfig::default(),
        )
    }
}

pub fn orchestrator_config(config: &AppConfig) -> OrchestratorConfig {
    OrchestratorConfig::default().with_capture_retry(RetryPolicy::exponential(
        config.capture_max_attempts,
        config.retry_base_delay,
        Duration::from_secs(60),
    ))
}

/// Postgres when `DATABASE_URL` is set (migrations applied on start), in-memory
/// otherwise. Tenant rows, job lanes and schedules always share one backend.
pub async fn build_services(config: &AppConfig) -> anyhow::Result<AppServices> {
    let orchestrator = orchestrator_config(config);
    let Some(url) = &config.database_url else {
        warn!("DATABASE_URL not set; tenant rows, jobs and schedules are in-memory");
        return Ok(AppServices::new(
            Arc::new(InMemoryTenantStore::new()),
            Arc::new(InMemoryQueue::new()),
            Arc::new(ScheduleRegistry::new()),
            orchestrator,
        ));
    };

    let pool = PgPool::connect(url).await.context("failed to connect to DATABASE_URL")?;
    let store = PostgresTenantStore::new(pool.clone());
    store.migrate().await.context("failed to apply tenancy migrations")?;
    let jobs = Arc::new(PostgresJobStore::new(pool));
    jobs.migrate().await.context("failed to apply job migrations")?;
    info!("using postgres tenant store and job lanes");

    Ok(AppServices::new(Arc::new(store), jobs.clone(), jobs, orchestrator))
}

/// Start lane workers. Capture and diff lanes only run when their service is configured.
pub fn start_workers(services: &AppServices, config: &AppConfig) -> anyhow::Result<WorkerPoolHandle> {
    let mut sinks: Vec<Arc<dyn NotificationSink>> = vec![Arc::new(TracingSink)];
    if let Some(url) = &config.notify_webhook_url {
        sinks.push(Arc::new(WebhookSink::new(url.clone())?));
    }

    let client = Arc::new(RenderServiceClient::new(
        config.render_service_url.clone(),
        config.diff_service_url.clone(),
        config.capture_timeout + Duration::from_secs(5),
    )?);

    let pool_config = WorkerPoolConfig::default()
        .with_workers_per_lane(config.workers_per_lane)
        .with_tenant_concurrency(config.tenant_concurrency)
        .with_job_timeout(config.capture_timeout + Duration::from_secs(10))
        .with_scheduler_tick(config.scheduler_tick)
        .with_finished_retention(config.job_retention);

    let mut pool = WorkerPool::new(Arc::clone(&services.orchestrator), pool_config)
        .with_scheduler(Arc::clone(&services.lifecycle))
        .with_handler(Lane::Notify, Arc::new(NotifyHandler::new(NotificationRouter::new(sinks))));

    let blobs: Arc<dyn BlobStore> = match &config.blob_store_url {
        Some(url) => Arc::new(HttpBlobStore::new(url.clone(), Duration::from_secs(30))?),
        None => {
            warn!("BLOB_STORE_URL not set; captured images stay in this process");
            Arc::new(MemoryBlobStore::new())
        }
    };

    if config.render_service_url.is_some() {
        pool = pool.with_handler(
            Lane::Capture,
            Arc::new(CaptureHandler::new(
                Arc::clone(&services.lifecycle),
                client.clone(),
                blobs,
                config.capture_timeout,
            )),
        );
    } else {
        warn!("RENDER_SERVICE_URL not set; capture jobs will queue but not run");
    }

    if config.diff_service_url.is_some() {
        pool = pool.with_handler(
            Lane::Diff,
            Arc::new(DiffHandler::new(Arc::clone(&services.lifecycle), client)),
        );
    } else {
        warn!("DIFF_SERVICE_URL not set; diff jobs will queue but not run");
    }

    Ok(pool.spawn())
}
