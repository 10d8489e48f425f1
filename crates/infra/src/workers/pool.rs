use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, error, info, info_span, warn};

use pagewatch_core::TenantId;

use crate::jobs::{AttemptOutcome, Job, JobOrchestrator, JobResult, Lane, QueueError};
use crate::lifecycle::CaptureLifecycle;

/// Processes one lane's jobs.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> JobResult;

    /// Called once when a job spends its last attempt.
    async fn on_exhausted(&self, job: &Job, reason: &str) {
        warn!(lane = %job.lane, job_id = %job.id, tenant_id = %job.tenant_id, reason, "job exhausted its retries");
    }
}

/// Caps concurrent jobs per tenant so one busy tenant cannot hold every worker.
#[derive(Debug)]
pub struct TenantLimiter {
    per_tenant: usize,
    permits: Mutex<HashMap<TenantId, Arc<Semaphore>>>,
}

impl TenantLimiter {
    pub fn new(per_tenant: usize) -> Self {
        Self {
            per_tenant: per_tenant.max(1),
            permits: Mutex::new(HashMap::new()),
        }
    }

    /// A permit if the tenant is under its cap. Never waits.
    pub fn try_acquire(&self, tenant_id: &TenantId) -> Option<OwnedSemaphorePermit> {
        let semaphore = {
            let mut permits = self.permits.lock().unwrap_or_else(|p| p.into_inner());
            Arc::clone(
                permits
                    .entry(tenant_id.clone())
                    .or_insert_with(|| Arc::new(Semaphore::new(self.per_tenant))),
            )
        };
        semaphore.try_acquire_owned().ok()
    }
}

/// One worker's view of a lane.
pub struct LaneWorker {
    lane: Lane,
    orchestrator: Arc<JobOrchestrator>,
    handler: Arc<dyn JobHandler>,
    limiter: Arc<TenantLimiter>,
    job_timeout: Duration,
}

impl LaneWorker {
    pub fn new(
        lane: Lane,
        orchestrator: Arc<JobOrchestrator>,
        handler: Arc<dyn JobHandler>,
        limiter: Arc<TenantLimiter>,
        job_timeout: Duration,
    ) -> Self {
        Self {
            lane,
            orchestrator,
            handler,
            limiter,
            job_timeout,
        }
    }

    /// Claim and run the oldest eligible job. Jobs of tenants at their
    /// concurrency cap are skipped, not waited on. Returns whether a job ran.
    pub async fn process_next(&self) -> Result<bool, QueueError> {
        let mut permit = None;
        let limiter = &self.limiter;
        let claimed = self.orchestrator.claim(self.lane, &mut |job: &Job| {
            match limiter.try_acquire(&job.tenant_id) {
                Some(acquired) => {
                    permit = Some(acquired);
                    true
                }
                None => false,
            }
        })
        .await?;
        let Some(job) = claimed else {
            return Ok(false);
        };
        let _permit = permit;

        let span = info_span!(
            "job",
            lane = %self.lane,
            job_id = %job.id,
            tenant_id = %job.tenant_id,
            attempt = job.attempts
        );
        self.run(job).instrument(span).await?;
        Ok(true)
    }

    async fn run(&self, job: Job) -> Result<(), QueueError> {
        let started_at = Utc::now();
        let result = match tokio::time::timeout(self.job_timeout, self.handler.handle(&job)).await {
            Ok(result) => result,
            Err(_) => JobResult::Transient(format!(
                "{} timed out after {}s",
                self.lane,
                self.job_timeout.as_secs()
            )),
        };

        let (job, outcome) = self
            .orchestrator
            .complete(self.lane, &job.id, result, started_at)
            .await?;
        match outcome {
            AttemptOutcome::Completed => debug!("job completed"),
            AttemptOutcome::RetryScheduled { attempt, delay } => {
                warn!(attempt, delay_ms = delay.as_millis() as u64, reason = job.failed_reason.as_deref(), "job attempt failed; retry scheduled");
            }
            AttemptOutcome::Failed { reason, attempts } => {
                error!(attempts, reason = %reason, "job failed");
                self.handler.on_exhausted(&job, &reason).await;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub workers_per_lane: usize,
    pub tenant_concurrency: usize,
    pub job_timeout: Duration,
    /// Idle wait between polls of an empty lane.
    pub poll_interval: Duration,
    pub scheduler_tick: Duration,
    /// Active jobs untouched this long lost their worker and are re-queued.
    /// Never shorter than twice `job_timeout`.
    pub stalled_after: Duration,
    /// Finished jobs are deleted this long after they finish.
    pub finished_retention: Duration,
    pub maintenance_tick: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers_per_lane: 4,
            tenant_concurrency: 2,
            job_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(250),
            scheduler_tick: Duration::from_secs(30),
            stalled_after: Duration::from_secs(300),
            finished_retention: Duration::from_secs(24 * 60 * 60),
            maintenance_tick: Duration::from_secs(60),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_workers_per_lane(mut self, workers: usize) -> Self {
        self.workers_per_lane = workers.max(1);
        self
    }

    pub fn with_tenant_concurrency(mut self, limit: usize) -> Self {
        self.tenant_concurrency = limit.max(1);
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_scheduler_tick(mut self, tick: Duration) -> Self {
        self.scheduler_tick = tick;
        self
    }

    pub fn with_stalled_after(mut self, after: Duration) -> Self {
        self.stalled_after = after;
        self
    }

    pub fn with_finished_retention(mut self, retention: Duration) -> Self {
        self.finished_retention = retention;
        self
    }

    pub fn with_maintenance_tick(mut self, tick: Duration) -> Self {
        self.maintenance_tick = tick;
        self
    }

    fn stalled_grace(&self) -> Duration {
        self.stalled_after.max(self.job_timeout.saturating_mul(2))
    }
}

/// Handle to stop and join the pool's tasks.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerPoolHandle {
    /// Request graceful shutdown and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "worker task ended abnormally");
            }
        }
    }
}

/// Workers for every lane that has a handler, a maintenance task that
/// re-queues stalled jobs and reaps finished ones, plus the recurring-capture
/// scheduler when a lifecycle is attached.
pub struct WorkerPool {
    orchestrator: Arc<JobOrchestrator>,
    handlers: HashMap<Lane, Arc<dyn JobHandler>>,
    scheduler: Option<Arc<CaptureLifecycle>>,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    pub fn new(orchestrator: Arc<JobOrchestrator>, config: WorkerPoolConfig) -> Self {
        Self {
            orchestrator,
            handlers: HashMap::new(),
            scheduler: None,
            config,
        }
    }

    pub fn with_handler(mut self, lane: Lane, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(lane, handler);
        self
    }

    pub fn with_scheduler(mut self, lifecycle: Arc<CaptureLifecycle>) -> Self {
        self.scheduler = Some(lifecycle);
        self
    }

    /// Must be called inside a tokio runtime.
    pub fn spawn(self) -> WorkerPoolHandle {
        let (shutdown, signal) = watch::channel(false);
        let mut tasks = Vec::new();

        for lane in Lane::ALL {
            let Some(handler) = self.handlers.get(&lane) else {
                info!(lane = %lane, "no handler configured; lane will not be processed");
                continue;
            };
            // Limits are per lane: a tenant saturating captures still gets notifications out.
            let limiter = Arc::new(TenantLimiter::new(self.config.tenant_concurrency));
            for index in 0..self.config.workers_per_lane {
                let worker = LaneWorker::new(
                    lane,
                    Arc::clone(&self.orchestrator),
                    Arc::clone(handler),
                    Arc::clone(&limiter),
                    self.config.job_timeout,
                );
                tasks.push(tokio::spawn(
                    worker_loop(worker, self.config.poll_interval, signal.clone())
                        .instrument(info_span!("worker", lane = %lane, index)),
                ));
            }
        }

        tasks.push(tokio::spawn(
            maintenance_loop(
                Arc::clone(&self.orchestrator),
                self.config.clone(),
                signal.clone(),
            )
            .instrument(info_span!("queue_maintenance")),
        ));

        if let Some(lifecycle) = self.scheduler {
            tasks.push(tokio::spawn(scheduler_loop(
                lifecycle,
                self.config.scheduler_tick,
                signal.clone(),
            )));
        }

        info!(tasks = tasks.len(), "worker pool started");
        WorkerPoolHandle { shutdown, tasks }
    }
}

async fn worker_loop(worker: LaneWorker, poll_interval: Duration, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        match worker.process_next().await {
            Ok(true) => continue,
            Ok(false) => {}
            Err(err) => warn!(error = %err, "queue error while claiming job"),
        }

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
    debug!("worker stopped");
}

async fn maintenance_loop(
    orchestrator: Arc<JobOrchestrator>,
    config: WorkerPoolConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(config.maintenance_tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = interval.tick() => maintain(&orchestrator, &config).await,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("maintenance stopped");
}

async fn maintain(orchestrator: &JobOrchestrator, config: &WorkerPoolConfig) {
    for lane in Lane::ALL {
        if let Err(err) = orchestrator.requeue_stalled(lane, config.stalled_grace()).await {
            warn!(lane = %lane, error = %err, "stalled job sweep failed");
        }
        if let Err(err) = orchestrator.reap(lane, config.finished_retention).await {
            warn!(lane = %lane, error = %err, "finished job reap failed");
        }
    }
}

async fn scheduler_loop(lifecycle: Arc<CaptureLifecycle>, tick: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match lifecycle.run_due_schedules(Utc::now()).await {
                    Ok(0) => {}
                    Ok(submitted) => info!(submitted, "scheduled captures submitted"),
                    Err(err) => warn!(error = %err, "scheduler tick failed"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{
        InMemoryQueue, JobState, NotifyRequest, NotifyType, OrchestratorConfig, RetryPolicy,
    };
    use pagewatch_core::{ProjectId, ScreenshotId};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Scripted {
        results: Mutex<Vec<JobResult>>,
        exhausted: AtomicU32,
    }

    impl Scripted {
        fn new(mut results: Vec<JobResult>) -> Arc<Self> {
            results.reverse();
            Arc::new(Self {
                results: Mutex::new(results),
                exhausted: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl JobHandler for Scripted {
        async fn handle(&self, _job: &Job) -> JobResult {
            self.results.lock().unwrap().pop().unwrap_or(JobResult::Success)
        }

        async fn on_exhausted(&self, _job: &Job, _reason: &str) {
            self.exhausted.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Hangs;

    #[async_trait]
    impl JobHandler for Hangs {
        async fn handle(&self, _job: &Job) -> JobResult {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            JobResult::Success
        }
    }

    fn orchestrator() -> Arc<JobOrchestrator> {
        Arc::new(JobOrchestrator::new(
            Arc::new(InMemoryQueue::new()),
            OrchestratorConfig::default().with_notify_retry(RetryPolicy::fixed(2, Duration::ZERO)),
        ))
    }

    async fn notify(orch: &JobOrchestrator, tenant: &str) -> crate::jobs::JobId {
        orch.submit_notify(
            &TenantId::parse(tenant).unwrap(),
            NotifyRequest {
                kind: NotifyType::CaptureCompleted,
                project_id: ProjectId::new().to_string(),
                screenshot_id: ScreenshotId::new().to_string(),
                message: "done".to_string(),
                diff_ref: None,
                diff_metrics: None,
            },
        )
        .await
        .unwrap()
        .job_id
    }

    fn worker(orch: &Arc<JobOrchestrator>, handler: Arc<dyn JobHandler>, limiter: Arc<TenantLimiter>) -> LaneWorker {
        LaneWorker::new(Lane::Notify, Arc::clone(orch), handler, limiter, Duration::from_secs(5))
    }

    #[test]
    fn limiter_caps_each_tenant_independently() {
        let limiter = TenantLimiter::new(1);
        let a = TenantId::parse("org_a").unwrap();
        let b = TenantId::parse("org_b").unwrap();

        let held = limiter.try_acquire(&a).unwrap();
        assert!(limiter.try_acquire(&a).is_none());
        assert!(limiter.try_acquire(&b).is_some());

        drop(held);
        assert!(limiter.try_acquire(&a).is_some());
    }

    #[tokio::test]
    async fn transient_then_permanent_exhausts_and_calls_hook_once() {
        let orch = orchestrator();
        let id = notify(&orch, "org_a").await;
        let handler = Scripted::new(vec![
            JobResult::Transient("flaky".into()),
            JobResult::Transient("flaky again".into()),
        ]);
        let w = worker(&orch, handler.clone(), Arc::new(TenantLimiter::new(1)));

        assert!(w.process_next().await.unwrap());
        assert!(w.process_next().await.unwrap());
        assert!(!w.process_next().await.unwrap());

        let job = orch.job(Lane::Notify, &id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts, 2);
        assert_eq!(handler.exhausted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn saturated_tenant_is_skipped_for_another_tenant() {
        let orch = orchestrator();
        let first_a = notify(&orch, "org_a").await;
        let _second_a = notify(&orch, "org_a").await;
        let b = notify(&orch, "org_b").await;

        let limiter = Arc::new(TenantLimiter::new(1));
        let held = limiter.try_acquire(&TenantId::parse("org_a").unwrap()).unwrap();
        let w = worker(&orch, Scripted::new(vec![]), Arc::clone(&limiter));

        assert!(w.process_next().await.unwrap());
        assert_eq!(orch.job(Lane::Notify, &b).await.unwrap().unwrap().state, JobState::Completed);
        assert_eq!(orch.job(Lane::Notify, &first_a).await.unwrap().unwrap().state, JobState::Waiting);

        drop(held);
        assert!(w.process_next().await.unwrap());
        assert_eq!(orch.job(Lane::Notify, &first_a).await.unwrap().unwrap().state, JobState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_handler_times_out_as_transient() {
        let orch = orchestrator();
        let id = notify(&orch, "org_a").await;
        let w = LaneWorker::new(
            Lane::Notify,
            Arc::clone(&orch),
            Arc::new(Hangs),
            Arc::new(TenantLimiter::new(1)),
            Duration::from_secs(30),
        );

        assert!(w.process_next().await.unwrap());
        let job = orch.job(Lane::Notify, &id).await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
        assert!(job.failed_reason.unwrap().contains("timed out after 30s"));
    }

    #[tokio::test]
    async fn maintenance_requeues_lost_jobs_and_reaps_finished_ones() {
        let orch = orchestrator();
        let lost = notify(&orch, "org_a").await;
        let done = notify(&orch, "org_a").await;

        let claimed = orch.claim(Lane::Notify, &mut |_| true).await.unwrap().unwrap();
        assert_eq!(claimed.id, lost);
        let w = worker(&orch, Scripted::new(vec![]), Arc::new(TenantLimiter::new(1)));
        assert!(w.process_next().await.unwrap());
        assert_eq!(orch.job(Lane::Notify, &done).await.unwrap().unwrap().state, JobState::Completed);

        let config = WorkerPoolConfig::default()
            .with_job_timeout(Duration::ZERO)
            .with_stalled_after(Duration::ZERO)
            .with_finished_retention(Duration::ZERO);
        maintain(&orch, &config).await;

        assert_eq!(orch.job(Lane::Notify, &lost).await.unwrap().unwrap().state, JobState::Waiting);
        assert!(orch.job(Lane::Notify, &done).await.unwrap().is_none());
    }

    #[test]
    fn stalled_grace_outlasts_the_job_timeout() {
        let config = WorkerPoolConfig::default()
            .with_job_timeout(Duration::from_secs(600))
            .with_stalled_after(Duration::from_secs(60));
        assert_eq!(config.stalled_grace(), Duration::from_secs(1200));
    }

    #[tokio::test]
    async fn pool_drains_queue_and_shuts_down() {
        let orch = orchestrator();
        let ids: Vec<_> = {
            let mut ids = Vec::new();
            for _ in 0..5 {
                ids.push(notify(&orch, "org_a").await);
            }
            ids
        };
        let handle = WorkerPool::new(
            Arc::clone(&orch),
            WorkerPoolConfig::default()
                .with_workers_per_lane(2)
                .with_poll_interval(Duration::from_millis(5)),
        )
        .with_handler(Lane::Notify, Scripted::new(vec![]))
        .spawn();

        for _ in 0..200 {
            if orch.lane_status(Lane::Notify).await.unwrap().counts.completed == ids.len() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.shutdown().await;

        for id in ids {
            assert_eq!(orch.job(Lane::Notify, &id).await.unwrap().unwrap().state, JobState::Completed);
        }
    }
}
