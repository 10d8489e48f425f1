//! Lane-aware job orchestration: validated submission, inspection and
//! administrative controls over a [`QueueBackend`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use pagewatch_core::{DomainError, ScreenshotId, TenantId};

use super::payload::{CapturePayload, CaptureRequest, DiffRequest, JobPayload, NotifyRequest};
use super::schedule::{DueCapture, RecurringCapture, ScheduleRegistry, ScheduleStore};
use super::store::{
    CancelOutcome, EnqueueMode, LaneCounts, QueueBackend, QueueError, SubmitOutcome,
};
use super::store::Eligibility;
use super::types::{AttemptOutcome, Job, JobId, JobResult, JobState, Lane, RetryPolicy};

/// Identity policy for capture submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitMode {
    /// Timestamped identity, always new work.
    Adhoc,
    /// `capture:{screenshotId}` identity, replaces queued work for the screenshot.
    Deduplicating,
}

impl SubmitMode {
    /// Identity of a capture of `screenshot_id` submitted at `at`.
    pub fn capture_id(self, screenshot_id: ScreenshotId, at: DateTime<Utc>) -> JobId {
        match self {
            SubmitMode::Adhoc => JobId::capture_adhoc(screenshot_id, at),
            SubmitMode::Deduplicating => JobId::capture(screenshot_id),
        }
    }

    fn enqueue_mode(self) -> EnqueueMode {
        match self {
            SubmitMode::Adhoc => EnqueueMode::Unique,
            SubmitMode::Deduplicating => EnqueueMode::Deduplicate,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Validation(#[from] DomainError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Acknowledgement for one accepted submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Submission {
    pub lane: Lane,
    pub job_id: JobId,
    pub outcome: SubmitOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSummary {
    pub id: JobId,
    pub tenant_id: TenantId,
    pub state: JobState,
    pub attempts: u32,
    pub failed_reason: Option<String>,
    pub payload: JobPayload,
}

impl From<Job> for JobSummary {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            tenant_id: job.tenant_id,
            state: job.state,
            attempts: job.attempts,
            failed_reason: job.failed_reason,
            payload: job.payload,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LaneSample {
    pub waiting: Vec<JobSummary>,
    pub active: Vec<JobSummary>,
    pub failed: Vec<JobSummary>,
}

/// Operational view of a lane. Never used for business decisions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LaneStatus {
    pub lane: Lane,
    pub paused: bool,
    pub counts: LaneCounts,
    pub sample: LaneSample,
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub capture_retry: RetryPolicy,
    pub diff_retry: RetryPolicy,
    pub notify_retry: RetryPolicy,
    /// Entries per state in [`LaneStatus::sample`]
    pub sample_limit: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            capture_retry: RetryPolicy::exponential(3, Duration::from_secs(2), Duration::from_secs(60)),
            diff_retry: RetryPolicy::exponential(3, Duration::from_secs(1), Duration::from_secs(30)),
            notify_retry: RetryPolicy::exponential(5, Duration::from_secs(1), Duration::from_secs(60)),
            sample_limit: 10,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_capture_retry(mut self, policy: RetryPolicy) -> Self {
        self.capture_retry = policy;
        self
    }

    pub fn with_diff_retry(mut self, policy: RetryPolicy) -> Self {
        self.diff_retry = policy;
        self
    }

    pub fn with_notify_retry(mut self, policy: RetryPolicy) -> Self {
        self.notify_retry = policy;
        self
    }

    pub fn with_sample_limit(mut self, limit: usize) -> Self {
        self.sample_limit = limit;
        self
    }

    fn retry_for(&self, lane: Lane) -> RetryPolicy {
        match lane {
            Lane::Capture => self.capture_retry.clone(),
            Lane::Diff => self.diff_retry.clone(),
            Lane::Notify => self.notify_retry.clone(),
        }
    }
}

/// Submits, inspects, retries and cancels work across the three lanes.
pub struct JobOrchestrator {
    queue: Arc<dyn QueueBackend>,
    schedules: Arc<dyn ScheduleStore>,
    config: OrchestratorConfig,
}

impl std::fmt::Debug for JobOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobOrchestrator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Adhoc identities are millisecond-stamped; collisions move forward a tick.
pub const ADHOC_ID_ATTEMPTS: i64 = 16;

impl JobOrchestrator {
    /// Orchestrator over `queue` with process-local schedules.
    pub fn new(queue: Arc<dyn QueueBackend>, config: OrchestratorConfig) -> Self {
        Self {
            queue,
            schedules: Arc::new(ScheduleRegistry::new()),
            config,
        }
    }

    pub fn with_schedules(mut self, schedules: Arc<dyn ScheduleStore>) -> Self {
        self.schedules = schedules;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Validate and enqueue a capture.
    pub async fn submit_capture(
        &self,
        tenant_id: &TenantId,
        request: CaptureRequest,
        mode: SubmitMode,
    ) -> Result<Submission, OrchestratorError> {
        let payload = request.validate()?;
        self.enqueue_capture(tenant_id, payload, mode).await
    }

    /// Enqueue an already-validated capture payload, allocating its identity.
    pub async fn enqueue_capture(
        &self,
        tenant_id: &TenantId,
        payload: CapturePayload,
        mode: SubmitMode,
    ) -> Result<Submission, OrchestratorError> {
        let base = Utc::now();
        for tick in 0..ADHOC_ID_ATTEMPTS {
            let id = mode.capture_id(payload.screenshot_id, base + chrono::Duration::milliseconds(tick));
            match self.enqueue_capture_as(tenant_id, id, payload.clone(), mode).await {
                Err(OrchestratorError::Queue(QueueError::Duplicate(_))) if mode == SubmitMode::Adhoc => continue,
                other => return other,
            }
        }
        Err(QueueError::Backend("could not allocate an adhoc capture id".to_string()).into())
    }

    /// Enqueue a capture under an identity from [`SubmitMode::capture_id`].
    /// An adhoc identity that is already taken is a `Duplicate`.
    #[instrument(skip(self, payload), fields(tenant_id = %tenant_id, screenshot_id = %payload.screenshot_id, job_id = %id, mode = ?mode))]
    pub async fn enqueue_capture_as(
        &self,
        tenant_id: &TenantId,
        id: JobId,
        payload: CapturePayload,
        mode: SubmitMode,
    ) -> Result<Submission, OrchestratorError> {
        self.enqueue(tenant_id, id, JobPayload::Capture(payload), mode.enqueue_mode())
            .await
    }

    /// Enqueue many deduplicating captures. Each item is validated and
    /// submitted independently; one bad item never blocks the others.
    pub async fn submit_bulk_capture(
        &self,
        tenant_id: &TenantId,
        requests: Vec<CaptureRequest>,
    ) -> Vec<Result<Submission, OrchestratorError>> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            results.push(self.submit_capture(tenant_id, request, SubmitMode::Deduplicating).await);
        }
        let accepted = results.iter().filter(|r| r.is_ok()).count();
        info!(tenant_id = %tenant_id, accepted, rejected = results.len() - accepted, "bulk capture submitted");
        results
    }

    /// Diff jobs are keyed by the capture they compare, so a redelivered
    /// capture result does not queue a second comparison.
    pub async fn submit_diff(&self, tenant_id: &TenantId, request: DiffRequest) -> Result<Submission, OrchestratorError> {
        let payload = request.validate()?;
        let id = JobId::diff(payload.screenshot_id, &payload.current_image_ref);
        self.enqueue(tenant_id, id, JobPayload::Diff(payload), EnqueueMode::Deduplicate)
            .await
    }

    /// Queue a notification under a fresh identity.
    pub async fn submit_notify(&self, tenant_id: &TenantId, request: NotifyRequest) -> Result<Submission, OrchestratorError> {
        self.submit_notify_as(tenant_id, JobId::notify(), request).await
    }

    /// Queue a notification under a caller-chosen identity (deduplicating).
    pub async fn submit_notify_as(
        &self,
        tenant_id: &TenantId,
        id: JobId,
        request: NotifyRequest,
    ) -> Result<Submission, OrchestratorError> {
        let payload = request.validate()?;
        self.enqueue(tenant_id, id, JobPayload::Notify(payload), EnqueueMode::Deduplicate)
            .await
    }

    async fn enqueue(
        &self,
        tenant_id: &TenantId,
        id: JobId,
        payload: JobPayload,
        mode: EnqueueMode,
    ) -> Result<Submission, OrchestratorError> {
        let lane = payload.lane();
        let job = Job::new(id.clone(), tenant_id.clone(), payload, self.config.retry_for(lane), Utc::now());
        let outcome = self.queue.enqueue(job, mode).await?;
        debug!(lane = %lane, job_id = %id, outcome = ?outcome, "job submitted");
        Ok(Submission {
            lane,
            job_id: id,
            outcome,
        })
    }

    /// Register (or replace) the recurring capture for one screenshot.
    pub async fn schedule_recurring(
        &self,
        tenant_id: &TenantId,
        screenshot_id: ScreenshotId,
        expression: &str,
        request: CaptureRequest,
    ) -> Result<RecurringCapture, OrchestratorError> {
        let payload = request.validate()?;
        if payload.screenshot_id != screenshot_id {
            return Err(DomainError::validation("payload screenshotId does not match the schedule key").into());
        }
        let entry = RecurringCapture::new(tenant_id.clone(), expression, payload, Utc::now())?;
        let entry = self.schedules.register(entry).await?;
        info!(tenant_id = %tenant_id, screenshot_id = %screenshot_id, next_run = %entry.next_run, "recurring capture registered");
        Ok(entry)
    }

    pub async fn unschedule(&self, tenant_id: &TenantId, screenshot_id: ScreenshotId) -> Result<bool, OrchestratorError> {
        Ok(self.schedules.remove(tenant_id, screenshot_id).await?)
    }

    /// Registrations due at `now`; each is advanced past `now`.
    pub async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<DueCapture>, OrchestratorError> {
        Ok(self.schedules.take_due(now).await?)
    }

    pub async fn schedules(&self, tenant_id: &TenantId) -> Result<Vec<RecurringCapture>, OrchestratorError> {
        Ok(self.schedules.list(tenant_id).await?)
    }

    pub async fn schedule(&self, screenshot_id: ScreenshotId) -> Result<Option<RecurringCapture>, OrchestratorError> {
        Ok(self.schedules.get(screenshot_id).await?)
    }

    pub async fn lane_status(&self, lane: Lane) -> Result<LaneStatus, OrchestratorError> {
        let limit = self.config.sample_limit;
        let mut sample = LaneSample::default();
        for (state, into) in [
            (JobState::Waiting, &mut sample.waiting),
            (JobState::Active, &mut sample.active),
            (JobState::Failed, &mut sample.failed),
        ] {
            *into = self
                .queue
                .sample(lane, state, limit)
                .await?
                .into_iter()
                .map(JobSummary::from)
                .collect();
        }
        Ok(LaneStatus {
            lane,
            paused: self.queue.is_paused(lane).await?,
            counts: self.queue.counts(lane).await?,
            sample,
        })
    }

    pub async fn job(&self, lane: Lane, id: &JobId) -> Result<Option<Job>, OrchestratorError> {
        Ok(self.queue.get(lane, id).await?)
    }

    /// Move up to `limit` failed jobs back to waiting. Returns the moved jobs.
    pub async fn retry_failed(&self, lane: Lane, limit: usize) -> Result<Vec<Job>, OrchestratorError> {
        let jobs = self.queue.retry_failed(lane, limit, Utc::now()).await?;
        info!(lane = %lane, count = jobs.len(), "failed jobs re-queued");
        Ok(jobs)
    }

    /// Prevent future pickup of a job. Running attempts are not interrupted.
    pub async fn cancel(&self, lane: Lane, id: &JobId) -> Result<CancelOutcome, OrchestratorError> {
        let outcome = self.queue.cancel(lane, id).await?;
        if outcome == CancelOutcome::StillActive {
            warn!(lane = %lane, job_id = %id, "cancel requested for active job; it will run to completion");
        }
        Ok(outcome)
    }

    pub async fn pause(&self, lane: Lane) -> Result<(), OrchestratorError> {
        self.queue.set_paused(lane, true).await?;
        info!(lane = %lane, "lane paused");
        Ok(())
    }

    pub async fn resume(&self, lane: Lane) -> Result<(), OrchestratorError> {
        self.queue.set_paused(lane, false).await?;
        info!(lane = %lane, "lane resumed");
        Ok(())
    }

    /// Delete completed and failed jobs that finished more than `grace` ago.
    pub async fn reap(&self, lane: Lane, grace: Duration) -> Result<usize, OrchestratorError> {
        let Some(cutoff) = cutoff_before(grace) else {
            return Ok(0);
        };
        let removed = self.queue.reap(lane, cutoff).await?;
        if removed > 0 {
            info!(lane = %lane, removed, "finished jobs reaped");
        }
        Ok(removed)
    }

    /// Hand back active jobs untouched for longer than `grace`; their worker
    /// is gone (crash or restart). Returns the released ids.
    pub async fn requeue_stalled(&self, lane: Lane, grace: Duration) -> Result<Vec<JobId>, OrchestratorError> {
        let Some(cutoff) = cutoff_before(grace) else {
            return Ok(Vec::new());
        };
        let released = self.queue.requeue_stalled(lane, cutoff, Utc::now()).await?;
        for job in &released {
            warn!(lane = %lane, job_id = %job.id, tenant_id = %job.tenant_id, attempts = job.attempts, "stalled job re-queued");
        }
        Ok(released.into_iter().map(|job| job.id).collect())
    }

    pub(crate) async fn claim(
        &self,
        lane: Lane,
        eligible: &mut Eligibility<'_>,
    ) -> Result<Option<Job>, QueueError> {
        self.queue.claim_next(lane, Utc::now(), eligible).await
    }

    pub(crate) async fn complete(
        &self,
        lane: Lane,
        id: &JobId,
        result: JobResult,
        started_at: DateTime<Utc>,
    ) -> Result<(Job, AttemptOutcome), QueueError> {
        self.queue.complete(lane, id, result, started_at, Utc::now()).await
    }
}

fn cutoff_before(grace: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(grace)
        .ok()
        .and_then(|grace| Utc::now().checked_sub_signed(grace))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::payload::NotifyType;
    use crate::jobs::store::InMemoryQueue;
    use pagewatch_core::ProjectId;

    fn orchestrator() -> JobOrchestrator {
        JobOrchestrator::new(
            Arc::new(InMemoryQueue::new()),
            OrchestratorConfig::default().with_capture_retry(RetryPolicy::fixed(3, Duration::ZERO)),
        )
    }

    fn tenant() -> TenantId {
        TenantId::parse("org_a").unwrap()
    }

    fn capture(screenshot_id: ScreenshotId) -> CaptureRequest {
        CaptureRequest {
            project_id: ProjectId::new().to_string(),
            screenshot_id: screenshot_id.to_string(),
            url: "https://example.com".to_string(),
            selector: None,
            viewport: None,
        }
    }

    async fn claim_any(orch: &JobOrchestrator) -> Option<Job> {
        orch.claim(Lane::Capture, &mut |_| true).await.unwrap()
    }

    #[tokio::test]
    async fn adhoc_submission_shows_one_waiting_job() {
        let orch = orchestrator();
        let sid = ScreenshotId::new();

        let submission = orch
            .submit_capture(&tenant(), capture(sid), SubmitMode::Adhoc)
            .await
            .unwrap();
        assert_eq!(submission.outcome, SubmitOutcome::Created);
        assert!(submission.job_id.as_str().starts_with(&format!("capture:{sid}:")));

        let status = orch.lane_status(Lane::Capture).await.unwrap();
        assert_eq!(status.counts.waiting, 1);
        assert_eq!(status.sample.waiting[0].id, submission.job_id);
    }

    #[tokio::test]
    async fn adhoc_submissions_are_always_new_work() {
        let orch = orchestrator();
        let sid = ScreenshotId::new();
        for _ in 0..3 {
            let s = orch
                .submit_capture(&tenant(), capture(sid), SubmitMode::Adhoc)
                .await
                .unwrap();
            assert_eq!(s.outcome, SubmitOutcome::Created);
        }
        assert_eq!(orch.lane_status(Lane::Capture).await.unwrap().counts.waiting, 3);
    }

    #[tokio::test]
    async fn explicit_adhoc_identity_is_never_reused() {
        let orch = orchestrator();
        let sid = ScreenshotId::new();
        let payload = capture(sid).validate().unwrap();
        let id = SubmitMode::Adhoc.capture_id(sid, Utc::now());

        orch.enqueue_capture_as(&tenant(), id.clone(), payload.clone(), SubmitMode::Adhoc)
            .await
            .unwrap();
        let err = orch
            .enqueue_capture_as(&tenant(), id, payload, SubmitMode::Adhoc)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Queue(QueueError::Duplicate(_))));
    }

    #[tokio::test]
    async fn invalid_payload_is_never_enqueued() {
        let orch = orchestrator();
        let mut request = capture(ScreenshotId::new());
        request.url = "javascript:alert(1)".to_string();

        let err = orch
            .submit_capture(&tenant(), request, SubmitMode::Deduplicating)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(DomainError::Validation(_))));
        assert_eq!(orch.lane_status(Lane::Capture).await.unwrap().counts, LaneCounts::default());
    }

    #[tokio::test]
    async fn bulk_enqueues_each_item_independently() {
        let orch = orchestrator();
        let mut requests: Vec<_> = (0..4).map(|_| capture(ScreenshotId::new())).collect();
        requests[1].url = "nope".to_string();

        let results = orch.submit_bulk_capture(&tenant(), requests).await;
        assert_eq!(results.len(), 4);
        assert!(results[1].is_err());
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 3);

        let status = orch.lane_status(Lane::Capture).await.unwrap();
        assert_eq!(status.counts.waiting, 3);
        let ids: std::collections::HashSet<_> = status.sample.waiting.iter().map(|j| j.id.clone()).collect();
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test]
    async fn sample_is_bounded() {
        let orch = JobOrchestrator::new(
            Arc::new(InMemoryQueue::new()),
            OrchestratorConfig::default().with_sample_limit(2),
        );
        for _ in 0..5 {
            orch.submit_capture(&tenant(), capture(ScreenshotId::new()), SubmitMode::Deduplicating)
                .await
                .unwrap();
        }
        let status = orch.lane_status(Lane::Capture).await.unwrap();
        assert_eq!(status.counts.waiting, 5);
        assert_eq!(status.sample.waiting.len(), 2);
    }

    #[tokio::test]
    async fn cancel_waiting_job_before_pickup() {
        let orch = orchestrator();
        let waiting = orch
            .submit_capture(&tenant(), capture(ScreenshotId::new()), SubmitMode::Deduplicating)
            .await
            .unwrap();
        assert_eq!(orch.cancel(Lane::Capture, &waiting.job_id).await.unwrap(), CancelOutcome::Removed);
        assert!(orch.lane_status(Lane::Capture).await.unwrap().sample.waiting.is_empty());

        let active = orch
            .submit_capture(&tenant(), capture(ScreenshotId::new()), SubmitMode::Deduplicating)
            .await
            .unwrap();
        claim_any(&orch).await.unwrap();
        assert_eq!(orch.cancel(Lane::Capture, &active.job_id).await.unwrap(), CancelOutcome::StillActive);
        let status = orch.lane_status(Lane::Capture).await.unwrap();
        assert_eq!(status.sample.active.len(), 1);

        orch.complete(Lane::Capture, &active.job_id, JobResult::Success, Utc::now())
            .await
            .unwrap();
        let status = orch.lane_status(Lane::Capture).await.unwrap();
        assert!(status.sample.active.is_empty());
        assert_eq!(status.counts.completed, 1);
    }

    #[tokio::test]
    async fn exhausted_job_lands_in_failed_sample() {
        let orch = orchestrator();
        let submission = orch
            .submit_capture(&tenant(), capture(ScreenshotId::new()), SubmitMode::Adhoc)
            .await
            .unwrap();

        let mut last = None;
        for _ in 0..3 {
            let job = claim_any(&orch).await.unwrap();
            let (_, outcome) = orch
                .complete(Lane::Capture, &job.id, JobResult::Transient("timeout".into()), Utc::now())
                .await
                .unwrap();
            last = Some(outcome);
        }
        assert!(matches!(last, Some(AttemptOutcome::Failed { attempts: 3, .. })));
        assert!(claim_any(&orch).await.is_none());

        let status = orch.lane_status(Lane::Capture).await.unwrap();
        assert_eq!(status.sample.failed[0].id, submission.job_id);
        assert_eq!(status.sample.failed[0].failed_reason.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn diff_notifications_are_idempotent_per_diff() {
        let orch = orchestrator();
        let diff_id = pagewatch_core::DiffId::new();
        let request = NotifyRequest {
            kind: NotifyType::DiffDetected,
            project_id: ProjectId::new().to_string(),
            screenshot_id: ScreenshotId::new().to_string(),
            message: "changed".to_string(),
            diff_ref: Some(diff_id.to_string()),
            diff_metrics: None,
        };

        let first = orch
            .submit_notify_as(&tenant(), JobId::notify_for_diff(diff_id), request.clone())
            .await
            .unwrap();
        let second = orch
            .submit_notify_as(&tenant(), JobId::notify_for_diff(diff_id), request)
            .await
            .unwrap();
        assert_eq!(first.outcome, SubmitOutcome::Created);
        assert_eq!(second.outcome, SubmitOutcome::Replaced);
        assert_eq!(orch.lane_status(Lane::Notify).await.unwrap().counts.waiting, 1);
    }

    #[tokio::test]
    async fn schedule_is_keyed_by_screenshot() {
        let orch = orchestrator();
        let sid = ScreenshotId::new();
        orch.schedule_recurring(&tenant(), sid, "0 * * * *", capture(sid)).await.unwrap();
        orch.schedule_recurring(&tenant(), sid, "*/5 * * * *", capture(sid)).await.unwrap();
        assert_eq!(orch.schedules(&tenant()).await.unwrap().len(), 1);

        assert!(orch
            .schedule_recurring(&tenant(), ScreenshotId::new(), "0 * * * *", capture(sid))
            .await
            .is_err());
        assert!(orch.unschedule(&tenant(), sid).await.unwrap());
        assert!(orch.schedules(&tenant()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn schedule_errors_keep_their_kind() {
        let orch = orchestrator();
        let sid = ScreenshotId::new();
        assert!(matches!(
            orch.schedule_recurring(&tenant(), sid, "every day", capture(sid)).await,
            Err(OrchestratorError::Validation(DomainError::Validation(_)))
        ));

        orch.schedule_recurring(&tenant(), sid, "0 * * * *", capture(sid)).await.unwrap();
        let other = TenantId::parse("org_b").unwrap();
        assert!(matches!(
            orch.schedule_recurring(&other, sid, "0 * * * *", capture(sid)).await,
            Err(OrchestratorError::Queue(QueueError::Conflict(_)))
        ));
    }

    #[tokio::test]
    async fn requeue_stalled_ignores_fresh_active_jobs() {
        let orch = orchestrator();
        orch.submit_capture(&tenant(), capture(ScreenshotId::new()), SubmitMode::Deduplicating)
            .await
            .unwrap();
        claim_any(&orch).await.unwrap();

        assert!(orch
            .requeue_stalled(Lane::Capture, Duration::from_secs(3600))
            .await
            .unwrap()
            .is_empty());
        assert_eq!(orch.requeue_stalled(Lane::Capture, Duration::ZERO).await.unwrap().len(), 1);
        assert_eq!(orch.lane_status(Lane::Capture).await.unwrap().counts.waiting, 1);
    }
}
