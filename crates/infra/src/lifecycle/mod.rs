//! Capture lifecycle: the screenshot status and approval state machines
//! driven by submissions and worker results.
//!
//! ## Submission order
//!
//! validate payload → consume quota → mark `pending` with the job id →
//! enqueue. A failed enqueue refunds the quota and restores the previous
//! status; a submission that replaced or coalesced into existing work
//! refunds the quota.
//!
//! ## Worker results
//!
//! Each submission stamps its job id on the screenshot. A result is applied
//! only while the screenshot is `pending` on that same job; anything else is
//! stale (e.g. the older of two forced re-runs, whichever finishes first)
//! and is ignored.

mod error;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use pagewatch_core::model::{ApprovalAction, ApprovalEvent, CaptureStatus, Diff, Screenshot};
use pagewatch_core::{DomainError, ProjectId, ScreenshotId, TenantId};

use crate::collaborators::DiffService;
use crate::jobs::{
    CaptureRequest, DiffPayload, DiffRequest, JobId, JobOrchestrator, JobPayload, Lane,
    NotifyRequest, NotifyType, OrchestratorError, QueueError, RecurringCapture, SubmitMode,
    SubmitOutcome, Submission, ADHOC_ID_ATTEMPTS,
};
use crate::tenancy::{StoreError, TenantContext, TenantScope, UsageReservation};

pub use error::LifecycleError;

/// Optimistic-write attempts before a conflict is surfaced.
const MAX_WRITE_ATTEMPTS: usize = 3;

/// Why a capture is being (re)submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RerunTrigger {
    Manual,
    Bulk,
    Scheduled,
}

impl RerunTrigger {
    /// The one place job identity policy is decided: a manual single re-run
    /// is the forced (always-new) path, everything else deduplicates.
    pub fn submit_mode(self) -> SubmitMode {
        match self {
            RerunTrigger::Manual => SubmitMode::Adhoc,
            RerunTrigger::Bulk | RerunTrigger::Scheduled => SubmitMode::Deduplicating,
        }
    }
}

/// Result of applying a worker result to a screenshot.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureUpdate {
    Applied {
        screenshot: Screenshot,
        /// Diff job (on success with a baseline) or failure notification.
        follow_up: Option<Submission>,
    },
    /// The screenshot was no longer `pending`; nothing was written.
    Stale { status: CaptureStatus },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiffOutcome {
    pub diff: Diff,
    pub notify: Option<Submission>,
}

/// Per-screenshot result of a bulk run.
#[derive(Debug)]
pub struct BulkItem {
    pub screenshot_id: ScreenshotId,
    pub result: Result<Submission, LifecycleError>,
}

pub struct CaptureLifecycle {
    tenants: TenantContext,
    orchestrator: Arc<JobOrchestrator>,
}

impl std::fmt::Debug for CaptureLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureLifecycle").finish_non_exhaustive()
    }
}

impl CaptureLifecycle {
    pub fn new(tenants: TenantContext, orchestrator: Arc<JobOrchestrator>) -> Self {
        Self {
            tenants,
            orchestrator,
        }
    }

    pub fn tenants(&self) -> &TenantContext {
        &self.tenants
    }

    pub fn orchestrator(&self) -> &Arc<JobOrchestrator> {
        &self.orchestrator
    }

    /// Re-run one screenshot from any status.
    #[instrument(skip(self, tenant_id), fields(tenant_id = %tenant_id.as_ref()), err)]
    pub async fn rerun(
        &self,
        tenant_id: impl AsRef<str>,
        screenshot_id: ScreenshotId,
        trigger: RerunTrigger,
    ) -> Result<Submission, LifecycleError> {
        self.tenants
            .with_tenant(tenant_id, |scope| async move {
                let screenshot = scope
                    .screenshot(screenshot_id)
                    .await?
                    .ok_or(LifecycleError::NotFound("screenshot"))?;
                self.submit_capture(&scope, screenshot, trigger).await
            })
            .await
    }

    /// Submit every screenshot of a project. Items succeed or fail independently.
    pub async fn bulk_run(
        &self,
        tenant_id: impl AsRef<str>,
        project_id: ProjectId,
    ) -> Result<Vec<BulkItem>, LifecycleError> {
        self.tenants
            .with_tenant(tenant_id, |scope| async move {
                scope
                    .project(project_id)
                    .await?
                    .ok_or(LifecycleError::NotFound("project"))?;

                let mut items = Vec::new();
                for screenshot in scope.screenshots(project_id).await? {
                    let screenshot_id = screenshot.id;
                    let result = self.submit_capture(&scope, screenshot, RerunTrigger::Bulk).await;
                    items.push(BulkItem {
                        screenshot_id,
                        result,
                    });
                }
                let accepted = items.iter().filter(|i| i.result.is_ok()).count();
                info!(project_id = %project_id, accepted, total = items.len(), "bulk run submitted");
                Ok(items)
            })
            .await
    }

    async fn submit_capture(
        &self,
        scope: &TenantScope,
        screenshot: Screenshot,
        trigger: RerunTrigger,
    ) -> Result<Submission, LifecycleError> {
        let payload = CaptureRequest::for_screenshot(&screenshot).validate()?;
        let reservation = scope.increment_capture_usage().await?;

        let mode = trigger.submit_mode();
        let base = Utc::now();
        let mut prior = (screenshot.status, screenshot.capture_job_id.clone());
        let mut job_id = mode.capture_id(screenshot.id, base);
        let mut enqueued: Result<Submission, OrchestratorError> = Err(QueueError::Backend("no capture id attempted".to_string()).into());
        for tick in 0..ADHOC_ID_ATTEMPTS {
            job_id = mode.capture_id(screenshot.id, base + chrono::Duration::milliseconds(tick));
            // Stamp before enqueueing so a fast worker's result is never stale.
            let marked = modify_screenshot(scope, screenshot.id, |s| {
                if tick == 0 {
                    prior = (s.status, s.capture_job_id.clone());
                }
                s.mark_pending(job_id.as_str(), Utc::now());
                Ok(true)
            })
            .await;
            if let Err(err) = marked {
                refund(scope, &reservation).await;
                return Err(err);
            }

            enqueued = self
                .orchestrator
                .enqueue_capture_as(scope.tenant_id(), job_id.clone(), payload.clone(), mode)
                .await;
            match &enqueued {
                Err(OrchestratorError::Queue(QueueError::Duplicate(_))) if mode == SubmitMode::Adhoc => continue,
                _ => break,
            }
        }

        match enqueued {
            Ok(submission) => {
                if submission.outcome != SubmitOutcome::Created {
                    refund(scope, &reservation).await;
                }
                info!(
                    screenshot_id = %screenshot.id,
                    job_id = %submission.job_id,
                    trigger = ?trigger,
                    outcome = ?submission.outcome,
                    "capture submitted"
                );
                Ok(submission)
            }
            Err(err) => {
                refund(scope, &reservation).await;
                let (prior_status, prior_job) = prior;
                let restored = modify_screenshot(scope, screenshot.id, |s| {
                    if s.capture_job_id.as_deref() != Some(job_id.as_str()) {
                        return Ok(false);
                    }
                    s.status = prior_status;
                    s.capture_job_id = prior_job.clone();
                    s.updated_at = Utc::now();
                    Ok(true)
                })
                .await;
                if let Err(restore_err) = restored {
                    warn!(screenshot_id = %screenshot.id, error = %restore_err, "could not restore status after failed enqueue");
                }
                Err(err.into())
            }
        }
    }

    /// Register (or replace) a recurring capture for one screenshot.
    pub async fn schedule(
        &self,
        tenant_id: impl AsRef<str>,
        screenshot_id: ScreenshotId,
        expression: &str,
    ) -> Result<RecurringCapture, LifecycleError> {
        self.tenants
            .with_tenant(tenant_id, |scope| async move {
                let screenshot = scope
                    .screenshot(screenshot_id)
                    .await?
                    .ok_or(LifecycleError::NotFound("screenshot"))?;
                Ok(self
                    .orchestrator
                    .schedule_recurring(
                        scope.tenant_id(),
                        screenshot_id,
                        expression,
                        CaptureRequest::for_screenshot(&screenshot),
                    )
                    .await?)
            })
            .await
    }

    pub async fn unschedule(&self, tenant_id: impl AsRef<str>, screenshot_id: ScreenshotId) -> Result<bool, LifecycleError> {
        self.tenants
            .with_tenant(tenant_id, |scope| async move {
                Ok(self.orchestrator.unschedule(scope.tenant_id(), screenshot_id).await?)
            })
            .await
    }

    /// Submit every registration due at `now`. The payload is rebuilt from
    /// the current screenshot row so edits since registration take effect.
    pub async fn run_due_schedules(&self, now: DateTime<Utc>) -> Result<usize, LifecycleError> {
        let due = self.orchestrator.due_schedules(now).await?;
        let mut submitted = 0;
        for entry in due {
            match self
                .rerun(entry.tenant_id.as_str(), entry.screenshot_id, RerunTrigger::Scheduled)
                .await
            {
                Ok(_) => submitted += 1,
                Err(LifecycleError::NotFound(_)) => {
                    warn!(tenant_id = %entry.tenant_id, screenshot_id = %entry.screenshot_id, "scheduled screenshot is gone; unscheduling");
                    self.orchestrator.unschedule(&entry.tenant_id, entry.screenshot_id).await?;
                }
                Err(err) => {
                    warn!(tenant_id = %entry.tenant_id, screenshot_id = %entry.screenshot_id, error = %err, "scheduled capture not submitted");
                }
            }
        }
        Ok(submitted)
    }

    /// `pending → captured` for the result of `job_id`. Submits a diff job
    /// when a different baseline exists.
    #[instrument(skip(self, tenant_id, image_ref), fields(tenant_id = %tenant_id, job_id = %job_id), err)]
    pub async fn record_capture_success(
        &self,
        tenant_id: &TenantId,
        screenshot_id: ScreenshotId,
        job_id: &JobId,
        image_ref: String,
    ) -> Result<CaptureUpdate, LifecycleError> {
        self.tenants
            .with_tenant(tenant_id.as_str(), |scope| async move {
                let mut previous = None;
                let (screenshot, written) = modify_screenshot(&scope, screenshot_id, |s| {
                    if !s.accepts_result(job_id.as_str()) {
                        return Ok(false);
                    }
                    previous = s.mark_captured(image_ref.clone(), Utc::now())?;
                    Ok(true)
                })
                .await?;

                if !written {
                    debug!(screenshot_id = %screenshot_id, status = screenshot.status.as_str(), "stale capture result ignored");
                    return Ok(CaptureUpdate::Stale {
                        status: screenshot.status,
                    });
                }

                let follow_up = match previous {
                    Some(previous) if previous != image_ref => Some(
                        self.orchestrator
                            .submit_diff(
                                scope.tenant_id(),
                                DiffRequest {
                                    screenshot_id: screenshot_id.to_string(),
                                    current_image_ref: image_ref.clone(),
                                    previous_image_ref: previous,
                                },
                            )
                            .await?,
                    ),
                    _ => None,
                };
                info!(screenshot_id = %screenshot_id, diff_queued = follow_up.is_some(), "capture recorded");
                Ok(CaptureUpdate::Applied {
                    screenshot,
                    follow_up,
                })
            })
            .await
    }

    /// `pending → failed` once the retries of `job_id` are spent. Queues a
    /// `capture_failed` notification.
    #[instrument(skip(self, tenant_id, reason), fields(tenant_id = %tenant_id, job_id = %job_id), err)]
    pub async fn record_capture_failure(
        &self,
        tenant_id: &TenantId,
        screenshot_id: ScreenshotId,
        job_id: &JobId,
        reason: &str,
        attempts: u32,
    ) -> Result<CaptureUpdate, LifecycleError> {
        self.tenants
            .with_tenant(tenant_id.as_str(), |scope| async move {
                let (screenshot, written) = modify_screenshot(&scope, screenshot_id, |s| {
                    if !s.accepts_result(job_id.as_str()) {
                        return Ok(false);
                    }
                    s.mark_failed(reason, attempts, Utc::now())?;
                    Ok(true)
                })
                .await?;

                if !written {
                    debug!(screenshot_id = %screenshot_id, status = screenshot.status.as_str(), "stale failure ignored");
                    return Ok(CaptureUpdate::Stale {
                        status: screenshot.status,
                    });
                }

                let last_error = screenshot.last_error.clone().unwrap_or_default();
                warn!(screenshot_id = %screenshot_id, attempts, error = %last_error, "capture failed");
                let notify = self
                    .orchestrator
                    .submit_notify(
                        scope.tenant_id(),
                        NotifyRequest {
                            kind: NotifyType::CaptureFailed,
                            project_id: screenshot.project_id.to_string(),
                            screenshot_id: screenshot_id.to_string(),
                            message: format!(
                                "Capture of \"{}\" failed after {attempts} attempt(s): {last_error}",
                                screenshot.name
                            ),
                            diff_ref: None,
                            diff_metrics: None,
                        },
                    )
                    .await?;
                Ok(CaptureUpdate::Applied {
                    screenshot,
                    follow_up: Some(notify),
                })
            })
            .await
    }

    /// Compute, evaluate and persist a diff; queue one notification if it is
    /// significant.
    #[instrument(skip(self, tenant_id, payload, diffs), fields(tenant_id = %tenant_id, screenshot_id = %payload.screenshot_id), err)]
    pub async fn evaluate_diff(
        &self,
        tenant_id: &TenantId,
        payload: &DiffPayload,
        diffs: &dyn DiffService,
    ) -> Result<DiffOutcome, LifecycleError> {
        self.tenants
            .with_tenant(tenant_id.as_str(), |scope| async move {
                let screenshot = scope
                    .screenshot(payload.screenshot_id)
                    .await?
                    .ok_or(LifecycleError::NotFound("screenshot"))?;
                let project = scope
                    .project(screenshot.project_id)
                    .await?
                    .ok_or(LifecycleError::NotFound("project"))?;

                let metrics = diffs
                    .compare(&payload.previous_image_ref, &payload.current_image_ref)
                    .await?;
                let diff = scope
                    .record_diff(Diff::evaluate(
                        scope.tenant_id().clone(),
                        screenshot.id,
                        payload.previous_image_ref.clone(),
                        payload.current_image_ref.clone(),
                        metrics,
                        project.diff_threshold,
                        Utc::now(),
                    ))
                    .await?;

                info!(
                    diff_id = %diff.id,
                    percentage_diff = diff.metrics.percentage_diff,
                    threshold = diff.threshold,
                    significant = diff.significant,
                    "diff evaluated"
                );
                if !diff.significant {
                    return Ok(DiffOutcome { diff, notify: None });
                }

                let notify = self
                    .orchestrator
                    .submit_notify_as(
                        scope.tenant_id(),
                        JobId::notify_for_diff(diff.id),
                        NotifyRequest {
                            kind: NotifyType::DiffDetected,
                            project_id: project.id.to_string(),
                            screenshot_id: screenshot.id.to_string(),
                            message: format!(
                                "\"{}\" changed by {:.2}% (threshold {:.2}%)",
                                screenshot.name, diff.metrics.percentage_diff, diff.threshold
                            ),
                            diff_ref: Some(diff.id.to_string()),
                            diff_metrics: Some(diff.metrics),
                        },
                    )
                    .await?;
                Ok(DiffOutcome {
                    diff,
                    notify: Some(notify),
                })
            })
            .await
    }

    pub async fn approve(
        &self,
        tenant_id: impl AsRef<str>,
        screenshot_id: ScreenshotId,
        actor: &str,
        reason: Option<String>,
    ) -> Result<Screenshot, LifecycleError> {
        self.apply_approval(tenant_id, screenshot_id, ApprovalAction::Approved, actor, reason)
            .await
    }

    pub async fn reject(
        &self,
        tenant_id: impl AsRef<str>,
        screenshot_id: ScreenshotId,
        actor: &str,
        reason: Option<String>,
    ) -> Result<Screenshot, LifecycleError> {
        self.apply_approval(tenant_id, screenshot_id, ApprovalAction::Rejected, actor, reason)
            .await
    }

    pub async fn reset_approval(
        &self,
        tenant_id: impl AsRef<str>,
        screenshot_id: ScreenshotId,
        actor: &str,
        reason: Option<String>,
    ) -> Result<Screenshot, LifecycleError> {
        self.apply_approval(tenant_id, screenshot_id, ApprovalAction::Pending, actor, reason)
            .await
    }

    /// Update the approval fields and append exactly one audit row, as one write.
    #[instrument(skip(self, tenant_id, reason), fields(tenant_id = %tenant_id.as_ref()), err)]
    pub async fn apply_approval(
        &self,
        tenant_id: impl AsRef<str>,
        screenshot_id: ScreenshotId,
        action: ApprovalAction,
        actor: &str,
        reason: Option<String>,
    ) -> Result<Screenshot, LifecycleError> {
        let actor = actor.trim();
        if actor.is_empty() {
            return Err(DomainError::validation("approval requires an acting principal").into());
        }

        self.tenants
            .with_tenant(tenant_id, |scope| async move {
                let mut attempt = 0;
                loop {
                    attempt += 1;
                    let mut screenshot = scope
                        .screenshot(screenshot_id)
                        .await?
                        .ok_or(LifecycleError::NotFound("screenshot"))?;
                    let diff_id = scope.latest_diff(screenshot_id).await?.map(|d| d.id);

                    let now = Utc::now();
                    screenshot.apply_approval(action, actor, now)?;
                    let event = ApprovalEvent::new(
                        scope.tenant_id().clone(),
                        screenshot_id,
                        diff_id,
                        action,
                        actor,
                        reason.clone(),
                        now,
                    );

                    match scope.record_approval(&screenshot, event).await {
                        Ok(saved) => {
                            info!(screenshot_id = %screenshot_id, action = action.as_str(), actor, "approval recorded");
                            return Ok(saved);
                        }
                        Err(StoreError::Conflict(_)) if attempt < MAX_WRITE_ATTEMPTS => continue,
                        Err(err) => return Err(err.into()),
                    }
                }
            })
            .await
    }

    /// Re-queue failed jobs. A failed capture that is still the screenshot's
    /// latest submission also moves it back to `pending` so the new result
    /// is applied.
    pub async fn retry_failed(&self, lane: Lane, limit: usize) -> Result<Vec<JobId>, LifecycleError> {
        let jobs = self.orchestrator.retry_failed(lane, limit).await?;
        for job in &jobs {
            let JobPayload::Capture(payload) = &job.payload else {
                continue;
            };
            let screenshot_id = payload.screenshot_id;
            let job_id = &job.id;
            let reopened: Result<_, LifecycleError> = self
                .tenants
                .with_tenant(job.tenant_id.as_str(), |scope| async move {
                    modify_screenshot(&scope, screenshot_id, |s| {
                        if s.status != CaptureStatus::Failed
                            || s.capture_job_id.as_deref() != Some(job_id.as_str())
                        {
                            return Ok(false);
                        }
                        s.mark_pending(job_id.as_str(), Utc::now());
                        Ok(true)
                    })
                    .await
                })
                .await;
            if let Err(err) = reopened {
                warn!(job_id = %job.id, error = %err, "could not reopen screenshot for retried job");
            }
        }
        Ok(jobs.into_iter().map(|job| job.id).collect())
    }
}

/// Read-modify-write with optimistic retry. `apply` returns whether to write;
/// the returned flag says whether a write happened.
async fn modify_screenshot<F>(
    scope: &TenantScope,
    screenshot_id: ScreenshotId,
    mut apply: F,
) -> Result<(Screenshot, bool), LifecycleError>
where
    F: FnMut(&mut Screenshot) -> Result<bool, LifecycleError>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut screenshot = scope
            .screenshot(screenshot_id)
            .await?
            .ok_or(LifecycleError::NotFound("screenshot"))?;
        if !apply(&mut screenshot)? {
            return Ok((screenshot, false));
        }
        match scope.save_screenshot(&screenshot).await {
            Ok(saved) => return Ok((saved, true)),
            Err(StoreError::Conflict(reason)) if attempt < MAX_WRITE_ATTEMPTS => {
                debug!(screenshot_id = %screenshot_id, attempt, reason = %reason, "screenshot write conflict, reloading");
            }
            Err(err) => return Err(err.into()),
        }
    }
}

async fn refund(scope: &TenantScope, reservation: &UsageReservation) {
    if let Err(err) = scope.release_capture_usage(reservation).await {
        warn!(tenant_id = %scope.tenant_id(), error = %err, "capture usage refund failed");
    }
}
