//! Queue backend abstraction and the in-memory implementation.

use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::types::{AttemptOutcome, Job, JobId, JobResult, JobState, Lane};

/// How a submission treats an existing job with the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueMode {
    /// Identity must be new; an existing unfinished job is a `Duplicate`.
    Unique,
    /// Identity is a dedup key: replace queued work, coalesce into active work.
    Deduplicate,
}

/// Result of a single submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitOutcome {
    /// New work was queued.
    Created,
    /// A queued job with the same identity was updated in place.
    Replaced,
    /// The same identity is already running; nothing was queued.
    Coalesced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Removed,
    /// Running jobs finish their current attempt; cancellation is cooperative.
    StillActive,
    NotFound,
}

/// Job counts per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LaneCounts {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
}

/// Queue backend error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    Duplicate(JobId),
    #[error("job {0} is not active")]
    NotActive(JobId),
    /// The key is held by another owner (e.g. another tenant's schedule).
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("queue backend error: {0}")]
    Backend(String),
}

/// Predicate a claim consults for each ready job, oldest first.
pub type Eligibility<'a> = dyn FnMut(&Job) -> bool + Send + 'a;

/// Durable-queue abstraction. Jobs are keyed by `(lane, id)`.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    async fn enqueue(&self, job: Job, mode: EnqueueMode) -> Result<SubmitOutcome, QueueError>;

    /// Claim the first ready job (FIFO by sequence) accepted by `eligible`.
    /// Returns `None` when the lane is paused or nothing is claimable.
    async fn claim_next(
        &self,
        lane: Lane,
        now: DateTime<Utc>,
        eligible: &mut Eligibility<'_>,
    ) -> Result<Option<Job>, QueueError>;

    /// Record the result of the current attempt of an active job.
    async fn complete(
        &self,
        lane: Lane,
        id: &JobId,
        result: JobResult,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(Job, AttemptOutcome), QueueError>;

    async fn get(&self, lane: Lane, id: &JobId) -> Result<Option<Job>, QueueError>;

    async fn counts(&self, lane: Lane) -> Result<LaneCounts, QueueError>;

    /// First `limit` jobs in `state`, in queue order.
    async fn sample(&self, lane: Lane, state: JobState, limit: usize) -> Result<Vec<Job>, QueueError>;

    /// Move up to `limit` failed jobs back to waiting with a fresh budget.
    async fn retry_failed(&self, lane: Lane, limit: usize, now: DateTime<Utc>) -> Result<Vec<Job>, QueueError>;

    async fn cancel(&self, lane: Lane, id: &JobId) -> Result<CancelOutcome, QueueError>;

    async fn set_paused(&self, lane: Lane, paused: bool) -> Result<(), QueueError>;

    async fn is_paused(&self, lane: Lane) -> Result<bool, QueueError>;

    /// Delete completed/failed jobs that finished at or before `cutoff`.
    async fn reap(&self, lane: Lane, cutoff: DateTime<Utc>) -> Result<usize, QueueError>;

    /// Put active jobs last touched at or before `cutoff` back in line
    /// behind current work. Their owning worker is presumed gone.
    async fn requeue_stalled(&self, lane: Lane, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<Vec<Job>, QueueError>;
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<(Lane, JobId), Job>,
    paused: HashSet<Lane>,
    next_seq: u64,
}

impl Inner {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn lane_jobs(&self, lane: Lane) -> impl Iterator<Item = &Job> {
        self.jobs
            .iter()
            .filter_map(move |((l, _), job)| (*l == lane).then_some(job))
    }
}

/// In-memory queue for tests/dev and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    inner: RwLock<Inner>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, QueueError> {
        self.inner
            .read()
            .map_err(|_| QueueError::Backend("queue lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, QueueError> {
        self.inner
            .write()
            .map_err(|_| QueueError::Backend("queue lock poisoned".to_string()))
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueue {
    async fn enqueue(&self, mut job: Job, mode: EnqueueMode) -> Result<SubmitOutcome, QueueError> {
        let mut inner = self.write()?;
        let key = (job.lane, job.id.clone());

        let existing_state = inner.jobs.get(&key).map(|j| j.state);
        match (existing_state, mode) {
            (None, _) | (Some(JobState::Completed | JobState::Failed), _) => {
                job.seq = inner.next_seq();
                inner.jobs.insert(key, job);
                Ok(SubmitOutcome::Created)
            }
            (Some(_), EnqueueMode::Unique) => Err(QueueError::Duplicate(job.id)),
            (Some(JobState::Active), EnqueueMode::Deduplicate) => Ok(SubmitOutcome::Coalesced),
            (Some(JobState::Waiting | JobState::Delayed), EnqueueMode::Deduplicate) => {
                let Some(existing) = inner.jobs.get_mut(&key) else {
                    return Err(QueueError::NotFound(job.id));
                };
                // Keep the queue position, take the newest payload and budget.
                existing.payload = job.payload;
                existing.retry_policy = job.retry_policy;
                existing.reset_for_retry(job.updated_at);
                Ok(SubmitOutcome::Replaced)
            }
        }
    }

    async fn claim_next(
        &self,
        lane: Lane,
        now: DateTime<Utc>,
        eligible: &mut Eligibility<'_>,
    ) -> Result<Option<Job>, QueueError> {
        let mut inner = self.write()?;
        if inner.paused.contains(&lane) {
            return Ok(None);
        }

        let mut ready: Vec<(u64, JobId)> = inner
            .lane_jobs(lane)
            .filter(|j| j.is_ready(now))
            .map(|j| (j.seq, j.id.clone()))
            .collect();
        ready.sort();

        for (_, id) in ready {
            let Some(job) = inner.jobs.get_mut(&(lane, id)) else {
                continue;
            };
            if eligible(job) {
                job.mark_active(now);
                return Ok(Some(job.clone()));
            }
        }
        Ok(None)
    }

    async fn complete(
        &self,
        lane: Lane,
        id: &JobId,
        result: JobResult,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(Job, AttemptOutcome), QueueError> {
        let mut inner = self.write()?;
        let seq = inner.next_seq();
        let job = inner
            .jobs
            .get_mut(&(lane, id.clone()))
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;
        if job.state != JobState::Active {
            return Err(QueueError::NotActive(id.clone()));
        }

        let outcome = job.record_attempt(result, started_at, now);
        if matches!(outcome, AttemptOutcome::RetryScheduled { .. }) {
            // Retried jobs re-enter behind work submitted before the retry.
            job.seq = seq;
        }
        Ok((job.clone(), outcome))
    }

    async fn get(&self, lane: Lane, id: &JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.read()?.jobs.get(&(lane, id.clone())).cloned())
    }

    async fn counts(&self, lane: Lane) -> Result<LaneCounts, QueueError> {
        let inner = self.read()?;
        let mut counts = LaneCounts::default();
        for job in inner.lane_jobs(lane) {
            match job.state {
                JobState::Waiting => counts.waiting += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
                JobState::Delayed => counts.delayed += 1,
            }
        }
        Ok(counts)
    }

    async fn sample(&self, lane: Lane, state: JobState, limit: usize) -> Result<Vec<Job>, QueueError> {
        let inner = self.read()?;
        let mut jobs: Vec<Job> = inner
            .lane_jobs(lane)
            .filter(|j| j.state == state)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.seq);
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn retry_failed(&self, lane: Lane, limit: usize, now: DateTime<Utc>) -> Result<Vec<Job>, QueueError> {
        let mut inner = self.write()?;
        let mut failed: Vec<(Option<DateTime<Utc>>, u64, JobId)> = inner
            .lane_jobs(lane)
            .filter(|j| j.state == JobState::Failed)
            .map(|j| (j.finished_at, j.seq, j.id.clone()))
            .collect();
        failed.sort();

        let mut retried = Vec::new();
        for (_, _, id) in failed.into_iter().take(limit) {
            let seq = inner.next_seq();
            if let Some(job) = inner.jobs.get_mut(&(lane, id)) {
                job.reset_for_retry(now);
                job.seq = seq;
                retried.push(job.clone());
            }
        }
        Ok(retried)
    }

    async fn cancel(&self, lane: Lane, id: &JobId) -> Result<CancelOutcome, QueueError> {
        let mut inner = self.write()?;
        let key = (lane, id.clone());
        match inner.jobs.get(&key).map(|j| j.state) {
            None => Ok(CancelOutcome::NotFound),
            Some(JobState::Active) => Ok(CancelOutcome::StillActive),
            Some(_) => {
                inner.jobs.remove(&key);
                Ok(CancelOutcome::Removed)
            }
        }
    }

    async fn set_paused(&self, lane: Lane, paused: bool) -> Result<(), QueueError> {
        let mut inner = self.write()?;
        if paused {
            inner.paused.insert(lane);
        } else {
            inner.paused.remove(&lane);
        }
        Ok(())
    }

    async fn is_paused(&self, lane: Lane) -> Result<bool, QueueError> {
        Ok(self.read()?.paused.contains(&lane))
    }

    async fn reap(&self, lane: Lane, cutoff: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut inner = self.write()?;
        let before = inner.jobs.len();
        inner.jobs.retain(|(l, _), job| {
            *l != lane
                || !job.state.is_finished()
                || job.finished_at.is_none_or(|at| at > cutoff)
        });
        Ok(before - inner.jobs.len())
    }

    async fn requeue_stalled(&self, lane: Lane, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<Vec<Job>, QueueError> {
        let mut inner = self.write()?;
        let mut stalled: Vec<(u64, JobId)> = inner
            .lane_jobs(lane)
            .filter(|j| j.state == JobState::Active && j.updated_at <= cutoff)
            .map(|j| (j.seq, j.id.clone()))
            .collect();
        stalled.sort();

        let mut released = Vec::new();
        for (_, id) in stalled {
            let seq = inner.next_seq();
            if let Some(job) = inner.jobs.get_mut(&(lane, id)) {
                job.release_stalled(now);
                job.seq = seq;
                released.push(job.clone());
            }
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::payload::{CaptureRequest, JobPayload};
    use crate::jobs::types::RetryPolicy;
    use pagewatch_core::{ProjectId, ScreenshotId, TenantId};
    use std::time::Duration;

    fn capture(tenant: &str, screenshot_id: ScreenshotId) -> Job {
        let payload = CaptureRequest {
            project_id: ProjectId::new().to_string(),
            screenshot_id: screenshot_id.to_string(),
            url: "https://example.com".to_string(),
            selector: None,
            viewport: None,
        }
        .validate()
        .unwrap();
        Job::new(
            JobId::capture(screenshot_id),
            TenantId::parse(tenant).unwrap(),
            JobPayload::Capture(payload),
            RetryPolicy::fixed(3, Duration::ZERO),
            Utc::now(),
        )
    }

    async fn claim(queue: &InMemoryQueue) -> Option<Job> {
        queue.claim_next(Lane::Capture, Utc::now(), &mut |_| true).await.unwrap()
    }

    #[tokio::test]
    async fn claims_in_submission_order() {
        let queue = InMemoryQueue::new();
        let first = capture("org_a", ScreenshotId::new());
        let second = capture("org_a", ScreenshotId::new());
        queue.enqueue(first.clone(), EnqueueMode::Deduplicate).await.unwrap();
        queue.enqueue(second.clone(), EnqueueMode::Deduplicate).await.unwrap();

        assert_eq!(claim(&queue).await.unwrap().id, first.id);
        assert_eq!(claim(&queue).await.unwrap().id, second.id);
        assert!(claim(&queue).await.is_none());
    }

    #[tokio::test]
    async fn dedup_replaces_waiting_and_coalesces_active() {
        let queue = InMemoryQueue::new();
        let sid = ScreenshotId::new();

        assert_eq!(
            queue.enqueue(capture("org_a", sid), EnqueueMode::Deduplicate).await.unwrap(),
            SubmitOutcome::Created
        );
        assert_eq!(
            queue.enqueue(capture("org_a", sid), EnqueueMode::Deduplicate).await.unwrap(),
            SubmitOutcome::Replaced
        );
        assert_eq!(queue.counts(Lane::Capture).await.unwrap().waiting, 1);

        claim(&queue).await.unwrap();
        assert_eq!(
            queue.enqueue(capture("org_a", sid), EnqueueMode::Deduplicate).await.unwrap(),
            SubmitOutcome::Coalesced
        );
        assert!(matches!(
            queue.enqueue(capture("org_a", sid), EnqueueMode::Unique).await,
            Err(QueueError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn finished_job_is_overwritten_by_new_submission() {
        let queue = InMemoryQueue::new();
        let job = capture("org_a", ScreenshotId::new());
        queue.enqueue(job.clone(), EnqueueMode::Deduplicate).await.unwrap();
        let claimed = claim(&queue).await.unwrap();
        queue
            .complete(Lane::Capture, &claimed.id, JobResult::Success, Utc::now(), Utc::now())
            .await
            .unwrap();

        assert_eq!(
            queue.enqueue(job, EnqueueMode::Deduplicate).await.unwrap(),
            SubmitOutcome::Created
        );
        let counts = queue.counts(Lane::Capture).await.unwrap();
        assert_eq!((counts.waiting, counts.completed), (1, 0));
    }

    #[tokio::test]
    async fn eligibility_skips_without_blocking_the_lane() {
        let queue = InMemoryQueue::new();
        queue
            .enqueue(capture("org_busy", ScreenshotId::new()), EnqueueMode::Deduplicate)
            .await
            .unwrap();
        let other = capture("org_idle", ScreenshotId::new());
        queue.enqueue(other.clone(), EnqueueMode::Deduplicate).await.unwrap();

        let claimed = queue
            .claim_next(Lane::Capture, Utc::now(), &mut |job| job.tenant_id.as_str() != "org_busy")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, other.id);
        assert_eq!(queue.counts(Lane::Capture).await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn retried_job_goes_behind_later_submissions() {
        let queue = InMemoryQueue::new();
        let first = capture("org_a", ScreenshotId::new());
        queue.enqueue(first.clone(), EnqueueMode::Deduplicate).await.unwrap();
        claim(&queue).await.unwrap();

        let later = capture("org_a", ScreenshotId::new());
        queue.enqueue(later.clone(), EnqueueMode::Deduplicate).await.unwrap();
        let (_, outcome) = queue
            .complete(Lane::Capture, &first.id, JobResult::Transient("timeout".into()), Utc::now(), Utc::now())
            .await
            .unwrap();
        assert!(matches!(outcome, AttemptOutcome::RetryScheduled { .. }));

        assert_eq!(claim(&queue).await.unwrap().id, later.id);
        assert_eq!(claim(&queue).await.unwrap().id, first.id);
    }

    #[tokio::test]
    async fn cancel_removes_waiting_but_not_active() {
        let queue = InMemoryQueue::new();
        let waiting = capture("org_a", ScreenshotId::new());
        queue.enqueue(waiting.clone(), EnqueueMode::Deduplicate).await.unwrap();
        let active = capture("org_a", ScreenshotId::new());

        assert_eq!(queue.cancel(Lane::Capture, &waiting.id).await.unwrap(), CancelOutcome::Removed);
        assert_eq!(queue.cancel(Lane::Capture, &waiting.id).await.unwrap(), CancelOutcome::NotFound);

        queue.enqueue(active.clone(), EnqueueMode::Deduplicate).await.unwrap();
        claim(&queue).await.unwrap();
        assert_eq!(queue.cancel(Lane::Capture, &active.id).await.unwrap(), CancelOutcome::StillActive);
        assert_eq!(queue.counts(Lane::Capture).await.unwrap().active, 1);
    }

    #[tokio::test]
    async fn paused_lane_hands_out_nothing() {
        let queue = InMemoryQueue::new();
        queue
            .enqueue(capture("org_a", ScreenshotId::new()), EnqueueMode::Deduplicate)
            .await
            .unwrap();
        queue.set_paused(Lane::Capture, true).await.unwrap();
        assert!(claim(&queue).await.is_none());

        queue.set_paused(Lane::Capture, false).await.unwrap();
        assert!(claim(&queue).await.is_some());
    }

    #[tokio::test]
    async fn retry_failed_and_reap() {
        let queue = InMemoryQueue::new();
        let job = capture("org_a", ScreenshotId::new());
        queue.enqueue(job.clone(), EnqueueMode::Deduplicate).await.unwrap();
        claim(&queue).await.unwrap();
        let finished = Utc::now();
        queue
            .complete(Lane::Capture, &job.id, JobResult::Permanent("bad selector".into()), finished, finished)
            .await
            .unwrap();

        let retried = queue.retry_failed(Lane::Capture, 10, Utc::now()).await.unwrap();
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].attempts, 0);
        assert_eq!(queue.counts(Lane::Capture).await.unwrap().waiting, 1);

        claim(&queue).await.unwrap();
        queue
            .complete(Lane::Capture, &job.id, JobResult::Success, finished, finished)
            .await
            .unwrap();
        assert_eq!(
            queue.reap(Lane::Capture, finished - chrono::Duration::seconds(1)).await.unwrap(),
            0
        );
        assert_eq!(queue.reap(Lane::Capture, finished).await.unwrap(), 1);
        assert!(queue.get(Lane::Capture, &job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stalled_active_job_is_handed_out_again() {
        let queue = InMemoryQueue::new();
        let job = capture("org_a", ScreenshotId::new());
        queue.enqueue(job.clone(), EnqueueMode::Deduplicate).await.unwrap();
        let claimed = claim(&queue).await.unwrap();
        let cutoff = claimed.updated_at;

        let before = cutoff - chrono::Duration::seconds(1);
        assert!(queue.requeue_stalled(Lane::Capture, before, Utc::now()).await.unwrap().is_empty());

        let released = queue.requeue_stalled(Lane::Capture, cutoff, Utc::now()).await.unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].state, JobState::Waiting);

        let again = claim(&queue).await.unwrap();
        assert_eq!(again.id, job.id);
        assert_eq!(again.attempts, 2);
    }
}
