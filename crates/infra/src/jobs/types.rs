//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use pagewatch_core::{DiffId, ScreenshotId, TenantId};

use super::payload::JobPayload;

/// A named queue holding one kind of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    Capture,
    Diff,
    Notify,
}

impl Lane {
    pub const ALL: [Lane; 3] = [Lane::Capture, Lane::Diff, Lane::Notify];

    pub fn as_str(self) -> &'static str {
        match self {
            Lane::Capture => "capture",
            Lane::Diff => "diff",
            Lane::Notify => "notify",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "capture" => Some(Lane::Capture),
            "diff" => Some(Lane::Diff),
            "notify" => Some(Lane::Notify),
            _ => None,
        }
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job identity within a lane; doubles as the deduplication key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Stable identity: one live capture per screenshot.
    pub fn capture(screenshot_id: ScreenshotId) -> Self {
        Self(format!("capture:{screenshot_id}"))
    }

    /// Always-new identity for a single forced re-run.
    pub fn capture_adhoc(screenshot_id: ScreenshotId, at: DateTime<Utc>) -> Self {
        Self(format!("capture:{screenshot_id}:{}", at.timestamp_millis()))
    }

    pub fn diff(screenshot_id: ScreenshotId, current_image_ref: &str) -> Self {
        Self(format!("diff:{screenshot_id}:{current_image_ref}"))
    }

    pub fn notify() -> Self {
        Self(format!("notify:{}", Uuid::now_v7()))
    }

    /// One notification per persisted diff, however often the diff job is redelivered.
    pub fn notify_for_diff(diff_id: DiffId) -> Self {
        Self(format!("notify:diff:{diff_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Backend-managed job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Queued, waiting to be picked up
    Waiting,
    /// Owned by exactly one worker
    Active,
    Completed,
    /// Permanent failure or retries exhausted; kept for inspection
    Failed,
    /// Waiting out a retry backoff
    Delayed,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Delayed => "delayed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "waiting" => Some(JobState::Waiting),
            "active" => Some(JobState::Active),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            "delayed" => Some(JobState::Delayed),
            _ => None,
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn is_queued(self) -> bool {
        matches!(self, JobState::Waiting | JobState::Delayed)
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_secs(2), Duration::from_secs(60))
    }
}

impl RetryPolicy {
    /// Single attempt, failures are final.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((attempt - 1).min(30) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic jitter derived from the attempt number.
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Whether another attempt may follow `attempts_made`.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

/// Outcome reported by a handler for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    Success,
    /// Retried while attempts remain (timeouts, navigation failures, backend hiccups)
    Transient(String),
    /// Failed immediately, no further attempts (bad selector, malformed URL)
    Permanent(String),
}

/// What the queue did with a job after an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Completed,
    RetryScheduled { attempt: u32, delay: Duration },
    /// Left in the failed state; the caller reacts via `on_exhausted`.
    Failed { reason: String, attempts: u32 },
}

/// Record of a job execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// A unit of work in a lane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub lane: Lane,
    pub id: JobId,
    pub tenant_id: TenantId,
    pub payload: JobPayload,
    pub state: JobState,
    pub retry_policy: RetryPolicy,
    /// Attempts started so far
    pub attempts: u32,
    /// FIFO position; reassigned when the job re-enters the queue
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest pickup time while delayed
    pub run_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
    pub history: Vec<JobAttemptRecord>,
}

impl Job {
    pub fn new(
        id: JobId,
        tenant_id: TenantId,
        payload: JobPayload,
        retry_policy: RetryPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            lane: payload.lane(),
            id,
            tenant_id,
            payload,
            state: JobState::Waiting,
            retry_policy,
            attempts: 0,
            seq: 0,
            created_at: now,
            updated_at: now,
            run_at: None,
            finished_at: None,
            failed_reason: None,
            history: Vec::new(),
        }
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            JobState::Waiting => true,
            JobState::Delayed => self.run_at.is_none_or(|at| at <= now),
            _ => false,
        }
    }

    pub fn mark_active(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Active;
        self.attempts += 1;
        self.run_at = None;
        self.updated_at = now;
    }

    /// Apply an attempt result. Returns what happens next.
    pub fn record_attempt(
        &mut self,
        result: JobResult,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AttemptOutcome {
        let error = match &result {
            JobResult::Success => None,
            JobResult::Transient(reason) | JobResult::Permanent(reason) => Some(reason.clone()),
        };
        self.history.push(JobAttemptRecord {
            attempt: self.attempts,
            started_at,
            finished_at: now,
            error,
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });
        self.updated_at = now;

        match result {
            JobResult::Success => {
                self.state = JobState::Completed;
                self.failed_reason = None;
                self.finished_at = Some(now);
                AttemptOutcome::Completed
            }
            JobResult::Transient(reason) if self.retry_policy.should_retry(self.attempts) => {
                let delay = self.retry_policy.delay_for_attempt(self.attempts);
                self.state = JobState::Delayed;
                self.run_at = Some(now + chrono::Duration::from_std(delay).unwrap_or_default());
                self.failed_reason = Some(reason);
                AttemptOutcome::RetryScheduled {
                    attempt: self.attempts,
                    delay,
                }
            }
            JobResult::Transient(reason) | JobResult::Permanent(reason) => {
                let reason = if reason.trim().is_empty() {
                    "job failed".to_string()
                } else {
                    reason
                };
                self.state = JobState::Failed;
                self.failed_reason = Some(reason.clone());
                self.finished_at = Some(now);
                AttemptOutcome::Failed {
                    reason,
                    attempts: self.attempts,
                }
            }
        }
    }

    /// Hand an active job whose worker went away back to the queue. The
    /// attempt it was on still counts.
    pub fn release_stalled(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Waiting;
        self.run_at = None;
        self.failed_reason = Some("worker lost while the job was active".to_string());
        self.updated_at = now;
    }

    /// Put a finished job back in line with a fresh retry budget.
    pub fn reset_for_retry(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Waiting;
        self.attempts = 0;
        self.run_at = None;
        self.finished_at = None;
        self.failed_reason = None;
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::payload::CaptureRequest;
    use proptest::prelude::*;

    fn capture_job(policy: RetryPolicy) -> Job {
        let screenshot_id = ScreenshotId::new();
        let payload = CaptureRequest {
            project_id: pagewatch_core::ProjectId::new().to_string(),
            screenshot_id: screenshot_id.to_string(),
            url: "https://example.com".to_string(),
            selector: None,
            viewport: None,
        }
        .validate()
        .unwrap();
        Job::new(
            JobId::capture(screenshot_id),
            TenantId::parse("org_1").unwrap(),
            JobPayload::Capture(payload),
            policy,
            Utc::now(),
        )
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_secs(10))
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Linear,
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn default_policy_allows_three_attempts() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert_eq!(policy.base_delay, Duration::from_secs(2));
    }

    #[test]
    fn transient_failures_exhaust_the_budget() {
        let mut job = capture_job(RetryPolicy::fixed(3, Duration::ZERO));
        let now = Utc::now();

        for attempt in 1..=2 {
            job.mark_active(now);
            let outcome = job.record_attempt(JobResult::Transient("timeout".into()), now, now);
            assert_eq!(
                outcome,
                AttemptOutcome::RetryScheduled {
                    attempt,
                    delay: Duration::ZERO
                }
            );
            assert_eq!(job.state, JobState::Delayed);
            assert!(job.is_ready(now));
        }

        job.mark_active(now);
        let outcome = job.record_attempt(JobResult::Transient("timeout".into()), now, now);
        assert_eq!(
            outcome,
            AttemptOutcome::Failed {
                reason: "timeout".into(),
                attempts: 3
            }
        );
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.history.len(), 3);
    }

    #[test]
    fn permanent_failure_skips_remaining_attempts() {
        let mut job = capture_job(RetryPolicy::default());
        let now = Utc::now();
        job.mark_active(now);

        let outcome = job.record_attempt(JobResult::Permanent("invalid selector".into()), now, now);
        assert!(matches!(outcome, AttemptOutcome::Failed { attempts: 1, .. }));
        assert_eq!(job.failed_reason.as_deref(), Some("invalid selector"));
    }

    #[test]
    fn delayed_job_waits_for_its_backoff() {
        let mut job = capture_job(RetryPolicy::fixed(2, Duration::from_secs(30)));
        let now = Utc::now();
        job.mark_active(now);
        job.record_attempt(JobResult::Transient("navigation failed".into()), now, now);

        assert!(!job.is_ready(now));
        assert!(job.is_ready(now + chrono::Duration::seconds(30)));
    }

    #[test]
    fn job_ids_follow_lane_conventions() {
        let sid = ScreenshotId::new();
        assert_eq!(JobId::capture(sid).as_str(), format!("capture:{sid}"));
        let at = Utc::now();
        assert_eq!(
            JobId::capture_adhoc(sid, at).as_str(),
            format!("capture:{sid}:{}", at.timestamp_millis())
        );
        assert!(JobId::notify().as_str().starts_with("notify:"));
        assert_ne!(JobId::notify(), JobId::notify());
    }

    proptest! {
        #[test]
        fn backoff_never_exceeds_cap_plus_jitter(attempt in 1u32..64, base_ms in 1u64..10_000) {
            let policy = RetryPolicy::exponential(10, Duration::from_millis(base_ms), Duration::from_secs(60));
            let delay = policy.delay_for_attempt(attempt);
            prop_assert!(delay <= Duration::from_millis(66_000));
        }
    }
}
