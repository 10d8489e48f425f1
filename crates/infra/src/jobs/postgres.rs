//! Postgres-backed job lanes and recurring captures.
//!
//! ## Claiming
//!
//! A claim locks a batch of ready rows in queue order with
//! `FOR UPDATE SKIP LOCKED`, walks it through the eligibility predicate and
//! flips the first accepted row to `active` in the same transaction. Rows
//! another worker holds are skipped rather than waited on, so any number of
//! processes can share a lane.
//!
//! ## Storage
//!
//! The full [`Job`] lives in the `body` JSONB column. `state`, `seq`,
//! `run_at`, `finished_at` and `updated_at` are mirrored into columns for
//! the claim, sample and reap queries and are always written together with
//! the body.
//!
//! ## Error Mapping
//!
//! | SQLx Error | QueueError |
//! |------------|------------|
//! | Database (unique violation `23505`) | `Conflict` |
//! | Anything else | `Backend` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument};

use pagewatch_core::{ScreenshotId, TenantId};

use super::payload::CapturePayload;
use super::schedule::{DueCapture, RecurringCapture, ScheduleStore};
use super::store::{
    CancelOutcome, EnqueueMode, Eligibility, LaneCounts, QueueBackend, QueueError, SubmitOutcome,
};
use super::types::{AttemptOutcome, Job, JobId, JobResult, JobState, Lane};

/// Job and schedule tables, applied by [`PostgresJobStore::migrate`].
pub const MIGRATION: &str = include_str!("../../migrations/0002_jobs.sql");

/// Ready rows locked per claim while looking for an eligible one.
const CLAIM_BATCH: i64 = 32;

const JOB_COLUMNS: &str = "body, seq";

/// Durable [`QueueBackend`] and [`ScheduleStore`] over one pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Apply the bundled schema. Idempotent.
    pub async fn migrate(&self) -> Result<(), QueueError> {
        sqlx::raw_sql(MIGRATION)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, QueueError> {
        self.pool.begin().await.map_err(|e| map_sqlx_error("begin", e))
    }

    async fn next_seq(tx: &mut Transaction<'static, Postgres>) -> Result<u64, QueueError> {
        let seq: i64 = sqlx::query_scalar("SELECT nextval('job_seq')")
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("next_seq", e))?;
        Ok(seq.max(0) as u64)
    }

    async fn lock_job(
        tx: &mut Transaction<'static, Postgres>,
        lane: Lane,
        id: &JobId,
    ) -> Result<Option<Job>, QueueError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE lane = $1 AND id = $2 FOR UPDATE"
        ))
        .bind(lane.as_str())
        .bind(id.as_str())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_job", e))?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    /// Insert a new row. `false` when another submission created the key first.
    async fn insert_job(tx: &mut Transaction<'static, Postgres>, job: &Job) -> Result<bool, QueueError> {
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (lane, id, tenant_id, state, seq, run_at, finished_at, updated_at, body)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (lane, id) DO NOTHING
            "#,
        )
        .bind(job.lane.as_str())
        .bind(job.id.as_str())
        .bind(job.tenant_id.as_str())
        .bind(job.state.as_str())
        .bind(job.seq as i64)
        .bind(job.run_at)
        .bind(job.finished_at)
        .bind(job.updated_at)
        .bind(Json(job))
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_job", e))?;
        Ok(result.rows_affected() == 1)
    }

    /// Write back a row locked earlier in the same transaction.
    async fn save_job(tx: &mut Transaction<'static, Postgres>, job: &Job) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                tenant_id = $3,
                state = $4,
                seq = $5,
                run_at = $6,
                finished_at = $7,
                updated_at = $8,
                body = $9
            WHERE lane = $1 AND id = $2
            "#,
        )
        .bind(job.lane.as_str())
        .bind(job.id.as_str())
        .bind(job.tenant_id.as_str())
        .bind(job.state.as_str())
        .bind(job.seq as i64)
        .bind(job.run_at)
        .bind(job.finished_at)
        .bind(job.updated_at)
        .bind(Json(job))
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("save_job", e))?;
        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(job.id.clone()));
        }
        Ok(())
    }

    async fn lane_paused(tx: &mut Transaction<'static, Postgres>, lane: Lane) -> Result<bool, QueueError> {
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM paused_lanes WHERE lane = $1)")
            .bind(lane.as_str())
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("lane_paused", e))
    }

    async fn commit(tx: Transaction<'static, Postgres>) -> Result<(), QueueError> {
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))
    }
}

#[async_trait]
impl QueueBackend for PostgresJobStore {
    #[instrument(skip(self, job), fields(lane = %job.lane, job_id = %job.id))]
    async fn enqueue(&self, mut job: Job, mode: EnqueueMode) -> Result<SubmitOutcome, QueueError> {
        let mut tx = self.begin().await?;
        let outcome = match (Self::lock_job(&mut tx, job.lane, &job.id).await?, mode) {
            (None, _) => {
                job.seq = Self::next_seq(&mut tx).await?;
                if Self::insert_job(&mut tx, &job).await? {
                    SubmitOutcome::Created
                } else {
                    // Lost a race to a concurrent submission of the same key.
                    match mode {
                        EnqueueMode::Unique => return Err(QueueError::Duplicate(job.id)),
                        EnqueueMode::Deduplicate => SubmitOutcome::Coalesced,
                    }
                }
            }
            (Some(existing), _) if existing.state.is_finished() => {
                job.seq = Self::next_seq(&mut tx).await?;
                Self::save_job(&mut tx, &job).await?;
                SubmitOutcome::Created
            }
            (Some(_), EnqueueMode::Unique) => return Err(QueueError::Duplicate(job.id)),
            (Some(existing), EnqueueMode::Deduplicate) if existing.state == JobState::Active => {
                SubmitOutcome::Coalesced
            }
            (Some(mut existing), EnqueueMode::Deduplicate) => {
                // Keep the queue position, take the newest payload and budget.
                existing.payload = job.payload;
                existing.retry_policy = job.retry_policy;
                existing.reset_for_retry(job.updated_at);
                Self::save_job(&mut tx, &existing).await?;
                SubmitOutcome::Replaced
            }
        };
        Self::commit(tx).await?;
        Ok(outcome)
    }

    async fn claim_next(
        &self,
        lane: Lane,
        now: DateTime<Utc>,
        eligible: &mut Eligibility<'_>,
    ) -> Result<Option<Job>, QueueError> {
        let mut tx = self.begin().await?;
        if Self::lane_paused(&mut tx, lane).await? {
            Self::commit(tx).await?;
            return Ok(None);
        }

        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE lane = $1 \
               AND (state = 'waiting' OR (state = 'delayed' AND (run_at IS NULL OR run_at <= $2))) \
             ORDER BY seq \
             LIMIT $3 \
             FOR UPDATE SKIP LOCKED"
        ))
        .bind(lane.as_str())
        .bind(now)
        .bind(CLAIM_BATCH)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;

        let mut claimed = None;
        for row in rows {
            let job = job_from_row(&row)?;
            if eligible(&job) {
                claimed = Some(job);
                break;
            }
        }

        let Some(mut job) = claimed else {
            Self::commit(tx).await?;
            return Ok(None);
        };
        job.mark_active(now);
        Self::save_job(&mut tx, &job).await?;
        Self::commit(tx).await?;
        debug!(lane = %lane, job_id = %job.id, "job claimed");
        Ok(Some(job))
    }

    async fn complete(
        &self,
        lane: Lane,
        id: &JobId,
        result: JobResult,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(Job, AttemptOutcome), QueueError> {
        let mut tx = self.begin().await?;
        let mut job = Self::lock_job(&mut tx, lane, id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;
        if job.state != JobState::Active {
            return Err(QueueError::NotActive(id.clone()));
        }

        let outcome = job.record_attempt(result, started_at, now);
        if matches!(outcome, AttemptOutcome::RetryScheduled { .. }) {
            job.seq = Self::next_seq(&mut tx).await?;
        }
        Self::save_job(&mut tx, &job).await?;
        Self::commit(tx).await?;
        Ok((job, outcome))
    }

    async fn get(&self, lane: Lane, id: &JobId) -> Result<Option<Job>, QueueError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE lane = $1 AND id = $2"))
            .bind(lane.as_str())
            .bind(id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    async fn counts(&self, lane: Lane) -> Result<LaneCounts, QueueError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM jobs WHERE lane = $1 GROUP BY state")
            .bind(lane.as_str())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("counts", e))?;

        let mut counts = LaneCounts::default();
        for row in rows {
            let state: String = row.try_get("state").map_err(row_error)?;
            let n: i64 = row.try_get("n").map_err(row_error)?;
            let n = n.max(0) as usize;
            match JobState::parse(&state).ok_or_else(|| decode_error("state", &state))? {
                JobState::Waiting => counts.waiting = n,
                JobState::Active => counts.active = n,
                JobState::Completed => counts.completed = n,
                JobState::Failed => counts.failed = n,
                JobState::Delayed => counts.delayed = n,
            }
        }
        Ok(counts)
    }

    async fn sample(&self, lane: Lane, state: JobState, limit: usize) -> Result<Vec<Job>, QueueError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE lane = $1 AND state = $2 ORDER BY seq LIMIT $3"
        ))
        .bind(lane.as_str())
        .bind(state.as_str())
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("sample", e))?;
        rows.iter().map(job_from_row).collect()
    }

    async fn retry_failed(&self, lane: Lane, limit: usize, now: DateTime<Utc>) -> Result<Vec<Job>, QueueError> {
        let mut tx = self.begin().await?;
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE lane = $1 AND state = 'failed' \
             ORDER BY finished_at, seq LIMIT $2 FOR UPDATE SKIP LOCKED"
        ))
        .bind(lane.as_str())
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("retry_failed", e))?;

        let mut retried = Vec::with_capacity(rows.len());
        for row in rows {
            let mut job = job_from_row(&row)?;
            job.reset_for_retry(now);
            job.seq = Self::next_seq(&mut tx).await?;
            Self::save_job(&mut tx, &job).await?;
            retried.push(job);
        }
        Self::commit(tx).await?;
        Ok(retried)
    }

    async fn cancel(&self, lane: Lane, id: &JobId) -> Result<CancelOutcome, QueueError> {
        let mut tx = self.begin().await?;
        let outcome = match Self::lock_job(&mut tx, lane, id).await? {
            None => CancelOutcome::NotFound,
            Some(job) if job.state == JobState::Active => CancelOutcome::StillActive,
            Some(_) => {
                sqlx::query("DELETE FROM jobs WHERE lane = $1 AND id = $2")
                    .bind(lane.as_str())
                    .bind(id.as_str())
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx_error("cancel", e))?;
                CancelOutcome::Removed
            }
        };
        Self::commit(tx).await?;
        Ok(outcome)
    }

    async fn set_paused(&self, lane: Lane, paused: bool) -> Result<(), QueueError> {
        let sql = if paused {
            "INSERT INTO paused_lanes (lane) VALUES ($1) ON CONFLICT (lane) DO NOTHING"
        } else {
            "DELETE FROM paused_lanes WHERE lane = $1"
        };
        sqlx::query(sql)
            .bind(lane.as_str())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("set_paused", e))?;
        Ok(())
    }

    async fn is_paused(&self, lane: Lane) -> Result<bool, QueueError> {
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM paused_lanes WHERE lane = $1)")
            .bind(lane.as_str())
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("is_paused", e))
    }

    async fn reap(&self, lane: Lane, cutoff: DateTime<Utc>) -> Result<usize, QueueError> {
        let result = sqlx::query(
            "DELETE FROM jobs WHERE lane = $1 AND state IN ('completed', 'failed') AND finished_at <= $2",
        )
        .bind(lane.as_str())
        .bind(cutoff)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reap", e))?;
        Ok(result.rows_affected() as usize)
    }

    async fn requeue_stalled(&self, lane: Lane, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<Vec<Job>, QueueError> {
        let mut tx = self.begin().await?;
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE lane = $1 AND state = 'active' AND updated_at <= $2 \
             ORDER BY seq FOR UPDATE SKIP LOCKED"
        ))
        .bind(lane.as_str())
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("requeue_stalled", e))?;

        let mut released = Vec::with_capacity(rows.len());
        for row in rows {
            let mut job = job_from_row(&row)?;
            job.release_stalled(now);
            job.seq = Self::next_seq(&mut tx).await?;
            Self::save_job(&mut tx, &job).await?;
            released.push(job);
        }
        Self::commit(tx).await?;
        Ok(released)
    }
}

const SCHEDULE_COLUMNS: &str = "screenshot_id, tenant_id, expression, payload, next_run";

#[async_trait]
impl ScheduleStore for PostgresJobStore {
    #[instrument(skip(self, entry), fields(tenant_id = %entry.tenant_id, screenshot_id = %entry.screenshot_id), err)]
    async fn register(&self, entry: RecurringCapture) -> Result<RecurringCapture, QueueError> {
        let mut tx = self.begin().await?;
        let owner: Option<String> =
            sqlx::query_scalar("SELECT tenant_id FROM capture_schedules WHERE screenshot_id = $1 FOR UPDATE")
                .bind(entry.screenshot_id.as_uuid())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("register", e))?;
        if owner.is_some_and(|owner| owner != entry.tenant_id.as_str()) {
            return Err(QueueError::Conflict("screenshot is scheduled by another tenant".to_string()));
        }

        let result = sqlx::query(
            r#"
            INSERT INTO capture_schedules (screenshot_id, tenant_id, expression, payload, next_run)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (screenshot_id) DO UPDATE SET
                expression = EXCLUDED.expression,
                payload = EXCLUDED.payload,
                next_run = EXCLUDED.next_run
            WHERE capture_schedules.tenant_id = EXCLUDED.tenant_id
            "#,
        )
        .bind(entry.screenshot_id.as_uuid())
        .bind(entry.tenant_id.as_str())
        .bind(&entry.expression)
        .bind(Json(&entry.payload))
        .bind(entry.next_run)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("register", e))?;
        if result.rows_affected() == 0 {
            return Err(QueueError::Conflict("screenshot is scheduled by another tenant".to_string()));
        }
        Self::commit(tx).await?;
        Ok(entry)
    }

    async fn remove(&self, tenant_id: &TenantId, screenshot_id: ScreenshotId) -> Result<bool, QueueError> {
        let result = sqlx::query("DELETE FROM capture_schedules WHERE screenshot_id = $1 AND tenant_id = $2")
            .bind(screenshot_id.as_uuid())
            .bind(tenant_id.as_str())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("unschedule", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn take_due(&self, now: DateTime<Utc>) -> Result<Vec<DueCapture>, QueueError> {
        let mut tx = self.begin().await?;
        let rows = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM capture_schedules WHERE next_run <= $1 \
             ORDER BY screenshot_id FOR UPDATE SKIP LOCKED"
        ))
        .bind(now)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("take_due", e))?;

        let mut due = Vec::with_capacity(rows.len());
        for row in rows {
            let entry = schedule_from_row(&row)?;
            match entry.next_after(now) {
                Some(next) => {
                    sqlx::query("UPDATE capture_schedules SET next_run = $2 WHERE screenshot_id = $1")
                        .bind(entry.screenshot_id.as_uuid())
                        .bind(next)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| map_sqlx_error("take_due", e))?;
                }
                None => {
                    sqlx::query("DELETE FROM capture_schedules WHERE screenshot_id = $1")
                        .bind(entry.screenshot_id.as_uuid())
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| map_sqlx_error("take_due", e))?;
                }
            }
            due.push(DueCapture {
                tenant_id: entry.tenant_id,
                screenshot_id: entry.screenshot_id,
                payload: entry.payload,
            });
        }
        Self::commit(tx).await?;
        Ok(due)
    }

    async fn list(&self, tenant_id: &TenantId) -> Result<Vec<RecurringCapture>, QueueError> {
        let rows = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM capture_schedules WHERE tenant_id = $1 ORDER BY screenshot_id"
        ))
        .bind(tenant_id.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_schedules", e))?;
        rows.iter().map(schedule_from_row).collect()
    }

    async fn get(&self, screenshot_id: ScreenshotId) -> Result<Option<RecurringCapture>, QueueError> {
        let row = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM capture_schedules WHERE screenshot_id = $1"
        ))
        .bind(screenshot_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_schedule", e))?;
        row.map(|r| schedule_from_row(&r)).transpose()
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, QueueError> {
    let Json(mut job): Json<Job> = row.try_get("body").map_err(row_error)?;
    let seq: i64 = row.try_get("seq").map_err(row_error)?;
    job.seq = seq.max(0) as u64;
    Ok(job)
}

fn schedule_from_row(row: &PgRow) -> Result<RecurringCapture, QueueError> {
    let tenant: String = row.try_get("tenant_id").map_err(row_error)?;
    let tenant_id = TenantId::parse(&tenant).map_err(|_| decode_error("tenant_id", &tenant))?;
    let Json(payload): Json<CapturePayload> = row.try_get("payload").map_err(row_error)?;
    let expression: String = row.try_get("expression").map_err(row_error)?;
    let next_run: DateTime<Utc> = row.try_get("next_run").map_err(row_error)?;
    RecurringCapture::restore(tenant_id, expression, payload, next_run)
        .map_err(|e| QueueError::Backend(format!("stored schedule is unreadable: {e}")))
}

fn row_error(err: sqlx::Error) -> QueueError {
    QueueError::Backend(format!("failed to decode row: {err}"))
}

fn decode_error(column: &str, value: &str) -> QueueError {
    QueueError::Backend(format!("unexpected value {value:?} in column {column}"))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => QueueError::Conflict(msg),
                _ => QueueError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => QueueError::Backend(format!("connection pool closed in {}", operation)),
        _ => QueueError::Backend(format!("sqlx error in {}: {}", operation, err)),
    }
}
