//! Postgres-backed tenant store.
//!
//! ## Tenant Isolation
//!
//! Every operation runs in its own transaction that starts with
//! `set_config('app.current_tenant', $1, true)`. The setting is
//! transaction-local, so it is released on commit/rollback and can never leak
//! into another caller's use of the pooled connection. The row-level security
//! policies in `migrations/0001_tenancy.sql` compare every row's `tenant_id`
//! against it, and every query also filters on `tenant_id` explicitly.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (foreign key violation) | `23503` | `NotFound` |
//! | Database (RLS `WITH CHECK` failure) | `42501` | `TenantIsolation` |
//! | Anything else | any | `Backend` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use pagewatch_core::model::{
    ApprovalAction, ApprovalEvent, ApprovalStatus, CaptureStatus, Diff, DiffMetrics, Plan, Project,
    Screenshot, Tenant, User, UserProfile, Viewport,
};
use pagewatch_core::{
    ProjectId, QuotaExceeded, QuotaResource, ScreenshotId, TenantContextError, TenantId,
};

use super::store::{StoreError, TenantStore, ensure_owned};

/// Schema + RLS policies, applied by [`PostgresTenantStore::migrate`].
pub const MIGRATION: &str = include_str!("../../migrations/0001_tenancy.sql");

/// Postgres-backed tenant store.
#[derive(Debug, Clone)]
pub struct PostgresTenantStore {
    pool: Arc<PgPool>,
}

impl PostgresTenantStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Apply the bundled schema. Idempotent.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(MIGRATION)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    /// Open a transaction bound to `tenant_id`.
    async fn begin(&self, tenant_id: &TenantId) -> Result<Transaction<'static, Postgres>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;
        sqlx::query("SELECT set_config('app.current_tenant', $1, true)")
            .bind(tenant_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("set_tenant", e))?;
        Ok(tx)
    }

    async fn load_screenshot(
        tx: &mut Transaction<'static, Postgres>,
        tenant_id: &TenantId,
        id: ScreenshotId,
    ) -> Result<Option<Screenshot>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SCREENSHOT_COLUMNS} FROM screenshots WHERE tenant_id = $1 AND id = $2"
        ))
        .bind(tenant_id.as_str())
        .bind(id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("load_screenshot", e))?;
        row.map(|r| screenshot_from_row(&r)).transpose()
    }

    /// Versioned write of every mutable screenshot column.
    async fn write_screenshot(
        tx: &mut Transaction<'static, Postgres>,
        tenant_id: &TenantId,
        screenshot: &Screenshot,
    ) -> Result<Screenshot, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE screenshots SET
                name = $3,
                url = $4,
                selector = $5,
                viewport_width = $6,
                viewport_height = $7,
                status = $8,
                approval_status = $9,
                approved_by = $10,
                approved_at = $11,
                retry_count = $12,
                image_ref = $13,
                last_error = $14,
                last_captured_at = $15,
                capture_job_id = $16,
                updated_at = $17,
                version = version + 1
            WHERE tenant_id = $1 AND id = $2 AND version = $18
            "#,
        )
        .bind(tenant_id.as_str())
        .bind(screenshot.id.as_uuid())
        .bind(&screenshot.name)
        .bind(&screenshot.url)
        .bind(&screenshot.selector)
        .bind(screenshot.viewport.map(|v| v.width as i32))
        .bind(screenshot.viewport.map(|v| v.height as i32))
        .bind(screenshot.status.as_str())
        .bind(screenshot.approval_status.as_str())
        .bind(&screenshot.approved_by)
        .bind(screenshot.approved_at)
        .bind(screenshot.retry_count as i32)
        .bind(&screenshot.image_ref)
        .bind(&screenshot.last_error)
        .bind(screenshot.last_captured_at)
        .bind(&screenshot.capture_job_id)
        .bind(screenshot.updated_at)
        .bind(screenshot.version as i64)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("write_screenshot", e))?;

        if result.rows_affected() == 0 {
            return match Self::load_screenshot(tx, tenant_id, screenshot.id).await? {
                Some(stored) => Err(StoreError::Conflict(format!(
                    "screenshot {} is at version {}, write was based on {}",
                    stored.id, stored.version, screenshot.version
                ))),
                None => Err(StoreError::NotFound),
            };
        }

        let mut next = screenshot.clone();
        next.version += 1;
        Ok(next)
    }
}

const SCREENSHOT_COLUMNS: &str = "id, tenant_id, project_id, name, url, selector, viewport_width, \
     viewport_height, status, approval_status, approved_by, approved_at, retry_count, image_ref, \
     last_error, last_captured_at, capture_job_id, version, created_at, updated_at";

const DIFF_COLUMNS: &str = "id, tenant_id, screenshot_id, previous_image_ref, current_image_ref, \
     pixel_diff, percentage_diff, total_pixels, significant, threshold, created_at";

#[async_trait]
impl TenantStore for PostgresTenantStore {
    #[instrument(skip(self, tenant), fields(tenant_id = %tenant.id), err)]
    async fn upsert_tenant(&self, tenant: Tenant) -> Result<Tenant, StoreError> {
        let mut tx = self.begin(&tenant.id).await?;
        let row = sqlx::query(
            r#"
            INSERT INTO tenants (id, name, plan, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, plan = EXCLUDED.plan
            RETURNING id, name, plan, created_at
            "#,
        )
        .bind(tenant.id.as_str())
        .bind(&tenant.name)
        .bind(tenant.plan.as_str())
        .bind(tenant.created_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("upsert_tenant", e))?;
        let stored = tenant_from_row(&row)?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(stored)
    }

    async fn get_tenant(&self, tenant_id: &TenantId) -> Result<Option<Tenant>, StoreError> {
        let mut tx = self.begin(tenant_id).await?;
        let row = sqlx::query("SELECT id, name, plan, created_at FROM tenants WHERE id = $1")
            .bind(tenant_id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("get_tenant", e))?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        row.map(|r| tenant_from_row(&r)).transpose()
    }

    async fn upsert_user(
        &self,
        tenant_id: &TenantId,
        external_id: &str,
        profile: UserProfile,
        now: DateTime<Utc>,
    ) -> Result<User, StoreError> {
        let mut tx = self.begin(tenant_id).await?;
        let row = sqlx::query(
            r#"
            INSERT INTO users (tenant_id, external_id, email, display_name, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $5)
            ON CONFLICT (tenant_id, external_id) DO UPDATE SET
                email = EXCLUDED.email,
                display_name = EXCLUDED.display_name,
                updated_at = EXCLUDED.updated_at
            RETURNING tenant_id, external_id, email, display_name, created_at, updated_at
            "#,
        )
        .bind(tenant_id.as_str())
        .bind(external_id)
        .bind(&profile.email)
        .bind(&profile.display_name)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("upsert_user", e))?;
        let user = user_from_row(&row)?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(user)
    }

    async fn delete_user(&self, tenant_id: &TenantId, external_id: &str) -> Result<bool, StoreError> {
        let mut tx = self.begin(tenant_id).await?;
        let result = sqlx::query("DELETE FROM users WHERE tenant_id = $1 AND external_id = $2")
            .bind(tenant_id.as_str())
            .bind(external_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete_user", e))?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_user(&self, tenant_id: &TenantId, external_id: &str) -> Result<Option<User>, StoreError> {
        let mut tx = self.begin(tenant_id).await?;
        let row = sqlx::query(
            "SELECT tenant_id, external_id, email, display_name, created_at, updated_at \
             FROM users WHERE tenant_id = $1 AND external_id = $2",
        )
        .bind(tenant_id.as_str())
        .bind(external_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("get_user", e))?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        row.map(|r| user_from_row(&r)).transpose()
    }

    #[instrument(skip(self, project), fields(tenant_id = %tenant_id), err)]
    async fn insert_project(
        &self,
        tenant_id: &TenantId,
        project: Project,
        max_projects: Option<u64>,
    ) -> Result<Project, StoreError> {
        ensure_owned(tenant_id, &project.tenant_id)?;
        let mut tx = self.begin(tenant_id).await?;

        // Serialize concurrent creates for this tenant so the count check holds.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(tenant_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lock_projects", e))?;

        if let Some(limit) = max_projects {
            let used: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM projects WHERE tenant_id = $1")
                .bind(tenant_id.as_str())
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("count_projects", e))?;
            if used as u64 >= limit {
                return Err(StoreError::Quota(QuotaExceeded {
                    tenant_id: tenant_id.clone(),
                    resource: QuotaResource::Projects,
                    used: used as u64,
                    limit,
                }));
            }
        }

        sqlx::query(
            "INSERT INTO projects (id, tenant_id, name, base_url, diff_threshold, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(project.id.as_uuid())
        .bind(tenant_id.as_str())
        .bind(&project.name)
        .bind(&project.base_url)
        .bind(project.diff_threshold)
        .bind(project.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_project", e))?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(project)
    }

    async fn get_project(&self, tenant_id: &TenantId, id: ProjectId) -> Result<Option<Project>, StoreError> {
        let mut tx = self.begin(tenant_id).await?;
        let row = sqlx::query(
            "SELECT id, tenant_id, name, base_url, diff_threshold, created_at \
             FROM projects WHERE tenant_id = $1 AND id = $2",
        )
        .bind(tenant_id.as_str())
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("get_project", e))?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        row.map(|r| project_from_row(&r)).transpose()
    }

    async fn list_projects(&self, tenant_id: &TenantId) -> Result<Vec<Project>, StoreError> {
        let mut tx = self.begin(tenant_id).await?;
        let rows = sqlx::query(
            "SELECT id, tenant_id, name, base_url, diff_threshold, created_at \
             FROM projects WHERE tenant_id = $1 ORDER BY created_at, id",
        )
        .bind(tenant_id.as_str())
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("list_projects", e))?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        rows.iter().map(project_from_row).collect()
    }

    async fn count_projects(&self, tenant_id: &TenantId) -> Result<u64, StoreError> {
        let mut tx = self.begin(tenant_id).await?;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM projects WHERE tenant_id = $1")
            .bind(tenant_id.as_str())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("count_projects", e))?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(count.max(0) as u64)
    }

    async fn insert_screenshot(&self, tenant_id: &TenantId, screenshot: Screenshot) -> Result<Screenshot, StoreError> {
        ensure_owned(tenant_id, &screenshot.tenant_id)?;
        let mut tx = self.begin(tenant_id).await?;
        let project_exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM projects WHERE tenant_id = $1 AND id = $2)",
        )
        .bind(tenant_id.as_str())
        .bind(screenshot.project_id.as_uuid())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("check_project", e))?;
        if !project_exists {
            return Err(StoreError::NotFound);
        }

        sqlx::query(&format!(
            "INSERT INTO screenshots ({SCREENSHOT_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)"
        ))
        .bind(screenshot.id.as_uuid())
        .bind(tenant_id.as_str())
        .bind(screenshot.project_id.as_uuid())
        .bind(&screenshot.name)
        .bind(&screenshot.url)
        .bind(&screenshot.selector)
        .bind(screenshot.viewport.map(|v| v.width as i32))
        .bind(screenshot.viewport.map(|v| v.height as i32))
        .bind(screenshot.status.as_str())
        .bind(screenshot.approval_status.as_str())
        .bind(&screenshot.approved_by)
        .bind(screenshot.approved_at)
        .bind(screenshot.retry_count as i32)
        .bind(&screenshot.image_ref)
        .bind(&screenshot.last_error)
        .bind(screenshot.last_captured_at)
        .bind(&screenshot.capture_job_id)
        .bind(screenshot.version as i64)
        .bind(screenshot.created_at)
        .bind(screenshot.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_screenshot", e))?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(screenshot)
    }

    async fn get_screenshot(&self, tenant_id: &TenantId, id: ScreenshotId) -> Result<Option<Screenshot>, StoreError> {
        let mut tx = self.begin(tenant_id).await?;
        let screenshot = Self::load_screenshot(&mut tx, tenant_id, id).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(screenshot)
    }

    async fn list_screenshots(&self, tenant_id: &TenantId, project_id: ProjectId) -> Result<Vec<Screenshot>, StoreError> {
        let mut tx = self.begin(tenant_id).await?;
        let rows = sqlx::query(&format!(
            "SELECT {SCREENSHOT_COLUMNS} FROM screenshots \
             WHERE tenant_id = $1 AND project_id = $2 ORDER BY created_at, id"
        ))
        .bind(tenant_id.as_str())
        .bind(project_id.as_uuid())
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("list_screenshots", e))?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        rows.iter().map(screenshot_from_row).collect()
    }

    #[instrument(skip(self, screenshot), fields(tenant_id = %tenant_id, screenshot_id = %screenshot.id), err)]
    async fn update_screenshot(&self, tenant_id: &TenantId, screenshot: &Screenshot) -> Result<Screenshot, StoreError> {
        ensure_owned(tenant_id, &screenshot.tenant_id)?;
        let mut tx = self.begin(tenant_id).await?;
        let next = Self::write_screenshot(&mut tx, tenant_id, screenshot).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(next)
    }

    async fn insert_diff(&self, tenant_id: &TenantId, diff: Diff) -> Result<Diff, StoreError> {
        ensure_owned(tenant_id, &diff.tenant_id)?;
        let mut tx = self.begin(tenant_id).await?;
        sqlx::query(&format!(
            "INSERT INTO diffs ({DIFF_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             ON CONFLICT (tenant_id, screenshot_id, previous_image_ref, current_image_ref) DO NOTHING"
        ))
        .bind(diff.id.as_uuid())
        .bind(tenant_id.as_str())
        .bind(diff.screenshot_id.as_uuid())
        .bind(&diff.previous_image_ref)
        .bind(&diff.current_image_ref)
        .bind(diff.metrics.pixel_diff as i64)
        .bind(diff.metrics.percentage_diff)
        .bind(diff.metrics.total_pixels as i64)
        .bind(diff.significant)
        .bind(diff.threshold)
        .bind(diff.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_diff", e))?;

        let row = sqlx::query(&format!(
            "SELECT {DIFF_COLUMNS} FROM diffs WHERE tenant_id = $1 AND screenshot_id = $2 \
             AND previous_image_ref = $3 AND current_image_ref = $4"
        ))
        .bind(tenant_id.as_str())
        .bind(diff.screenshot_id.as_uuid())
        .bind(&diff.previous_image_ref)
        .bind(&diff.current_image_ref)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("load_diff", e))?;
        let stored = diff_from_row(&row)?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(stored)
    }

    async fn latest_diff(&self, tenant_id: &TenantId, screenshot_id: ScreenshotId) -> Result<Option<Diff>, StoreError> {
        let mut tx = self.begin(tenant_id).await?;
        let row = sqlx::query(&format!(
            "SELECT {DIFF_COLUMNS} FROM diffs WHERE tenant_id = $1 AND screenshot_id = $2 \
             ORDER BY created_at DESC, id DESC LIMIT 1"
        ))
        .bind(tenant_id.as_str())
        .bind(screenshot_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("latest_diff", e))?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        row.map(|r| diff_from_row(&r)).transpose()
    }

    #[instrument(skip(self, screenshot, event), fields(tenant_id = %tenant_id, screenshot_id = %screenshot.id), err)]
    async fn record_approval(
        &self,
        tenant_id: &TenantId,
        screenshot: &Screenshot,
        event: ApprovalEvent,
    ) -> Result<Screenshot, StoreError> {
        ensure_owned(tenant_id, &screenshot.tenant_id)?;
        ensure_owned(tenant_id, &event.tenant_id)?;
        let mut tx = self.begin(tenant_id).await?;
        let next = Self::write_screenshot(&mut tx, tenant_id, screenshot).await?;
        sqlx::query(
            "INSERT INTO approval_events (id, tenant_id, screenshot_id, diff_id, action, actor, reason, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(event.id.as_uuid())
        .bind(tenant_id.as_str())
        .bind(event.screenshot_id.as_uuid())
        .bind(event.diff_id.map(|d| *d.as_uuid()))
        .bind(event.action.as_str())
        .bind(&event.actor)
        .bind(&event.reason)
        .bind(event.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_approval_event", e))?;
        // Dropping `tx` on any error above rolls back both writes.
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(next)
    }

    async fn list_approval_events(
        &self,
        tenant_id: &TenantId,
        screenshot_id: ScreenshotId,
    ) -> Result<Vec<ApprovalEvent>, StoreError> {
        let mut tx = self.begin(tenant_id).await?;
        let rows = sqlx::query(
            "SELECT id, tenant_id, screenshot_id, diff_id, action, actor, reason, created_at \
             FROM approval_events WHERE tenant_id = $1 AND screenshot_id = $2 ORDER BY created_at, id",
        )
        .bind(tenant_id.as_str())
        .bind(screenshot_id.as_uuid())
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("list_approval_events", e))?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        rows.iter().map(approval_event_from_row).collect()
    }

    async fn capture_usage(&self, tenant_id: &TenantId, period: &str) -> Result<u64, StoreError> {
        let mut tx = self.begin(tenant_id).await?;
        let count: Option<i64> = sqlx::query_scalar(
            "SELECT count FROM capture_usage WHERE tenant_id = $1 AND period = $2",
        )
        .bind(tenant_id.as_str())
        .bind(period)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("capture_usage", e))?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(count.unwrap_or(0).max(0) as u64)
    }

    #[instrument(skip(self), err)]
    async fn try_increment_capture_usage(
        &self,
        tenant_id: &TenantId,
        period: &str,
        limit: Option<u64>,
    ) -> Result<u64, StoreError> {
        let quota_error = |used: u64, limit: u64| {
            StoreError::Quota(QuotaExceeded {
                tenant_id: tenant_id.clone(),
                resource: QuotaResource::MonthlyCaptures,
                used,
                limit,
            })
        };
        if limit == Some(0) {
            return Err(quota_error(0, 0));
        }

        let mut tx = self.begin(tenant_id).await?;
        // Single conditional upsert: the row lock taken by ON CONFLICT makes
        // check-and-increment atomic across concurrent submitters.
        let updated: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO capture_usage (tenant_id, period, count) VALUES ($1, $2, 1)
            ON CONFLICT (tenant_id, period) DO UPDATE SET count = capture_usage.count + 1
            WHERE $3::BIGINT IS NULL OR capture_usage.count < $3::BIGINT
            RETURNING count
            "#,
        )
        .bind(tenant_id.as_str())
        .bind(period)
        .bind(limit.map(|l| l as i64))
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("increment_capture_usage", e))?;

        match updated {
            Some(count) => {
                tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
                Ok(count.max(0) as u64)
            }
            None => {
                let used: i64 = sqlx::query_scalar(
                    "SELECT count FROM capture_usage WHERE tenant_id = $1 AND period = $2",
                )
                .bind(tenant_id.as_str())
                .bind(period)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("capture_usage", e))?;
                Err(quota_error(used.max(0) as u64, limit.unwrap_or_default()))
            }
        }
    }

    async fn release_capture_usage(&self, tenant_id: &TenantId, period: &str) -> Result<(), StoreError> {
        let mut tx = self.begin(tenant_id).await?;
        sqlx::query(
            "UPDATE capture_usage SET count = GREATEST(count - 1, 0) WHERE tenant_id = $1 AND period = $2",
        )
        .bind(tenant_id.as_str())
        .bind(period)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("release_capture_usage", e))?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(())
    }
}

fn tenant_id_from_row(row: &PgRow, column: &str) -> Result<TenantId, StoreError> {
    let raw: String = row.try_get(column).map_err(row_error)?;
    Ok(TenantId::parse(raw)?)
}

fn tenant_from_row(row: &PgRow) -> Result<Tenant, StoreError> {
    let plan: String = row.try_get("plan").map_err(row_error)?;
    Ok(Tenant {
        id: tenant_id_from_row(row, "id")?,
        name: row.try_get("name").map_err(row_error)?,
        plan: Plan::parse(&plan).ok_or_else(|| decode_error("plan", &plan))?,
        created_at: row.try_get("created_at").map_err(row_error)?,
    })
}

fn user_from_row(row: &PgRow) -> Result<User, StoreError> {
    Ok(User {
        tenant_id: tenant_id_from_row(row, "tenant_id")?,
        external_id: row.try_get("external_id").map_err(row_error)?,
        email: row.try_get("email").map_err(row_error)?,
        display_name: row.try_get("display_name").map_err(row_error)?,
        created_at: row.try_get("created_at").map_err(row_error)?,
        updated_at: row.try_get("updated_at").map_err(row_error)?,
    })
}

fn project_from_row(row: &PgRow) -> Result<Project, StoreError> {
    let id: uuid::Uuid = row.try_get("id").map_err(row_error)?;
    Ok(Project {
        id: ProjectId::from_uuid(id),
        tenant_id: tenant_id_from_row(row, "tenant_id")?,
        name: row.try_get("name").map_err(row_error)?,
        base_url: row.try_get("base_url").map_err(row_error)?,
        diff_threshold: row.try_get("diff_threshold").map_err(row_error)?,
        created_at: row.try_get("created_at").map_err(row_error)?,
    })
}

fn screenshot_from_row(row: &PgRow) -> Result<Screenshot, StoreError> {
    let id: uuid::Uuid = row.try_get("id").map_err(row_error)?;
    let project_id: uuid::Uuid = row.try_get("project_id").map_err(row_error)?;
    let width: Option<i32> = row.try_get("viewport_width").map_err(row_error)?;
    let height: Option<i32> = row.try_get("viewport_height").map_err(row_error)?;
    let status: String = row.try_get("status").map_err(row_error)?;
    let approval: String = row.try_get("approval_status").map_err(row_error)?;
    let retry_count: i32 = row.try_get("retry_count").map_err(row_error)?;
    let version: i64 = row.try_get("version").map_err(row_error)?;

    Ok(Screenshot {
        id: ScreenshotId::from_uuid(id),
        tenant_id: tenant_id_from_row(row, "tenant_id")?,
        project_id: ProjectId::from_uuid(project_id),
        name: row.try_get("name").map_err(row_error)?,
        url: row.try_get("url").map_err(row_error)?,
        selector: row.try_get("selector").map_err(row_error)?,
        viewport: match (width, height) {
            (Some(w), Some(h)) => Some(Viewport {
                width: w.max(0) as u32,
                height: h.max(0) as u32,
            }),
            _ => None,
        },
        status: CaptureStatus::parse(&status).ok_or_else(|| decode_error("status", &status))?,
        approval_status: ApprovalStatus::parse(&approval)
            .ok_or_else(|| decode_error("approval_status", &approval))?,
        approved_by: row.try_get("approved_by").map_err(row_error)?,
        approved_at: row.try_get("approved_at").map_err(row_error)?,
        retry_count: retry_count.max(0) as u32,
        image_ref: row.try_get("image_ref").map_err(row_error)?,
        last_error: row.try_get("last_error").map_err(row_error)?,
        last_captured_at: row.try_get("last_captured_at").map_err(row_error)?,
        capture_job_id: row.try_get("capture_job_id").map_err(row_error)?,
        version: version.max(0) as u64,
        created_at: row.try_get("created_at").map_err(row_error)?,
        updated_at: row.try_get("updated_at").map_err(row_error)?,
    })
}

fn diff_from_row(row: &PgRow) -> Result<Diff, StoreError> {
    let id: uuid::Uuid = row.try_get("id").map_err(row_error)?;
    let screenshot_id: uuid::Uuid = row.try_get("screenshot_id").map_err(row_error)?;
    let pixel_diff: i64 = row.try_get("pixel_diff").map_err(row_error)?;
    let total_pixels: i64 = row.try_get("total_pixels").map_err(row_error)?;
    Ok(Diff {
        id: id.into(),
        tenant_id: tenant_id_from_row(row, "tenant_id")?,
        screenshot_id: ScreenshotId::from_uuid(screenshot_id),
        previous_image_ref: row.try_get("previous_image_ref").map_err(row_error)?,
        current_image_ref: row.try_get("current_image_ref").map_err(row_error)?,
        metrics: DiffMetrics {
            pixel_diff: pixel_diff.max(0) as u64,
            percentage_diff: row.try_get("percentage_diff").map_err(row_error)?,
            total_pixels: total_pixels.max(0) as u64,
        },
        significant: row.try_get("significant").map_err(row_error)?,
        threshold: row.try_get("threshold").map_err(row_error)?,
        created_at: row.try_get("created_at").map_err(row_error)?,
    })
}

fn approval_event_from_row(row: &PgRow) -> Result<ApprovalEvent, StoreError> {
    let id: uuid::Uuid = row.try_get("id").map_err(row_error)?;
    let screenshot_id: uuid::Uuid = row.try_get("screenshot_id").map_err(row_error)?;
    let diff_id: Option<uuid::Uuid> = row.try_get("diff_id").map_err(row_error)?;
    let action: String = row.try_get("action").map_err(row_error)?;
    Ok(ApprovalEvent {
        id: id.into(),
        tenant_id: tenant_id_from_row(row, "tenant_id")?,
        screenshot_id: ScreenshotId::from_uuid(screenshot_id),
        diff_id: diff_id.map(Into::into),
        action: ApprovalAction::parse(&action).ok_or_else(|| decode_error("action", &action))?,
        actor: row.try_get("actor").map_err(row_error)?,
        reason: row.try_get("reason").map_err(row_error)?,
        created_at: row.try_get("created_at").map_err(row_error)?,
    })
}

fn row_error(err: sqlx::Error) -> StoreError {
    StoreError::Backend(format!("failed to decode row: {err}"))
}

fn decode_error(column: &str, value: &str) -> StoreError {
    StoreError::Backend(format!("unexpected value {value:?} in column {column}"))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                Some("23503") => StoreError::NotFound,
                // RLS WITH CHECK rejections surface as insufficient_privilege.
                Some("42501") => StoreError::TenantIsolation(TenantContextError::MissingTenant),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Backend(format!("sqlx error in {}: {}", operation, err)),
    }
}
