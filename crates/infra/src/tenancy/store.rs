//! Tenant-isolated relational store abstraction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use pagewatch_core::model::{
    ApprovalEvent, Diff, Project, Screenshot, Tenant, User, UserProfile,
};
use pagewatch_core::{
    DomainError, ProjectId, QuotaExceeded, ScreenshotId, TenantContextError, TenantId,
};

/// Store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("tenant isolation violation: {0}")]
    TenantIsolation(#[from] TenantContextError),
    /// Optimistic concurrency failure (the row changed since it was read).
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Quota(#[from] QuotaExceeded),
    /// Input rejected before reaching the backend.
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("storage error: {0}")]
    Backend(String),
}

/// Shared, row-level-isolated store.
///
/// Every method takes the tenant explicitly; implementations must never
/// return or accept rows belonging to another tenant. Callers reach the
/// store through [`crate::tenancy::TenantScope`], never directly.
#[async_trait]
pub trait TenantStore: Send + Sync {
    /// Create or update the tenant row (name/plan are last-write-wins).
    async fn upsert_tenant(&self, tenant: Tenant) -> Result<Tenant, StoreError>;

    async fn get_tenant(&self, tenant_id: &TenantId) -> Result<Option<Tenant>, StoreError>;

    /// Idempotent create-or-update keyed by `external_id`.
    async fn upsert_user(
        &self,
        tenant_id: &TenantId,
        external_id: &str,
        profile: UserProfile,
        now: DateTime<Utc>,
    ) -> Result<User, StoreError>;

    /// Returns whether a row was removed.
    async fn delete_user(&self, tenant_id: &TenantId, external_id: &str) -> Result<bool, StoreError>;

    async fn get_user(&self, tenant_id: &TenantId, external_id: &str) -> Result<Option<User>, StoreError>;

    /// Insert a project, atomically enforcing `max_projects` when given.
    async fn insert_project(
        &self,
        tenant_id: &TenantId,
        project: Project,
        max_projects: Option<u64>,
    ) -> Result<Project, StoreError>;

    async fn get_project(&self, tenant_id: &TenantId, id: ProjectId) -> Result<Option<Project>, StoreError>;

    async fn list_projects(&self, tenant_id: &TenantId) -> Result<Vec<Project>, StoreError>;

    async fn count_projects(&self, tenant_id: &TenantId) -> Result<u64, StoreError>;

    /// Insert a screenshot; the owning project must exist under the same tenant.
    async fn insert_screenshot(&self, tenant_id: &TenantId, screenshot: Screenshot) -> Result<Screenshot, StoreError>;

    async fn get_screenshot(&self, tenant_id: &TenantId, id: ScreenshotId) -> Result<Option<Screenshot>, StoreError>;

    async fn list_screenshots(&self, tenant_id: &TenantId, project_id: ProjectId) -> Result<Vec<Screenshot>, StoreError>;

    /// Write back a screenshot read earlier. Fails with `Conflict` if the
    /// stored version no longer matches `screenshot.version`.
    async fn update_screenshot(&self, tenant_id: &TenantId, screenshot: &Screenshot) -> Result<Screenshot, StoreError>;

    /// Persist a diff. Idempotent on `(screenshot, previous ref, current ref)`:
    /// a redelivered comparison returns the row written the first time.
    async fn insert_diff(&self, tenant_id: &TenantId, diff: Diff) -> Result<Diff, StoreError>;

    async fn latest_diff(&self, tenant_id: &TenantId, screenshot_id: ScreenshotId) -> Result<Option<Diff>, StoreError>;

    /// Update the screenshot's approval fields and append the audit row as
    /// one unit: both writes are applied or neither is.
    async fn record_approval(
        &self,
        tenant_id: &TenantId,
        screenshot: &Screenshot,
        event: ApprovalEvent,
    ) -> Result<Screenshot, StoreError>;

    async fn list_approval_events(
        &self,
        tenant_id: &TenantId,
        screenshot_id: ScreenshotId,
    ) -> Result<Vec<ApprovalEvent>, StoreError>;

    async fn capture_usage(&self, tenant_id: &TenantId, period: &str) -> Result<u64, StoreError>;

    /// Conditional increment: bumps the counter only while it is below
    /// `limit` and returns the new value, otherwise `StoreError::Quota`.
    async fn try_increment_capture_usage(
        &self,
        tenant_id: &TenantId,
        period: &str,
        limit: Option<u64>,
    ) -> Result<u64, StoreError>;

    /// Refund one unit (never below zero).
    async fn release_capture_usage(&self, tenant_id: &TenantId, period: &str) -> Result<(), StoreError>;
}

pub(crate) fn ensure_owned(scope: &TenantId, row: &TenantId) -> Result<(), StoreError> {
    if scope != row {
        return Err(StoreError::TenantIsolation(TenantContextError::Mismatch {
            scope: scope.clone(),
            row: row.clone(),
        }));
    }
    Ok(())
}
