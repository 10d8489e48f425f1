//! Scoped tenant boundary.
//!
//! [`TenantContext`] is shared process-wide but never carries a tenant. Each
//! logical operation calls [`TenantContext::with_tenant`], which builds a
//! fresh [`TenantScope`] bound to exactly one tenant, runs the operation and
//! drops the scope. Two concurrent callers therefore never observe each
//! other's boundary.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{Instrument, debug, info, info_span};

use pagewatch_core::model::{
    ApprovalEvent, Diff, NewProject, NewScreenshot, Plan, Project, QuotaStatus, Screenshot,
    Tenant, Usage, User, UserProfile, usage_period,
};
use pagewatch_core::{ProjectId, ScreenshotId, TenantContextError, TenantId};

use super::store::{StoreError, TenantStore};

/// Entry point for all tenant-scoped data access.
#[derive(Clone)]
pub struct TenantContext {
    store: Arc<dyn TenantStore>,
}

impl std::fmt::Debug for TenantContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantContext").finish_non_exhaustive()
    }
}

impl TenantContext {
    pub fn new(store: Arc<dyn TenantStore>) -> Self {
        Self { store }
    }

    /// Run `operation` inside a boundary for `tenant_id`.
    ///
    /// Fails closed with [`TenantContextError::MissingTenant`] before the
    /// operation runs if the id is empty.
    pub async fn with_tenant<F, Fut, T, E>(&self, tenant_id: impl AsRef<str>, operation: F) -> Result<T, E>
    where
        F: FnOnce(TenantScope) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<TenantContextError>,
    {
        let tenant_id = TenantId::parse(tenant_id)?;
        let span = info_span!("tenant_scope", tenant_id = %tenant_id);
        let scope = TenantScope {
            store: Arc::clone(&self.store),
            tenant_id,
        };
        operation(scope).instrument(span).await
    }

    /// Handle an identity-provider webhook event under the event's own tenant.
    pub async fn apply_identity_event(&self, event: IdentityEvent) -> Result<IdentityOutcome, StoreError> {
        let tenant_id = event.tenant_id().to_string();
        self.with_tenant(tenant_id, |scope| async move {
            match event {
                IdentityEvent::UserCreated(user) | IdentityEvent::UserUpdated(user) => {
                    let org_name = user.org_name.unwrap_or_else(|| scope.tenant_id().to_string());
                    scope.ensure_tenant(&org_name).await?;
                    let stored = scope
                        .upsert_user(
                            &user.external_id,
                            UserProfile {
                                email: user.email,
                                display_name: user.display_name,
                            },
                        )
                        .await?;
                    Ok(IdentityOutcome::Upserted(stored))
                }
                IdentityEvent::UserDeleted { external_id, .. } => {
                    let removed = scope.delete_user(&external_id).await?;
                    Ok(IdentityOutcome::Deleted { removed })
                }
            }
        })
        .await
    }
}

/// A boundary for exactly one tenant. Built only by [`TenantContext::with_tenant`].
pub struct TenantScope {
    store: Arc<dyn TenantStore>,
    tenant_id: TenantId,
}

impl std::fmt::Debug for TenantScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantScope")
            .field("tenant_id", &self.tenant_id)
            .finish_non_exhaustive()
    }
}

/// A consumed unit of the monthly capture quota.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageReservation {
    pub period: String,
    pub used: u64,
}

impl TenantScope {
    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    /// Return the tenant row, creating it on the free plan if missing.
    pub async fn ensure_tenant(&self, name: &str) -> Result<Tenant, StoreError> {
        if let Some(existing) = self.store.get_tenant(&self.tenant_id).await? {
            return Ok(existing);
        }
        info!(tenant_id = %self.tenant_id, "provisioning tenant");
        self.store
            .upsert_tenant(Tenant {
                id: self.tenant_id.clone(),
                name: name.to_string(),
                plan: Plan::default(),
                created_at: Utc::now(),
            })
            .await
    }

    /// Change the tenant's plan. Unknown tenants fail closed.
    pub async fn set_plan(&self, plan: Plan) -> Result<Tenant, StoreError> {
        let mut tenant = self.require_tenant().await?;
        tenant.plan = plan;
        self.store.upsert_tenant(tenant).await
    }

    pub async fn tenant(&self) -> Result<Option<Tenant>, StoreError> {
        self.store.get_tenant(&self.tenant_id).await
    }

    pub async fn upsert_user(&self, external_id: &str, profile: UserProfile) -> Result<User, StoreError> {
        self.store
            .upsert_user(&self.tenant_id, external_id, profile, Utc::now())
            .await
    }

    pub async fn delete_user(&self, external_id: &str) -> Result<bool, StoreError> {
        self.store.delete_user(&self.tenant_id, external_id).await
    }

    pub async fn user(&self, external_id: &str) -> Result<Option<User>, StoreError> {
        self.store.get_user(&self.tenant_id, external_id).await
    }

    /// Validate and insert a project, enforcing the plan's project limit in
    /// the same write.
    pub async fn create_project(&self, input: NewProject) -> Result<Project, StoreError> {
        input.validate()?;
        let tenant = self.require_tenant().await?;
        let project = input.into_project(self.tenant_id.clone(), Utc::now());
        self.store
            .insert_project(&self.tenant_id, project, tenant.plan.limits().max_projects)
            .await
    }

    pub async fn project(&self, id: ProjectId) -> Result<Option<Project>, StoreError> {
        self.store.get_project(&self.tenant_id, id).await
    }

    pub async fn projects(&self) -> Result<Vec<Project>, StoreError> {
        self.store.list_projects(&self.tenant_id).await
    }

    pub async fn create_screenshot(&self, project_id: ProjectId, input: NewScreenshot) -> Result<Screenshot, StoreError> {
        input.validate()?;
        let screenshot = Screenshot::new(self.tenant_id.clone(), project_id, input, Utc::now());
        self.store.insert_screenshot(&self.tenant_id, screenshot).await
    }

    pub async fn screenshot(&self, id: ScreenshotId) -> Result<Option<Screenshot>, StoreError> {
        self.store.get_screenshot(&self.tenant_id, id).await
    }

    pub async fn screenshots(&self, project_id: ProjectId) -> Result<Vec<Screenshot>, StoreError> {
        self.store.list_screenshots(&self.tenant_id, project_id).await
    }

    /// Versioned write-back; `Conflict` when the row moved underneath.
    pub async fn save_screenshot(&self, screenshot: &Screenshot) -> Result<Screenshot, StoreError> {
        self.store.update_screenshot(&self.tenant_id, screenshot).await
    }

    pub async fn record_diff(&self, diff: Diff) -> Result<Diff, StoreError> {
        self.store.insert_diff(&self.tenant_id, diff).await
    }

    pub async fn latest_diff(&self, screenshot_id: ScreenshotId) -> Result<Option<Diff>, StoreError> {
        self.store.latest_diff(&self.tenant_id, screenshot_id).await
    }

    /// Approval field update and audit row, applied together.
    pub async fn record_approval(&self, screenshot: &Screenshot, event: ApprovalEvent) -> Result<Screenshot, StoreError> {
        self.store
            .record_approval(&self.tenant_id, screenshot, event)
            .await
    }

    pub async fn approval_events(&self, screenshot_id: ScreenshotId) -> Result<Vec<ApprovalEvent>, StoreError> {
        self.store
            .list_approval_events(&self.tenant_id, screenshot_id)
            .await
    }

    /// Informational quota snapshot. Submission paths use
    /// [`TenantScope::increment_capture_usage`] instead of branching on this.
    pub async fn check_quota(&self) -> Result<QuotaStatus, StoreError> {
        let tenant = self.require_tenant().await?;
        let period = usage_period(Utc::now());
        let usage = Usage {
            projects: self.store.count_projects(&self.tenant_id).await?,
            captures_this_period: self.store.capture_usage(&self.tenant_id, &period).await?,
            period,
        };
        Ok(QuotaStatus::evaluate(tenant.plan.limits(), usage))
    }

    /// Atomically consume one capture from this month's allowance, failing
    /// with `StoreError::Quota` (and consuming nothing) at the limit.
    pub async fn increment_capture_usage(&self) -> Result<UsageReservation, StoreError> {
        let tenant = self.require_tenant().await?;
        let period = usage_period(Utc::now());
        let used = self
            .store
            .try_increment_capture_usage(&self.tenant_id, &period, tenant.plan.limits().monthly_captures)
            .await?;
        debug!(tenant_id = %self.tenant_id, period = %period, used, "capture usage incremented");
        Ok(UsageReservation { period, used })
    }

    /// Give back a reservation whose submission did not create new work.
    pub async fn release_capture_usage(&self, reservation: &UsageReservation) -> Result<(), StoreError> {
        self.store
            .release_capture_usage(&self.tenant_id, &reservation.period)
            .await
    }

    async fn require_tenant(&self) -> Result<Tenant, StoreError> {
        self.store
            .get_tenant(&self.tenant_id)
            .await?
            .ok_or_else(|| TenantContextError::UnknownTenant(self.tenant_id.clone()).into())
    }
}

/// User payload carried by identity-provider events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityUser {
    pub tenant_id: TenantId,
    pub external_id: String,
    pub email: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Organisation name, used when the tenant is provisioned on first sight.
    #[serde(default)]
    pub org_name: Option<String>,
}

/// Identity-provider webhook event (signature verification happens upstream).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum IdentityEvent {
    #[serde(rename = "user.created")]
    UserCreated(IdentityUser),
    #[serde(rename = "user.updated")]
    UserUpdated(IdentityUser),
    #[serde(rename = "user.deleted")]
    UserDeleted {
        tenant_id: TenantId,
        external_id: String,
    },
}

impl IdentityEvent {
    pub fn tenant_id(&self) -> &TenantId {
        match self {
            IdentityEvent::UserCreated(user) | IdentityEvent::UserUpdated(user) => &user.tenant_id,
            IdentityEvent::UserDeleted { tenant_id, .. } => tenant_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityOutcome {
    Upserted(User),
    Deleted { removed: bool },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenancy::InMemoryTenantStore;
    use pagewatch_core::{QuotaExceeded, QuotaResource};

    fn context() -> TenantContext {
        TenantContext::new(Arc::new(InMemoryTenantStore::new()))
    }

    async fn provision(ctx: &TenantContext, tenant: &str) {
        ctx.with_tenant(tenant, |scope| async move {
            scope.ensure_tenant("Org").await.map(|_| ())
        })
        .await
        .unwrap();
    }

    fn site() -> NewProject {
        NewProject {
            name: "Site".to_string(),
            base_url: None,
            diff_threshold: None,
        }
    }

    #[tokio::test]
    async fn empty_tenant_fails_before_the_operation_runs() {
        let ctx = context();
        let mut ran = false;
        let result: Result<(), StoreError> = ctx
            .with_tenant("  ", |_scope| {
                ran = true;
                async { Ok(()) }
            })
            .await;

        assert!(matches!(
            result,
            Err(StoreError::TenantIsolation(TenantContextError::MissingTenant))
        ));
        assert!(!ran);
    }

    #[tokio::test]
    async fn projects_with_the_same_name_stay_in_their_tenant() {
        let ctx = context();
        provision(&ctx, "org_a").await;
        provision(&ctx, "org_b").await;

        let a = ctx
            .with_tenant("org_a", |scope| async move { scope.create_project(site()).await })
            .await
            .unwrap();
        ctx.with_tenant("org_b", |scope| async move { scope.create_project(site()).await })
            .await
            .unwrap();

        let listed = ctx
            .with_tenant("org_a", |scope| async move { scope.projects().await })
            .await
            .unwrap();
        assert_eq!(listed, vec![a.clone()]);

        let foreign = ctx
            .with_tenant("org_b", |scope| async move { scope.project(a.id).await })
            .await
            .unwrap();
        assert_eq!(foreign, None);
    }

    #[tokio::test]
    async fn concurrent_scopes_do_not_share_a_boundary() {
        let ctx = context();
        provision(&ctx, "org_a").await;
        provision(&ctx, "org_b").await;

        let mut handles = Vec::new();
        for i in 0..20 {
            let ctx = ctx.clone();
            let tenant = if i % 2 == 0 { "org_a" } else { "org_b" };
            handles.push(tokio::spawn(async move {
                ctx.with_tenant(tenant, |scope| async move {
                    tokio::task::yield_now().await;
                    Ok::<_, StoreError>(scope.tenant_id().as_str().to_string())
                })
                .await
                .map(|seen| (tenant, seen))
            }));
        }
        for handle in handles {
            let (expected, seen) = handle.await.unwrap().unwrap();
            assert_eq!(expected, seen);
        }
    }

    #[tokio::test]
    async fn unknown_tenant_fails_closed_for_quota() {
        let ctx = context();
        let result = ctx
            .with_tenant("org_ghost", |scope| async move { scope.check_quota().await })
            .await;
        assert!(matches!(
            result,
            Err(StoreError::TenantIsolation(TenantContextError::UnknownTenant(_)))
        ));
    }

    #[tokio::test]
    async fn project_limit_follows_the_plan() {
        let ctx = context();
        provision(&ctx, "org_a").await;

        let result = ctx
            .with_tenant("org_a", |scope| async move {
                for _ in 0..3 {
                    scope.create_project(site()).await?;
                }
                let quota = scope.check_quota().await?;
                assert!(!quota.can_create_project);
                scope.create_project(site()).await
            })
            .await;

        match result {
            Err(StoreError::Quota(QuotaExceeded { resource, used, limit, .. })) => {
                assert_eq!(resource, QuotaResource::Projects);
                assert_eq!((used, limit), (3, 3));
            }
            other => panic!("expected project quota error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn released_reservation_returns_the_unit() {
        let ctx = context();
        provision(&ctx, "org_a").await;

        let used = ctx
            .with_tenant("org_a", |scope| async move {
                let first = scope.increment_capture_usage().await?;
                let second = scope.increment_capture_usage().await?;
                assert_eq!(second.used, 2);
                scope.release_capture_usage(&first).await?;
                Ok::<_, StoreError>(scope.check_quota().await?.usage.captures_this_period)
            })
            .await
            .unwrap();
        assert_eq!(used, 1);
    }

    #[tokio::test]
    async fn identity_events_upsert_and_delete_users() {
        let ctx = context();
        let created: IdentityEvent = serde_json::from_value(serde_json::json!({
            "type": "user.created",
            "data": {
                "tenant_id": "org_a",
                "external_id": "user_1",
                "email": "a@example.com",
                "org_name": "Acme"
            }
        }))
        .unwrap();
        ctx.apply_identity_event(created).await.unwrap();

        let updated = IdentityEvent::UserUpdated(IdentityUser {
            tenant_id: TenantId::parse("org_a").unwrap(),
            external_id: "user_1".to_string(),
            email: "b@example.com".to_string(),
            display_name: Some("B".to_string()),
            org_name: None,
        });
        let outcome = ctx.apply_identity_event(updated).await.unwrap();
        let IdentityOutcome::Upserted(user) = outcome else {
            panic!("expected upsert");
        };
        assert_eq!(user.email, "b@example.com");

        let tenant = ctx
            .with_tenant("org_a", |scope| async move { scope.tenant().await })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tenant.name, "Acme");

        let deleted = IdentityEvent::UserDeleted {
            tenant_id: TenantId::parse("org_a").unwrap(),
            external_id: "user_1".to_string(),
        };
        assert_eq!(
            ctx.apply_identity_event(deleted.clone()).await.unwrap(),
            IdentityOutcome::Deleted { removed: true }
        );
        assert_eq!(
            ctx.apply_identity_event(deleted).await.unwrap(),
            IdentityOutcome::Deleted { removed: false }
        );
    }
}
