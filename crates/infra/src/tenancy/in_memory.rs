//! In-memory tenant store for tests/dev.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use pagewatch_core::model::{
    ApprovalEvent, Diff, Project, Screenshot, Tenant, User, UserProfile,
};
use pagewatch_core::{
    Entity, ProjectId, QuotaExceeded, QuotaResource, ScreenshotId, TenantId,
};

use super::store::{StoreError, TenantStore, ensure_owned};

/// Rows of one entity type, keyed by `(tenant, id)`.
#[derive(Debug)]
struct TenantTable<E: Entity> {
    rows: HashMap<(TenantId, E::Id), E>,
}

impl<E: Entity> Default for TenantTable<E> {
    fn default() -> Self {
        Self {
            rows: HashMap::new(),
        }
    }
}

impl<E: Entity + Clone> TenantTable<E> {
    fn get(&self, tenant_id: &TenantId, id: &E::Id) -> Option<&E> {
        self.rows.get(&(tenant_id.clone(), id.clone()))
    }

    fn put(&mut self, row: E) {
        self.rows.insert((row.tenant_id().clone(), row.id().clone()), row);
    }

    fn remove(&mut self, tenant_id: &TenantId, id: &E::Id) -> Option<E> {
        self.rows.remove(&(tenant_id.clone(), id.clone()))
    }

    fn list<'a>(&'a self, tenant_id: &'a TenantId) -> impl Iterator<Item = &'a E> + 'a {
        self.rows
            .iter()
            .filter_map(move |((t, _), row)| (t == tenant_id).then_some(row))
    }
}

#[derive(Debug, Default)]
struct Inner {
    tenants: HashMap<TenantId, Tenant>,
    users: TenantTable<User>,
    projects: TenantTable<Project>,
    screenshots: TenantTable<Screenshot>,
    diffs: TenantTable<Diff>,
    approvals: TenantTable<ApprovalEvent>,
    usage: HashMap<(TenantId, String), u64>,
}

/// In-memory tenant store.
///
/// A single lock guards all tables, so multi-row writes such as
/// [`TenantStore::record_approval`] are atomic.
#[derive(Debug, Default)]
pub struct InMemoryTenantStore {
    inner: RwLock<Inner>,
}

impl InMemoryTenantStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, StoreError> {
        self.inner
            .read()
            .map_err(|_| StoreError::Backend("tenant store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, StoreError> {
        self.inner
            .write()
            .map_err(|_| StoreError::Backend("tenant store lock poisoned".to_string()))
    }
}

fn check_version(stored: &Screenshot, incoming: &Screenshot) -> Result<(), StoreError> {
    if stored.version != incoming.version {
        return Err(StoreError::Conflict(format!(
            "screenshot {} is at version {}, write was based on {}",
            stored.id, stored.version, incoming.version
        )));
    }
    Ok(())
}

#[async_trait]
impl TenantStore for InMemoryTenantStore {
    async fn upsert_tenant(&self, tenant: Tenant) -> Result<Tenant, StoreError> {
        let mut inner = self.write()?;
        let row = inner
            .tenants
            .entry(tenant.id.clone())
            .and_modify(|existing| {
                existing.name = tenant.name.clone();
                existing.plan = tenant.plan;
            })
            .or_insert(tenant);
        Ok(row.clone())
    }

    async fn get_tenant(&self, tenant_id: &TenantId) -> Result<Option<Tenant>, StoreError> {
        Ok(self.read()?.tenants.get(tenant_id).cloned())
    }

    async fn upsert_user(
        &self,
        tenant_id: &TenantId,
        external_id: &str,
        profile: UserProfile,
        now: DateTime<Utc>,
    ) -> Result<User, StoreError> {
        let mut inner = self.write()?;
        let key = external_id.to_string();
        let user = match inner.users.get(tenant_id, &key).cloned() {
            Some(mut existing) => {
                existing.apply_profile(profile, now);
                existing
            }
            None => User::new(tenant_id.clone(), key, profile, now),
        };
        inner.users.put(user.clone());
        Ok(user)
    }

    async fn delete_user(&self, tenant_id: &TenantId, external_id: &str) -> Result<bool, StoreError> {
        let mut inner = self.write()?;
        Ok(inner.users.remove(tenant_id, &external_id.to_string()).is_some())
    }

    async fn get_user(&self, tenant_id: &TenantId, external_id: &str) -> Result<Option<User>, StoreError> {
        Ok(self
            .read()?
            .users
            .get(tenant_id, &external_id.to_string())
            .cloned())
    }

    async fn insert_project(
        &self,
        tenant_id: &TenantId,
        project: Project,
        max_projects: Option<u64>,
    ) -> Result<Project, StoreError> {
        ensure_owned(tenant_id, &project.tenant_id)?;
        let mut inner = self.write()?;
        let used = inner.projects.list(tenant_id).count() as u64;
        if let Some(limit) = max_projects {
            if used >= limit {
                return Err(StoreError::Quota(QuotaExceeded {
                    tenant_id: tenant_id.clone(),
                    resource: QuotaResource::Projects,
                    used,
                    limit,
                }));
            }
        }
        inner.projects.put(project.clone());
        Ok(project)
    }

    async fn get_project(&self, tenant_id: &TenantId, id: ProjectId) -> Result<Option<Project>, StoreError> {
        Ok(self.read()?.projects.get(tenant_id, &id).cloned())
    }

    async fn list_projects(&self, tenant_id: &TenantId) -> Result<Vec<Project>, StoreError> {
        let inner = self.read()?;
        let mut projects: Vec<_> = inner.projects.list(tenant_id).cloned().collect();
        projects.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(projects)
    }

    async fn count_projects(&self, tenant_id: &TenantId) -> Result<u64, StoreError> {
        Ok(self.read()?.projects.list(tenant_id).count() as u64)
    }

    async fn insert_screenshot(&self, tenant_id: &TenantId, screenshot: Screenshot) -> Result<Screenshot, StoreError> {
        ensure_owned(tenant_id, &screenshot.tenant_id)?;
        let mut inner = self.write()?;
        if inner.projects.get(tenant_id, &screenshot.project_id).is_none() {
            return Err(StoreError::NotFound);
        }
        inner.screenshots.put(screenshot.clone());
        Ok(screenshot)
    }

    async fn get_screenshot(&self, tenant_id: &TenantId, id: ScreenshotId) -> Result<Option<Screenshot>, StoreError> {
        Ok(self.read()?.screenshots.get(tenant_id, &id).cloned())
    }

    async fn list_screenshots(&self, tenant_id: &TenantId, project_id: ProjectId) -> Result<Vec<Screenshot>, StoreError> {
        let inner = self.read()?;
        let mut rows: Vec<_> = inner
            .screenshots
            .list(tenant_id)
            .filter(|s| s.project_id == project_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn update_screenshot(&self, tenant_id: &TenantId, screenshot: &Screenshot) -> Result<Screenshot, StoreError> {
        ensure_owned(tenant_id, &screenshot.tenant_id)?;
        let mut inner = self.write()?;
        let stored = inner
            .screenshots
            .get(tenant_id, &screenshot.id)
            .ok_or(StoreError::NotFound)?;
        check_version(stored, screenshot)?;

        let mut next = screenshot.clone();
        next.version += 1;
        inner.screenshots.put(next.clone());
        Ok(next)
    }

    async fn insert_diff(&self, tenant_id: &TenantId, diff: Diff) -> Result<Diff, StoreError> {
        ensure_owned(tenant_id, &diff.tenant_id)?;
        let mut inner = self.write()?;
        if inner.screenshots.get(tenant_id, &diff.screenshot_id).is_none() {
            return Err(StoreError::NotFound);
        }
        let existing = inner
            .diffs
            .list(tenant_id)
            .find(|d| {
                d.screenshot_id == diff.screenshot_id
                    && d.same_comparison(&diff.previous_image_ref, &diff.current_image_ref)
            })
            .cloned();
        if let Some(existing) = existing {
            return Ok(existing);
        }
        inner.diffs.put(diff.clone());
        Ok(diff)
    }

    async fn latest_diff(&self, tenant_id: &TenantId, screenshot_id: ScreenshotId) -> Result<Option<Diff>, StoreError> {
        let inner = self.read()?;
        Ok(inner
            .diffs
            .list(tenant_id)
            .filter(|d| d.screenshot_id == screenshot_id)
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
            .cloned())
    }

    async fn record_approval(
        &self,
        tenant_id: &TenantId,
        screenshot: &Screenshot,
        event: ApprovalEvent,
    ) -> Result<Screenshot, StoreError> {
        ensure_owned(tenant_id, &screenshot.tenant_id)?;
        ensure_owned(tenant_id, &event.tenant_id)?;
        let mut inner = self.write()?;
        let stored = inner
            .screenshots
            .get(tenant_id, &screenshot.id)
            .ok_or(StoreError::NotFound)?;
        check_version(stored, screenshot)?;

        let mut next = screenshot.clone();
        next.version += 1;
        // Both writes happen under the same guard.
        inner.screenshots.put(next.clone());
        inner.approvals.put(event);
        Ok(next)
    }

    async fn list_approval_events(
        &self,
        tenant_id: &TenantId,
        screenshot_id: ScreenshotId,
    ) -> Result<Vec<ApprovalEvent>, StoreError> {
        let inner = self.read()?;
        let mut events: Vec<_> = inner
            .approvals
            .list(tenant_id)
            .filter(|e| e.screenshot_id == screenshot_id)
            .cloned()
            .collect();
        events.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(events)
    }

    async fn capture_usage(&self, tenant_id: &TenantId, period: &str) -> Result<u64, StoreError> {
        let inner = self.read()?;
        Ok(inner
            .usage
            .get(&(tenant_id.clone(), period.to_string()))
            .copied()
            .unwrap_or(0))
    }

    async fn try_increment_capture_usage(
        &self,
        tenant_id: &TenantId,
        period: &str,
        limit: Option<u64>,
    ) -> Result<u64, StoreError> {
        let mut inner = self.write()?;
        let counter = inner
            .usage
            .entry((tenant_id.clone(), period.to_string()))
            .or_insert(0);
        if let Some(limit) = limit {
            if *counter >= limit {
                return Err(StoreError::Quota(QuotaExceeded {
                    tenant_id: tenant_id.clone(),
                    resource: QuotaResource::MonthlyCaptures,
                    used: *counter,
                    limit,
                }));
            }
        }
        *counter += 1;
        Ok(*counter)
    }

    async fn release_capture_usage(&self, tenant_id: &TenantId, period: &str) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        if let Some(counter) = inner.usage.get_mut(&(tenant_id.clone(), period.to_string())) {
            *counter = counter.saturating_sub(1);
        }
        Ok(())
    }
}
