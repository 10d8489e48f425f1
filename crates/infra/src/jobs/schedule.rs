//! Recurring capture registrations, keyed directly by screenshot.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use pagewatch_core::{DomainError, ScreenshotId, TenantId};

use super::payload::CapturePayload;
use super::store::QueueError;

/// One recurring capture.
#[derive(Debug, Clone, Serialize)]
pub struct RecurringCapture {
    pub tenant_id: TenantId,
    pub screenshot_id: ScreenshotId,
    /// Expression as registered (5, 6 or 7 fields).
    pub expression: String,
    pub payload: CapturePayload,
    pub next_run: DateTime<Utc>,
    #[serde(skip)]
    schedule: cron::Schedule,
}

impl RecurringCapture {
    /// Parse `expression` and compute the first fire time after `now`.
    pub fn new(
        tenant_id: TenantId,
        expression: &str,
        payload: CapturePayload,
        now: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        let schedule = parse_cron(expression)?;
        let next_run = schedule
            .after(&now)
            .next()
            .ok_or_else(|| DomainError::validation("cron expression never fires"))?;
        Ok(Self {
            tenant_id,
            screenshot_id: payload.screenshot_id,
            expression: expression.trim().to_string(),
            payload,
            next_run,
            schedule,
        })
    }

    /// Rebuild a stored registration without recomputing `next_run`.
    pub fn restore(
        tenant_id: TenantId,
        expression: String,
        payload: CapturePayload,
        next_run: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        let schedule = parse_cron(&expression)?;
        Ok(Self {
            tenant_id,
            screenshot_id: payload.screenshot_id,
            expression,
            payload,
            next_run,
            schedule,
        })
    }

    /// First fire time strictly after `now`; `None` once the expression is exhausted.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&now).next()
    }

    fn due(&self) -> DueCapture {
        DueCapture {
            tenant_id: self.tenant_id.clone(),
            screenshot_id: self.screenshot_id,
            payload: self.payload.clone(),
        }
    }
}

/// A registration that came due.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueCapture {
    pub tenant_id: TenantId,
    pub screenshot_id: ScreenshotId,
    pub payload: CapturePayload,
}

/// Parse a cron expression. Five-field (minute-first) expressions get a
/// leading seconds field of `0`.
pub fn parse_cron(expression: &str) -> Result<cron::Schedule, DomainError> {
    let trimmed = expression.trim();
    let normalized = match trimmed.split_whitespace().count() {
        5 => format!("0 {trimmed}"),
        6 | 7 => trimmed.to_string(),
        n => {
            return Err(DomainError::validation(format!(
                "cron expression must have 5, 6 or 7 fields, got {n}"
            )));
        }
    };
    cron::Schedule::from_str(&normalized)
        .map_err(|e| DomainError::validation(format!("invalid cron expression {expression:?}: {e}")))
}

/// Where recurring registrations live. One entry per screenshot.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Insert or replace the entry for `entry.screenshot_id`. A screenshot
    /// registered under another tenant is a `Conflict`, never taken over.
    async fn register(&self, entry: RecurringCapture) -> Result<RecurringCapture, QueueError>;

    /// Remove the entry if it belongs to `tenant_id`. Returns whether one was removed.
    async fn remove(&self, tenant_id: &TenantId, screenshot_id: ScreenshotId) -> Result<bool, QueueError>;

    /// Collect registrations due at `now` and advance each to its next fire
    /// time after `now`. Missed fires collapse into one; exhausted entries are dropped.
    async fn take_due(&self, now: DateTime<Utc>) -> Result<Vec<DueCapture>, QueueError>;

    async fn list(&self, tenant_id: &TenantId) -> Result<Vec<RecurringCapture>, QueueError>;

    async fn get(&self, screenshot_id: ScreenshotId) -> Result<Option<RecurringCapture>, QueueError>;
}

/// Process-local registrations for tests/dev.
#[derive(Debug, Default)]
pub struct ScheduleRegistry {
    entries: RwLock<HashMap<ScreenshotId, RecurringCapture>>,
}

impl ScheduleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<ScreenshotId, RecurringCapture>>, QueueError> {
        self.entries
            .read()
            .map_err(|_| QueueError::Backend("schedule lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<ScreenshotId, RecurringCapture>>, QueueError> {
        self.entries
            .write()
            .map_err(|_| QueueError::Backend("schedule lock poisoned".to_string()))
    }
}

#[async_trait]
impl ScheduleStore for ScheduleRegistry {
    async fn register(&self, entry: RecurringCapture) -> Result<RecurringCapture, QueueError> {
        let mut entries = self.write()?;
        if let Some(existing) = entries.get(&entry.screenshot_id) {
            if existing.tenant_id != entry.tenant_id {
                return Err(QueueError::Conflict("screenshot is scheduled by another tenant".to_string()));
            }
        }
        entries.insert(entry.screenshot_id, entry.clone());
        Ok(entry)
    }

    async fn remove(&self, tenant_id: &TenantId, screenshot_id: ScreenshotId) -> Result<bool, QueueError> {
        let mut entries = self.write()?;
        match entries.get(&screenshot_id) {
            Some(existing) if &existing.tenant_id == tenant_id => {
                entries.remove(&screenshot_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn take_due(&self, now: DateTime<Utc>) -> Result<Vec<DueCapture>, QueueError> {
        let mut entries = self.write()?;
        let mut due = Vec::new();
        let mut exhausted = Vec::new();

        for entry in entries.values_mut() {
            if entry.next_run > now {
                continue;
            }
            due.push(entry.due());
            match entry.next_after(now) {
                Some(next) => entry.next_run = next,
                None => exhausted.push(entry.screenshot_id),
            }
        }
        for id in exhausted {
            entries.remove(&id);
        }

        due.sort_by_key(|d| d.screenshot_id);
        Ok(due)
    }

    async fn list(&self, tenant_id: &TenantId) -> Result<Vec<RecurringCapture>, QueueError> {
        let entries = self.read()?;
        let mut list: Vec<_> = entries
            .values()
            .filter(|e| &e.tenant_id == tenant_id)
            .cloned()
            .collect();
        list.sort_by_key(|e| e.screenshot_id);
        Ok(list)
    }

    async fn get(&self, screenshot_id: ScreenshotId) -> Result<Option<RecurringCapture>, QueueError> {
        Ok(self.read()?.get(&screenshot_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::payload::CaptureRequest;
    use chrono::TimeZone;
    use pagewatch_core::ProjectId;

    fn payload(screenshot_id: ScreenshotId) -> CapturePayload {
        CaptureRequest {
            project_id: ProjectId::new().to_string(),
            screenshot_id: screenshot_id.to_string(),
            url: "https://example.com".to_string(),
            selector: None,
            viewport: None,
        }
        .validate()
        .unwrap()
    }

    fn tenant() -> TenantId {
        TenantId::parse("org_a").unwrap()
    }

    fn entry(tenant_id: TenantId, expression: &str, sid: ScreenshotId, now: DateTime<Utc>) -> RecurringCapture {
        RecurringCapture::new(tenant_id, expression, payload(sid), now).unwrap()
    }

    #[test]
    fn accepts_five_and_six_field_expressions() {
        assert!(parse_cron("*/15 * * * *").is_ok());
        assert!(parse_cron("0 0 9 * * Mon-Fri").is_ok());
        assert!(parse_cron("* * *").is_err());
        assert!(parse_cron("61 * * * *").is_err());
    }

    #[tokio::test]
    async fn re_registering_replaces_the_entry() {
        let registry = ScheduleRegistry::new();
        let sid = ScreenshotId::new();
        let now = Utc.with_ymd_and_hms(2026, 10, 18, 8, 0, 0).unwrap();

        registry.register(entry(tenant(), "0 * * * *", sid, now)).await.unwrap();
        registry.register(entry(tenant(), "30 * * * *", sid, now)).await.unwrap();

        let list = registry.list(&tenant()).await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].expression, "30 * * * *");
        assert_eq!(list[0].next_run, Utc.with_ymd_and_hms(2026, 10, 18, 8, 30, 0).unwrap());
    }

    #[tokio::test]
    async fn due_entries_fire_once_and_advance() {
        let registry = ScheduleRegistry::new();
        let sid = ScreenshotId::new();
        let now = Utc.with_ymd_and_hms(2026, 10, 18, 8, 0, 0).unwrap();
        registry.register(entry(tenant(), "0 * * * *", sid, now)).await.unwrap();

        assert!(registry.take_due(now).await.unwrap().is_empty());

        let at_nine = Utc.with_ymd_and_hms(2026, 10, 18, 9, 0, 0).unwrap();
        let due = registry.take_due(at_nine).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].screenshot_id, sid);
        assert!(registry.take_due(at_nine).await.unwrap().is_empty());
        assert_eq!(
            registry.get(sid).await.unwrap().unwrap().next_run,
            Utc.with_ymd_and_hms(2026, 10, 18, 10, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn other_tenants_cannot_touch_a_schedule() {
        let registry = ScheduleRegistry::new();
        let sid = ScreenshotId::new();
        let now = Utc::now();
        registry.register(entry(tenant(), "0 * * * *", sid, now)).await.unwrap();

        let other = TenantId::parse("org_b").unwrap();
        assert!(!registry.remove(&other, sid).await.unwrap());
        assert!(matches!(
            registry.register(entry(other, "0 * * * *", sid, now)).await,
            Err(QueueError::Conflict(_))
        ));
        assert!(registry.remove(&tenant(), sid).await.unwrap());
    }

    #[tokio::test]
    async fn poisoned_registry_reports_a_backend_error() {
        let registry = std::sync::Arc::new(ScheduleRegistry::new());
        let poisoner = std::sync::Arc::clone(&registry);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.entries.write().unwrap();
            panic!("writer died holding the lock");
        })
        .join();

        let err = registry
            .register(entry(tenant(), "0 * * * *", ScreenshotId::new(), Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Backend(_)), "{err:?}");
        assert!(matches!(registry.list(&tenant()).await, Err(QueueError::Backend(_))));
    }

    #[test]
    fn restored_entry_keeps_its_fire_time() {
        let now = Utc.with_ymd_and_hms(2026, 10, 18, 8, 0, 0).unwrap();
        let next_run = Utc.with_ymd_and_hms(2026, 10, 18, 7, 0, 0).unwrap();
        let restored = RecurringCapture::restore(tenant(), "0 * * * *".to_string(), payload(ScreenshotId::new()), next_run)
            .unwrap();
        assert_eq!(restored.next_run, next_run);
        assert_eq!(restored.next_after(now), Some(Utc.with_ymd_and_hms(2026, 10, 18, 9, 0, 0).unwrap()));
        assert!(RecurringCapture::restore(tenant(), "nope".to_string(), payload(ScreenshotId::new()), next_run).is_err());
    }
}
