//! Tracked screenshot and its two independent state machines.
//!
//! ## Capture status
//!
//! ```text
//! pending ──success──▶ captured
//!    │                    │
//!    └──retries exhausted─┼──▶ failed
//!                         │       │
//!   re-run (manual/bulk/scheduled) ◀┘  (any state → pending)
//! ```
//!
//! ## Approval status
//!
//! `pending ↔ approved` and `pending ↔ rejected`, only via an explicit
//! approval action. The two axes are independent: a failed capture can still
//! carry a stale `approved` flag from an earlier successful run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::entity::Entity;
use crate::error::DomainError;
use crate::id::{ProjectId, ScreenshotId, TenantId};
use crate::model::approval::ApprovalAction;

/// Capture status (`status` column).
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureStatus {
    #[default]
    Pending,
    Captured,
    Failed,
}

impl CaptureStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CaptureStatus::Pending => "pending",
            CaptureStatus::Captured => "captured",
            CaptureStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(CaptureStatus::Pending),
            "captured" => Some(CaptureStatus::Captured),
            "failed" => Some(CaptureStatus::Failed),
            _ => None,
        }
    }
}

/// Review status (`approval_status` column).
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(ApprovalStatus::Pending),
            "approved" => Some(ApprovalStatus::Approved),
            "rejected" => Some(ApprovalStatus::Rejected),
            _ => None,
        }
    }
}

/// Browser viewport used for a capture.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub const MIN_WIDTH: u32 = 320;
    pub const MAX_WIDTH: u32 = 3840;
    pub const MIN_HEIGHT: u32 = 240;
    pub const MAX_HEIGHT: u32 = 2160;

    pub fn validate(&self) -> Result<(), DomainError> {
        if !(Self::MIN_WIDTH..=Self::MAX_WIDTH).contains(&self.width) {
            return Err(DomainError::validation(format!(
                "viewport width must be between {} and {}, got {}",
                Self::MIN_WIDTH,
                Self::MAX_WIDTH,
                self.width
            )));
        }
        if !(Self::MIN_HEIGHT..=Self::MAX_HEIGHT).contains(&self.height) {
            return Err(DomainError::validation(format!(
                "viewport height must be between {} and {}, got {}",
                Self::MIN_HEIGHT,
                Self::MAX_HEIGHT,
                self.height
            )));
        }
        Ok(())
    }
}

/// A tracked page capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Screenshot {
    pub id: ScreenshotId,
    pub tenant_id: TenantId,
    pub project_id: ProjectId,
    pub name: String,
    pub url: String,
    pub selector: Option<String>,
    pub viewport: Option<Viewport>,
    pub status: CaptureStatus,
    pub approval_status: ApprovalStatus,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    /// Opaque blob-store handle of the latest successful capture.
    pub image_ref: Option<String>,
    pub last_error: Option<String>,
    pub last_captured_at: Option<DateTime<Utc>>,
    /// Job whose result the current `pending` status is waiting for.
    #[serde(default)]
    pub capture_job_id: Option<String>,
    /// Optimistic concurrency token, bumped by the store on every write.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for registering a screenshot under a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewScreenshot {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub viewport: Option<Viewport>,
}

impl NewScreenshot {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.name.trim().is_empty() {
            return Err(DomainError::validation("screenshot name cannot be empty"));
        }
        let raw = self.url.trim();
        if raw.is_empty() {
            return Err(DomainError::validation("screenshot url cannot be empty"));
        }
        let url = Url::parse(raw)
            .map_err(|e| DomainError::validation(format!("screenshot url {raw:?} is invalid: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(DomainError::validation(format!(
                "screenshot url must be an absolute http(s) URL, got {raw:?}"
            )));
        }
        if let Some(viewport) = &self.viewport {
            viewport.validate()?;
        }
        Ok(())
    }
}

impl Screenshot {
    /// New screenshots always start `pending` on both axes.
    pub fn new(
        tenant_id: TenantId,
        project_id: ProjectId,
        input: NewScreenshot,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ScreenshotId::new(),
            tenant_id,
            project_id,
            name: input.name.trim().to_string(),
            url: input.url.trim().to_string(),
            selector: input.selector,
            viewport: input.viewport,
            status: CaptureStatus::Pending,
            approval_status: ApprovalStatus::Pending,
            approved_by: None,
            approved_at: None,
            retry_count: 0,
            image_ref: None,
            last_error: None,
            last_captured_at: None,
            capture_job_id: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Re-run: any capture status goes back to `pending`, now waiting on
    /// `capture_job_id`. Results of earlier submissions no longer apply.
    pub fn mark_pending(&mut self, capture_job_id: impl Into<String>, now: DateTime<Utc>) {
        self.status = CaptureStatus::Pending;
        self.capture_job_id = Some(capture_job_id.into());
        self.updated_at = now;
    }

    /// Whether a worker result from `job_id` belongs to the latest submission.
    pub fn accepts_result(&self, job_id: &str) -> bool {
        self.status == CaptureStatus::Pending && self.capture_job_id.as_deref() == Some(job_id)
    }

    /// `pending → captured`. Returns the previous image ref (the diff baseline).
    pub fn mark_captured(
        &mut self,
        image_ref: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, DomainError> {
        self.ensure_pending("captured")?;
        let previous = self.image_ref.replace(image_ref.into());
        self.status = CaptureStatus::Captured;
        self.last_error = None;
        self.last_captured_at = Some(now);
        self.updated_at = now;
        Ok(previous)
    }

    /// `pending → failed` after the retry budget is spent.
    pub fn mark_failed(
        &mut self,
        reason: impl Into<String>,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        self.ensure_pending("failed")?;
        let reason = reason.into();
        self.status = CaptureStatus::Failed;
        self.last_error = Some(if reason.trim().is_empty() {
            "capture failed".to_string()
        } else {
            reason
        });
        self.retry_count = self.retry_count.saturating_add(attempts);
        self.updated_at = now;
        Ok(())
    }

    /// Apply an approval action to the approval axis.
    ///
    /// Allowed: pending → approved|rejected, approved|rejected → pending.
    pub fn apply_approval(
        &mut self,
        action: ApprovalAction,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        let target = action.target_status();
        let allowed = matches!(
            (self.approval_status, target),
            (ApprovalStatus::Pending, ApprovalStatus::Approved)
                | (ApprovalStatus::Pending, ApprovalStatus::Rejected)
                | (ApprovalStatus::Approved, ApprovalStatus::Pending)
                | (ApprovalStatus::Rejected, ApprovalStatus::Pending)
        );
        if !allowed {
            return Err(DomainError::invalid_transition(format!(
                "approval status {} cannot move to {}",
                self.approval_status.as_str(),
                target.as_str()
            )));
        }

        self.approval_status = target;
        match target {
            ApprovalStatus::Approved => {
                self.approved_by = Some(actor.to_string());
                self.approved_at = Some(now);
            }
            ApprovalStatus::Rejected | ApprovalStatus::Pending => {
                self.approved_by = None;
                self.approved_at = None;
            }
        }
        self.updated_at = now;
        Ok(())
    }

    fn ensure_pending(&self, target: &str) -> Result<(), DomainError> {
        if self.status != CaptureStatus::Pending {
            return Err(DomainError::invalid_transition(format!(
                "capture status {} cannot move to {target}",
                self.status.as_str()
            )));
        }
        Ok(())
    }
}

impl Entity for Screenshot {
    type Id = ScreenshotId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }
}
