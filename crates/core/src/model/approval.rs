use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::id::{ApprovalEventId, DiffId, ScreenshotId, TenantId};
use crate::model::screenshot::ApprovalStatus;

/// Action recorded by a reviewer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalAction {
    Approved,
    Rejected,
    /// Reset back to pending review.
    Pending,
}

impl ApprovalAction {
    pub fn target_status(self) -> ApprovalStatus {
        match self {
            ApprovalAction::Approved => ApprovalStatus::Approved,
            ApprovalAction::Rejected => ApprovalStatus::Rejected,
            ApprovalAction::Pending => ApprovalStatus::Pending,
        }
    }

    pub fn as_str(self) -> &'static str {
        self.target_status().as_str()
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "approved" => Some(ApprovalAction::Approved),
            "rejected" => Some(ApprovalAction::Rejected),
            "pending" => Some(ApprovalAction::Pending),
            _ => None,
        }
    }
}

/// Append-only audit entry. Never mutated or deleted once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalEvent {
    pub id: ApprovalEventId,
    pub tenant_id: TenantId,
    pub screenshot_id: ScreenshotId,
    /// The diff under review, if the screenshot has one.
    pub diff_id: Option<DiffId>,
    pub action: ApprovalAction,
    pub actor: String,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ApprovalEvent {
    pub fn new(
        tenant_id: TenantId,
        screenshot_id: ScreenshotId,
        diff_id: Option<DiffId>,
        action: ApprovalAction,
        actor: impl Into<String>,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ApprovalEventId::new(),
            tenant_id,
            screenshot_id,
            diff_id,
            action,
            actor: actor.into(),
            reason,
            created_at: now,
        }
    }
}

impl Entity for ApprovalEvent {
    type Id = ApprovalEventId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }
}
