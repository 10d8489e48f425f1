use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::id::TenantId;

/// Subscription plan of a tenant.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    #[default]
    Free,
    Pro,
    Enterprise,
}

/// Hard limits attached to a plan. `None` means unlimited.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanLimits {
    pub max_projects: Option<u64>,
    pub monthly_captures: Option<u64>,
}

impl Plan {
    pub fn limits(self) -> PlanLimits {
        match self {
            Plan::Free => PlanLimits {
                max_projects: Some(3),
                monthly_captures: Some(500),
            },
            Plan::Pro => PlanLimits {
                max_projects: Some(25),
                monthly_captures: Some(10_000),
            },
            Plan::Enterprise => PlanLimits {
                max_projects: None,
                monthly_captures: None,
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Pro => "pro",
            Plan::Enterprise => "enterprise",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "free" => Some(Plan::Free),
            "pro" => Some(Plan::Pro),
            "enterprise" => Some(Plan::Enterprise),
            _ => None,
        }
    }
}

/// An isolated customer account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub plan: Plan,
    pub created_at: DateTime<Utc>,
}

/// Profile fields mirrored from the identity provider (last write wins).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub email: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// A tenant member, keyed by the identity provider's user id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub tenant_id: TenantId,
    pub external_id: String,
    pub email: String,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(tenant_id: TenantId, external_id: String, profile: UserProfile, now: DateTime<Utc>) -> Self {
        Self {
            tenant_id,
            external_id,
            email: profile.email,
            display_name: profile.display_name,
            created_at: now,
            updated_at: now,
        }
    }

    /// Overwrite profile fields, keeping identity and creation time.
    pub fn apply_profile(&mut self, profile: UserProfile, now: DateTime<Utc>) {
        self.email = profile.email;
        self.display_name = profile.display_name;
        self.updated_at = now;
    }
}

impl Entity for User {
    type Id = String;

    fn id(&self) -> &Self::Id {
        &self.external_id
    }

    fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }
}

/// Metered usage for the current period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub projects: u64,
    pub captures_this_period: u64,
    pub period: String,
}

/// Result of a quota check.
///
/// Informational only: capture submission goes through the store's
/// conditional increment instead of branching on `can_capture`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub can_create_project: bool,
    pub can_capture: bool,
    pub usage: Usage,
    pub limits: PlanLimits,
}

impl QuotaStatus {
    pub fn evaluate(limits: PlanLimits, usage: Usage) -> Self {
        let can_create_project = limits.max_projects.is_none_or(|max| usage.projects < max);
        let can_capture = limits
            .monthly_captures
            .is_none_or(|max| usage.captures_this_period < max);
        Self {
            can_create_project,
            can_capture,
            usage,
            limits,
        }
    }
}

/// Calendar-month usage bucket (UTC), e.g. `2026-10`.
pub fn usage_period(at: DateTime<Utc>) -> String {
    format!("{:04}-{:02}", at.year(), at.month())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn period_is_calendar_month() {
        let at = Utc.with_ymd_and_hms(2026, 3, 31, 23, 59, 59).unwrap();
        assert_eq!(usage_period(at), "2026-03");
    }

    #[test]
    fn quota_flags_follow_limits() {
        let usage = Usage {
            projects: 3,
            captures_this_period: 499,
            period: "2026-10".to_string(),
        };
        let status = QuotaStatus::evaluate(Plan::Free.limits(), usage.clone());
        assert!(!status.can_create_project);
        assert!(status.can_capture);

        let unlimited = QuotaStatus::evaluate(Plan::Enterprise.limits(), usage);
        assert!(unlimited.can_create_project);
        assert!(unlimited.can_capture);
    }

    #[test]
    fn profile_update_is_last_write_wins() {
        let now = Utc::now();
        let tenant = TenantId::parse("org_1").unwrap();
        let mut user = User::new(
            tenant,
            "user_1".to_string(),
            UserProfile {
                email: "a@example.com".to_string(),
                display_name: Some("A".to_string()),
            },
            now,
        );
        user.apply_profile(
            UserProfile {
                email: "b@example.com".to_string(),
                display_name: None,
            },
            now,
        );
        assert_eq!(user.email, "b@example.com");
        assert_eq!(user.display_name, None);
        assert_eq!(user.created_at, now);
    }
}
