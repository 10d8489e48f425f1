use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::error::DomainError;
use crate::id::{ProjectId, TenantId};

/// A group of tracked pages owned by one tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub tenant_id: TenantId,
    pub name: String,
    pub base_url: Option<String>,
    /// Percentage threshold for significant diffs; falls back to the system default.
    pub diff_threshold: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// Input for creating a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewProject {
    pub name: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub diff_threshold: Option<f64>,
}

impl NewProject {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.name.trim().is_empty() {
            return Err(DomainError::validation("project name cannot be empty"));
        }
        if let Some(threshold) = self.diff_threshold {
            if !(0.0..=100.0).contains(&threshold) {
                return Err(DomainError::validation(
                    "diff_threshold must be a percentage between 0 and 100",
                ));
            }
        }
        Ok(())
    }

    pub fn into_project(self, tenant_id: TenantId, now: DateTime<Utc>) -> Project {
        Project {
            id: ProjectId::new(),
            tenant_id,
            name: self.name.trim().to_string(),
            base_url: self.base_url,
            diff_threshold: self.diff_threshold,
            created_at: now,
        }
    }
}

impl Entity for Project {
    type Id = ProjectId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_blank_name_and_out_of_range_threshold() {
        let blank = NewProject {
            name: "  ".to_string(),
            base_url: None,
            diff_threshold: None,
        };
        assert!(matches!(blank.validate(), Err(DomainError::Validation(_))));

        let bad_threshold = NewProject {
            name: "Site".to_string(),
            base_url: None,
            diff_threshold: Some(150.0),
        };
        assert!(matches!(bad_threshold.validate(), Err(DomainError::Validation(_))));
    }
}
