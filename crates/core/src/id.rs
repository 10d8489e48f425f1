//! Strongly-typed identifiers used across the domain.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DomainError, TenantContextError};

/// Identifier of a tenant (multi-tenant boundary).
///
/// Tenants are provisioned by the identity provider, so the identifier is the
/// provider's organisation id rather than a locally generated UUID. It is
/// never empty: [`TenantId::parse`] is the only way to build one from
/// untrusted input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Parse a tenant identifier, failing closed on empty/blank input.
    pub fn parse(raw: impl AsRef<str>) -> Result<Self, TenantContextError> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            return Err(TenantContextError::MissingTenant);
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for TenantId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TenantId {
    type Err = TenantContextError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl<'de> Deserialize<'de> for TenantId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::parse(raw).map_err(serde::de::Error::custom)
    }
}

/// Identifier of a project (tenant-owned).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(Uuid);

/// Identifier of a tracked screenshot (project-owned).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScreenshotId(Uuid);

/// Identifier of a persisted diff row.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiffId(Uuid);

/// Identifier of an approval audit entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApprovalEventId(Uuid);

macro_rules! impl_uuid_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Create a new identifier.
            ///
            /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
            /// for determinism.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$t> for Uuid {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::from_str(s)
                    .map_err(|e| DomainError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(uuid))
            }
        }
    };
}

impl_uuid_newtype!(ProjectId, "ProjectId");
impl_uuid_newtype!(ScreenshotId, "ScreenshotId");
impl_uuid_newtype!(DiffId, "DiffId");
impl_uuid_newtype!(ApprovalEventId, "ApprovalEventId");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_id_rejects_blank_input() {
        assert_eq!(TenantId::parse(""), Err(TenantContextError::MissingTenant));
        assert_eq!(TenantId::parse("   "), Err(TenantContextError::MissingTenant));
        assert_eq!(TenantId::parse(" org_1 ").unwrap().as_str(), "org_1");
    }

    #[test]
    fn tenant_id_deserialization_fails_closed() {
        let err = serde_json::from_str::<TenantId>("\"\"");
        assert!(err.is_err());

        let ok: TenantId = serde_json::from_str("\"org_acme\"").unwrap();
        assert_eq!(ok.to_string(), "org_acme");
    }

    #[test]
    fn uuid_ids_round_trip_through_display() {
        let id = ScreenshotId::new();
        let parsed: ScreenshotId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);

        assert!(matches!(
            "not-a-uuid".parse::<ProjectId>(),
            Err(DomainError::InvalidId(_))
        ));
    }
}
