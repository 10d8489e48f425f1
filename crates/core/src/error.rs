//! Domain error model.

use thiserror::Error;

use crate::id::TenantId;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures (validation,
/// state transitions, conflicts). Infrastructure concerns belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed submission payload).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A state machine was asked to make a transition it does not allow.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested resource was not found (domain-level).
    #[error("not found")]
    NotFound,

    /// A conflict occurred (e.g. duplicate natural key).
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_transition(msg: impl Into<String>) -> Self {
        Self::InvalidTransition(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }
}

/// Missing or invalid tenant boundary.
///
/// Always fails closed: there is no unscoped fallback for any data operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TenantContextError {
    #[error("no tenant boundary established (tenant id is empty)")]
    MissingTenant,

    #[error("unknown tenant: {0}")]
    UnknownTenant(TenantId),

    #[error("tenant boundary mismatch: scope is {scope}, row belongs to {row}")]
    Mismatch { scope: TenantId, row: TenantId },
}

/// Metered resource a quota applies to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaResource {
    Projects,
    MonthlyCaptures,
}

impl core::fmt::Display for QuotaResource {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            QuotaResource::Projects => f.write_str("projects"),
            QuotaResource::MonthlyCaptures => f.write_str("monthly captures"),
        }
    }
}

/// A plan limit was already reached; returned synchronously, never queued.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("quota exceeded for tenant {tenant_id}: {resource} {used}/{limit}")]
pub struct QuotaExceeded {
    pub tenant_id: TenantId,
    pub resource: QuotaResource,
    pub used: u64,
    pub limit: u64,
}
