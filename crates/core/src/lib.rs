//! `pagewatch-core`: domain building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the error taxonomy, the persisted data model with its state
//! machines, and the diff significance decision.

pub mod entity;
pub mod error;
pub mod id;
pub mod model;
pub mod significance;

pub use entity::Entity;
pub use error::{DomainError, DomainResult, QuotaExceeded, QuotaResource, TenantContextError};
pub use id::{ApprovalEventId, DiffId, ProjectId, ScreenshotId, TenantId};
