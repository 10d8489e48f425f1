//! Persisted data model: tenants, projects, screenshots, diffs and the
//! append-only approval audit trail.

pub mod approval;
pub mod diff;
pub mod project;
pub mod screenshot;
pub mod tenant;

pub use approval::{ApprovalAction, ApprovalEvent};
pub use diff::{Diff, DiffMetrics};
pub use project::{NewProject, Project};
pub use screenshot::{ApprovalStatus, CaptureStatus, NewScreenshot, Screenshot, Viewport};
pub use tenant::{Plan, PlanLimits, QuotaStatus, Tenant, Usage, User, UserProfile, usage_period};
