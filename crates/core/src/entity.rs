//! Entity trait: identity + tenant ownership.

use crate::id::TenantId;

/// Tenant-owned entity.
///
/// Every row the system persists belongs to exactly one tenant; stores use
/// `(tenant_id, id)` as the effective key so a foreign id is indistinguishable
/// from a missing one.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;

    /// Returns the owning tenant.
    fn tenant_id(&self) -> &TenantId;
}
