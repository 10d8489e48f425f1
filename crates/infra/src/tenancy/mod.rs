//! Tenant boundary and tenant-isolated persistence.

mod context;
mod in_memory;
mod postgres;
mod store;

pub use context::{
    IdentityEvent, IdentityOutcome, IdentityUser, TenantContext, TenantScope, UsageReservation,
};
pub use in_memory::InMemoryTenantStore;
pub use postgres::{MIGRATION, PostgresTenantStore};
pub use store::{StoreError, TenantStore};
