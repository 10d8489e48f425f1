//! Infrastructure layer: tenant-scoped storage, job lanes, the capture
//! lifecycle, background workers and external collaborators.

pub mod collaborators;
pub mod jobs;
pub mod lifecycle;
pub mod notify;
pub mod tenancy;
pub mod workers;
