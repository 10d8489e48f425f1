//! Background workers: a pool of lane workers plus the recurring-capture
//! scheduler, and one handler per lane.

mod capture;
mod diff;
mod notify;
pub mod pool;

use std::fmt::Display;

use crate::jobs::JobResult;

pub use capture::CaptureHandler;
pub use diff::DiffHandler;
pub use notify::NotifyHandler;
pub use pool::{JobHandler, LaneWorker, TenantLimiter, WorkerPool, WorkerPoolConfig, WorkerPoolHandle};

fn failure(transient: bool, err: impl Display) -> JobResult {
    if transient {
        JobResult::Transient(err.to_string())
    } else {
        JobResult::Permanent(err.to_string())
    }
}
