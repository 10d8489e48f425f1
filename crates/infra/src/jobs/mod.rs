//! Job orchestration over three typed lanes: capture, diff, notify.
//!
//! ## Design
//!
//! - Payloads are validated once at submission into a tagged union
//! - Job identity doubles as the deduplication key
//! - Bounded retries with backoff; exhausted jobs stay in `failed`
//! - Recurring captures are registered per screenshot
//!
//! ## Components
//!
//! - `JobOrchestrator`: submission, inspection and admin controls
//! - `QueueBackend`: lane storage (`InMemoryQueue`, `PostgresJobStore`)
//! - `ScheduleStore`: cron registrations keyed by screenshot
//!   (`ScheduleRegistry`, `PostgresJobStore`)

pub mod orchestrator;
pub mod payload;
pub mod postgres;
pub mod schedule;
pub mod store;
pub mod types;

pub use orchestrator::{
    ADHOC_ID_ATTEMPTS, JobOrchestrator, JobSummary, LaneSample, LaneStatus, OrchestratorConfig, OrchestratorError,
    SubmitMode, Submission,
};
pub use payload::{
    CapturePayload, CaptureRequest, DiffPayload, DiffRequest, JobPayload, NotifyPayload,
    NotifyRequest, NotifyType,
};
pub use postgres::PostgresJobStore;
pub use schedule::{DueCapture, RecurringCapture, ScheduleRegistry, ScheduleStore, parse_cron};
pub use store::{
    CancelOutcome, Eligibility, EnqueueMode, InMemoryQueue, LaneCounts, QueueBackend, QueueError, SubmitOutcome,
};
pub use types::{
    AttemptOutcome, BackoffStrategy, Job, JobAttemptRecord, JobId, JobResult, JobState, Lane,
    RetryPolicy,
};
