use async_trait::async_trait;

use crate::jobs::{Job, JobPayload, JobResult};
use crate::notify::NotificationRouter;

use super::pool::JobHandler;

/// Hands notify payloads to the configured sinks. Sink failures are retried.
pub struct NotifyHandler {
    router: NotificationRouter,
}

impl NotifyHandler {
    pub fn new(router: NotificationRouter) -> Self {
        Self { router }
    }
}

#[async_trait]
impl JobHandler for NotifyHandler {
    async fn handle(&self, job: &Job) -> JobResult {
        let JobPayload::Notify(payload) = &job.payload else {
            return JobResult::Permanent(format!("notify lane received a {} payload", job.payload.lane()));
        };
        match self.router.deliver(&job.tenant_id, payload).await {
            Ok(()) => JobResult::Success,
            Err(err) => JobResult::Transient(err.to_string()),
        }
    }
}
