use std::sync::Arc;

use async_trait::async_trait;

use crate::collaborators::DiffService;
use crate::jobs::{Job, JobPayload, JobResult};
use crate::lifecycle::CaptureLifecycle;

use super::failure;
use super::pool::JobHandler;

pub struct DiffHandler {
    lifecycle: Arc<CaptureLifecycle>,
    diffs: Arc<dyn DiffService>,
}

impl DiffHandler {
    pub fn new(lifecycle: Arc<CaptureLifecycle>, diffs: Arc<dyn DiffService>) -> Self {
        Self { lifecycle, diffs }
    }
}

#[async_trait]
impl JobHandler for DiffHandler {
    async fn handle(&self, job: &Job) -> JobResult {
        let JobPayload::Diff(payload) = &job.payload else {
            return JobResult::Permanent(format!("diff lane received a {} payload", job.payload.lane()));
        };
        match self
            .lifecycle
            .evaluate_diff(&job.tenant_id, payload, self.diffs.as_ref())
            .await
        {
            Ok(_) => JobResult::Success,
            Err(err) => failure(err.is_transient(), err),
        }
    }
}
