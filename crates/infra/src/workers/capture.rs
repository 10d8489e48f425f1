use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error};

use crate::collaborators::{BlobStore, BrowserEngine, CaptureSpec};
use crate::jobs::{Job, JobPayload, JobResult};
use crate::lifecycle::{CaptureLifecycle, CaptureUpdate};

use super::failure;
use super::pool::JobHandler;

/// Renders the page, stores the image and records the result.
pub struct CaptureHandler {
    lifecycle: Arc<CaptureLifecycle>,
    engine: Arc<dyn BrowserEngine>,
    blobs: Arc<dyn BlobStore>,
    capture_timeout: Duration,
}

impl CaptureHandler {
    pub fn new(
        lifecycle: Arc<CaptureLifecycle>,
        engine: Arc<dyn BrowserEngine>,
        blobs: Arc<dyn BlobStore>,
        capture_timeout: Duration,
    ) -> Self {
        Self {
            lifecycle,
            engine,
            blobs,
            capture_timeout,
        }
    }
}

#[async_trait]
impl JobHandler for CaptureHandler {
    async fn handle(&self, job: &Job) -> JobResult {
        let JobPayload::Capture(payload) = &job.payload else {
            return JobResult::Permanent(format!("capture lane received a {} payload", job.payload.lane()));
        };

        let spec = CaptureSpec::from_payload(payload, self.capture_timeout);
        let bytes = match self.engine.capture(&spec).await {
            Ok(bytes) => bytes,
            Err(err) => return failure(err.is_transient(), err),
        };
        let image_ref = match self.blobs.put(bytes).await {
            Ok(image_ref) => image_ref,
            Err(err) => return failure(err.is_transient(), err),
        };

        match self
            .lifecycle
            .record_capture_success(&job.tenant_id, payload.screenshot_id, &job.id, image_ref)
            .await
        {
            Ok(CaptureUpdate::Stale { status }) => {
                debug!(status = status.as_str(), "capture superseded; result dropped");
                JobResult::Success
            }
            Ok(CaptureUpdate::Applied { .. }) => JobResult::Success,
            Err(err) => failure(err.is_transient(), err),
        }
    }

    async fn on_exhausted(&self, job: &Job, reason: &str) {
        let JobPayload::Capture(payload) = &job.payload else {
            return;
        };
        if let Err(err) = self
            .lifecycle
            .record_capture_failure(&job.tenant_id, payload.screenshot_id, &job.id, reason, job.attempts)
            .await
        {
            error!(job_id = %job.id, error = %err, "could not record capture failure");
        }
    }
}
