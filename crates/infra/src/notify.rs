//! Notification sinks.
//!
//! Every channel is a [`NotificationSink`]; the set in use is chosen by
//! configuration and fanned out by [`NotificationRouter`]. Formatting and
//! per-channel retries belong to the sink, not to this crate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{info, warn};
use url::Url;

use pagewatch_core::TenantId;

use crate::jobs::NotifyPayload;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("{sink}: delivery failed: {reason}")]
    Delivery { sink: String, reason: String },
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, tenant_id: &TenantId, payload: &NotifyPayload) -> Result<(), SinkError>;
}

/// Writes notifications to the structured log.
#[derive(Debug, Default, Clone)]
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn deliver(&self, tenant_id: &TenantId, payload: &NotifyPayload) -> Result<(), SinkError> {
        info!(
            tenant_id = %tenant_id,
            kind = ?payload.kind,
            project_id = %payload.project_id,
            screenshot_id = %payload.screenshot_id,
            percentage_diff = payload.diff_metrics.map(|m| m.percentage_diff),
            message = %payload.message,
            "notification"
        );
        Ok(())
    }
}

/// POSTs the payload as JSON, with the tenant in `x-tenant-id`.
#[derive(Debug, Clone)]
pub struct WebhookSink {
    http: Client,
    url: Url,
}

impl WebhookSink {
    pub fn new(url: Url) -> Result<Self, SinkError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| SinkError::Delivery {
                sink: "webhook".to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self { http, url })
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, tenant_id: &TenantId, payload: &NotifyPayload) -> Result<(), SinkError> {
        let failed = |reason: String| SinkError::Delivery {
            sink: self.name().to_string(),
            reason,
        };
        let response = self
            .http
            .post(self.url.clone())
            .header("x-tenant-id", tenant_id.as_str())
            .json(payload)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(failed(format!("status {status}: {body}")));
        }
        Ok(())
    }
}

/// Fan-out over the configured sinks.
#[derive(Clone, Default)]
pub struct NotificationRouter {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl std::fmt::Debug for NotificationRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.sinks.iter().map(|s| s.name().to_string()))
            .finish()
    }
}

impl NotificationRouter {
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>) -> Self {
        Self { sinks }
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Deliver to every sink. All sinks are tried; the first failure is returned.
    pub async fn deliver(&self, tenant_id: &TenantId, payload: &NotifyPayload) -> Result<(), SinkError> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(err) = sink.deliver(tenant_id, payload).await {
                warn!(sink = sink.name(), tenant_id = %tenant_id, error = %err, "notification delivery failed");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{NotifyRequest, NotifyType};
    use pagewatch_core::{ProjectId, ScreenshotId};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl NotificationSink for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        async fn deliver(&self, _tenant_id: &TenantId, payload: &NotifyPayload) -> Result<(), SinkError> {
            self.seen.lock().unwrap().push(payload.message.clone());
            if self.fail {
                return Err(SinkError::Delivery {
                    sink: "recording".into(),
                    reason: "down".into(),
                });
            }
            Ok(())
        }
    }

    fn payload() -> NotifyPayload {
        NotifyRequest {
            kind: NotifyType::DiffDetected,
            project_id: ProjectId::new().to_string(),
            screenshot_id: ScreenshotId::new().to_string(),
            message: "Home changed by 5.1%".to_string(),
            diff_ref: None,
            diff_metrics: None,
        }
        .validate()
        .unwrap()
    }

    #[tokio::test]
    async fn every_sink_is_tried_even_after_a_failure() {
        let failing = Arc::new(Recording {
            fail: true,
            ..Default::default()
        });
        let healthy = Arc::new(Recording::default());
        let router = NotificationRouter::default()
            .with_sink(failing.clone())
            .with_sink(healthy.clone())
            .with_sink(Arc::new(TracingSink));

        let tenant = TenantId::parse("org_a").unwrap();
        let result = router.deliver(&tenant, &payload()).await;

        assert!(result.is_err());
        assert_eq!(healthy.seen.lock().unwrap().len(), 1);
        assert_eq!(failing.seen.lock().unwrap().len(), 1);
    }
}
