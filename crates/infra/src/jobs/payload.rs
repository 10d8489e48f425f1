//! Lane payloads.
//!
//! Raw request types mirror the wire shapes and are validated once, at
//! submission, into the [`JobPayload`] tagged union. Workers match on the
//! validated variant and never re-validate.

use serde::{Deserialize, Serialize};
use url::Url;

use pagewatch_core::model::{DiffMetrics, Screenshot, Viewport};
use pagewatch_core::{DomainError, ProjectId, ScreenshotId};

use super::types::Lane;

/// Capture submission as received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureRequest {
    pub project_id: String,
    pub screenshot_id: String,
    pub url: String,
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub viewport: Option<Viewport>,
}

impl CaptureRequest {
    pub fn for_screenshot(screenshot: &Screenshot) -> Self {
        Self {
            project_id: screenshot.project_id.to_string(),
            screenshot_id: screenshot.id.to_string(),
            url: screenshot.url.clone(),
            selector: screenshot.selector.clone(),
            viewport: screenshot.viewport,
        }
    }

    pub fn validate(self) -> Result<CapturePayload, DomainError> {
        let project_id = parse_id::<ProjectId>("projectId", &self.project_id)?;
        let screenshot_id = parse_id::<ScreenshotId>("screenshotId", &self.screenshot_id)?;
        let url = parse_http_url(&self.url)?;
        let selector = match self.selector {
            Some(s) if s.trim().is_empty() => {
                return Err(DomainError::validation("selector cannot be blank"));
            }
            other => other,
        };
        if let Some(viewport) = &self.viewport {
            viewport.validate()?;
        }
        Ok(CapturePayload {
            project_id,
            screenshot_id,
            url: url.to_string(),
            selector,
            viewport: self.viewport,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct CapturePayload {
    pub project_id: ProjectId,
    pub screenshot_id: ScreenshotId,
    /// Absolute http(s) URL, normalised.
    pub url: String,
    pub selector: Option<String>,
    pub viewport: Option<Viewport>,
}

/// Diff submission as received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffRequest {
    pub screenshot_id: String,
    pub current_image_ref: String,
    pub previous_image_ref: String,
}

impl DiffRequest {
    pub fn validate(self) -> Result<DiffPayload, DomainError> {
        let screenshot_id = parse_id::<ScreenshotId>("screenshotId", &self.screenshot_id)?;
        if self.current_image_ref.trim().is_empty() {
            return Err(DomainError::validation("currentImageRef cannot be empty"));
        }
        if self.previous_image_ref.trim().is_empty() {
            return Err(DomainError::validation("previousImageRef cannot be empty"));
        }
        Ok(DiffPayload {
            screenshot_id,
            current_image_ref: self.current_image_ref,
            previous_image_ref: self.previous_image_ref,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct DiffPayload {
    pub screenshot_id: ScreenshotId,
    pub current_image_ref: String,
    pub previous_image_ref: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyType {
    CaptureCompleted,
    DiffDetected,
    CaptureFailed,
    ProjectSummary,
    BulkChanges,
}

/// Notify submission as received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyRequest {
    #[serde(rename = "type")]
    pub kind: NotifyType,
    pub project_id: String,
    pub screenshot_id: String,
    pub message: String,
    #[serde(default)]
    pub diff_ref: Option<String>,
    #[serde(default)]
    pub diff_metrics: Option<DiffMetrics>,
}

impl NotifyRequest {
    pub fn validate(self) -> Result<NotifyPayload, DomainError> {
        let project_id = parse_id::<ProjectId>("projectId", &self.project_id)?;
        let screenshot_id = parse_id::<ScreenshotId>("screenshotId", &self.screenshot_id)?;
        if self.message.trim().is_empty() {
            return Err(DomainError::validation("message cannot be empty"));
        }
        if let Some(metrics) = &self.diff_metrics {
            let pct = metrics.percentage_diff;
            if !pct.is_finite() || !(0.0..=100.0).contains(&pct) {
                return Err(DomainError::validation(format!(
                    "diffMetrics.percentageDiff must be within 0..=100, got {pct}"
                )));
            }
            if metrics.pixel_diff > metrics.total_pixels {
                return Err(DomainError::validation(
                    "diffMetrics.pixelDiff cannot exceed totalPixels",
                ));
            }
        }
        Ok(NotifyPayload {
            kind: self.kind,
            project_id,
            screenshot_id,
            message: self.message,
            diff_ref: self.diff_ref,
            diff_metrics: self.diff_metrics,
        })
    }
}

/// Delivered verbatim to notification sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct NotifyPayload {
    #[serde(rename = "type")]
    pub kind: NotifyType,
    pub project_id: ProjectId,
    pub screenshot_id: ScreenshotId,
    pub message: String,
    pub diff_ref: Option<String>,
    pub diff_metrics: Option<DiffMetrics>,
}

/// Validated payload, one variant per lane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "lane", content = "data", rename_all = "snake_case")]
pub enum JobPayload {
    Capture(CapturePayload),
    Diff(DiffPayload),
    Notify(NotifyPayload),
}

impl JobPayload {
    pub fn lane(&self) -> Lane {
        match self {
            JobPayload::Capture(_) => Lane::Capture,
            JobPayload::Diff(_) => Lane::Diff,
            JobPayload::Notify(_) => Lane::Notify,
        }
    }

    pub fn screenshot_id(&self) -> ScreenshotId {
        match self {
            JobPayload::Capture(p) => p.screenshot_id,
            JobPayload::Diff(p) => p.screenshot_id,
            JobPayload::Notify(p) => p.screenshot_id,
        }
    }
}

fn parse_id<T: std::str::FromStr>(field: &str, raw: &str) -> Result<T, DomainError> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| DomainError::validation(format!("{field} is not a valid id: {raw:?}")))
}

fn parse_http_url(raw: &str) -> Result<Url, DomainError> {
    let url = Url::parse(raw.trim())
        .map_err(|e| DomainError::validation(format!("url {raw:?} is invalid: {e}")))?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(url),
        scheme => Err(DomainError::validation(format!(
            "url must be an absolute http(s) URL, got scheme {scheme:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture(url: &str) -> CaptureRequest {
        CaptureRequest {
            project_id: ProjectId::new().to_string(),
            screenshot_id: ScreenshotId::new().to_string(),
            url: url.to_string(),
            selector: None,
            viewport: None,
        }
    }

    #[test]
    fn capture_accepts_wire_shape() {
        let sid = ScreenshotId::new();
        let pid = ProjectId::new();
        let request: CaptureRequest = serde_json::from_value(serde_json::json!({
            "projectId": pid.to_string(),
            "screenshotId": sid.to_string(),
            "url": "https://example.com/pricing",
            "viewport": { "width": 1280, "height": 800 }
        }))
        .unwrap();

        let payload = request.validate().unwrap();
        assert_eq!(payload.screenshot_id, sid);
        assert_eq!(payload.project_id, pid);
        assert_eq!(payload.url, "https://example.com/pricing");
    }

    #[test]
    fn capture_rejects_bad_urls_and_ids() {
        assert!(matches!(capture("not a url").validate(), Err(DomainError::Validation(_))));
        assert!(capture("ftp://example.com").validate().is_err());
        assert!(capture("file:///etc/passwd").validate().is_err());

        let mut bad_id = capture("https://example.com");
        bad_id.screenshot_id = "s1".to_string();
        assert!(bad_id.validate().is_err());
    }

    #[test]
    fn capture_rejects_out_of_range_viewport() {
        let mut request = capture("https://example.com");
        request.viewport = Some(Viewport { width: 100, height: 800 });
        assert!(request.validate().is_err());
    }

    #[test]
    fn notify_checks_message_and_metrics() {
        let base = NotifyRequest {
            kind: NotifyType::DiffDetected,
            project_id: ProjectId::new().to_string(),
            screenshot_id: ScreenshotId::new().to_string(),
            message: "Home changed".to_string(),
            diff_ref: None,
            diff_metrics: Some(DiffMetrics {
                pixel_diff: 10,
                percentage_diff: 5.1,
                total_pixels: 100,
            }),
        };
        assert!(base.clone().validate().is_ok());

        let mut blank = base.clone();
        blank.message = " ".to_string();
        assert!(blank.validate().is_err());

        let mut nan = base;
        nan.diff_metrics = Some(DiffMetrics {
            pixel_diff: 0,
            percentage_diff: f64::NAN,
            total_pixels: 100,
        });
        assert!(nan.validate().is_err());
    }

    #[test]
    fn notify_type_uses_wire_names() {
        let value = serde_json::to_value(NotifyType::CaptureFailed).unwrap();
        assert_eq!(value, "capture_failed");
    }
}
