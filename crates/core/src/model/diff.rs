use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::id::{DiffId, ScreenshotId, TenantId};
use crate::significance;

/// Metrics returned by the diff computation service.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffMetrics {
    pub pixel_diff: u64,
    pub percentage_diff: f64,
    pub total_pixels: u64,
}

/// Immutable comparison between two consecutive captures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diff {
    pub id: DiffId,
    pub tenant_id: TenantId,
    pub screenshot_id: ScreenshotId,
    pub previous_image_ref: String,
    pub current_image_ref: String,
    pub metrics: DiffMetrics,
    pub significant: bool,
    /// Threshold the significance decision was made against.
    pub threshold: f64,
    pub created_at: DateTime<Utc>,
}

impl Diff {
    /// Build a diff row, deciding significance against `threshold_override`
    /// (the project's setting) or the system default.
    pub fn evaluate(
        tenant_id: TenantId,
        screenshot_id: ScreenshotId,
        previous_image_ref: String,
        current_image_ref: String,
        metrics: DiffMetrics,
        threshold_override: Option<f64>,
        now: DateTime<Utc>,
    ) -> Self {
        let threshold = significance::effective_threshold(threshold_override);
        Self {
            id: DiffId::new(),
            tenant_id,
            screenshot_id,
            previous_image_ref,
            current_image_ref,
            metrics,
            significant: significance::evaluate(metrics.percentage_diff, Some(threshold)),
            threshold,
            created_at: now,
        }
    }

    /// Natural key used to make diff persistence idempotent under redelivery.
    pub fn same_comparison(&self, previous_image_ref: &str, current_image_ref: &str) -> bool {
        self.previous_image_ref == previous_image_ref && self.current_image_ref == current_image_ref
    }
}

impl Entity for Diff {
    type Id = DiffId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }
}
