use serde::Deserialize;
use serde_json::{Value, json};

use pagewatch_infra::jobs::Submission;
use pagewatch_infra::lifecycle::BulkItem;
use pagewatch_infra::tenancy::IdentityOutcome;

#[derive(Debug, Deserialize)]
pub struct ApprovalRequest {
    pub action: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ScheduleRequest {
    pub cron: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct RetryRequest {
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReapRequest {
    #[serde(default)]
    pub grace_secs: Option<u64>,
}

pub fn submission_to_json(submission: &Submission) -> Value {
    json!({
        "lane": submission.lane,
        "job_id": submission.job_id,
        "outcome": submission.outcome,
    })
}

pub fn bulk_item_to_json(item: BulkItem) -> Value {
    match item.result {
        Ok(submission) => json!({
            "screenshot_id": item.screenshot_id,
            "job_id": submission.job_id,
            "outcome": submission.outcome,
        }),
        Err(err) => json!({
            "screenshot_id": item.screenshot_id,
            "error": err.to_string(),
        }),
    }
}

pub fn identity_outcome_to_json(outcome: IdentityOutcome) -> Value {
    match outcome {
        IdentityOutcome::Upserted(user) => json!({ "result": "upserted", "user": user }),
        IdentityOutcome::Deleted { removed } => json!({ "result": "deleted", "removed": removed }),
    }
}
