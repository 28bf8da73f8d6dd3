use chrono::{DateTime, Utc};
use companion_core::{JobId, Period, RecipientId};
use serde::{Deserialize, Serialize};

use crate::collab::ReportPayload;

/// Lifecycle state of a delivery job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for its scheduled time or for a retry.
    Pending,
    /// An attempt is in flight.
    Sending,
    /// Delivered. Terminal.
    Sent,
    /// Retry budget exhausted. Terminal.
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Sent | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Sending => "sending",
            JobStatus::Sent => "sent",
            JobStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "sending" => Ok(JobStatus::Sending),
            "sent" => Ok(JobStatus::Sent),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// One scheduled delivery of one report to one recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryJob {
    /// UUIDv7 primary key.
    pub id: JobId,
    pub recipient_id: RecipientId,
    pub period: Period,
    pub scheduled_for: DateTime<Utc>,
    /// Number of attempts started. Never decreases.
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<DateTime<Utc>>,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Report content generated on the first attempt, reused on retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_payload: Option<ReportPayload>,
    /// Transport message id of the successful send.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Partial update merged into a job by `DeliveryQueue::update`.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    /// Ignored when lower than the stored value.
    pub attempts: Option<u32>,
    pub last_attempt: Option<DateTime<Utc>>,
    /// `Some(None)` clears the message.
    pub error_message: Option<Option<String>>,
    pub cached_payload: Option<ReportPayload>,
    pub message_id: Option<String>,
}

/// Queue snapshot for the configuration surface.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub sending: usize,
    pub sent: usize,
    pub failed: usize,
    /// Pending job with the earliest `scheduled_for`.
    pub oldest_pending: Option<DeliveryJob>,
    /// End of the most recent drain pass.
    pub last_processed: Option<DateTime<Utc>>,
}
