//! Contracts of the external collaborators the engine drives.
//!
//! The engine never looks inside a [`ReportPayload`] or a [`Document`]; it
//! only caches the payload on the job so retries reuse the same content.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use companion_core::{Period, RecipientId};
use serde::{Deserialize, Serialize};

/// What the report generator is asked to produce.
#[derive(Debug, Clone)]
pub struct ReportRequest {
    /// Data owner whose readings the report summarises.
    pub owner_id: String,
    pub recipient_id: RecipientId,
    pub period: Period,
    pub as_of: DateTime<Utc>,
}

/// Computed report, memoised on the job once generated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportPayload {
    pub owner_id: String,
    pub period: Period,
    /// First instant covered by the report.
    pub range_start: DateTime<Utc>,
    /// Last instant covered by the report.
    pub range_end: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
    /// Opaque metrics produced by the analytics side.
    #[serde(default)]
    pub content: serde_json::Value,
}

/// Rendered, ready-to-send report.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// MIME type of `body`, e.g. `text/html`.
    pub content_type: String,
    pub body: String,
}

/// Transport acknowledgement of an accepted message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendReceipt {
    pub message_id: Option<String>,
}

/// A failed delivery attempt. Always treated as retryable up to the budget.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeliveryError {
    #[error("report generation failed: {0}")]
    Report(String),

    #[error("template rendering failed: {0}")]
    Render(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("recipient not found: {id}")]
    RecipientGone { id: String },

    #[error("internal error: {0}")]
    Internal(String),
}

/// Produces the report content for one recipient and period.
#[async_trait]
pub trait ReportGenerator: Send + Sync {
    async fn generate(&self, req: &ReportRequest) -> Result<ReportPayload, DeliveryError>;
}

/// Turns a payload into a displayable document.
#[async_trait]
pub trait TemplateRenderer: Send + Sync {
    async fn render(&self, payload: &ReportPayload) -> Result<Document, DeliveryError>;
}

/// Hands a document to the outside world (e-mail API, ...).
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    /// Transport name for logging.
    fn name(&self) -> &str;

    async fn send(
        &self,
        address: &str,
        subject: &str,
        document: &Document,
    ) -> Result<SendReceipt, DeliveryError>;
}
