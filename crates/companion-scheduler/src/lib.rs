//! `companion-scheduler` - persisted delivery queue and the scheduling engine.
//!
//! # Overview
//!
//! The [`engine::SchedulingEngine`] runs in two steps:
//!
//! 1. **fan-out**: for every period, ask the recipient registry who is due
//!    and enqueue one [`types::DeliveryJob`] per recipient at the period's
//!    scheduled time;
//! 2. **drain**: under the queue's processing lock, take up to
//!    `max_per_pass` ready jobs and deliver them one by one, with a courtesy
//!    delay between sends.
//!
//! # Scheduled times
//!
//! | Period    | Scheduled for                                   |
//! |-----------|-------------------------------------------------|
//! | `daily`   | today at `sending_hour` (local)                 |
//! | `weekly`  | next Monday at `sending_hour` (1–7 days ahead)  |
//! | `monthly` | the 1st of next month at `sending_hour`         |
//!
//! Report content, rendering and transport are collaborators behind the
//! traits in [`collab`].

pub mod collab;
pub mod engine;
pub mod error;
pub mod queue;
pub mod schedule;
pub mod types;

pub use collab::{
    DeliveryError, DeliveryTransport, Document, ReportGenerator, ReportPayload, ReportRequest,
    SendReceipt, TemplateRenderer,
};
pub use engine::{Collaborators, DrainReport, EngineOptions, FanOutSummary, SchedulingEngine};
pub use error::{Result, SchedulerError};
pub use queue::DeliveryQueue;
pub use types::{DeliveryJob, JobPatch, JobStatus, QueueStats};
