//! `companion-orchestrator` - keeps report delivery going without a caller.
//!
//! [`BackgroundOrchestrator`] wakes up on a recurring timer and on lifecycle
//! transitions, decides whether a full pass (fan-out + drain) is due according
//! to the persisted [`RunConfig`], and runs it under a job lock that is
//! distinct from the queue's processing lock.

pub mod error;
pub mod orchestrator;
pub mod runs;
pub mod types;

pub use error::{OrchestratorError, Result};
pub use orchestrator::{BackgroundOrchestrator, OrchestratorOptions};
pub use runs::RunLedger;
pub use types::{JobExecutionResult, LifecycleState, OrchestratorStats, RunConfig, SkipReason};
