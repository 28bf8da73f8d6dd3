//! `companion-recipients` - who receives reports, and when they are due.
//!
//! The [`registry::RecipientRegistry`] owns every [`types::RecipientConfig`]
//! and the per-period `last_sent` bookkeeping. It is the only place that
//! answers "which recipients are due for period P now?".

pub mod due;
pub mod error;
pub mod registry;
pub mod types;

pub use error::{RegistryError, Result};
pub use registry::RecipientRegistry;
pub use types::{LastSent, PeriodFlags, RecipientConfig, RecipientPatch, RecipientStats};
