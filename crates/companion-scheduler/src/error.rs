use thiserror::Error;

/// Errors that can occur within the scheduling subsystem.
///
/// Per-job delivery failures are not errors at this level: they are recorded
/// on the job (see [`crate::collab::DeliveryError`]) and never abort a drain.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying store error.
    #[error(transparent)]
    Store(#[from] companion_core::CoreError),

    /// Recipient registry failure during fan-out or bookkeeping.
    #[error(transparent)]
    Registry(#[from] companion_recipients::RegistryError),

    /// No job with the given ID exists in the queue.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
