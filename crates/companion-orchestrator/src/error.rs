use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Another pass holds a live job lock. Nothing was changed.
    #[error("a scheduling pass is already running")]
    LockContention,

    #[error("validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] companion_core::CoreError),

    #[error(transparent)]
    Registry(#[from] companion_recipients::RegistryError),

    #[error(transparent)]
    Scheduler(#[from] companion_scheduler::SchedulerError),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
