use thiserror::Error;

/// Errors raised by recipient management.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Malformed address, duplicate registration or bad verification token.
    #[error("validation failed: {0}")]
    Validation(String),

    /// No recipient with the given ID exists.
    #[error("recipient not found: {id}")]
    NotFound { id: String },

    /// The backing store failed.
    #[error(transparent)]
    Store(#[from] companion_core::CoreError),
}

pub type Result<T> = std::result::Result<T, RegistryError>;
