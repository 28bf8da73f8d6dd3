use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    Store(String),
}

impl CoreError {
    /// Short error code string, stable across releases (used by the CLI output).
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Config(_) => "CONFIG_ERROR",
            CoreError::Validation(_) => "VALIDATION_ERROR",
            CoreError::InvalidTimezone(_) => "INVALID_TIMEZONE",
            CoreError::Database(_) => "DATABASE_ERROR",
            CoreError::Serialization(_) => "SERIALIZATION_ERROR",
            CoreError::Store(_) => "STORE_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
