//! Error types for GymFlow

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GymError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Billing error: {0}")]
    Billing(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for GymError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => GymError::NotFound("row not found".to_string()),
            other => GymError::Database(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for GymError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        GymError::Database(format!("migration failed: {}", err))
    }
}

pub type GymResult<T> = Result<T, GymError>;
