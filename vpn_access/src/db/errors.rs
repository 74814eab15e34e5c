//! Store error types.

use std::time::Duration;
use thiserror::Error;

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    /// Operation did not finish in time
    #[error("Database operation timed out after {0:?}")]
    Timeout(Duration),

    /// Unique constraint rejected the write
    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    /// The row lock was already used to commit a change
    #[error("Row lock already released")]
    LockReleased,

    /// A stored value could not be decoded
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err
            && db_err.is_unique_violation()
        {
            return StoreError::UniqueViolation(
                db_err.constraint().unwrap_or("unique").to_string(),
            );
        }
        StoreError::Database(err)
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;
