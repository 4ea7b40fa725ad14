//! Database Error Types

use exam_payments::PaymentError;
use thiserror::Error;

use crate::migrations::MigrationError;

/// Result type alias
pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Debit larger than the user's balance
    #[error("Insufficient credits for {user_id}: balance {balance}, required {required}")]
    InsufficientCredits {
        user_id: String,
        balance: i64,
        required: i64,
    },

    /// Caller passed a value the schema cannot hold
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Stored value that does not parse back
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl DbError {
    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        DbError::NotFound {
            entity,
            id: id.into(),
        }
    }
}

impl From<DbError> for PaymentError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound { id, .. } => PaymentError::PaymentNotFound(id),
            other => PaymentError::Storage(other.to_string()),
        }
    }
}
