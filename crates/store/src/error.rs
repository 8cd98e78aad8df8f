use thiserror::Error;

use crate::state::ParseCommitStateError;

/// Errors that can occur when reading or writing saga entities.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A stored commit state is not part of the saga vocabulary.
    #[error("Corrupt row: {0}")]
    CorruptCommitState(#[from] ParseCommitStateError),

    /// The requested write has no edge in the saga state graph.
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// A row the caller just wrote could not be read back.
    #[error("Row vanished after write: {0}")]
    RowVanished(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
