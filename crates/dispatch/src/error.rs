use thiserror::Error;

/// Lock service errors.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another holder kept the lease for every acquisition attempt.
    #[error("Lock {key:?} is held elsewhere after {attempts} attempts")]
    NotAcquired { key: String, attempts: u32 },

    /// The Redis backend failed.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

pub type Result<T> = std::result::Result<T, LockError>;
