//! The lock capability and the retrying acquisition shared by all backends.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{LockError, Result};

/// A held lease on one lock key.
///
/// The token is unique per acquisition; backends only release or extend a
/// key whose stored token still matches, so a holder whose lease already
/// expired cannot affect the next holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    key: String,
    token: String,
}

impl Lease {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            token: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Lease duration and acquisition retry policy.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// How long a lease lives without renewal.
    pub ttl: Duration,
    /// Extra acquisition attempts after the first one fails.
    pub retry_count: u32,
    /// Pause between acquisition attempts.
    pub retry_delay: Duration,
}

impl LockConfig {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            ..Self::default()
        }
    }

    /// Interval at which a running handler renews its lease.
    pub fn renewal_interval(&self) -> Duration {
        (self.ttl / 3).max(Duration::from_millis(10))
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            retry_count: 3,
            retry_delay: Duration::from_millis(200),
        }
    }
}

/// A cluster-wide mutual-exclusion service with lease expiry.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Takes the lease if the key is free. Returns `None` when it is held.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<Lease>>;

    /// Pushes the lease expiry out to `ttl` from now. Returns `false` when
    /// the lease was lost.
    async fn extend(&self, lease: &Lease, ttl: Duration) -> Result<bool>;

    /// Releases the lease. Returns `false` when it was no longer held.
    async fn release(&self, lease: &Lease) -> Result<bool>;
}

/// Tries to take `key`, retrying per `config` while it is held elsewhere.
///
/// Backend errors are returned immediately.
pub async fn acquire_with_retry(
    lock: &dyn DistributedLock,
    key: &str,
    config: &LockConfig,
) -> Result<Lease> {
    let attempts = config.retry_count + 1;
    for attempt in 1..=attempts {
        if let Some(lease) = lock.try_acquire(key, config.ttl).await? {
            return Ok(lease);
        }
        if attempt < attempts {
            tracing::debug!(key, attempt, "lock held, retrying");
            tokio::time::sleep(config.retry_delay).await;
        }
    }
    Err(LockError::NotAcquired {
        key: key.to_string(),
        attempts,
    })
}
