use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::Result;
use crate::{DistributedLock, Lease};

/// In-process lock with the same token and expiry semantics as
/// [`RedisLock`](crate::RedisLock).
///
/// Only excludes holders within one process; suitable for tests and
/// single-process deployments.
#[derive(Clone, Default)]
pub struct InMemoryLock {
    held: Arc<Mutex<HashMap<String, (String, Instant)>>>,
}

impl InMemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if `key` is currently held by an unexpired lease.
    pub async fn is_held(&self, key: &str) -> bool {
        let held = self.held.lock().await;
        held.get(key)
            .is_some_and(|(_, expires_at)| *expires_at > Instant::now())
    }
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<Lease>> {
        let now = Instant::now();
        let mut held = self.held.lock().await;
        if let Some((_, expires_at)) = held.get(key)
            && *expires_at > now
        {
            return Ok(None);
        }

        let lease = Lease::new(key);
        held.insert(key.to_string(), (lease.token().to_string(), now + ttl));
        Ok(Some(lease))
    }

    async fn extend(&self, lease: &Lease, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut held = self.held.lock().await;
        match held.get_mut(lease.key()) {
            Some((token, expires_at)) if token == lease.token() && *expires_at > now => {
                *expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, lease: &Lease) -> Result<bool> {
        let mut held = self.held.lock().await;
        match held.get(lease.key()) {
            Some((token, _)) if token == lease.token() => {
                held.remove(lease.key());
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn test_second_acquire_is_refused() {
        let lock = InMemoryLock::new();
        let lease = lock.try_acquire("repos/create/1", TTL).await.unwrap();
        assert!(lease.is_some());
        assert!(lock.try_acquire("repos/create/1", TTL).await.unwrap().is_none());
        assert!(lock.try_acquire("repos/create/2", TTL).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_can_be_taken_over() {
        let lock = InMemoryLock::new();
        let stale = lock.try_acquire("k", TTL).await.unwrap().unwrap();

        tokio::time::advance(TTL + Duration::from_millis(1)).await;
        assert!(!lock.is_held("k").await);

        let fresh = lock.try_acquire("k", TTL).await.unwrap().unwrap();
        // The old holder can neither extend nor release the new lease.
        assert!(!lock.extend(&stale, TTL).await.unwrap());
        assert!(!lock.release(&stale).await.unwrap());
        assert!(lock.is_held("k").await);
        assert!(lock.release(&fresh).await.unwrap());
        assert!(!lock.is_held("k").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_keeps_lease_alive() {
        let lock = InMemoryLock::new();
        let lease = lock.try_acquire("k", TTL).await.unwrap().unwrap();

        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(lock.extend(&lease, TTL).await.unwrap());
        tokio::time::advance(Duration::from_secs(8)).await;

        assert!(lock.is_held("k").await);
        assert!(lock.try_acquire("k", TTL).await.unwrap().is_none());
    }
}
