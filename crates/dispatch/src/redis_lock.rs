//! Redis-backed distributed lock.
//!
//! Acquisition is a single `SET key token NX PX ttl`. Release and extension
//! run as Lua scripts that compare the stored token first, so they are atomic
//! on the server and never touch a lease owned by someone else.

use std::time::Duration;

use async_trait::async_trait;
use redis::Script;
use redis::aio::MultiplexedConnection;

use crate::error::Result;
use crate::{DistributedLock, Lease};

/// Default prefix for lock keys in Redis.
const DEFAULT_KEY_PREFIX: &str = "locks:";

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

#[derive(Clone)]
pub struct RedisLock {
    conn: MultiplexedConnection,
    key_prefix: String,
    release: Script,
    extend: Script,
}

impl RedisLock {
    /// Connects to Redis at `redis_url`, e.g. `redis://localhost:6379`.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        tracing::info!("connected to redis lock service");
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            release: Script::new(RELEASE_SCRIPT),
            extend: Script::new(EXTEND_SCRIPT),
        }
    }

    /// Overrides the prefix prepended to every lock key.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl DistributedLock for RedisLock {
    #[tracing::instrument(skip(self))]
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<Lease>> {
        let lease = Lease::new(key);
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.redis_key(key))
            .arg(lease.token())
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;

        Ok(reply.map(|_| lease))
    }

    async fn extend(&self, lease: &Lease, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let extended: i64 = self
            .extend
            .key(self.redis_key(lease.key()))
            .arg(lease.token())
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    async fn release(&self, lease: &Lease) -> Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release
            .key(self.redis_key(lease.key()))
            .arg(lease.token())
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }
}
