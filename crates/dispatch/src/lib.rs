//! Distributed-lock dispatch for sub-queue consumers.
//!
//! Every logical consumer is wrapped in a [`LockedConsumer`]: the raw payload
//! is decoded into the concrete [`Message`](queue::Message) type, a
//! cluster-wide lease is taken on the message's lock id, and the
//! [`Handler`] runs while the lease is held and renewed. The lease is released
//! whatever the handler's outcome, panics included.
//!
//! The dispatcher is also the single place that turns an error class into an
//! action: transient and invariant errors leave the message for redelivery,
//! permanent errors run the handler's compensation and acknowledge.

pub mod dispatcher;
pub mod error;
pub mod lock;
pub mod memory;
pub mod redis_lock;

pub use dispatcher::{Handler, LockedConsumer, register_locked};
pub use error::LockError;
pub use lock::{DistributedLock, Lease, LockConfig, acquire_with_retry};
pub use memory::InMemoryLock;
pub use redis_lock::RedisLock;
