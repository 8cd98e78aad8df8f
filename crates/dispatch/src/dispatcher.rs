//! The locking consumer wrapper.

use std::any::Any;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::FutureExt;
use queue::{ConsumeError, Consumer, ConsumerMultiplexer, ErrorClass, Message, QueueError};

use crate::{DistributedLock, Lease, LockConfig, acquire_with_retry};

/// Business logic for one sub-queue.
///
/// `handle` must be idempotent: the same message may be delivered more than
/// once, and may find its entity in any state.
#[async_trait]
pub trait Handler<M: Message>: Send + Sync + 'static {
    async fn handle(&self, message: &M) -> Result<(), ConsumeError>;

    /// Undoes the effects of a message whose handling failed permanently.
    /// Runs under the same lease as `handle`. On success the message is
    /// acknowledged; on failure it is left for redelivery.
    async fn compensate(&self, message: &M, cause: &ConsumeError) -> Result<(), ConsumeError> {
        let _ = message;
        tracing::warn!(error = %cause, "permanent failure with nothing to compensate");
        Ok(())
    }
}

/// A [`Consumer`] that decodes the payload into `M`, holds the distributed
/// lock named by [`Message::lock_id`] and runs the handler under it.
pub struct LockedConsumer<M, H> {
    subqueue_id: String,
    handler: Arc<H>,
    lock: Arc<dyn DistributedLock>,
    config: LockConfig,
    _message: PhantomData<fn() -> M>,
}

impl<M, H> LockedConsumer<M, H>
where
    M: Message,
    H: Handler<M>,
{
    pub fn new(
        subqueue_id: impl Into<String>,
        handler: Arc<H>,
        lock: Arc<dyn DistributedLock>,
        config: LockConfig,
    ) -> Self {
        Self {
            subqueue_id: subqueue_id.into(),
            handler,
            lock,
            config,
            _message: PhantomData,
        }
    }

    async fn run_handler(&self, message: &M) -> Result<(), ConsumeError> {
        let err = match self.handler.handle(message).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        if err.class() != ErrorClass::Permanent {
            return Err(err);
        }

        tracing::warn!(error = %err, "permanent failure, compensating");
        metrics::counter!("dispatch_compensations_total", "subqueue" => self.subqueue_id.clone())
            .increment(1);
        self.handler.compensate(message, &err).await
    }
}

/// Keeps `lease` alive until the task is aborted or the lease is lost.
fn spawn_renewal(
    lock: Arc<dyn DistributedLock>,
    lease: Lease,
    ttl: Duration,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            match lock.extend(&lease, ttl).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(key = lease.key(), "lease lost while handler was running");
                    return;
                }
                Err(err) => {
                    tracing::warn!(key = lease.key(), error = %err, "lease renewal failed");
                }
            }
        }
    })
}

/// Owns the lease for one delivery. Dropping it before [`LeaseGuard::release`]
/// (a cancelled or timed-out delivery) stops renewal and releases the lease in
/// the background.
struct LeaseGuard {
    lock: Arc<dyn DistributedLock>,
    lease: Option<Lease>,
    renewal: tokio::task::JoinHandle<()>,
}

impl LeaseGuard {
    fn new(lock: Arc<dyn DistributedLock>, lease: Lease, config: &LockConfig) -> Self {
        let renewal = spawn_renewal(
            lock.clone(),
            lease.clone(),
            config.ttl,
            config.renewal_interval(),
        );
        Self {
            lock,
            lease: Some(lease),
            renewal,
        }
    }

    async fn release(mut self) {
        self.renewal.abort();
        if let Some(lease) = self.lease.take() {
            release_lease(self.lock.as_ref(), &lease).await;
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.renewal.abort();
        let Some(lease) = self.lease.take() else {
            return;
        };
        tracing::warn!(key = lease.key(), "delivery cancelled while holding lease");
        // Without a runtime the lease simply runs out its ttl.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let lock = self.lock.clone();
            runtime.spawn(async move {
                release_lease(lock.as_ref(), &lease).await;
            });
        }
    }
}

async fn release_lease(lock: &dyn DistributedLock, lease: &Lease) {
    match lock.release(lease).await {
        Ok(true) => {}
        Ok(false) => tracing::warn!(key = lease.key(), "lease had already expired at release"),
        Err(err) => tracing::warn!(key = lease.key(), error = %err, "failed to release lease"),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

#[async_trait]
impl<M, H> Consumer for LockedConsumer<M, H>
where
    M: Message,
    H: Handler<M>,
{
    #[tracing::instrument(skip_all, fields(subqueue_id = %self.subqueue_id, lock_id = tracing::field::Empty))]
    async fn consume_message(&self, payload: serde_json::Value) -> Result<(), ConsumeError> {
        let message: M = serde_json::from_value(payload)?;
        let key = message.lock_id();
        tracing::Span::current().record("lock_id", key.as_str());

        let lease = match acquire_with_retry(self.lock.as_ref(), &key, &self.config).await {
            Ok(lease) => lease,
            Err(err) => {
                metrics::counter!("dispatch_lock_failures_total", "subqueue" => self.subqueue_id.clone())
                    .increment(1);
                return Err(ConsumeError::LockUnavailable {
                    key,
                    reason: err.to_string(),
                });
            }
        };

        let guard = LeaseGuard::new(self.lock.clone(), lease, &self.config);
        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.run_handler(&message))
            .catch_unwind()
            .await;
        metrics::histogram!("dispatch_handler_duration_seconds", "subqueue" => self.subqueue_id.clone())
            .record(started.elapsed().as_secs_f64());
        guard.release().await;

        let result = match outcome {
            Ok(result) => result,
            Err(panic) => Err(ConsumeError::Invariant(format!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            ))),
        };
        if let Err(err) = &result
            && err.class() == ErrorClass::Invariant
        {
            tracing::error!(error = %err, "invariant violated");
        }
        result
    }
}

/// Wraps `handler` in a [`LockedConsumer`] and registers it on `mux`.
pub fn register_locked<M, H>(
    mux: &mut ConsumerMultiplexer,
    subqueue_id: &str,
    handler: Arc<H>,
    lock: Arc<dyn DistributedLock>,
    config: LockConfig,
) -> Result<(), QueueError>
where
    M: Message,
    H: Handler<M>,
{
    let consumer = LockedConsumer::<M, H>::new(subqueue_id, handler, lock, config);
    mux.register_consumer(subqueue_id, Arc::new(consumer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryLock;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    #[derive(Debug, Serialize, Deserialize)]
    struct Job {
        id: i64,
        #[serde(default)]
        mode: String,
    }

    impl Message for Job {
        fn lock_id(&self) -> String {
            format!("jobs/run/{}", self.id)
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        events: Mutex<Vec<String>>,
        compensations: AtomicUsize,
    }

    #[async_trait]
    impl Handler<Job> for RecordingHandler {
        async fn handle(&self, job: &Job) -> Result<(), ConsumeError> {
            self.events.lock().await.push(format!("enter {}", job.id));
            if job.mode == "hang" {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.events.lock().await.push(format!("exit {}", job.id));
            match job.mode.as_str() {
                "panic" => panic!("boom"),
                "permanent" => Err(ConsumeError::Permanent("card declined".to_string())),
                "transient" => Err(ConsumeError::Transient("timeout".to_string())),
                _ => Ok(()),
            }
        }

        async fn compensate(&self, _job: &Job, _cause: &ConsumeError) -> Result<(), ConsumeError> {
            self.compensations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn consumer(
        handler: Arc<RecordingHandler>,
        lock: InMemoryLock,
    ) -> LockedConsumer<Job, RecordingHandler> {
        LockedConsumer::new(
            "jobs/run",
            handler,
            Arc::new(lock),
            LockConfig {
                ttl: Duration::from_secs(5),
                retry_count: 200,
                retry_delay: Duration::from_millis(1),
            },
        )
    }

    #[tokio::test]
    async fn test_same_key_never_runs_concurrently() {
        let handler = Arc::new(RecordingHandler::default());
        let consumer = Arc::new(consumer(handler.clone(), InMemoryLock::new()));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let consumer = consumer.clone();
            tasks.push(tokio::spawn(async move {
                consumer
                    .consume_message(serde_json::json!({"id": 1}))
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let events = handler.events.lock().await;
        assert_eq!(events.len(), 16);
        for pair in events.chunks(2) {
            assert_eq!(pair, ["enter 1", "exit 1"]);
        }
    }

    #[tokio::test]
    async fn test_panic_becomes_invariant_and_releases_lock() {
        let lock = InMemoryLock::new();
        let consumer = consumer(Arc::new(RecordingHandler::default()), lock.clone());

        let err = consumer
            .consume_message(serde_json::json!({"id": 2, "mode": "panic"}))
            .await
            .unwrap_err();

        assert_eq!(err.class(), ErrorClass::Invariant);
        assert!(err.to_string().contains("boom"));
        assert!(!lock.is_held("jobs/run/2").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_delivery_frees_its_lease() {
        let lock = InMemoryLock::new();
        let consumer = consumer(Arc::new(RecordingHandler::default()), lock.clone());

        let delivery = tokio::time::timeout(
            Duration::from_secs(1),
            consumer.consume_message(serde_json::json!({"id": 7, "mode": "hang"})),
        )
        .await;
        assert!(delivery.is_err());

        // Well inside the 5s ttl, so only an explicit release frees the key.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!lock.is_held("jobs/run/7").await);

        // Renewal stopped with the delivery.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!lock.is_held("jobs/run/7").await);
        let lease = lock
            .try_acquire("jobs/run/7", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(lease.is_some());
    }

    #[tokio::test]
    async fn test_held_lock_is_transient_failure() {
        let lock = InMemoryLock::new();
        let _other = lock
            .try_acquire("jobs/run/3", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        let handler = Arc::new(RecordingHandler::default());
        let consumer = LockedConsumer::new(
            "jobs/run",
            handler.clone(),
            Arc::new(lock),
            LockConfig {
                ttl: Duration::from_secs(5),
                retry_count: 1,
                retry_delay: Duration::from_millis(1),
            },
        );

        let err = consumer
            .consume_message(serde_json::json!({"id": 3}))
            .await
            .unwrap_err();

        assert!(matches!(err, ConsumeError::LockUnavailable { ref key, .. } if key == "jobs/run/3"));
        assert_eq!(err.class(), ErrorClass::Transient);
        assert!(handler.events.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_permanent_failure_is_compensated_and_acked() {
        let handler = Arc::new(RecordingHandler::default());
        let lock = InMemoryLock::new();
        let consumer = consumer(handler.clone(), lock.clone());

        consumer
            .consume_message(serde_json::json!({"id": 4, "mode": "permanent"}))
            .await
            .unwrap();

        assert_eq!(handler.compensations.load(Ordering::SeqCst), 1);
        assert!(!lock.is_held("jobs/run/4").await);
    }

    #[tokio::test]
    async fn test_transient_failure_is_not_compensated() {
        let handler = Arc::new(RecordingHandler::default());
        let consumer = consumer(handler.clone(), InMemoryLock::new());

        let err = consumer
            .consume_message(serde_json::json!({"id": 5, "mode": "transient"}))
            .await
            .unwrap_err();

        assert_eq!(err.class(), ErrorClass::Transient);
        assert_eq!(handler.compensations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_decode_error() {
        let consumer = consumer(Arc::new(RecordingHandler::default()), InMemoryLock::new());
        let err = consumer
            .consume_message(serde_json::json!({"id": "not a number"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ConsumeError::Decode(_)));
    }

    #[tokio::test]
    async fn test_register_locked_routes_through_mux() {
        let handler = Arc::new(RecordingHandler::default());
        let mut mux = ConsumerMultiplexer::new();
        register_locked::<Job, _>(
            &mut mux,
            "jobs/run",
            handler.clone(),
            Arc::new(InMemoryLock::new()),
            LockConfig::default(),
        )
        .unwrap();

        let raw = serde_json::to_vec(&serde_json::json!({
            "SubqueueID": "jobs/run",
            "Message": {"id": 6}
        }))
        .unwrap();
        mux.consume_message(&raw).await.unwrap();

        assert_eq!(*handler.events.lock().await, vec!["enter 6", "exit 6"]);
    }
}
