//! Process wiring: backends, HTTP state and the primary-queue worker.
//!
//! Every backend has an in-memory stand-in that is used when its
//! configuration variable is unset, so a single `ROLE=all` process runs
//! without any infrastructure.

use std::sync::Arc;

use aws_config::BehaviorVersion;
use dispatch::{DistributedLock, InMemoryLock, LockConfig, LockError, RedisLock};
use queue::{
    ConsumerMultiplexer, InMemoryQueue, ProducerMultiplexer, Queue, QueueError, QueueReceiver,
    SqsQueue, Worker, WorkerConfig,
};
use saga::{
    PaymentGateway, RepoSaga, RepoSagaConfig, SagaProducers, SubSaga, VcsProvider,
    register_analysis_producer, register_consumers,
};
use sqlx::postgres::PgPoolOptions;
use store::{InMemoryStore, OrgSubStore, PostgresStore, RepoStore, StoreError};
use thiserror::Error;

use crate::AppState;
use crate::config::Config;
use crate::routes::health::BackendKinds;

/// Errors that abort process startup.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Database connection failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store setup failed: {0}")]
    Store(#[from] StoreError),

    #[error("Lock service connection failed: {0}")]
    Lock(#[from] LockError),

    #[error("Queue setup failed: {0}")]
    Queue(#[from] QueueError),
}

/// Storage, queue and lock backends shared by the API and the worker.
#[derive(Clone)]
pub struct Backends {
    pub repos: Arc<dyn RepoStore>,
    pub subs: Arc<dyn OrgSubStore>,
    pub primary: Arc<dyn Queue>,
    pub primary_receiver: Arc<dyn QueueReceiver>,
    pub analyses: Arc<dyn Queue>,
    pub lock: Arc<dyn DistributedLock>,
    pub kinds: BackendKinds,
}

impl Backends {
    /// Builds in-memory backends for tests and single-process runs.
    pub fn in_memory(config: &Config) -> Self {
        let store = InMemoryStore::new();
        let primary = InMemoryQueue::with_visibility_timeout(config.visibility_timeout);
        Self {
            repos: Arc::new(store.clone()),
            subs: Arc::new(store),
            primary: Arc::new(primary.clone()),
            primary_receiver: Arc::new(primary),
            analyses: Arc::new(InMemoryQueue::new()),
            lock: Arc::new(InMemoryLock::new()),
            kinds: BackendKinds::default(),
        }
    }

    /// Connects the configured backends, falling back to in-memory ones.
    pub async fn connect(config: &Config) -> Result<Self, StartupError> {
        let mut backends = Self::in_memory(config);

        if let Some(url) = &config.database_url {
            let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
            let store = PostgresStore::new(pool);
            store.run_migrations().await?;
            backends.repos = Arc::new(store.clone());
            backends.subs = Arc::new(store);
            backends.kinds.store = "postgres";
            tracing::info!("using postgres store");
        } else {
            tracing::warn!("DATABASE_URL not set, using in-memory store");
        }

        if config.primary_queue_url.is_some() || config.analysis_queue_url.is_some() {
            let sdk_config = aws_config::defaults(BehaviorVersion::latest()).load().await;
            let client = aws_sdk_sqs::Client::new(&sdk_config);
            if let Some(url) = &config.primary_queue_url {
                let queue = SqsQueue::new(client.clone(), url, config.visibility_timeout);
                backends.primary = Arc::new(queue.clone());
                backends.primary_receiver = Arc::new(queue);
                backends.kinds.queue = "sqs";
            }
            if let Some(url) = &config.analysis_queue_url {
                backends.analyses =
                    Arc::new(SqsQueue::new(client, url, config.visibility_timeout));
            }
        }
        if config.primary_queue_url.is_none() {
            tracing::warn!("PRIMARY_QUEUE_URL not set, using in-memory primary queue");
        }

        if let Some(url) = &config.redis_url {
            backends.lock = Arc::new(RedisLock::connect(url).await?);
            backends.kinds.lock = "redis";
        } else {
            tracing::warn!("REDIS_URL not set, using in-memory lock");
        }

        Ok(backends)
    }
}

/// Registers the API-side producers and builds the HTTP state.
pub fn build_state(backends: &Backends) -> Result<Arc<AppState>, QueueError> {
    let mut producers = ProducerMultiplexer::new(backends.primary.clone());
    let producers = SagaProducers::register(&mut producers)?;
    Ok(Arc::new(AppState {
        repos: backends.repos.clone(),
        subs: backends.subs.clone(),
        producers,
        backends: backends.kinds,
    }))
}

/// Builds the worker consuming every primary sub-queue.
pub fn build_worker(
    config: &Config,
    backends: &Backends,
    vcs: Arc<dyn VcsProvider>,
    gateway: Arc<dyn PaymentGateway>,
) -> Result<Worker, QueueError> {
    let mut analysis_producers = ProducerMultiplexer::new(backends.analyses.clone());
    let launches = register_analysis_producer(&mut analysis_producers)?;

    let repos = RepoSaga::new(
        backends.repos.clone(),
        vcs,
        launches,
        RepoSagaConfig {
            hook_base_url: config.hook_base_url.clone(),
            reviewer_login: config.reviewer_login.clone(),
        },
    );
    let subs = SubSaga::new(backends.subs.clone(), gateway);

    let mut consumers = ConsumerMultiplexer::new();
    register_consumers(
        &mut consumers,
        Arc::new(repos),
        Arc::new(subs),
        backends.lock.clone(),
        LockConfig::with_ttl(config.lock_ttl),
    )?;

    Ok(Worker::new(
        "primary",
        backends.primary_receiver.clone(),
        Arc::new(consumers),
        WorkerConfig::for_visibility_timeout(config.visibility_timeout, config.worker_concurrency),
    ))
}
