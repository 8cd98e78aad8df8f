//! Sub-queue registration for producers and consumers.

use std::sync::Arc;

use dispatch::{DistributedLock, LockConfig, register_locked};
use queue::{ConsumerMultiplexer, ProducerMultiplexer, QueueError, SubQueueHandle};

use crate::messages::{
    ANALYSES_LAUNCH, CreateRepo, CreateSub, DeleteRepo, DeleteSub, REPOS_CREATE, REPOS_DELETE,
    SUBS_CREATE, SUBS_DELETE, SUBS_UPDATE, UpdateSub,
};
use crate::repo_saga::RepoSaga;
use crate::sub_saga::SubSaga;

/// Producer handles for every sub-queue of the primary queue.
#[derive(Clone)]
pub struct SagaProducers {
    pub repos_create: SubQueueHandle,
    pub repos_delete: SubQueueHandle,
    pub subs_create: SubQueueHandle,
    pub subs_update: SubQueueHandle,
    pub subs_delete: SubQueueHandle,
}

impl SagaProducers {
    /// Registers the primary sub-queues on `mux`. Fails if any id was
    /// already taken.
    pub fn register(mux: &mut ProducerMultiplexer) -> Result<Self, QueueError> {
        Ok(Self {
            repos_create: mux.register(REPOS_CREATE)?,
            repos_delete: mux.register(REPOS_DELETE)?,
            subs_create: mux.register(SUBS_CREATE)?,
            subs_update: mux.register(SUBS_UPDATE)?,
            subs_delete: mux.register(SUBS_DELETE)?,
        })
    }
}

/// Registers the launch-analysis sub-queue on the analysis queue's producer.
pub fn register_analysis_producer(
    mux: &mut ProducerMultiplexer,
) -> Result<SubQueueHandle, QueueError> {
    mux.register(ANALYSES_LAUNCH)
}

/// Registers a locked consumer for every primary sub-queue.
pub fn register_consumers(
    mux: &mut ConsumerMultiplexer,
    repos: Arc<RepoSaga>,
    subs: Arc<SubSaga>,
    lock: Arc<dyn DistributedLock>,
    config: LockConfig,
) -> Result<(), QueueError> {
    register_locked::<CreateRepo, _>(
        mux,
        REPOS_CREATE,
        Arc::clone(&repos),
        Arc::clone(&lock),
        config.clone(),
    )?;
    register_locked::<DeleteRepo, _>(
        mux,
        REPOS_DELETE,
        repos,
        Arc::clone(&lock),
        config.clone(),
    )?;
    register_locked::<CreateSub, _>(
        mux,
        SUBS_CREATE,
        Arc::clone(&subs),
        Arc::clone(&lock),
        config.clone(),
    )?;
    register_locked::<UpdateSub, _>(
        mux,
        SUBS_UPDATE,
        Arc::clone(&subs),
        Arc::clone(&lock),
        config.clone(),
    )?;
    register_locked::<DeleteSub, _>(mux, SUBS_DELETE, subs, lock, config)?;

    tracing::info!(subqueues = ?mux.subqueue_ids(), "consumers registered");
    Ok(())
}
