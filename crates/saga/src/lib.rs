//! Commit-state sagas for repository and subscription lifecycles.
//!
//! Each saga is a handler plugged into the lock dispatcher: it reloads the
//! entity, performs the side effect belonging to the current commit state and
//! records progress with a conditional write. Nothing is kept in memory
//! between messages, so any worker can pick up where another stopped.
//!
//! Permanent failures are compensated by the dispatcher:
//! 1. repository creation rolls back and soft-deletes the row
//! 2. subscription creation deletes the local row
//! 3. subscription update and delete return to the active `create/done` state

pub mod error;
pub mod messages;
pub mod repo_saga;
pub mod services;
pub mod sub_saga;
pub mod wiring;

pub use error::{Result, SagaError};
pub use messages::{CreateRepo, CreateSub, DeleteRepo, DeleteSub, LaunchAnalysis, UpdateSub};
pub use repo_saga::{RepoSaga, RepoSagaConfig};
pub use services::{
    GatewaySubscription, InMemoryPaymentGateway, InMemoryVcsProvider, PaymentError,
    PaymentGateway, ProviderError, ProviderHook, ProviderRepo, VcsProvider,
};
pub use sub_saga::SubSaga;
pub use wiring::{SagaProducers, register_analysis_producer, register_consumers};
