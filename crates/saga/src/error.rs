//! Saga error types.

use queue::{ConsumeError, ErrorClass, QueueError};
use store::StoreError;
use thiserror::Error;

use crate::services::{PaymentError, ProviderError};

/// Errors that can occur while driving a saga.
#[derive(Debug, Error)]
pub enum SagaError {
    /// Storage error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// VCS provider error.
    #[error("VCS provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Payment gateway error.
    #[error("Payment gateway error: {0}")]
    Payment(#[from] PaymentError),

    /// A follow-up message could not be enqueued.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// A conditional write that had to apply matched no row.
    #[error("Conditional write on {entity} {id} missed: expected {expected}, found {found}")]
    StaleWrite {
        entity: &'static str,
        id: i64,
        expected: String,
        found: String,
    },

    /// The entity is in a state the saga step does not handle.
    #[error("{entity} {id} is in unexpected state {state}")]
    UnexpectedState {
        entity: &'static str,
        id: i64,
        state: String,
    },

    /// A required side-effect field is missing for the current state.
    #[error("{entity} {id} is missing {field}")]
    MissingField {
        entity: &'static str,
        id: i64,
        field: &'static str,
    },

    /// The saga loop kept running without reaching a terminal state.
    #[error("{entity} {id} did not settle after {steps} steps")]
    NoProgress {
        entity: &'static str,
        id: i64,
        steps: usize,
    },
}

impl SagaError {
    /// Classifies the error for retry decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            SagaError::Store(StoreError::Database(_)) | SagaError::Queue(_) => {
                ErrorClass::Transient
            }
            SagaError::Store(_) => ErrorClass::Invariant,
            SagaError::Provider(err) if err.is_permanent() => ErrorClass::Permanent,
            SagaError::Payment(err) if err.is_permanent() => ErrorClass::Permanent,
            SagaError::Provider(_) | SagaError::Payment(_) => ErrorClass::Transient,
            SagaError::StaleWrite { .. }
            | SagaError::UnexpectedState { .. }
            | SagaError::MissingField { .. }
            | SagaError::NoProgress { .. } => ErrorClass::Invariant,
        }
    }
}

impl From<SagaError> for ConsumeError {
    fn from(err: SagaError) -> Self {
        let message = err.to_string();
        match err.class() {
            ErrorClass::Transient => ConsumeError::Transient(message),
            ErrorClass::Permanent => ConsumeError::Permanent(message),
            ErrorClass::Invariant => ConsumeError::Invariant(message),
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
