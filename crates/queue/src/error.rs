//! Queue and consumption error types.

use thiserror::Error;

/// Errors raised by the producer side and by transports.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The same sub-queue id was registered twice in one process.
    #[error("Sub-queue {0:?} is already registered")]
    DuplicateSubqueue(String),

    /// The physical queue rejected or failed an operation.
    #[error("Queue transport error: {0}")]
    Transport(String),

    /// A message could not be serialized into an envelope.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// How the transport layer should treat a failed consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Leave the message unacknowledged; redelivery will retry it.
    Transient,
    /// Retrying cannot help; the dispatcher compensates instead.
    Permanent,
    /// A logic bug or violated invariant; surfaced loudly, left for
    /// redelivery and operators.
    Invariant,
}

impl ErrorClass {
    /// Returns the class name, used as a metrics label.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Permanent => "permanent",
            ErrorClass::Invariant => "invariant",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors returned by a [`Consumer`](crate::Consumer) for one message.
#[derive(Debug, Error)]
pub enum ConsumeError {
    /// The envelope or the inner payload is not valid JSON of the expected
    /// shape.
    #[error("Malformed message: {0}")]
    Decode(#[from] serde_json::Error),

    /// No consumer is registered for the envelope's sub-queue id. This
    /// usually means producers and consumers run different code versions.
    #[error("Unknown sub-queue {id:?}, known sub-queues: {known:?}")]
    UnknownSubqueue { id: String, known: Vec<String> },

    /// The distributed lock for the message could not be taken.
    #[error("Lock {key:?} unavailable: {reason}")]
    LockUnavailable { key: String, reason: String },

    /// A failure that a later redelivery may not hit.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// A failure that no amount of retrying will fix.
    #[error("Permanent failure: {0}")]
    Permanent(String),

    /// A logic error: unexpected state, missed conditional write, panic.
    #[error("Invariant violated: {0}")]
    Invariant(String),
}

impl ConsumeError {
    /// Classifies the error for retry decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            ConsumeError::LockUnavailable { .. } | ConsumeError::Transient(_) => {
                ErrorClass::Transient
            }
            ConsumeError::Permanent(_) => ErrorClass::Permanent,
            ConsumeError::Decode(_)
            | ConsumeError::UnknownSubqueue { .. }
            | ConsumeError::Invariant(_) => ErrorClass::Invariant,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_unavailable_is_transient() {
        let err = ConsumeError::LockUnavailable {
            key: "repos/create/1".to_string(),
            reason: "held".to_string(),
        };
        assert_eq!(err.class(), ErrorClass::Transient);
    }

    #[test]
    fn test_unknown_subqueue_is_invariant() {
        let err = ConsumeError::UnknownSubqueue {
            id: "nope".to_string(),
            known: vec!["repos/create".to_string()],
        };
        assert_eq!(err.class(), ErrorClass::Invariant);
        let message = err.to_string();
        assert!(message.contains("\"nope\""));
        assert!(message.contains("repos/create"));
    }

    #[test]
    fn test_class_labels() {
        assert_eq!(ErrorClass::Transient.to_string(), "transient");
        assert_eq!(ErrorClass::Permanent.as_str(), "permanent");
        assert_eq!(ErrorClass::Invariant.as_str(), "invariant");
    }
}
