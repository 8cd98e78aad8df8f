//! Logical messages and the wire envelope that carries them.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A payload that can travel through a sub-queue.
///
/// `lock_id` names the logical entity the message acts on. The dispatcher
/// serializes processing per lock id across the whole worker fleet, and saga
/// steps reuse it as an idempotency key towards external providers. It must
/// be stable for the lifetime of one saga instance and look like
/// `"<subqueue id>/<entity suffix>"`, e.g. `"repos/create/42"`.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn lock_id(&self) -> String;
}

/// Wire format shared by every sub-queue on a physical queue:
/// `{"SubqueueID": "...", "Message": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "SubqueueID")]
    pub subqueue_id: String,
    #[serde(rename = "Message")]
    pub message: serde_json::Value,
}

impl Envelope {
    /// Wraps a logical message for the given sub-queue.
    pub fn wrap<M: Serialize + ?Sized>(
        subqueue_id: impl Into<String>,
        message: &M,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            subqueue_id: subqueue_id.into(),
            message: serde_json::to_value(message)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Ping {
        repo_id: i64,
    }

    #[test]
    fn test_envelope_wire_format() {
        let envelope = Envelope::wrap("repos/create", &Ping { repo_id: 42 }).unwrap();
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"SubqueueID": "repos/create", "Message": {"repo_id": 42}})
        );
    }

    #[test]
    fn test_envelope_decodes_foreign_producers() {
        let raw = r#"{"SubqueueID":"subs/create","Message":{"sub_id":7}}"#;
        let envelope: Envelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.subqueue_id, "subs/create");
        assert_eq!(envelope.message["sub_id"], 7);
    }
}
