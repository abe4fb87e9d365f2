//! Producer/consumer message contract.
//!
//! Every queue message carries a job envelope: a `jobType` tag consumers
//! switch on, an `attempt` counter owned by whichever consumer chooses to
//! retry, and a creation timestamp. Job-specific fields sit flat alongside
//! the envelope fields, which is the shape producers publish.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Job envelope carried by every queue message.
///
/// Owned by the broker from publish until exactly one consumer acks it
/// (competing-consumers semantics per queue).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Job tag consumers dispatch on.
    #[serde(rename = "jobType")]
    pub job_type: String,
    /// Retry counter, incremented by a consumer before a manual re-publish.
    #[serde(default)]
    pub attempt: u32,
    /// Creation time, ISO-8601.
    #[serde(rename = "createdAt", default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Job-specific fields, kept flat in the serialized form.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Envelope {
    /// New first-attempt envelope.
    ///
    /// Non-object payloads are nested under a `data` field so the flat
    /// top-level contract holds for every job.
    pub fn new(job_type: impl Into<String>, payload: Value) -> Self {
        let payload = match payload {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("data".to_string(), other);
                map
            }
        };
        Self {
            job_type: job_type.into(),
            attempt: 0,
            created_at: Utc::now(),
            payload,
        }
    }

    /// Copy with the attempt counter bumped for a manual retry.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }

    /// Job-specific field access.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}
