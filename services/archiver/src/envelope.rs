use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A message as delivered by the broker, stamped on arrival
#[derive(Debug, Clone)]
pub struct MessageEnvelope {
    /// Exact topic the message was published on
    pub topic: String,
    /// Raw payload, never validated
    pub payload: Bytes,
    /// Arrival instant, drives date partitioning and the key token
    pub received_at: DateTime<Utc>,
}

impl MessageEnvelope {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self::received_at(topic, payload, Utc::now())
    }

    pub fn received_at(
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at,
        }
    }
}

/// JSON document written to the archive: `{"topic": ..., "msg": ...}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedMessage {
    pub topic: String,
    /// Payload decoded as UTF-8; invalid sequences become U+FFFD
    pub msg: String,
}

impl ArchivedMessage {
    pub fn from_envelope(envelope: &MessageEnvelope) -> Self {
        Self {
            topic: envelope.topic.clone(),
            msg: String::from_utf8_lossy(&envelope.payload).into_owned(),
        }
    }

    pub fn to_json(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}
