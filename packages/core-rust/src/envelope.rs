//! Event envelope used by the broadcast patterns.
//!
//! Wrapping a payload marks it as "this payload as an event", so only event
//! consumers receive it, never command or request consumers of the same type.
//! The envelope has its own correlation id and timestamp; it is created at
//! publish time and unwrapped before the handler runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A payload published as an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(bound(
    serialize = "P: Serialize",
    deserialize = "P: serde::de::DeserializeOwned"
))]
pub struct EventEnvelope<P> {
    /// Correlation id of the event itself, independent of the payload.
    pub correlation_id: Uuid,
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
    pub payload: P,
}

impl<P> EventEnvelope<P> {
    /// Wraps a payload with a fresh correlation id and the current time.
    #[must_use]
    pub fn new(payload: P) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            payload,
        }
    }

    #[must_use]
    pub fn payload(&self) -> &P {
        &self.payload
    }

    /// Unwraps the envelope, discarding its metadata.
    #[must_use]
    pub fn into_payload(self) -> P {
        self.payload
    }
}
