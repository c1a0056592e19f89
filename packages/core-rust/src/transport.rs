//! Transport message: what actually crosses the broker boundary.
//!
//! Typed messages are encoded into named `MsgPack` (`rmp_serde::to_vec_named`)
//! bodies. The broker only ever sees [`TransportMessage`]; typing is restored
//! on the consumer side by the handler adapters.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::envelope::EventEnvelope;
use crate::identity::Message;
use crate::naming::Address;

/// Errors from encoding or decoding a message body.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode message body: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("failed to decode message body: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Delivery metadata carried next to the body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportHeaders {
    /// When the producer handed the message to the broker.
    pub sent_at: DateTime<Utc>,
    /// Where a response should be sent, for request/response deliveries.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reply_to: Option<Address>,
    /// Message id of the request this message answers.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub in_reply_to: Option<Uuid>,
    /// How many out-of-band redeliveries this message has been through.
    #[serde(default)]
    pub redelivery_count: u32,
    /// Requested delivery instant for scheduled patterns.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Terminal failure reason, set on fault replies.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub fault: Option<String>,
    /// Whether the body is an `EventEnvelope`.
    #[serde(default)]
    pub enveloped: bool,
}

impl Default for TransportHeaders {
    fn default() -> Self {
        Self {
            sent_at: Utc::now(),
            reply_to: None,
            in_reply_to: None,
            redelivery_count: 0,
            scheduled_for: None,
            fault: None,
            enveloped: false,
        }
    }
}

/// A serialized message plus its delivery metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportMessage {
    /// Unique delivery id. Producers assign one; brokers fill it in if missing.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message_id: Option<Uuid>,
    /// Application-level correlation id copied from the message.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub correlation_id: Option<Uuid>,
    /// Identity of the body, e.g. `sales.OrderCreated` or `EventEnvelope<sales.OrderCreated>`.
    pub message_type: String,
    pub headers: TransportHeaders,
    pub body: Bytes,
}

impl TransportMessage {
    /// Encodes a typed message with a fresh message id.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if the message cannot be serialized.
    pub fn encode<T: Message>(message: &T) -> Result<Self, CodecError> {
        let body = rmp_serde::to_vec_named(message)?;
        Ok(Self {
            message_id: Some(Uuid::new_v4()),
            correlation_id: message.correlation_id(),
            message_type: T::identity().to_string(),
            headers: TransportHeaders::default(),
            body: Bytes::from(body),
        })
    }

    /// Wraps `payload` in a fresh [`EventEnvelope`] and encodes it.
    ///
    /// The envelope's correlation id is used, not the payload's.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if the envelope cannot be serialized.
    pub fn encode_event<P: Message>(payload: &P) -> Result<Self, CodecError> {
        let envelope = EventEnvelope::new(payload);
        let body = rmp_serde::to_vec_named(&envelope)?;
        Ok(Self {
            message_id: Some(Uuid::new_v4()),
            correlation_id: Some(envelope.correlation_id),
            message_type: event_type_name::<P>(),
            headers: TransportHeaders {
                enveloped: true,
                ..TransportHeaders::default()
            },
            body: Bytes::from(body),
        })
    }

    /// Builds the response to `request`, correlated through `in_reply_to`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if the response cannot be serialized.
    pub fn response_to<R: Message>(request: &Self, response: &R) -> Result<Self, CodecError> {
        let mut reply = Self::encode(response)?;
        reply.headers.in_reply_to = request.message_id;
        if reply.correlation_id.is_none() {
            reply.correlation_id = request.correlation_id;
        }
        Ok(reply)
    }

    /// Builds a fault reply telling the requester that handling failed terminally.
    #[must_use]
    pub fn fault_to(request: &Self, reason: impl Into<String>) -> Self {
        Self {
            message_id: Some(Uuid::new_v4()),
            correlation_id: request.correlation_id,
            message_type: format!("Fault<{}>", request.message_type),
            headers: TransportHeaders {
                in_reply_to: request.message_id,
                fault: Some(reason.into()),
                ..TransportHeaders::default()
            },
            body: Bytes::new(),
        }
    }

    /// Decodes the body into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] if the body does not match `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        Ok(rmp_serde::from_slice(&self.body)?)
    }

    /// Sets the reply address.
    #[must_use]
    pub fn with_reply_to(mut self, address: Address) -> Self {
        self.headers.reply_to = Some(address);
        self
    }

    #[must_use]
    pub fn is_fault(&self) -> bool {
        self.headers.fault.is_some()
    }

    #[must_use]
    pub fn reply_to(&self) -> Option<&Address> {
        self.headers.reply_to.as_ref()
    }

    /// A copy of this message for the next out-of-band redelivery.
    #[must_use]
    pub fn redelivered(&self) -> Self {
        let mut next = self.clone();
        next.headers.redelivery_count = next.headers.redelivery_count.saturating_add(1);
        next
    }
}

/// Transport type name of an enveloped payload.
#[must_use]
pub fn event_type_name<P: Message>() -> String {
    format!("EventEnvelope<{}>", P::identity())
}
