//! Inbound delivery, pipeline outcome, and the error taxonomy of the bus.

use courier_core::{CodecError, RouteName, TransportMessage};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

/// One message handed to a receive endpoint by the broker.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Route the message was addressed to.
    pub route: RouteName,
    /// Queue of the endpoint consuming it.
    pub queue: String,
    pub message: TransportMessage,
    /// Fires when the endpoint is shutting down.
    pub cancel: CancellationToken,
}

impl Delivery {
    #[must_use]
    pub fn new(route: RouteName, queue: impl Into<String>, message: TransportMessage) -> Self {
        Self {
            route,
            queue: queue.into(),
            message,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn message_id(&self) -> Option<Uuid> {
        self.message.message_id
    }

    #[must_use]
    pub fn redelivery_count(&self) -> u32 {
        self.message.headers.redelivery_count
    }
}

/// Successful result of running a delivery through the consume pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// The handler ran and completed.
    Handled,
    /// The delivery was a duplicate and the handler was skipped.
    Duplicate,
    /// The handler produced a response for the delivery's reply address.
    Replied(TransportMessage),
}

impl DeliveryOutcome {
    /// Metrics/log label.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Handled => "handled",
            Self::Duplicate => "duplicate",
            Self::Replied(_) => "replied",
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures reported by a broker collaborator.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("no queue or exchange bound for {address}")]
    Unroutable { address: String },
    #[error("broker connection closed")]
    Closed,
    #[error("broker operation cancelled")]
    Cancelled,
    #[error("broker error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Failures reported by an idempotency store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("idempotency store unavailable: {0}")]
    Unavailable(#[from] anyhow::Error),
}

/// Errors surfaced to callers of the sender.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("send cancelled by caller")]
    Cancelled,
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("request failed on the consumer side: {reason}")]
    Fault { reason: String },
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Errors from consuming a delivery.
#[derive(Debug, thiserror::Error)]
pub enum ConsumeError {
    #[error("handler failed: {0}")]
    Handler(#[from] anyhow::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("unit of work commit failed: {0}")]
    Commit(anyhow::Error),
    #[error("consumption cancelled")]
    Cancelled,
}

impl ConsumeError {
    /// Whether another attempt could succeed.
    ///
    /// A body that does not decode never will, and cancellation means the
    /// endpoint is going away.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Codec(_) | Self::Cancelled)
    }

    /// Metrics/log label.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Handler(_) => "handler_error",
            Self::Codec(_) => "codec_error",
            Self::Store(_) => "store_error",
            Self::Commit(_) => "commit_error",
            Self::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use courier_core::TransportHeaders;

    use super::*;

    fn message() -> TransportMessage {
        TransportMessage {
            message_id: Some(Uuid::new_v4()),
            correlation_id: None,
            message_type: "Ping".to_string(),
            headers: TransportHeaders {
                redelivery_count: 2,
                ..TransportHeaders::default()
            },
            body: Bytes::new(),
        }
    }

    #[test]
    fn delivery_exposes_message_metadata() {
        let msg = message();
        let id = msg.message_id;
        let route = RouteName::resolve(
            &courier_core::MessageTypeIdentity::new("Ping"),
            courier_core::DeliveryPattern::FireAndForget,
        );
        let delivery = Delivery::new(route, "ping.cmd", msg);
        assert_eq!(delivery.message_id(), id);
        assert_eq!(delivery.redelivery_count(), 2);
        assert!(!delivery.cancel.is_cancelled());
    }

    #[test]
    fn codec_and_cancel_are_not_retryable() {
        let decode = rmp_decode_error();
        assert!(!ConsumeError::Codec(decode).is_retryable());
        assert!(!ConsumeError::Cancelled.is_retryable());
        assert!(ConsumeError::Handler(anyhow::anyhow!("boom")).is_retryable());
        assert!(ConsumeError::Commit(anyhow::anyhow!("db down")).is_retryable());
    }

    fn rmp_decode_error() -> CodecError {
        let mut msg = message();
        msg.body = Bytes::from_static(&[0xc1]);
        msg.decode::<String>().unwrap_err()
    }

    #[test]
    fn outcome_labels() {
        assert_eq!(DeliveryOutcome::Handled.label(), "handled");
        assert_eq!(DeliveryOutcome::Duplicate.label(), "duplicate");
        assert_eq!(DeliveryOutcome::Replied(message()).label(), "replied");
    }
}
