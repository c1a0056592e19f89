//! Collaborator traits: the broker transport, the idempotency claim store,
//! the dead-letter sink, and the transactional unit of work.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::{Address, IdempotencyKey, TransportMessage};
use tokio_util::sync::CancellationToken;

use crate::dead_letter::DeadLetter;
use crate::delivery::{BrokerError, StoreError};

/// Message transport providing the four broker primitives.
///
/// Cancellation aborts the caller's wait only. A message the broker has
/// already accepted is not recalled.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Send to a single queue or exchange.
    async fn send_to(
        &self,
        address: &Address,
        message: TransportMessage,
        cancel: &CancellationToken,
    ) -> Result<(), BrokerError>;

    /// Fan out to every queue bound to `topic`.
    ///
    /// Fan-out is not atomic. When a later queue fails or `cancel` fires
    /// part-way, the queues reached earlier keep the event and the caller
    /// still gets the error. A retry through [`crate::MessageSender`]
    /// re-encodes the event with a new message id, so those queues see it
    /// again and the idempotency filter does not treat it as a duplicate.
    async fn publish(
        &self,
        topic: &Address,
        message: TransportMessage,
        cancel: &CancellationToken,
    ) -> Result<(), BrokerError>;

    /// Send and wait for the correlated response.
    ///
    /// The broker owns the reply channel and sets `reply_to` itself.
    async fn request(
        &self,
        address: &Address,
        message: TransportMessage,
        cancel: &CancellationToken,
    ) -> Result<TransportMessage, BrokerError>;

    /// Send at a future instant. Instants in the past deliver immediately.
    async fn schedule_send(
        &self,
        address: &Address,
        at: DateTime<Utc>,
        message: TransportMessage,
        cancel: &CancellationToken,
    ) -> Result<(), BrokerError>;

    /// Publish at a future instant. Instants in the past deliver immediately.
    async fn schedule_publish(
        &self,
        topic: &Address,
        at: DateTime<Utc>,
        message: TransportMessage,
        cancel: &CancellationToken,
    ) -> Result<(), BrokerError>;
}

/// Key/TTL claim ledger used for duplicate suppression.
///
/// While a claim is outstanding, exactly one `try_start` for its key returns
/// `true`. A claim becomes available again after `complete` or once its TTL
/// has elapsed.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Try to claim `key` for `ttl`. `false` means the key is already claimed.
    async fn try_start(&self, key: &IdempotencyKey, ttl: Duration) -> Result<bool, StoreError>;

    /// Release the claim on `key`.
    async fn complete(&self, key: &IdempotencyKey) -> Result<(), StoreError>;
}

/// Terminal destination for messages that exhausted the failure ladder.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn dead_letter(&self, letter: DeadLetter) -> anyhow::Result<()>;
}

/// Transactional boundary committed after a handler succeeds.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    async fn commit(&self) -> anyhow::Result<()>;
}
