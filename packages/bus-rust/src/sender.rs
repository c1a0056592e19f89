//! Producer-facing API: one operation per delivery pattern.
//!
//! Every operation addresses the exchange of the message's route. Events are
//! wrapped in a fresh [`courier_core::EventEnvelope`] before they are
//! published. Caller cancellation aborts the caller's wait only: a message the
//! broker already accepted is not recalled.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_core::{
    Address, AddressingMode, DeliveryPattern, Message, MessageType, Request, RouteName,
    TransportMessage,
};
use tokio_util::sync::CancellationToken;

use crate::config::MessagingOptions;
use crate::delivery::{BrokerError, SendError};
use crate::traits::Broker;

// ---------------------------------------------------------------------------
// MessageSender
// ---------------------------------------------------------------------------

/// Sends typed messages through a [`Broker`].
#[derive(Clone)]
pub struct MessageSender {
    broker: Arc<dyn Broker>,
    request_timeout: Duration,
}

impl MessageSender {
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, options: &MessagingOptions) -> Self {
        Self {
            broker,
            request_timeout: options.request_timeout,
        }
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Per-type facade over this sender.
    #[must_use]
    pub fn typed<T: Message>(&self) -> TypedSender<T> {
        TypedSender::new(self.clone())
    }

    /// Sends a one-way command to the `cmd` route.
    ///
    /// # Errors
    ///
    /// [`SendError::Cancelled`] if `cancel` fires first, [`SendError::Broker`]
    /// if the broker rejects the message, [`SendError::Codec`] if it does not
    /// encode.
    pub async fn send_and_forget<T: Message>(
        &self,
        message: &T,
        cancel: &CancellationToken,
    ) -> Result<(), SendError> {
        let pattern = DeliveryPattern::FireAndForget;
        let address = exchange_for::<T>(pattern);
        let message = TransportMessage::encode(message)?;
        trace_send(pattern, &address, &message);
        until_cancelled(cancel, self.broker.send_to(&address, message, cancel)).await
    }

    /// Sends a request to the `rpc` route and waits for its response.
    ///
    /// The broker call is bounded by the request timeout and never sees the
    /// caller's token; `cancel` only stops this caller from waiting.
    ///
    /// # Errors
    ///
    /// [`SendError::Timeout`] when no response arrives in time,
    /// [`SendError::Fault`] when the consumer failed terminally,
    /// [`SendError::Cancelled`] if `cancel` fires first.
    pub async fn send_and_wait<R: Request>(
        &self,
        request: &R,
        cancel: &CancellationToken,
    ) -> Result<R::Response, SendError> {
        let pattern = DeliveryPattern::RequestResponse;
        let address = exchange_for::<R>(pattern);
        let message = TransportMessage::encode(request)?;
        trace_send(pattern, &address, &message);

        if cancel.is_cancelled() {
            return Err(SendError::Cancelled);
        }
        let broker_token = CancellationToken::new();
        let call = tokio::time::timeout(
            self.request_timeout,
            self.broker.request(&address, message, &broker_token),
        );
        let reply = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(SendError::Cancelled),
            result = call => match result {
                Ok(reply) => reply.map_err(broker_error)?,
                Err(_) => {
                    return Err(SendError::Timeout {
                        timeout_ms: u64::try_from(self.request_timeout.as_millis()).unwrap_or(u64::MAX),
                    })
                }
            },
        };

        if let Some(reason) = reply.headers.fault {
            return Err(SendError::Fault { reason });
        }
        Ok(reply.decode()?)
    }

    /// Sends to the single logical `pubq` queue of the message type.
    ///
    /// Takes no cancellation token: the broker call always runs to completion.
    ///
    /// # Errors
    ///
    /// [`SendError::Broker`] or [`SendError::Codec`].
    pub async fn publish_to_queue<T: Message>(&self, message: &T) -> Result<(), SendError> {
        let pattern = DeliveryPattern::PublishToQueue;
        let address = exchange_for::<T>(pattern);
        let message = TransportMessage::encode(message)?;
        trace_send(pattern, &address, &message);
        self.broker
            .send_to(&address, message, &CancellationToken::new())
            .await
            .map_err(broker_error)
    }

    /// Publishes `payload` in an event envelope to every event consumer.
    ///
    /// # Errors
    ///
    /// Same as [`MessageSender::send_and_forget`].
    pub async fn publish_to_all<P: Message>(
        &self,
        payload: &P,
        cancel: &CancellationToken,
    ) -> Result<(), SendError> {
        let pattern = DeliveryPattern::BroadcastPublish;
        let topic = exchange_for::<P>(pattern);
        let message = TransportMessage::encode_event(payload)?;
        trace_send(pattern, &topic, &message);
        until_cancelled(cancel, self.broker.publish(&topic, message, cancel)).await
    }

    /// Sends a command at `at`. Instants in the past deliver immediately.
    ///
    /// # Errors
    ///
    /// Same as [`MessageSender::send_and_forget`].
    pub async fn schedule_send<T: Message>(
        &self,
        message: &T,
        at: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<(), SendError> {
        let pattern = DeliveryPattern::ScheduledSend;
        let address = exchange_for::<T>(pattern);
        let at = not_before_now(at);
        let mut message = TransportMessage::encode(message)?;
        message.headers.scheduled_for = Some(at);
        trace_send(pattern, &address, &message);
        until_cancelled(cancel, self.broker.schedule_send(&address, at, message, cancel)).await
    }

    /// Publishes an event at `at`. Instants in the past deliver immediately.
    ///
    /// # Errors
    ///
    /// Same as [`MessageSender::send_and_forget`].
    pub async fn schedule_publish<P: Message>(
        &self,
        payload: &P,
        at: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<(), SendError> {
        let pattern = DeliveryPattern::ScheduledBroadcast;
        let topic = exchange_for::<P>(pattern);
        let at = not_before_now(at);
        let mut message = TransportMessage::encode_event(payload)?;
        message.headers.scheduled_for = Some(at);
        trace_send(pattern, &topic, &message);
        until_cancelled(cancel, self.broker.schedule_publish(&topic, at, message, cancel)).await
    }
}

impl std::fmt::Debug for MessageSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSender")
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

fn exchange_for<T: MessageType>(pattern: DeliveryPattern) -> Address {
    Address::for_route(&RouteName::for_type::<T>(pattern), AddressingMode::Exchange)
}

fn not_before_now(at: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if at < now {
        tracing::debug!(%at, "schedule instant in the past, delivering now");
        now
    } else {
        at
    }
}

fn trace_send(pattern: DeliveryPattern, address: &Address, message: &TransportMessage) {
    tracing::debug!(
        pattern = pattern.as_str(),
        address = %address,
        message_id = ?message.message_id,
        message_type = %message.message_type,
        "sending message"
    );
    metrics::counter!("courier_sent_total", "pattern" => pattern.as_str()).increment(1);
}

fn broker_error(error: BrokerError) -> SendError {
    match error {
        BrokerError::Cancelled => SendError::Cancelled,
        other => SendError::Broker(other),
    }
}

async fn until_cancelled<F>(cancel: &CancellationToken, call: F) -> Result<(), SendError>
where
    F: Future<Output = Result<(), BrokerError>>,
{
    if cancel.is_cancelled() {
        return Err(SendError::Cancelled);
    }
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(SendError::Cancelled),
        result = call => result.map_err(broker_error),
    }
}

// ---------------------------------------------------------------------------
// TypedSender
// ---------------------------------------------------------------------------

/// [`MessageSender`] bound to one message type.
pub struct TypedSender<T> {
    sender: MessageSender,
    _message: PhantomData<fn(&T)>,
}

impl<T> Clone for TypedSender<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            _message: PhantomData,
        }
    }
}

impl<T: Message> TypedSender<T> {
    #[must_use]
    pub fn new(sender: MessageSender) -> Self {
        Self {
            sender,
            _message: PhantomData,
        }
    }

    /// Route of `T` under `pattern`.
    #[must_use]
    pub fn route(pattern: DeliveryPattern) -> RouteName {
        RouteName::for_type::<T>(pattern)
    }

    /// # Errors
    ///
    /// See [`MessageSender::send_and_forget`].
    pub async fn send(&self, message: &T, cancel: &CancellationToken) -> Result<(), SendError> {
        self.sender.send_and_forget(message, cancel).await
    }

    /// # Errors
    ///
    /// See [`MessageSender::publish_to_queue`].
    pub async fn publish_to_queue(&self, message: &T) -> Result<(), SendError> {
        self.sender.publish_to_queue(message).await
    }

    /// # Errors
    ///
    /// See [`MessageSender::publish_to_all`].
    pub async fn publish(&self, payload: &T, cancel: &CancellationToken) -> Result<(), SendError> {
        self.sender.publish_to_all(payload, cancel).await
    }

    /// # Errors
    ///
    /// See [`MessageSender::schedule_send`].
    pub async fn schedule(
        &self,
        message: &T,
        at: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<(), SendError> {
        self.sender.schedule_send(message, at, cancel).await
    }

    /// # Errors
    ///
    /// See [`MessageSender::schedule_publish`].
    pub async fn schedule_publish(
        &self,
        payload: &T,
        at: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<(), SendError> {
        self.sender.schedule_publish(payload, at, cancel).await
    }
}

impl<T: Request> TypedSender<T> {
    /// # Errors
    ///
    /// See [`MessageSender::send_and_wait`].
    pub async fn request(&self, request: &T, cancel: &CancellationToken) -> Result<T::Response, SendError> {
        self.sender.send_and_wait(request, cancel).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
