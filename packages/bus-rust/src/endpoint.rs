//! Receive endpoints: one queue, one consumer, one consume pipeline.
//!
//! [`ReceiveEndpoint::process`] runs a delivery through the pipeline, sends
//! the response of a request consumer to the delivery's reply address, and
//! walks the failure ladder when the pipeline gives up: redeliver to the
//! endpoint's own queue after the next redelivery interval, otherwise
//! dead-letter, otherwise discard.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_core::{
    Address, ConsumerShape, FailureLadder, LadderStep, RedeliveryPolicy, RetryPolicy, RouteName,
    TransportMessage,
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use crate::config::MessagingOptions;
use crate::dead_letter::DeadLetter;
use crate::delivery::{ConsumeError, Delivery, DeliveryOutcome};
use crate::middleware::ConsumePipeline;
use crate::traits::{Broker, DeadLetterSink};

// ---------------------------------------------------------------------------
// EndpointConfig
// ---------------------------------------------------------------------------

/// Per-endpoint settings derived from [`MessagingOptions`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    pub route: RouteName,
    pub queue: String,
    pub shape: ConsumerShape,
    pub prefetch_count: u16,
    pub concurrency_limit: usize,
    pub retry: RetryPolicy,
    pub redelivery: RedeliveryPolicy,
    pub dead_letter: bool,
    pub quorum: bool,
    /// Highest message priority, when priority queues are enabled.
    pub max_priority: Option<u8>,
    /// Idempotency window, when the filter is enabled.
    pub idempotency_window: Option<Duration>,
}

impl EndpointConfig {
    #[must_use]
    pub fn new(
        route: RouteName,
        queue: impl Into<String>,
        shape: ConsumerShape,
        options: &MessagingOptions,
    ) -> Self {
        Self {
            route,
            queue: queue.into(),
            shape,
            prefetch_count: options.prefetch_count,
            concurrency_limit: options.concurrency_limit(),
            retry: options.retry_policy(),
            redelivery: options.redelivery_policy(),
            dead_letter: options.configure_dead_letter,
            quorum: options.use_quorum_queues,
            max_priority: options.enable_priority.then_some(options.max_priority),
            idempotency_window: options.idempotency(),
        }
    }

    #[must_use]
    pub fn ladder(&self) -> FailureLadder {
        FailureLadder::new(self.retry.clone(), self.redelivery.clone(), self.dead_letter)
    }

    /// Queue address the endpoint consumes from.
    #[must_use]
    pub fn address(&self) -> Address {
        Address::queue(self.queue.clone())
    }
}

// ---------------------------------------------------------------------------
// Acknowledgement
// ---------------------------------------------------------------------------

/// How a delivery was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acknowledgement {
    Handled,
    /// Skipped as a duplicate; still acknowledged.
    Duplicate,
    /// Scheduled for redelivery number `attempt` after `delay`.
    Redelivered { attempt: u32, delay: Duration },
    DeadLettered,
    Discarded,
}

// ---------------------------------------------------------------------------
// ReceiveEndpoint
// ---------------------------------------------------------------------------

pub struct ReceiveEndpoint {
    config: EndpointConfig,
    consumer: String,
    pipeline: Mutex<ConsumePipeline>,
    dead_letters: Arc<dyn DeadLetterSink>,
}

impl ReceiveEndpoint {
    #[must_use]
    pub fn new(
        config: EndpointConfig,
        consumer: impl Into<String>,
        pipeline: ConsumePipeline,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        Self {
            config,
            consumer: consumer.into(),
            pipeline: Mutex::new(pipeline),
            dead_letters,
        }
    }

    #[must_use]
    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    #[must_use]
    pub fn queue(&self) -> &str {
        &self.config.queue
    }

    #[must_use]
    pub fn route(&self) -> &RouteName {
        &self.config.route
    }

    #[must_use]
    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Consumes one delivery and settles it.
    pub async fn process(&self, delivery: Delivery, broker: &dyn Broker) -> Acknowledgement {
        let pipeline = self.pipeline.lock().clone();
        match pipeline.oneshot(delivery.clone()).await {
            Ok(DeliveryOutcome::Handled) => Acknowledgement::Handled,
            Ok(DeliveryOutcome::Duplicate) => Acknowledgement::Duplicate,
            Ok(DeliveryOutcome::Replied(reply)) => {
                self.send_reply(&delivery.message, reply, broker).await;
                Acknowledgement::Handled
            }
            Err(ConsumeError::Cancelled) => {
                tracing::warn!(queue = %self.config.queue, "delivery abandoned on shutdown");
                Acknowledgement::Discarded
            }
            Err(error) => self.escalate(delivery, &error, broker).await,
        }
    }

    async fn send_reply(&self, request: &TransportMessage, reply: TransportMessage, broker: &dyn Broker) {
        let Some(reply_to) = request.reply_to() else {
            return;
        };
        // The reply path is not tied to endpoint shutdown.
        if let Err(error) = broker.send_to(reply_to, reply, &CancellationToken::new()).await {
            tracing::error!(
                queue = %self.config.queue,
                reply_to = %reply_to,
                %error,
                "failed to send response"
            );
        }
    }

    async fn escalate(&self, delivery: Delivery, error: &ConsumeError, broker: &dyn Broker) -> Acknowledgement {
        let ladder = self.config.ladder();
        let redelivery_count = delivery.redelivery_count();
        let step = if error.is_retryable() {
            ladder.next_step(redelivery_count)
        } else if ladder.dead_letter {
            LadderStep::DeadLetter
        } else {
            LadderStep::Discard
        };

        match step {
            LadderStep::Redeliver { delay, attempt } => {
                let next = delivery.message.redelivered();
                let at = instant_after(delay);
                match broker
                    .schedule_send(&self.config.address(), at, next, &CancellationToken::new())
                    .await
                {
                    Ok(()) => {
                        tracing::warn!(
                            queue = %self.config.queue,
                            attempt,
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            %error,
                            "retries exhausted, redelivery scheduled"
                        );
                        metrics::counter!("courier_redeliveries_total", "route" => self.config.route.to_string())
                            .increment(1);
                        Acknowledgement::Redelivered { attempt, delay }
                    }
                    Err(schedule_error) => {
                        tracing::error!(
                            queue = %self.config.queue,
                            %schedule_error,
                            "failed to schedule redelivery"
                        );
                        self.terminal(delivery, error, broker, ladder.dead_letter).await
                    }
                }
            }
            LadderStep::DeadLetter => self.terminal(delivery, error, broker, true).await,
            LadderStep::Discard => self.terminal(delivery, error, broker, false).await,
        }
    }

    async fn terminal(
        &self,
        delivery: Delivery,
        error: &ConsumeError,
        broker: &dyn Broker,
        dead_letter: bool,
    ) -> Acknowledgement {
        let reason = error.to_string();
        let fault = delivery
            .message
            .reply_to()
            .map(|reply_to| (reply_to.clone(), TransportMessage::fault_to(&delivery.message, reason.clone())));

        let ack = if dead_letter {
            let retry_attempts = if error.is_retryable() {
                self.config.retry.attempts
            } else {
                0
            };
            let letter = DeadLetter {
                route: delivery.route.clone(),
                queue: delivery.queue.clone(),
                redelivery_count: delivery.redelivery_count(),
                message: delivery.message,
                reason,
                retry_attempts,
                dead_lettered_at: Utc::now(),
            };
            if let Err(sink_error) = self.dead_letters.dead_letter(letter).await {
                tracing::error!(queue = %self.config.queue, %sink_error, "dead-letter sink failed");
            }
            tracing::error!(queue = %self.config.queue, %error, "message dead-lettered");
            metrics::counter!("courier_dead_letters_total", "route" => self.config.route.to_string())
                .increment(1);
            Acknowledgement::DeadLettered
        } else {
            tracing::error!(
                queue = %self.config.queue,
                %error,
                "message discarded, dead-lettering disabled"
            );
            Acknowledgement::Discarded
        };

        if let Some((reply_to, fault)) = fault {
            if let Err(send_error) = broker.send_to(&reply_to, fault, &CancellationToken::new()).await {
                tracing::warn!(reply_to = %reply_to, %send_error, "failed to send fault reply");
            }
        }
        ack
    }
}

/// Wall-clock instant `delay` from now, saturating far in the future.
pub(crate) fn instant_after(delay: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
