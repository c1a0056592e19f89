//! Consumer shapes and the type-erased [`Handler`] the pipeline invokes.
//!
//! Applications implement one of [`CommandConsumer`], [`RequestConsumer`] or
//! [`EventConsumer`]. The matching adapter ([`CommandHandler`],
//! [`RequestHandler`], [`EventHandler`]) decodes the transport body, calls
//! the consumer, and reports a [`DeliveryOutcome`].

use std::any::type_name;

use async_trait::async_trait;
use courier_core::naming::kebab_case;
use courier_core::{
    ConsumerShape, EventEnvelope, Message, MessageType, MessageTypeIdentity, Request, RouteName,
    TransportMessage,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::delivery::{ConsumeError, Delivery, DeliveryOutcome};

// ---------------------------------------------------------------------------
// ConsumeContext
// ---------------------------------------------------------------------------

/// Delivery metadata available to a consumer.
#[derive(Debug, Clone)]
pub struct ConsumeContext {
    pub route: RouteName,
    pub queue: String,
    pub message_id: Option<Uuid>,
    /// For events, the envelope's correlation id.
    pub correlation_id: Option<Uuid>,
    pub redelivery_count: u32,
    /// Fires when the endpoint is shutting down.
    pub cancel: CancellationToken,
}

impl ConsumeContext {
    #[must_use]
    pub fn from_delivery(delivery: &Delivery) -> Self {
        Self {
            route: delivery.route.clone(),
            queue: delivery.queue.clone(),
            message_id: delivery.message.message_id,
            correlation_id: delivery.message.correlation_id,
            redelivery_count: delivery.message.headers.redelivery_count,
            cancel: delivery.cancel.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Consumer traits
// ---------------------------------------------------------------------------

/// Handles a one-way message.
#[async_trait]
pub trait CommandConsumer: Send + Sync + 'static {
    type Message: Message;

    async fn consume(&self, message: Self::Message, ctx: &ConsumeContext) -> anyhow::Result<()>;
}

/// Answers a request with a response.
///
/// The response is only sent when the delivery carries a reply address.
#[async_trait]
pub trait RequestConsumer: Send + Sync + 'static {
    type Request: Request;

    async fn respond(
        &self,
        request: Self::Request,
        ctx: &ConsumeContext,
    ) -> anyhow::Result<<Self::Request as Request>::Response>;
}

/// Handles the payload of a broadcast event. The envelope is never exposed.
#[async_trait]
pub trait EventConsumer: Send + Sync + 'static {
    type Event: Message;

    async fn on_event(&self, event: Self::Event, ctx: &ConsumeContext) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// Handler (type-erased)
// ---------------------------------------------------------------------------

/// A consumer behind a uniform, shape-tagged interface.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    fn shape(&self) -> ConsumerShape;

    /// Identity of the message this handler consumes.
    fn identity(&self) -> MessageTypeIdentity;

    /// Name of the consumer, used for event queue names and logs.
    fn consumer_name(&self) -> &str;

    async fn invoke(&self, delivery: &Delivery) -> Result<DeliveryOutcome, ConsumeError>;
}

/// Last path segment of a type name, generics stripped, in kebab-case.
fn default_consumer_name<T>() -> String {
    let full = type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    kebab_case(base.rsplit("::").next().unwrap_or(base))
}

macro_rules! named_adapter {
    ($adapter:ident, $bound:ident) => {
        impl<C: $bound> $adapter<C> {
            /// Wraps a consumer, naming it after its type.
            #[must_use]
            pub fn new(consumer: C) -> Self {
                Self {
                    consumer,
                    name: default_consumer_name::<C>(),
                }
            }

            /// Overrides the consumer name.
            #[must_use]
            pub fn named(mut self, name: impl Into<String>) -> Self {
                self.name = name.into();
                self
            }
        }
    };
}

// ---------------------------------------------------------------------------
// CommandHandler
// ---------------------------------------------------------------------------

pub struct CommandHandler<C> {
    consumer: C,
    name: String,
}

named_adapter!(CommandHandler, CommandConsumer);

#[async_trait]
impl<C: CommandConsumer> Handler for CommandHandler<C> {
    fn shape(&self) -> ConsumerShape {
        ConsumerShape::Command
    }

    fn identity(&self) -> MessageTypeIdentity {
        <C::Message as MessageType>::identity()
    }

    fn consumer_name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, delivery: &Delivery) -> Result<DeliveryOutcome, ConsumeError> {
        let message: C::Message = delivery.message.decode()?;
        let ctx = ConsumeContext::from_delivery(delivery);
        self.consumer.consume(message, &ctx).await?;
        Ok(DeliveryOutcome::Handled)
    }
}

// ---------------------------------------------------------------------------
// RequestHandler
// ---------------------------------------------------------------------------

pub struct RequestHandler<C> {
    consumer: C,
    name: String,
}

named_adapter!(RequestHandler, RequestConsumer);

#[async_trait]
impl<C: RequestConsumer> Handler for RequestHandler<C> {
    fn shape(&self) -> ConsumerShape {
        ConsumerShape::Request
    }

    fn identity(&self) -> MessageTypeIdentity {
        <C::Request as MessageType>::identity()
    }

    fn consumer_name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, delivery: &Delivery) -> Result<DeliveryOutcome, ConsumeError> {
        let request: C::Request = delivery.message.decode()?;
        let ctx = ConsumeContext::from_delivery(delivery);
        let response = self.consumer.respond(request, &ctx).await?;

        if delivery.message.reply_to().is_none() {
            tracing::debug!(route = %delivery.route, "no reply address, response discarded");
            return Ok(DeliveryOutcome::Handled);
        }
        let reply = TransportMessage::response_to(&delivery.message, &response)?;
        Ok(DeliveryOutcome::Replied(reply))
    }
}

// ---------------------------------------------------------------------------
// EventHandler
// ---------------------------------------------------------------------------

pub struct EventHandler<C> {
    consumer: C,
    name: String,
}

named_adapter!(EventHandler, EventConsumer);

#[async_trait]
impl<C: EventConsumer> Handler for EventHandler<C> {
    fn shape(&self) -> ConsumerShape {
        ConsumerShape::Event
    }

    fn identity(&self) -> MessageTypeIdentity {
        <C::Event as MessageType>::identity()
    }

    fn consumer_name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, delivery: &Delivery) -> Result<DeliveryOutcome, ConsumeError> {
        let envelope: EventEnvelope<C::Event> = delivery.message.decode()?;
        let mut ctx = ConsumeContext::from_delivery(delivery);
        ctx.correlation_id = Some(envelope.correlation_id);
        self.consumer.on_event(envelope.into_payload(), &ctx).await?;
        Ok(DeliveryOutcome::Handled)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
