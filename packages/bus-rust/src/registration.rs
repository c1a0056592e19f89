//! Consumer registration and the resulting topology.
//!
//! Consumers are declared explicitly in a [`ConsumerRegistry`]. At startup
//! [`Registration::build`] derives the routes each consumer binds to, builds
//! one [`ReceiveEndpoint`] per queue, and fails fast on any wiring error.
//! Nothing here runs per message.

use std::collections::BTreeMap;
use std::sync::Arc;

use courier_core::naming::kebab_case;
use courier_core::{
    ConsumerShape, DeliveryPattern, MessageTypeIdentity, RouteName, RoutingError, UnknownShape,
};

use crate::config::{ConfigError, MessagingOptions};
use crate::consumer::{
    CommandConsumer, CommandHandler, EventConsumer, EventHandler, Handler, RequestConsumer,
    RequestHandler,
};
use crate::endpoint::{EndpointConfig, ReceiveEndpoint};
use crate::middleware::{build_consume_pipeline, PipelineDeps};
use crate::traits::DeadLetterSink;

// ---------------------------------------------------------------------------
// RegistrationError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("invalid messaging options: {0}")]
    InvalidOptions(#[from] ConfigError),
    #[error("consumer {consumer} declared as {declared} but implements {actual}")]
    ShapeMismatch {
        consumer: String,
        declared: ConsumerShape,
        actual: ConsumerShape,
    },
    #[error("consumer {consumer} declared for {declared} but consumes {actual}")]
    IdentityMismatch {
        consumer: String,
        declared: MessageTypeIdentity,
        actual: MessageTypeIdentity,
    },
    #[error("route {route} already has a responder ({existing})")]
    DuplicateResponder { route: RouteName, existing: String },
    #[error("queue {queue} is already bound to consumer {existing}")]
    DuplicateBinding { queue: String, existing: String },
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error(transparent)]
    UnknownShape(#[from] UnknownShape),
}

// ---------------------------------------------------------------------------
// ConsumerDescriptor / ConsumerRegistry
// ---------------------------------------------------------------------------

/// One declared consumer: the message it handles, its shape, and the handler.
#[derive(Clone)]
pub struct ConsumerDescriptor {
    pub identity: MessageTypeIdentity,
    pub shape: ConsumerShape,
    pub handler: Arc<dyn Handler>,
}

impl ConsumerDescriptor {
    /// Declares a handler with its own identity and shape.
    #[must_use]
    pub fn new(handler: Arc<dyn Handler>) -> Self {
        Self {
            identity: handler.identity(),
            shape: handler.shape(),
            handler,
        }
    }

    /// Declares a handler from a configuration table entry.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownShape`] if `shape` is not a known consumer shape.
    pub fn parse(
        identity: MessageTypeIdentity,
        shape: &str,
        handler: Arc<dyn Handler>,
    ) -> Result<Self, UnknownShape> {
        Ok(Self {
            identity,
            shape: shape.parse()?,
            handler,
        })
    }

    #[must_use]
    pub fn consumer_name(&self) -> &str {
        self.handler.consumer_name()
    }
}

impl std::fmt::Debug for ConsumerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerDescriptor")
            .field("identity", &self.identity)
            .field("shape", &self.shape)
            .field("consumer", &self.consumer_name())
            .finish()
    }
}

/// Statically declared list of consumers, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct ConsumerRegistry {
    descriptors: Vec<ConsumerDescriptor>,
}

impl ConsumerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn command<C: CommandConsumer>(self, consumer: C) -> Self {
        self.descriptor(ConsumerDescriptor::new(Arc::new(CommandHandler::new(consumer))))
    }

    #[must_use]
    pub fn request<C: RequestConsumer>(self, consumer: C) -> Self {
        self.descriptor(ConsumerDescriptor::new(Arc::new(RequestHandler::new(consumer))))
    }

    #[must_use]
    pub fn event<C: EventConsumer>(self, consumer: C) -> Self {
        self.descriptor(ConsumerDescriptor::new(Arc::new(EventHandler::new(consumer))))
    }

    #[must_use]
    pub fn descriptor(mut self, descriptor: ConsumerDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConsumerDescriptor> {
        self.descriptors.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Topology
// ---------------------------------------------------------------------------

/// Endpoints by queue name and the queues bound to each route.
pub struct Topology {
    endpoints: BTreeMap<String, Arc<ReceiveEndpoint>>,
    bindings: BTreeMap<RouteName, Vec<String>>,
    options: Arc<MessagingOptions>,
}

impl Topology {
    pub fn routes(&self) -> impl Iterator<Item = &RouteName> {
        self.bindings.keys()
    }

    /// Endpoints bound to `route`, in declaration order.
    pub fn endpoints_for<'a>(&'a self, route: &RouteName) -> impl Iterator<Item = &'a Arc<ReceiveEndpoint>> + 'a {
        self.bindings
            .get(route)
            .into_iter()
            .flatten()
            .filter_map(|queue| self.endpoints.get(queue))
    }

    #[must_use]
    pub fn endpoint(&self, queue: &str) -> Option<&Arc<ReceiveEndpoint>> {
        self.endpoints.get(queue)
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &Arc<ReceiveEndpoint>> {
        self.endpoints.values()
    }

    #[must_use]
    pub fn options(&self) -> &Arc<MessagingOptions> {
        &self.options
    }
}

impl std::fmt::Debug for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topology")
            .field("bindings", &self.bindings)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// One-time wiring of declared consumers to routes and endpoints.
pub struct Registration;

impl Registration {
    /// Builds the topology for `registry`.
    ///
    /// # Errors
    ///
    /// Returns the first [`RegistrationError`] found; no endpoint is created
    /// when any descriptor is invalid.
    pub fn build(
        registry: &ConsumerRegistry,
        options: Arc<MessagingOptions>,
        deps: &PipelineDeps,
        dead_letters: &Arc<dyn DeadLetterSink>,
    ) -> Result<Topology, RegistrationError> {
        options.validate()?;

        let mut endpoints: BTreeMap<String, Arc<ReceiveEndpoint>> = BTreeMap::new();
        let mut bindings: BTreeMap<RouteName, Vec<String>> = BTreeMap::new();

        for descriptor in registry.iter() {
            check_descriptor(descriptor)?;
            let consumer = descriptor.consumer_name().to_string();

            for &pattern in descriptor.shape.bound_patterns() {
                let route = RouteName::resolve(&descriptor.identity, pattern);
                let queue = queue_name(&route, pattern, &consumer);

                if let Some(existing) = endpoints.get(&queue) {
                    let existing = existing.consumer().to_string();
                    return Err(if pattern == DeliveryPattern::RequestResponse {
                        RegistrationError::DuplicateResponder { route, existing }
                    } else {
                        RegistrationError::DuplicateBinding { queue, existing }
                    });
                }

                let config = EndpointConfig::new(route.clone(), queue.clone(), descriptor.shape, &options);
                let pipeline = build_consume_pipeline(Arc::clone(&descriptor.handler), &config, deps);
                tracing::info!(
                    route = %route,
                    queue = %queue,
                    consumer = %consumer,
                    shape = %descriptor.shape,
                    "consumer bound"
                );
                let endpoint = ReceiveEndpoint::new(config, consumer.clone(), pipeline, Arc::clone(dead_letters));
                endpoints.insert(queue.clone(), Arc::new(endpoint));
                bindings.entry(route).or_default().push(queue);
            }
        }

        Ok(Topology {
            endpoints,
            bindings,
            options,
        })
    }
}

fn check_descriptor(descriptor: &ConsumerDescriptor) -> Result<(), RegistrationError> {
    let handler = &descriptor.handler;
    if handler.shape() != descriptor.shape {
        return Err(RegistrationError::ShapeMismatch {
            consumer: handler.consumer_name().to_string(),
            declared: descriptor.shape,
            actual: handler.shape(),
        });
    }
    if handler.identity() != descriptor.identity {
        return Err(RegistrationError::IdentityMismatch {
            consumer: handler.consumer_name().to_string(),
            declared: descriptor.identity.clone(),
            actual: handler.identity(),
        });
    }
    descriptor.identity.validate()?;
    Ok(())
}

/// Command and request endpoints consume the route's own queue; every event
/// consumer gets a queue of its own bound to the `evtq` route.
fn queue_name(route: &RouteName, pattern: DeliveryPattern, consumer: &str) -> String {
    if pattern == DeliveryPattern::BroadcastPublish {
        format!("{route}.{}", kebab_case(consumer))
    } else {
        route.to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use courier_core::{Message, MessageType, Request};
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::consumer::ConsumeContext;
    use crate::dead_letter::MemoryDeadLetterQueue;
    use crate::store::MemoryIdempotencyStore;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct OrderCreated {
        order_id: u64,
    }

    impl MessageType for OrderCreated {
        const NAME: &'static str = "OrderCreated";
        const PREFIX: Option<&'static str> = Some("sales");
    }

    impl Message for OrderCreated {}

    impl Request for OrderCreated {
        type Response = OrderCreated;
    }

    struct Fulfilment;

    #[async_trait]
    impl CommandConsumer for Fulfilment {
        type Message = OrderCreated;

        async fn consume(&self, _message: OrderCreated, _ctx: &ConsumeContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct Echo;

    #[async_trait]
    impl RequestConsumer for Echo {
        type Request = OrderCreated;

        async fn respond(&self, request: OrderCreated, _ctx: &ConsumeContext) -> anyhow::Result<OrderCreated> {
            Ok(request)
        }
    }

    struct Audit;

    #[async_trait]
    impl EventConsumer for Audit {
        type Event = OrderCreated;

        async fn on_event(&self, _event: OrderCreated, _ctx: &ConsumeContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct Billing;

    #[async_trait]
    impl EventConsumer for Billing {
        type Event = OrderCreated;

        async fn on_event(&self, _event: OrderCreated, _ctx: &ConsumeContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn build(registry: &ConsumerRegistry, options: MessagingOptions) -> Result<Topology, RegistrationError> {
        let deps = PipelineDeps {
            store: Arc::new(MemoryIdempotencyStore::new()),
            unit_of_work: None,
        };
        let dead_letters: Arc<dyn DeadLetterSink> = Arc::new(MemoryDeadLetterQueue::new());
        Registration::build(registry, Arc::new(options), &deps, &dead_letters)
    }

    fn route(pattern: DeliveryPattern) -> RouteName {
        RouteName::for_type::<OrderCreated>(pattern)
    }

    #[test]
    fn binds_each_shape_to_its_routes() {
        let registry = ConsumerRegistry::new()
            .command(Fulfilment)
            .request(Echo)
            .event(Audit)
            .event(Billing);
        let topology = build(&registry, MessagingOptions::default()).unwrap();

        let routes: Vec<_> = topology.routes().map(RouteName::as_str).collect();
        assert_eq!(
            routes,
            vec![
                "sales.order-created.cmd",
                "sales.order-created.evtq",
                "sales.order-created.pubq",
                "sales.order-created.rpc",
            ]
        );

        let queues: Vec<_> = topology
            .endpoints_for(&route(DeliveryPattern::BroadcastPublish))
            .map(|e| e.queue().to_string())
            .collect();
        assert_eq!(
            queues,
            vec!["sales.order-created.evtq.audit", "sales.order-created.evtq.billing"]
        );

        let cmd = topology.endpoint("sales.order-created.cmd").unwrap();
        assert_eq!(cmd.consumer(), "fulfilment");
        assert_eq!(cmd.config().shape, ConsumerShape::Command);
        assert!(topology.endpoint("sales.order-created.pubq").is_some());
        assert_eq!(topology.endpoints().count(), 5);
    }

    #[test]
    fn scheduled_patterns_share_immediate_routes() {
        assert_eq!(route(DeliveryPattern::ScheduledSend), route(DeliveryPattern::FireAndForget));
        assert_eq!(
            route(DeliveryPattern::ScheduledBroadcast),
            route(DeliveryPattern::BroadcastPublish)
        );
    }

    #[test]
    fn second_responder_is_rejected() {
        let registry = ConsumerRegistry::new().request(Echo).request(Echo);
        let err = build(&registry, MessagingOptions::default()).unwrap_err();
        assert!(matches!(err, RegistrationError::DuplicateResponder { .. }));
    }

    #[test]
    fn second_command_consumer_is_rejected() {
        let registry = ConsumerRegistry::new().command(Fulfilment).command(Fulfilment);
        let err = build(&registry, MessagingOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            RegistrationError::DuplicateBinding { ref queue, .. } if queue == "sales.order-created.cmd"
        ));
    }

    #[test]
    fn same_event_consumer_name_is_rejected() {
        let registry = ConsumerRegistry::new().event(Audit).descriptor(ConsumerDescriptor::new(
            Arc::new(EventHandler::new(Billing).named("audit")),
        ));
        let err = build(&registry, MessagingOptions::default()).unwrap_err();
        assert!(matches!(err, RegistrationError::DuplicateBinding { .. }));
    }

    #[test]
    fn declared_shape_must_match_handler() {
        let handler: Arc<dyn Handler> = Arc::new(CommandHandler::new(Fulfilment));
        let descriptor =
            ConsumerDescriptor::parse(OrderCreated::identity(), "event", handler).unwrap();
        let err = build(&ConsumerRegistry::new().descriptor(descriptor), MessagingOptions::default())
            .unwrap_err();
        assert!(matches!(
            err,
            RegistrationError::ShapeMismatch {
                declared: ConsumerShape::Event,
                actual: ConsumerShape::Command,
                ..
            }
        ));
    }

    #[test]
    fn unknown_shape_fails_at_declaration() {
        let handler: Arc<dyn Handler> = Arc::new(CommandHandler::new(Fulfilment));
        let err = ConsumerDescriptor::parse(OrderCreated::identity(), "saga", handler).unwrap_err();
        let err = RegistrationError::from(err);
        assert!(matches!(err, RegistrationError::UnknownShape(_)));
    }

    #[test]
    fn declared_identity_must_match_handler() {
        let handler: Arc<dyn Handler> = Arc::new(CommandHandler::new(Fulfilment));
        let descriptor = ConsumerDescriptor::parse(
            MessageTypeIdentity::new("OrderShipped").with_prefix("sales"),
            "command",
            handler,
        )
        .unwrap();
        let err = build(&ConsumerRegistry::new().descriptor(descriptor), MessagingOptions::default())
            .unwrap_err();
        assert!(matches!(err, RegistrationError::IdentityMismatch { .. }));
    }

    #[test]
    fn invalid_options_fail_fast() {
        let options = MessagingOptions {
            prefetch_count: 0,
            ..MessagingOptions::default()
        };
        let err = build(&ConsumerRegistry::new().command(Fulfilment), options).unwrap_err();
        assert!(matches!(err, RegistrationError::InvalidOptions(ConfigError::ZeroPrefetch)));
    }

    #[test]
    fn endpoint_config_comes_from_options() {
        let options = MessagingOptions {
            concurrent_message_limit: Some(3),
            enable_idempotency: false,
            ..MessagingOptions::default()
        };
        let topology = build(&ConsumerRegistry::new().request(Echo), options).unwrap();
        let config = topology.endpoint("sales.order-created.rpc").unwrap().config();
        assert_eq!(config.concurrency_limit, 3);
        assert_eq!(config.idempotency_window, None);
        assert_eq!(config.retry.attempts, 5);
    }
}
