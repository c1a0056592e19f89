//! End-to-end delivery scenarios over the loopback broker.
//!
//! Each test registers its own consumers, binds them to a fresh
//! `LoopbackBroker`, and drives messages through `MessageSender`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use courier_bus::{
    Acknowledgement, Broker, CommandConsumer, ConsumeContext, ConsumerRegistry, DeadLetterSink,
    Delivery, EventConsumer, LoopbackBroker, MemoryDeadLetterQueue, MemoryIdempotencyStore,
    MessageSender, MessagingOptions, PipelineDeps, Registration, RequestConsumer, SendError,
    Topology,
};
use courier_core::{
    Address, DeliveryPattern, Message, MessageType, Request, RouteName, TransportMessage,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OrderCreated {
    order_id: Uuid,
    amount_cents: i64,
    currency: String,
}

impl OrderCreated {
    fn new(amount_cents: i64) -> Self {
        Self {
            order_id: Uuid::new_v4(),
            amount_cents,
            currency: "EUR".to_string(),
        }
    }
}

impl MessageType for OrderCreated {
    const NAME: &'static str = "OrderCreated";
    const PREFIX: Option<&'static str> = Some("sales");
}

impl Message for OrderCreated {}

impl Request for OrderCreated {
    type Response = OrderDecision;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OrderDecision {
    order_id: Uuid,
    accepted: bool,
    reason: Option<String>,
}

impl MessageType for OrderDecision {
    const NAME: &'static str = "OrderDecision";
    const PREFIX: Option<&'static str> = Some("sales");
}

impl Message for OrderDecision {}

// ---------------------------------------------------------------------------
// Consumers
// ---------------------------------------------------------------------------

/// Reports every consumed order on a channel.
struct Recorder {
    name: &'static str,
    seen: mpsc::UnboundedSender<(&'static str, OrderCreated, ConsumeContext)>,
}

#[async_trait]
impl CommandConsumer for Recorder {
    type Message = OrderCreated;

    async fn consume(&self, order: OrderCreated, ctx: &ConsumeContext) -> anyhow::Result<()> {
        let _ = self.seen.send((self.name, order, ctx.clone()));
        Ok(())
    }
}

struct AuditTrail(Recorder);

#[async_trait]
impl EventConsumer for AuditTrail {
    type Event = OrderCreated;

    async fn on_event(&self, order: OrderCreated, ctx: &ConsumeContext) -> anyhow::Result<()> {
        let _ = self.0.seen.send((self.0.name, order, ctx.clone()));
        Ok(())
    }
}

struct CustomerNotifier(Recorder);

#[async_trait]
impl EventConsumer for CustomerNotifier {
    type Event = OrderCreated;

    async fn on_event(&self, order: OrderCreated, ctx: &ConsumeContext) -> anyhow::Result<()> {
        let _ = self.0.seen.send((self.0.name, order, ctx.clone()));
        Ok(())
    }
}

/// Accepts non-negative amounts.
#[derive(Default)]
struct OrderApproval {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl RequestConsumer for OrderApproval {
    type Request = OrderCreated;

    async fn respond(&self, order: OrderCreated, _ctx: &ConsumeContext) -> anyhow::Result<OrderDecision> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let accepted = order.amount_cents >= 0;
        Ok(OrderDecision {
            order_id: order.order_id,
            accepted,
            reason: (!accepted).then(|| "Negative amount".to_string()),
        })
    }
}

/// Fails the first `failures` invocations, then reports success.
struct Flaky {
    attempts: Arc<AtomicU32>,
    failures: u32,
    succeeded: mpsc::UnboundedSender<ConsumeContext>,
}

#[async_trait]
impl CommandConsumer for Flaky {
    type Message = OrderCreated;

    async fn consume(&self, _order: OrderCreated, ctx: &ConsumeContext) -> anyhow::Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.failures {
            anyhow::bail!("payment gateway unavailable (attempt {attempt})");
        }
        let _ = self.succeeded.send(ctx.clone());
        Ok(())
    }
}

/// Parks every invocation until released.
struct Gated {
    calls: Arc<AtomicU32>,
    started: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl CommandConsumer for Gated {
    type Message = OrderCreated;

    async fn consume(&self, _order: OrderCreated, _ctx: &ConsumeContext) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();
        self.release.notified().await;
        Ok(())
    }
}

struct AlwaysFails;

#[async_trait]
impl RequestConsumer for AlwaysFails {
    type Request = OrderCreated;

    async fn respond(&self, _order: OrderCreated, _ctx: &ConsumeContext) -> anyhow::Result<OrderDecision> {
        anyhow::bail!("ledger rejected the order")
    }
}

/// Never answers before the endpoint shuts down.
struct Stalled;

#[async_trait]
impl RequestConsumer for Stalled {
    type Request = OrderCreated;

    async fn respond(&self, order: OrderCreated, ctx: &ConsumeContext) -> anyhow::Result<OrderDecision> {
        ctx.cancel.cancelled().await;
        Ok(OrderDecision {
            order_id: order.order_id,
            accepted: false,
            reason: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    broker: LoopbackBroker,
    sender: MessageSender,
    topology: Topology,
    dead_letters: Arc<MemoryDeadLetterQueue>,
}

fn fast_options() -> MessagingOptions {
    MessagingOptions {
        concurrent_message_limit: Some(4),
        retry_attempts: 2,
        retry_min: Duration::from_millis(5),
        retry_max: Duration::from_millis(20),
        retry_interval_delta: Duration::from_millis(5),
        redelivery_intervals: vec![Duration::from_millis(50)],
        request_timeout: WAIT,
        ..MessagingOptions::default()
    }
}

fn start(registry: &ConsumerRegistry, options: MessagingOptions) -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let options = Arc::new(options);
    let dead_letters = Arc::new(MemoryDeadLetterQueue::new());
    let sink: Arc<dyn DeadLetterSink> = dead_letters.clone();
    let deps = PipelineDeps {
        store: Arc::new(MemoryIdempotencyStore::new()),
        unit_of_work: None,
    };
    let topology = Registration::build(registry, Arc::clone(&options), &deps, &sink)
        .expect("registration succeeds");

    let broker = LoopbackBroker::new();
    broker.bind(&topology);
    let sender = MessageSender::new(Arc::new(broker.clone()), &options);
    Harness {
        broker,
        sender,
        topology,
        dead_letters,
    }
}

fn recorder(name: &'static str, seen: &mpsc::UnboundedSender<(&'static str, OrderCreated, ConsumeContext)>) -> Recorder {
    Recorder {
        name,
        seen: seen.clone(),
    }
}

async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a delivery")
        .expect("channel closed")
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scenario_a_fire_and_forget_uses_cmd_route() {
    let route = RouteName::for_type::<OrderCreated>(DeliveryPattern::FireAndForget);
    assert_eq!(route.as_str(), "sales.order-created.cmd");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let harness = start(
        &ConsumerRegistry::new().command(recorder("fulfilment", &tx)),
        fast_options(),
    );

    let order = OrderCreated::new(12_000);
    harness
        .sender
        .send_and_forget(&order, &CancellationToken::new())
        .await
        .unwrap();

    let (_, seen, ctx) = next(&mut rx).await;
    assert_eq!(seen, order);
    assert_eq!(ctx.route, route);
    assert_eq!(ctx.queue, "sales.order-created.cmd");
    harness.broker.shutdown().await;
}

#[tokio::test]
async fn scenario_b_request_response_correlates_one_reply() {
    let route = RouteName::for_type::<OrderCreated>(DeliveryPattern::RequestResponse);
    assert_eq!(route.as_str(), "sales.order-created.rpc");

    let approval = OrderApproval::default();
    let calls = Arc::clone(&approval.calls);
    let harness = start(&ConsumerRegistry::new().request(approval), fast_options());

    let order = OrderCreated::new(4_500);
    let decision = harness
        .sender
        .send_and_wait(&order, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(decision.order_id, order.order_id);
    assert!(decision.accepted);

    let request = TransportMessage::encode(&OrderCreated::new(-100)).unwrap();
    let reply = harness
        .broker
        .request(&Address::exchange(&route), request.clone(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(reply.headers.in_reply_to, request.message_id);
    let decision: OrderDecision = reply.decode().unwrap();
    assert!(!decision.accepted);
    assert_eq!(decision.reason.as_deref(), Some("Negative amount"));

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(harness.broker.pending_requests(), 0);
    harness.broker.shutdown().await;
}

#[tokio::test]
async fn scenario_c_duplicate_message_id_is_handled_once() {
    let gated = Gated {
        calls: Arc::new(AtomicU32::new(0)),
        started: Arc::new(Notify::new()),
        release: Arc::new(Notify::new()),
    };
    let calls = Arc::clone(&gated.calls);
    let started = Arc::clone(&gated.started);
    let release = Arc::clone(&gated.release);
    let harness = start(&ConsumerRegistry::new().command(gated), fast_options());

    let endpoint = Arc::clone(harness.topology.endpoint("sales.order-created.cmd").unwrap());
    let message = TransportMessage::encode(&OrderCreated::new(800)).unwrap();
    let delivery = Delivery::new(endpoint.route().clone(), endpoint.queue(), message);

    let first = {
        let endpoint = Arc::clone(&endpoint);
        let broker = harness.broker.clone();
        let delivery = delivery.clone();
        tokio::spawn(async move { endpoint.process(delivery, &broker).await })
    };
    tokio::time::timeout(WAIT, started.notified()).await.unwrap();

    let second = endpoint.process(delivery, &harness.broker).await;
    assert_eq!(second, Acknowledgement::Duplicate);

    release.notify_one();
    assert_eq!(first.await.unwrap(), Acknowledgement::Handled);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(harness.dead_letters.is_empty());
    harness.broker.shutdown().await;
}

#[tokio::test]
async fn scenario_d_transient_failure_succeeds_on_retry() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let attempts = Arc::new(AtomicU32::new(0));
    let flaky = Flaky {
        attempts: Arc::clone(&attempts),
        failures: 1,
        succeeded: tx,
    };
    let harness = start(&ConsumerRegistry::new().command(flaky), fast_options());

    harness
        .sender
        .send_and_forget(&OrderCreated::new(300), &CancellationToken::new())
        .await
        .unwrap();

    let ctx = next(&mut rx).await;
    assert_eq!(ctx.redelivery_count, 0);
    harness.broker.shutdown().await;

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert!(rx.try_recv().is_err());
    assert!(harness.dead_letters.is_empty());
}

#[tokio::test]
async fn scenario_e_broadcast_reaches_every_event_consumer() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let harness = start(
        &ConsumerRegistry::new()
            .event(AuditTrail(recorder("audit", &tx)))
            .event(CustomerNotifier(recorder("notifier", &tx))),
        fast_options(),
    );

    let order = OrderCreated::new(9_900);
    harness
        .sender
        .publish_to_all(&order, &CancellationToken::new())
        .await
        .unwrap();

    let mut seen = vec![next(&mut rx).await, next(&mut rx).await];
    seen.sort_by_key(|(name, _, _)| *name);
    assert_eq!(seen[0].0, "audit");
    assert_eq!(seen[1].0, "notifier");
    for (_, payload, ctx) in &seen {
        assert_eq!(payload, &order);
        assert!(ctx.correlation_id.is_some());
    }
    assert_eq!(seen[0].2.queue, "sales.order-created.evtq.audit-trail");
    assert_eq!(seen[1].2.queue, "sales.order-created.evtq.customer-notifier");
    assert_eq!(seen[0].2.correlation_id, seen[1].2.correlation_id);
    harness.broker.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn scheduled_broadcast_fans_out_once_at_its_instant() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let harness = start(
        &ConsumerRegistry::new()
            .event(AuditTrail(recorder("audit", &tx)))
            .event(CustomerNotifier(recorder("notifier", &tx))),
        fast_options(),
    );
    let cancel = CancellationToken::new();

    let later = OrderCreated::new(2_500);
    harness
        .sender
        .schedule_publish(&later, Utc::now() + chrono::Duration::seconds(30), &cancel)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(rx.try_recv().is_err());

    tokio::time::sleep(Duration::from_secs(30)).await;
    let mut seen = vec![next(&mut rx).await, next(&mut rx).await];
    seen.sort_by_key(|(name, _, _)| *name);
    assert_eq!(seen[0].0, "audit");
    assert_eq!(seen[1].0, "notifier");
    assert!(seen.iter().all(|(_, payload, _)| payload == &later));
    assert_eq!(seen[0].2.correlation_id, seen[1].2.correlation_id);

    let overdue = OrderCreated::new(700);
    harness
        .sender
        .schedule_publish(&overdue, Utc::now() - chrono::Duration::seconds(5), &cancel)
        .await
        .unwrap();
    let mut seen = vec![next(&mut rx).await, next(&mut rx).await];
    seen.sort_by_key(|(name, _, _)| *name);
    assert_eq!(seen[0].0, "audit");
    assert_eq!(seen[1].0, "notifier");
    assert!(seen.iter().all(|(_, payload, _)| payload == &overdue));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(rx.try_recv().is_err());
    harness.broker.shutdown().await;
}

// ---------------------------------------------------------------------------
// Failure ladder and caller-side outcomes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn exhausted_retries_are_redelivered_then_succeed() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let attempts = Arc::new(AtomicU32::new(0));
    let flaky = Flaky {
        attempts: Arc::clone(&attempts),
        failures: 3,
        succeeded: tx,
    };
    let harness = start(&ConsumerRegistry::new().command(flaky), fast_options());

    harness
        .sender
        .publish_to_queue(&OrderCreated::new(300))
        .await
        .unwrap();

    let ctx = next(&mut rx).await;
    assert_eq!(ctx.queue, "sales.order-created.pubq");
    assert_eq!(ctx.redelivery_count, 1);
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    assert!(harness.dead_letters.is_empty());
    harness.broker.shutdown().await;
}

#[tokio::test]
async fn terminal_rpc_failure_faults_the_caller_and_dead_letters() {
    let options = MessagingOptions {
        redelivery_intervals: Vec::new(),
        ..fast_options()
    };
    let harness = start(&ConsumerRegistry::new().request(AlwaysFails), options);

    let err = harness
        .sender
        .send_and_wait(&OrderCreated::new(100), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SendError::Fault { ref reason } if reason.contains("ledger rejected")));

    let letters = harness.dead_letters.snapshot();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].queue, "sales.order-created.rpc");
    assert_eq!(letters[0].retry_attempts, 2);
    harness.broker.shutdown().await;
}

#[tokio::test]
async fn unanswered_request_times_out() {
    let harness = start(&ConsumerRegistry::new().request(Stalled), fast_options());
    let sender = harness.sender.clone().with_request_timeout(Duration::from_millis(50));

    let err = sender
        .send_and_wait(&OrderCreated::new(1), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SendError::Timeout { timeout_ms: 50 }));
    assert_eq!(harness.broker.pending_requests(), 0);
    harness.broker.shutdown().await;
}

#[tokio::test]
async fn send_without_consumer_is_unroutable() {
    let harness = start(&ConsumerRegistry::new(), fast_options());
    let err = harness
        .sender
        .send_and_forget(&OrderCreated::new(1), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SendError::Broker(_)));
}
