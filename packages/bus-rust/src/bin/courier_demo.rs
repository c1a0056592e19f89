//! Drives every delivery pattern over the in-process loopback broker.
//!
//! ```text
//! RUST_LOG=courier_bus=debug,info courier-demo --retry-min-ms 100 --json-logs
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use clap::Parser;
use courier_bus::{
    BackgroundWorker, CommandConsumer, ConsumeContext, ConsumerRegistry, DeadLetterSink,
    EventConsumer, LoopbackBroker, MemoryDeadLetterQueue, MemoryIdempotencyStore, MessageSender,
    MessagingArgs, MessagingOptions, PipelineDeps, Registration, RequestConsumer, StoreSweeper,
};
use courier_core::{Message, MessageType, Request};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "courier-demo", about = "Courier delivery patterns over a loopback broker")]
struct Cli {
    #[command(flatten)]
    messaging: MessagingArgs,

    /// Emit logs as JSON lines
    #[arg(long, env = "COURIER_JSON_LOGS")]
    json_logs: bool,

    /// How long to wait for scheduled deliveries before shutting down
    #[arg(long, env = "COURIER_LINGER_MS", default_value_t = 1_500)]
    linger_ms: u64,
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderCreated {
    order_id: Uuid,
    total_amount: f64,
    currency: String,
}

impl OrderCreated {
    fn new(total_amount: f64, currency: &str) -> Self {
        Self {
            order_id: Uuid::new_v4(),
            total_amount,
            currency: currency.to_string(),
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

#[derive(Debug, Clone, Serialize, Deserialize)]
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

struct Fulfilment;

#[async_trait]
impl CommandConsumer for Fulfilment {
    type Message = OrderCreated;

    async fn consume(&self, order: OrderCreated, ctx: &ConsumeContext) -> anyhow::Result<()> {
        tracing::info!(
            queue = %ctx.queue,
            order_id = %order.order_id,
            amount = order.total_amount,
            currency = %order.currency,
            "fulfilling order"
        );
        Ok(())
    }
}

struct OrderApproval;

#[async_trait]
impl RequestConsumer for OrderApproval {
    type Request = OrderCreated;

    async fn respond(&self, order: OrderCreated, _ctx: &ConsumeContext) -> anyhow::Result<OrderDecision> {
        let accepted = order.total_amount >= 0.0;
        Ok(OrderDecision {
            order_id: order.order_id,
            accepted,
            reason: (!accepted).then(|| "Negative amount".to_string()),
        })
    }
}

struct AuditTrail;

#[async_trait]
impl EventConsumer for AuditTrail {
    type Event = OrderCreated;

    async fn on_event(&self, order: OrderCreated, ctx: &ConsumeContext) -> anyhow::Result<()> {
        tracing::info!(
            order_id = %order.order_id,
            correlation_id = ?ctx.correlation_id,
            "order recorded in audit trail"
        );
        Ok(())
    }
}

struct CustomerNotifier;

#[async_trait]
impl EventConsumer for CustomerNotifier {
    type Event = OrderCreated;

    async fn on_event(&self, order: OrderCreated, _ctx: &ConsumeContext) -> anyhow::Result<()> {
        tracing::info!(order_id = %order.order_id, "customer notified");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let options = Arc::new(MessagingOptions::from(cli.messaging));
    options.validate()?;
    let store = Arc::new(MemoryIdempotencyStore::new());
    let mut sweeper = BackgroundWorker::start(
        StoreSweeper::new(Arc::clone(&store)),
        options.idempotency_sweep_interval,
    );
    let dead_letters = Arc::new(MemoryDeadLetterQueue::new());
    let sink: Arc<dyn DeadLetterSink> = dead_letters.clone();

    let registry = ConsumerRegistry::new()
        .command(Fulfilment)
        .request(OrderApproval)
        .event(AuditTrail)
        .event(CustomerNotifier);
    let deps = PipelineDeps {
        store,
        unit_of_work: None,
    };
    let topology = Registration::build(&registry, Arc::clone(&options), &deps, &sink)?;
    for route in topology.routes() {
        tracing::info!(route = %route, queues = topology.endpoints_for(route).count(), "route ready");
    }

    let broker = LoopbackBroker::new();
    broker.bind(&topology);
    let sender = MessageSender::new(Arc::new(broker.clone()), &options);
    let cancel = CancellationToken::new();

    let order = OrderCreated::new(120.0, "EUR");
    sender.send_and_forget(&order, &cancel).await?;

    let decision = sender.send_and_wait(&order, &cancel).await?;
    tracing::info!(order_id = %decision.order_id, accepted = decision.accepted, "order approval answered");
    let refund = OrderCreated::new(-5.0, "EUR");
    let decision = sender.send_and_wait(&refund, &cancel).await?;
    tracing::info!(
        order_id = %decision.order_id,
        accepted = decision.accepted,
        reason = decision.reason.as_deref().unwrap_or(""),
        "order approval answered"
    );

    sender.publish_to_queue(&order).await?;
    sender.publish_to_all(&order, &cancel).await?;

    let soon = Utc::now() + chrono::Duration::milliseconds(500);
    let orders = sender.typed::<OrderCreated>();
    orders.schedule(&OrderCreated::new(42.0, "USD"), soon, &cancel).await?;
    orders.schedule_publish(&OrderCreated::new(7.5, "GBP"), soon, &cancel).await?;

    tokio::time::sleep(Duration::from_millis(cli.linger_ms)).await;
    broker.shutdown().await;
    sweeper.stop().await;

    tracing::info!(dead_letters = dead_letters.len(), "demo finished");
    Ok(())
}
