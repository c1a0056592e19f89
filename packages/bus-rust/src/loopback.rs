//! In-process broker for single-process use and tests.
//!
//! Each bound endpoint gets a bounded channel sized by its prefetch count and
//! a dispatch task that hands deliveries to [`ReceiveEndpoint::process`],
//! keeping at most `prefetch_count` deliveries in flight. Exchanges are route
//! names: a send goes to the first queue bound to the route, a publish fans
//! out to all of them. Requests are answered through a private reply queue
//! and a pending-reply table keyed by the request's message id.
//!
//! Nothing is persisted; messages still queued at shutdown are lost.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::{Address, TransportMessage};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::delivery::{BrokerError, Delivery};
use crate::endpoint::ReceiveEndpoint;
use crate::registration::Topology;
use crate::traits::Broker;

type PendingReplies = DashMap<Uuid, oneshot::Sender<TransportMessage>>;

struct LoopbackInner {
    /// Queue name -> inbound channel of the endpoint consuming it.
    queues: DashMap<String, mpsc::Sender<TransportMessage>>,
    /// Route name -> bound queues, in binding order.
    bindings: DashMap<String, Vec<String>>,
    pending: PendingReplies,
    reply_queue: String,
    shutdown: CancellationToken,
    dispatchers: Mutex<Vec<JoinHandle<()>>>,
}

/// Cheaply cloneable handle to an in-process broker.
#[derive(Clone)]
pub struct LoopbackBroker {
    inner: Arc<LoopbackInner>,
}

/// Where a `send_to` ends up.
enum Target {
    Reply,
    Queue(String),
}

impl LoopbackBroker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LoopbackInner {
                queues: DashMap::new(),
                bindings: DashMap::new(),
                pending: DashMap::new(),
                reply_queue: format!("courier.replies.{}", Uuid::new_v4().simple()),
                shutdown: CancellationToken::new(),
                dispatchers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Creates a queue and a dispatch task for every endpoint of `topology`
    /// and binds the queues to their routes.
    ///
    /// Endpoints whose queue is already bound are skipped. Must be called
    /// from within a Tokio runtime.
    pub fn bind(&self, topology: &Topology) {
        for route in topology.routes() {
            for endpoint in topology.endpoints_for(route) {
                let queue = endpoint.queue().to_string();
                if self.inner.queues.contains_key(&queue) {
                    continue;
                }
                let capacity = usize::from(endpoint.config().prefetch_count).max(1);
                let (tx, rx) = mpsc::channel(capacity);
                self.inner.queues.insert(queue.clone(), tx);
                self.inner
                    .bindings
                    .entry(route.to_string())
                    .or_default()
                    .push(queue.clone());

                let handle = tokio::spawn(self.clone().dispatch(Arc::clone(endpoint), rx, capacity));
                self.inner.dispatchers.lock().push(handle);
                tracing::debug!(route = %route, queue = %queue, "queue bound");
            }
        }
    }

    /// Queues bound to `route`, in binding order.
    #[must_use]
    pub fn bound_queues(&self, route: &str) -> Vec<String> {
        self.inner
            .bindings
            .get(route)
            .map(|queues| queues.value().clone())
            .unwrap_or_default()
    }

    /// Requests still waiting for a reply.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Stops accepting messages, cancels in-flight deliveries and waits for
    /// every dispatch task to finish.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handles = std::mem::take(&mut *self.inner.dispatchers.lock());
        for handle in handles {
            if let Err(error) = handle.await {
                tracing::error!(%error, "dispatch task panicked");
            }
        }
        tracing::info!("loopback broker stopped");
    }

    async fn dispatch(self, endpoint: Arc<ReceiveEndpoint>, mut rx: mpsc::Receiver<TransportMessage>, prefetch: usize) {
        let shutdown = self.inner.shutdown.clone();
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                received = rx.recv(), if in_flight.len() < prefetch => {
                    let Some(message) = received else { break };
                    let delivery = Delivery::new(endpoint.route().clone(), endpoint.queue(), message)
                        .with_cancel(shutdown.child_token());
                    let endpoint = Arc::clone(&endpoint);
                    let broker = self.clone();
                    in_flight.spawn(async move {
                        let ack = endpoint.process(delivery, &broker).await;
                        tracing::debug!(queue = endpoint.queue(), ?ack, "delivery settled");
                    });
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(error) = joined {
                        tracing::error!(queue = endpoint.queue(), %error, "delivery task panicked");
                    }
                }
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            if let Err(error) = joined {
                tracing::error!(queue = endpoint.queue(), %error, "delivery task panicked");
            }
        }
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.is_closed() {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }

    fn resolve(&self, address: &Address) -> Result<Target, BrokerError> {
        let unroutable = || BrokerError::Unroutable {
            address: address.to_string(),
        };
        match address {
            Address::Queue(name) if *name == self.inner.reply_queue => Ok(Target::Reply),
            Address::Queue(name) if self.inner.queues.contains_key(name) => Ok(Target::Queue(name.clone())),
            Address::Queue(_) => Err(unroutable()),
            Address::Exchange(route) => self
                .inner
                .bindings
                .get(route)
                .and_then(|queues| queues.first().cloned())
                .map(Target::Queue)
                .ok_or_else(unroutable),
        }
    }

    async fn enqueue(&self, queue: &str, message: TransportMessage, cancel: &CancellationToken) -> Result<(), BrokerError> {
        let sender = self
            .inner
            .queues
            .get(queue)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BrokerError::Unroutable {
                address: Address::queue(queue).to_string(),
            })?;
        tokio::select! {
            () = cancel.cancelled() => Err(BrokerError::Cancelled),
            () = self.inner.shutdown.cancelled() => Err(BrokerError::Closed),
            sent = sender.send(message) => sent.map_err(|_| BrokerError::Closed),
        }
    }

    fn complete_reply(&self, reply: TransportMessage) {
        let waiter = reply
            .headers
            .in_reply_to
            .and_then(|id| self.inner.pending.remove(&id));
        match waiter {
            Some((_, tx)) => {
                // The requester may have given up already.
                let _ = tx.send(reply);
            }
            None => tracing::debug!(
                in_reply_to = ?reply.headers.in_reply_to,
                "reply without a waiting request dropped"
            ),
        }
    }

    /// Runs `deliver` after `delay` unless the broker shuts down first.
    fn spawn_scheduled<F>(&self, delay: Duration, deliver: F)
    where
        F: std::future::Future<Output = Result<(), BrokerError>> + Send + 'static,
    {
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = shutdown.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    if let Err(error) = deliver.await {
                        tracing::warn!(%error, "scheduled delivery failed");
                    }
                }
            }
        });
    }
}

impl Default for LoopbackBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LoopbackBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackBroker")
            .field("queues", &self.inner.queues.len())
            .field("pending", &self.inner.pending.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Removes a pending-reply entry when the request future ends, however it ends.
struct PendingGuard<'a> {
    pending: &'a PendingReplies,
    id: Uuid,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

fn delay_until(at: DateTime<Utc>) -> Duration {
    (at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

#[async_trait]
impl Broker for LoopbackBroker {
    async fn send_to(&self, address: &Address, message: TransportMessage, cancel: &CancellationToken) -> Result<(), BrokerError> {
        self.ensure_open()?;
        match self.resolve(address)? {
            Target::Reply => {
                self.complete_reply(message);
                Ok(())
            }
            Target::Queue(queue) => self.enqueue(&queue, message, cancel).await,
        }
    }

    async fn publish(&self, topic: &Address, message: TransportMessage, cancel: &CancellationToken) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let queues = self.bound_queues(topic.name());
        if queues.is_empty() {
            tracing::debug!(topic = %topic, "no subscribers, event dropped");
            return Ok(());
        }
        for queue in &queues {
            self.enqueue(queue, message.clone(), cancel).await?;
        }
        Ok(())
    }

    async fn request(&self, address: &Address, message: TransportMessage, cancel: &CancellationToken) -> Result<TransportMessage, BrokerError> {
        self.ensure_open()?;
        let id = message.message_id.unwrap_or_else(Uuid::new_v4);
        let mut message = message.with_reply_to(Address::queue(self.inner.reply_queue.clone()));
        message.message_id = Some(id);

        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(id, tx);
        let _guard = PendingGuard {
            pending: &self.inner.pending,
            id,
        };

        self.send_to(address, message, cancel).await?;
        tokio::select! {
            () = cancel.cancelled() => Err(BrokerError::Cancelled),
            () = self.inner.shutdown.cancelled() => Err(BrokerError::Closed),
            reply = rx => reply.map_err(|_| BrokerError::Closed),
        }
    }

    async fn schedule_send(&self, address: &Address, at: DateTime<Utc>, message: TransportMessage, _cancel: &CancellationToken) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.resolve(address)?;
        let broker = self.clone();
        let address = address.clone();
        self.spawn_scheduled(delay_until(at), async move {
            broker.send_to(&address, message, &CancellationToken::new()).await
        });
        Ok(())
    }

    async fn schedule_publish(&self, topic: &Address, at: DateTime<Utc>, message: TransportMessage, _cancel: &CancellationToken) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let broker = self.clone();
        let topic = topic.clone();
        self.spawn_scheduled(delay_until(at), async move {
            broker.publish(&topic, message, &CancellationToken::new()).await
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use courier_core::{DeliveryPattern, Message, MessageType, RouteName};
    use serde::{Deserialize, Serialize};
    use tokio::sync::Notify;

    use super::*;
    use crate::config::MessagingOptions;
    use crate::consumer::{CommandConsumer, ConsumeContext};
    use crate::dead_letter::MemoryDeadLetterQueue;
    use crate::middleware::PipelineDeps;
    use crate::registration::{ConsumerRegistry, Registration};
    use crate::store::MemoryIdempotencyStore;
    use crate::traits::DeadLetterSink;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    impl MessageType for Ping {
        const NAME: &'static str = "Ping";
    }

    impl Message for Ping {}

    #[derive(Clone, Default)]
    struct Counter {
        seen: Arc<AtomicU32>,
        notify: Arc<Notify>,
    }

    #[async_trait]
    impl CommandConsumer for Counter {
        type Message = Ping;

        async fn consume(&self, _message: Ping, _ctx: &ConsumeContext) -> anyhow::Result<()> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            self.notify.notify_one();
            Ok(())
        }
    }

    fn bound(counter: Counter) -> LoopbackBroker {
        let deps = PipelineDeps {
            store: Arc::new(MemoryIdempotencyStore::new()),
            unit_of_work: None,
        };
        let dead_letters: Arc<dyn DeadLetterSink> = Arc::new(MemoryDeadLetterQueue::new());
        let topology = Registration::build(
            &ConsumerRegistry::new().command(counter),
            Arc::new(MessagingOptions::default()),
            &deps,
            &dead_letters,
        )
        .unwrap();
        let broker = LoopbackBroker::new();
        broker.bind(&topology);
        broker
    }

    fn ping(n: u32) -> TransportMessage {
        TransportMessage::encode(&Ping { n }).unwrap()
    }

    fn cmd() -> Address {
        Address::exchange(&RouteName::for_type::<Ping>(DeliveryPattern::FireAndForget))
    }

    #[tokio::test]
    async fn exchange_send_reaches_bound_endpoint() {
        let counter = Counter::default();
        let broker = bound(counter.clone());
        assert_eq!(broker.bound_queues("ping.cmd"), vec!["ping.cmd".to_string()]);

        broker.send_to(&cmd(), ping(1), &CancellationToken::new()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), counter.notify.notified())
            .await
            .unwrap();
        assert_eq!(counter.seen.load(Ordering::SeqCst), 1);
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn unbound_route_is_unroutable() {
        let broker = LoopbackBroker::new();
        let err = broker.send_to(&cmd(), ping(1), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, BrokerError::Unroutable { ref address } if address == "exchange:ping.cmd"));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_dropped() {
        let broker = LoopbackBroker::new();
        let topic = Address::exchange(&RouteName::for_type::<Ping>(DeliveryPattern::BroadcastPublish));
        broker.publish(&topic, ping(1), &CancellationToken::new()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_fan_out_keeps_earlier_queues() {
        let broker = LoopbackBroker::new();
        let (open_tx, mut open_rx) = mpsc::channel(1);
        let (full_tx, _full_rx) = mpsc::channel(1);
        full_tx.try_send(ping(0)).unwrap();
        broker.inner.queues.insert("ping.evtq.first".to_string(), open_tx);
        broker.inner.queues.insert("ping.evtq.second".to_string(), full_tx);
        broker.inner.bindings.insert(
            "ping.evtq".to_string(),
            vec!["ping.evtq.first".to_string(), "ping.evtq.second".to_string()],
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let topic = Address::exchange(&RouteName::for_type::<Ping>(DeliveryPattern::BroadcastPublish));
        let err = broker.publish(&topic, ping(7), &cancel).await.unwrap_err();
        assert!(matches!(err, BrokerError::Cancelled));

        let delivered: Ping = open_rx.try_recv().unwrap().decode().unwrap();
        assert_eq!(delivered.n, 7);
    }

    #[tokio::test]
    async fn reply_completes_pending_request_once() {
        let broker = LoopbackBroker::new();
        let (tx, rx) = oneshot::channel();
        let id = Uuid::new_v4();
        broker.inner.pending.insert(id, tx);

        let mut reply = ping(2);
        reply.headers.in_reply_to = Some(id);
        let reply_to = Address::queue(broker.inner.reply_queue.clone());
        broker.send_to(&reply_to, reply.clone(), &CancellationToken::new()).await.unwrap();
        // A second reply finds no waiter and is dropped.
        broker.send_to(&reply_to, reply, &CancellationToken::new()).await.unwrap();

        assert_eq!(rx.await.unwrap().headers.in_reply_to, Some(id));
        assert_eq!(broker.pending_requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_send_waits_for_instant() {
        let counter = Counter::default();
        let broker = bound(counter.clone());
        let at = Utc::now() + chrono::Duration::seconds(30);
        broker
            .schedule_send(&cmd(), at, ping(3), &CancellationToken::new())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(counter.seen.load(Ordering::SeqCst), 0);

        tokio::time::timeout(Duration::from_secs(60), counter.notify.notified())
            .await
            .unwrap();
        assert_eq!(counter.seen.load(Ordering::SeqCst), 1);
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn closed_broker_rejects_sends() {
        let broker = bound(Counter::default());
        broker.shutdown().await;
        assert!(broker.is_closed());
        let err = broker.send_to(&cmd(), ping(1), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, BrokerError::Closed));
    }
}
