//! Courier Bus: sender, consumer shapes, consume pipeline, idempotency,
//! retry/redelivery, and consumer registration over a pluggable broker.

pub mod config;
pub mod consumer;
pub mod dead_letter;
pub mod delivery;
pub mod endpoint;
pub mod loopback;
pub mod middleware;
pub mod registration;
pub mod sender;
pub mod store;
pub mod traits;
pub mod worker;

pub use config::{ConfigError, MessagingArgs, MessagingOptions};
pub use consumer::{
    CommandConsumer, CommandHandler, ConsumeContext, EventConsumer, EventHandler, Handler,
    RequestConsumer, RequestHandler,
};
pub use dead_letter::{DeadLetter, LoggingDeadLetterSink, MemoryDeadLetterQueue};
pub use delivery::{BrokerError, ConsumeError, Delivery, DeliveryOutcome, SendError, StoreError};
pub use endpoint::{Acknowledgement, EndpointConfig, ReceiveEndpoint};
pub use loopback::LoopbackBroker;
pub use middleware::{build_consume_pipeline, ConsumePipeline, PipelineDeps};
pub use registration::{
    ConsumerDescriptor, ConsumerRegistry, Registration, RegistrationError, Topology,
};
pub use sender::{MessageSender, TypedSender};
pub use store::{MemoryIdempotencyStore, StoreSweeper, SweepTask};
pub use traits::{Broker, DeadLetterSink, IdempotencyStore, UnitOfWork};
pub use worker::{BackgroundRunnable, BackgroundWorker};
