//! Tower middleware layers for the consume pipeline.
//!
//! - [`logging`]: `consume` span, outcome logging and metrics
//! - [`concurrency`]: per-endpoint bound on concurrent handler invocations
//! - [`retry`]: in-process exponential retries
//! - [`idempotency`]: duplicate suppression through the claim store
//! - [`transaction`]: unit-of-work commit after a successful handler
//! - [`handler`]: the innermost service invoking the consumer
//! - [`pipeline`]: composes all layers into a single service stack

use std::future::Future;
use std::pin::Pin;

use crate::delivery::{ConsumeError, DeliveryOutcome};

pub mod concurrency;
pub mod handler;
pub mod idempotency;
pub mod logging;
pub mod pipeline;
pub mod retry;
pub mod transaction;

pub use concurrency::ConcurrencyLimitLayer;
pub use handler::HandlerService;
pub use idempotency::IdempotencyLayer;
pub use logging::LoggingLayer;
pub use pipeline::{build_consume_pipeline, ConsumePipeline, PipelineDeps};
pub use retry::RetryLayer;
pub use transaction::TransactionLayer;

/// Boxed future returned by every consume-pipeline service.
pub type ConsumeFuture = Pin<Box<dyn Future<Output = Result<DeliveryOutcome, ConsumeError>> + Send>>;
