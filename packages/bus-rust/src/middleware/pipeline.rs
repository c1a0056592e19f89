//! Pipeline composition: wraps a [`Handler`] with every consume layer.

use std::sync::Arc;

use tower::util::BoxCloneService;
use tower::ServiceBuilder;

use super::concurrency::ConcurrencyLimitLayer;
use super::handler::HandlerService;
use super::idempotency::IdempotencyLayer;
use super::logging::LoggingLayer;
use super::retry::RetryLayer;
use super::transaction::TransactionLayer;
use crate::consumer::Handler;
use crate::delivery::{ConsumeError, Delivery, DeliveryOutcome};
use crate::endpoint::EndpointConfig;
use crate::traits::{IdempotencyStore, UnitOfWork};

/// The composed, type-erased consume pipeline of one endpoint.
pub type ConsumePipeline = BoxCloneService<Delivery, DeliveryOutcome, ConsumeError>;

/// Shared collaborators the pipeline layers need.
#[derive(Clone)]
pub struct PipelineDeps {
    pub store: Arc<dyn IdempotencyStore>,
    pub unit_of_work: Option<Arc<dyn UnitOfWork>>,
}

/// Build the consume pipeline around `handler`.
///
/// Layer order (outermost to innermost):
/// 1. `LoggingLayer` -- span, outcome and metrics for the whole delivery
/// 2. `ConcurrencyLimitLayer` -- wait for one of the endpoint's permits
/// 3. `RetryLayer` -- in-process retries; each retry re-enters the layers below
/// 4. `IdempotencyLayer` -- claim, skip duplicates, always complete
/// 5. `TransactionLayer` -- commit after the handler succeeds
/// 6. `HandlerService` -- decode and invoke the consumer
#[must_use]
pub fn build_consume_pipeline(
    handler: Arc<dyn Handler>,
    config: &EndpointConfig,
    deps: &PipelineDeps,
) -> ConsumePipeline {
    let service = ServiceBuilder::new()
        .layer(LoggingLayer)
        .layer(ConcurrencyLimitLayer::new(config.concurrency_limit))
        .layer(RetryLayer::new(config.retry.clone()))
        .layer(IdempotencyLayer::new(
            Arc::clone(&deps.store),
            config.idempotency_window,
        ))
        .layer(TransactionLayer::new(deps.unit_of_work.clone()))
        .service(HandlerService::new(handler));
    BoxCloneService::new(service)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
