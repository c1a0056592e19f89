//! Concurrency-limiting middleware for consumption.
//!
//! Bounds how many deliveries of one endpoint run their handlers at once.
//! Deliveries beyond the limit wait for a permit rather than being rejected,
//! so the broker's prefetch window provides the backpressure.

use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::Semaphore;
use tower::{Layer, Service};

use super::ConsumeFuture;
use crate::delivery::{ConsumeError, Delivery, DeliveryOutcome};

// ---------------------------------------------------------------------------
// ConcurrencyLimitLayer
// ---------------------------------------------------------------------------

/// Tower layer sharing one semaphore across every clone of the wrapped service.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimitLayer {
    semaphore: Arc<Semaphore>,
}

impl ConcurrencyLimitLayer {
    /// Allows `limit` concurrent deliveries (at least one).
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit.max(1))),
        }
    }
}

impl<S> Layer<S> for ConcurrencyLimitLayer {
    type Service = ConcurrencyLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ConcurrencyLimitService {
            inner,
            semaphore: Arc::clone(&self.semaphore),
        }
    }
}

// ---------------------------------------------------------------------------
// ConcurrencyLimitService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ConcurrencyLimitService<S> {
    inner: S,
    semaphore: Arc<Semaphore>,
}

impl<S> Service<Delivery> for ConcurrencyLimitService<S>
where
    S: Service<Delivery, Response = DeliveryOutcome, Error = ConsumeError> + Send,
    S::Future: Send + 'static,
{
    type Response = DeliveryOutcome;
    type Error = ConsumeError;
    type Future = ConsumeFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, delivery: Delivery) -> Self::Future {
        let semaphore = Arc::clone(&self.semaphore);
        let cancel = delivery.cancel.clone();
        let fut = self.inner.call(delivery);
        Box::pin(async move {
            let permit = tokio::select! {
                permit = semaphore.acquire_owned() => permit.map_err(|_| ConsumeError::Cancelled)?,
                () = cancel.cancelled() => return Err(ConsumeError::Cancelled),
            };
            let result = fut.await;
            drop(permit);
            result
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
