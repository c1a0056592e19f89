//! Duplicate suppression middleware.
//!
//! Claims the delivery's [`IdempotencyKey`], scoped to the consuming queue,
//! for the idempotency window before running the inner service. A refused
//! claim means another delivery of the same logical message is in flight or
//! was handled within the window:
//! the handler is skipped and the delivery is acknowledged as
//! [`DeliveryOutcome::Duplicate`]. The claim is always completed after the
//! inner service finishes, whatever its result, so a genuine failure can be
//! retried under a fresh claim.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use courier_core::IdempotencyKey;
use tower::{Layer, Service, ServiceExt};

use super::ConsumeFuture;
use crate::delivery::{ConsumeError, Delivery, DeliveryOutcome};
use crate::traits::IdempotencyStore;

// ---------------------------------------------------------------------------
// IdempotencyLayer
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct IdempotencyLayer {
    store: Arc<dyn IdempotencyStore>,
    /// `None` disables the filter.
    window: Option<Duration>,
}

impl IdempotencyLayer {
    #[must_use]
    pub fn new(store: Arc<dyn IdempotencyStore>, window: Option<Duration>) -> Self {
        Self { store, window }
    }
}

impl<S> Layer<S> for IdempotencyLayer {
    type Service = IdempotencyService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        IdempotencyService {
            inner,
            store: Arc::clone(&self.store),
            window: self.window,
        }
    }
}

// ---------------------------------------------------------------------------
// IdempotencyService
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct IdempotencyService<S> {
    inner: S,
    store: Arc<dyn IdempotencyStore>,
    window: Option<Duration>,
}

impl<S> Service<Delivery> for IdempotencyService<S>
where
    S: Service<Delivery, Response = DeliveryOutcome, Error = ConsumeError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = DeliveryOutcome;
    type Error = ConsumeError;
    type Future = ConsumeFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, delivery: Delivery) -> Self::Future {
        let Some(window) = self.window else {
            return Box::pin(self.inner.call(delivery));
        };

        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let store = Arc::clone(&self.store);
        let key = IdempotencyKey::derive(&delivery.message).scoped(&delivery.queue);

        Box::pin(async move {
            if !store.try_start(&key, window).await? {
                tracing::warn!(
                    route = %delivery.route,
                    key = %key,
                    "duplicate delivery skipped"
                );
                metrics::counter!("courier_duplicates_total", "route" => delivery.route.to_string())
                    .increment(1);
                return Ok(DeliveryOutcome::Duplicate);
            }
            if key.is_best_effort() {
                tracing::debug!(key = %key, "idempotency key derived from content hash");
            }

            let result = inner.oneshot(delivery).await;

            if let Err(error) = store.complete(&key).await {
                // The claim still expires with the window.
                tracing::warn!(key = %key, %error, "failed to complete idempotency claim");
            }
            result
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
