//! In-process retry middleware.
//!
//! A failed delivery is re-run through the inner stack up to
//! `RetryPolicy::attempts` more times, waiting `RetryPolicy::delay_for(n)`
//! before retry `n`. Non-retryable errors (undecodable bodies, cancellation)
//! are returned immediately. The error of the last attempt is returned once
//! retries are exhausted; the endpoint then walks the redelivery ladder.

use std::task::{Context, Poll};

use courier_core::RetryPolicy;
use tower::{Layer, Service, ServiceExt};

use super::ConsumeFuture;
use crate::delivery::{ConsumeError, Delivery, DeliveryOutcome};

// ---------------------------------------------------------------------------
// RetryLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RetryLayer {
    policy: RetryPolicy,
}

impl RetryLayer {
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }
}

impl<S> Layer<S> for RetryLayer {
    type Service = RetryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RetryService {
            inner,
            policy: self.policy.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// RetryService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RetryService<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S> Service<Delivery> for RetryService<S>
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
        // The clone is not ready; keep the one poll_ready was called on.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let policy = self.policy.clone();

        Box::pin(async move {
            let mut attempt = 0u32;
            let mut result = inner.call(delivery.clone()).await;
            loop {
                let error = match result {
                    Ok(outcome) => return Ok(outcome),
                    Err(error) => error,
                };
                if !error.is_retryable() || attempt >= policy.attempts {
                    return Err(error);
                }

                attempt += 1;
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    route = %delivery.route,
                    attempt,
                    max_attempts = policy.attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    %error,
                    "delivery failed, retrying"
                );
                metrics::counter!("courier_retries_total", "route" => delivery.route.to_string())
                    .increment(1);

                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = delivery.cancel.cancelled() => return Err(ConsumeError::Cancelled),
                }
                result = match inner.ready().await {
                    Ok(ready) => ready.call(delivery.clone()).await,
                    Err(error) => Err(error),
                };
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
