//! Logging middleware for consumption.
//!
//! Runs every delivery inside a `consume` span, records its duration and
//! outcome, and counts it in `courier_consumed_total{route,outcome}`.

use std::task::{Context, Poll};
use std::time::Instant;

use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use super::ConsumeFuture;
use crate::delivery::{ConsumeError, Delivery, DeliveryOutcome};

// ---------------------------------------------------------------------------
// LoggingLayer
// ---------------------------------------------------------------------------

/// Tower layer instrumenting deliveries with a span, a log line and metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingLayer;

impl<S> Layer<S> for LoggingLayer {
    type Service = LoggingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoggingService { inner }
    }
}

// ---------------------------------------------------------------------------
// LoggingService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoggingService<S> {
    inner: S,
}

impl<S> Service<Delivery> for LoggingService<S>
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
        let route = delivery.route.to_string();
        let span = info_span!(
            "consume",
            route = %route,
            queue = %delivery.queue,
            message_id = ?delivery.message.message_id,
            message_type = %delivery.message.message_type,
            redelivery = delivery.message.headers.redelivery_count,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(delivery);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

                let outcome = match &result {
                    Ok(outcome) => outcome.label(),
                    Err(error) => error.label(),
                };
                let span = tracing::Span::current();
                span.record("duration_ms", duration_ms);
                span.record("outcome", outcome);

                match &result {
                    Ok(_) => tracing::info!(duration_ms, outcome, "delivery consumed"),
                    Err(error) => tracing::error!(duration_ms, outcome, %error, "delivery failed"),
                }
                metrics::counter!("courier_consumed_total", "route" => route, "outcome" => outcome)
                    .increment(1);

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
