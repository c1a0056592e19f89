//! Innermost service: hands the delivery to the consumer's [`Handler`].

use std::sync::Arc;
use std::task::{Context, Poll};

use tower::Service;

use super::ConsumeFuture;
use crate::consumer::Handler;
use crate::delivery::{ConsumeError, Delivery, DeliveryOutcome};

/// Adapts an `Arc<dyn Handler>` to `tower::Service<Delivery>`.
#[derive(Clone)]
pub struct HandlerService {
    handler: Arc<dyn Handler>,
}

impl HandlerService {
    #[must_use]
    pub fn new(handler: Arc<dyn Handler>) -> Self {
        Self { handler }
    }
}

impl Service<Delivery> for HandlerService {
    type Response = DeliveryOutcome;
    type Error = ConsumeError;
    type Future = ConsumeFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, delivery: Delivery) -> Self::Future {
        let handler = Arc::clone(&self.handler);
        Box::pin(async move { handler.invoke(&delivery).await })
    }
}
