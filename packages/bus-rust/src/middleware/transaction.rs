//! Transactional boundary: commits the [`UnitOfWork`] after the handler succeeds.
//!
//! Nothing is committed when the handler fails. A failed commit fails the
//! delivery, which is then retried like any other failure.

use std::sync::Arc;
use std::task::{Context, Poll};

use tower::{Layer, Service};

use super::ConsumeFuture;
use crate::delivery::{ConsumeError, Delivery, DeliveryOutcome};
use crate::traits::UnitOfWork;

#[derive(Clone, Default)]
pub struct TransactionLayer {
    unit_of_work: Option<Arc<dyn UnitOfWork>>,
}

impl TransactionLayer {
    /// `None` makes the layer a pass-through.
    #[must_use]
    pub fn new(unit_of_work: Option<Arc<dyn UnitOfWork>>) -> Self {
        Self { unit_of_work }
    }
}

impl<S> Layer<S> for TransactionLayer {
    type Service = TransactionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TransactionService {
            inner,
            unit_of_work: self.unit_of_work.clone(),
        }
    }
}

#[derive(Clone)]
pub struct TransactionService<S> {
    inner: S,
    unit_of_work: Option<Arc<dyn UnitOfWork>>,
}

impl<S> Service<Delivery> for TransactionService<S>
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
        let fut = self.inner.call(delivery);
        let Some(unit_of_work) = self.unit_of_work.clone() else {
            return Box::pin(fut);
        };
        Box::pin(async move {
            let outcome = fut.await?;
            unit_of_work.commit().await.map_err(ConsumeError::Commit)?;
            Ok(outcome)
        })
    }
}
