//! Periodic purge of expired idempotency claims.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;

use super::memory::MemoryIdempotencyStore;
use crate::worker::BackgroundRunnable;

/// On-demand sweeper tasks.
#[derive(Debug)]
pub enum SweepTask {
    /// Purge now and report how many claims were removed.
    PurgeNow { reply: Option<oneshot::Sender<usize>> },
}

/// Purges expired claims from a [`MemoryIdempotencyStore`] on every tick.
///
/// Expired claims are already reclaimable without a sweep; the sweep only
/// bounds memory.
pub struct StoreSweeper {
    store: Arc<MemoryIdempotencyStore>,
}

impl StoreSweeper {
    #[must_use]
    pub fn new(store: Arc<MemoryIdempotencyStore>) -> Self {
        Self { store }
    }

    fn sweep(&self) -> usize {
        let purged = self.store.purge_expired();
        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!("courier_idempotency_claims").set(self.store.len() as f64);
        if purged > 0 {
            tracing::debug!(purged, remaining = self.store.len(), "expired idempotency claims purged");
        }
        purged
    }
}

#[async_trait]
impl BackgroundRunnable for StoreSweeper {
    type Task = SweepTask;

    fn name(&self) -> &'static str {
        "idempotency-sweeper"
    }

    async fn run(&mut self, task: SweepTask) {
        match task {
            SweepTask::PurgeNow { reply } => {
                let purged = self.sweep();
                if let Some(reply) = reply {
                    let _ = reply.send(purged);
                }
            }
        }
    }

    async fn on_tick(&mut self) {
        self.sweep();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use courier_core::ManualClock;

    use super::*;
    use crate::worker::BackgroundWorker;

    #[tokio::test]
    async fn purge_now_reports_removed_claims() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryIdempotencyStore::with_clock(clock.clone()));
        store.claim("a", Duration::from_secs(1));
        store.claim("b", Duration::from_secs(1));
        store.claim("c", Duration::from_secs(100));
        clock.advance(Duration::from_secs(2));

        let mut worker = BackgroundWorker::start(StoreSweeper::new(store.clone()), Duration::from_secs(60));
        let (tx, rx) = oneshot::channel();
        worker.submit(SweepTask::PurgeNow { reply: Some(tx) }).await.unwrap();

        assert_eq!(rx.await.unwrap(), 2);
        assert_eq!(store.len(), 1);
        worker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn tick_purges_in_background() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryIdempotencyStore::with_clock(clock.clone()));
        store.claim("a", Duration::from_secs(1));
        clock.advance(Duration::from_secs(2));

        let mut worker = BackgroundWorker::start(StoreSweeper::new(store.clone()), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(25)).await;

        assert!(store.is_empty());
        worker.stop().await;
    }
}
