//! Background worker for periodic and on-demand maintenance tasks.
//!
//! [`BackgroundWorker`] drives a [`BackgroundRunnable`]: tasks submitted over
//! an mpsc channel are run one at a time, `on_tick` fires at a fixed interval,
//! and `shutdown` runs once when the worker is stopped.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

const TASK_CHANNEL_CAPACITY: usize = 64;

/// Placeholder period for a ticker whose branch is disabled.
const IDLE_TICK: Duration = Duration::from_secs(3600);

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Task handler executed by [`BackgroundWorker`].
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    /// On-demand task type.
    type Task: Send + 'static;

    /// Short name used in logs.
    fn name(&self) -> &'static str;

    async fn run(&mut self, task: Self::Task);

    /// Called on every tick. Default is a no-op.
    async fn on_tick(&mut self) {}

    /// Called once when the worker stops. Default is a no-op.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Handle to a spawned background task.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: Option<mpsc::Sender<R::Task>>,
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Spawns the worker. The first tick fires one `tick` after start.
    /// A zero `tick` disables `on_tick`; submitted tasks still run.
    pub fn start(runnable: R, tick: Duration) -> Self {
        Self::start_with_token(runnable, tick, &CancellationToken::new())
    }

    /// Spawns the worker, also stopping when `parent` is cancelled.
    pub fn start_with_token(mut runnable: R, tick: Duration, parent: &CancellationToken) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Task>(TASK_CHANNEL_CAPACITY);
        let stop = parent.child_token();
        let token = stop.clone();

        let periodic = !tick.is_zero();
        if !periodic {
            tracing::warn!(worker = runnable.name(), "zero tick interval, periodic ticks disabled");
        }

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(if periodic { tick } else { IDLE_TICK });
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            tracing::debug!(worker = runnable.name(), "background worker started");
            loop {
                tokio::select! {
                    task = rx.recv() => match task {
                        Some(task) => runnable.run(task).await,
                        None => break,
                    },
                    _ = ticker.tick(), if periodic => runnable.on_tick().await,
                    () = token.cancelled() => break,
                }
            }

            runnable.shutdown().await;
            tracing::debug!(worker = runnable.name(), "background worker stopped");
        });

        Self {
            tx: Some(tx),
            stop,
            handle: Some(handle),
        }
    }

    /// Queues an on-demand task.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker has stopped.
    pub async fn submit(&self, task: R::Task) -> anyhow::Result<()> {
        let Some(tx) = &self.tx else {
            anyhow::bail!("worker not running");
        };
        tx.send(task)
            .await
            .map_err(|_| anyhow::anyhow!("worker channel closed"))
    }

    /// Stops the worker and waits for `shutdown` to finish.
    pub async fn stop(&mut self) {
        self.stop.cancel();
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if let Err(error) = handle.await {
                tracing::warn!(%error, "background worker task failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
