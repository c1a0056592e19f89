//! Dead-letter records and sinks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::{RouteName, TransportMessage};
use parking_lot::Mutex;
use serde::Serialize;

use crate::traits::DeadLetterSink;

/// A message that exhausted retries and redeliveries.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub route: RouteName,
    pub queue: String,
    pub message: TransportMessage,
    /// Last failure.
    pub reason: String,
    /// In-process retries spent on the final redelivery.
    pub retry_attempts: u32,
    pub redelivery_count: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Keeps dead letters in memory for inspection and replay.
#[derive(Debug, Default)]
pub struct MemoryDeadLetterQueue {
    letters: Mutex<Vec<DeadLetter>>,
}

impl MemoryDeadLetterQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<DeadLetter> {
        self.letters.lock().clone()
    }

    /// Removes and returns every stored letter.
    pub fn drain(&self) -> Vec<DeadLetter> {
        std::mem::take(&mut *self.letters.lock())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.letters.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.letters.lock().is_empty()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterQueue {
    async fn dead_letter(&self, letter: DeadLetter) -> anyhow::Result<()> {
        self.letters.lock().push(letter);
        Ok(())
    }
}

/// Logs dead letters at `error` and keeps nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingDeadLetterSink;

#[async_trait]
impl DeadLetterSink for LoggingDeadLetterSink {
    async fn dead_letter(&self, letter: DeadLetter) -> anyhow::Result<()> {
        let payload = serde_json::to_string(&letter.message.headers)?;
        tracing::error!(
            route = %letter.route,
            queue = %letter.queue,
            message_id = ?letter.message.message_id,
            message_type = %letter.message.message_type,
            redelivery_count = letter.redelivery_count,
            reason = %letter.reason,
            headers = %payload,
            "message dead-lettered"
        );
        Ok(())
    }
}
