//! Messaging configuration.
//!
//! [`MessagingOptions`] is built once at startup, validated, and shared as an
//! `Arc`. Nothing mutates it afterwards. [`MessagingArgs`] maps every option to
//! a command-line flag and a `COURIER_*` environment variable.

use std::time::Duration;

use clap::{ArgAction, Args};
use courier_core::{FailureLadder, RedeliveryPolicy, RetryPolicy};

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Invalid option combinations rejected by [`MessagingOptions::validate`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("retry_min ({min_ms}ms) must not exceed retry_max ({max_ms}ms)")]
    RetryBounds { min_ms: u128, max_ms: u128 },
    #[error("prefetch_count must be at least 1")]
    ZeroPrefetch,
    #[error("concurrent_message_limit must be at least 1 when set")]
    ZeroConcurrency,
    #[error("idempotency_window must be non-zero while idempotency is enabled")]
    ZeroIdempotencyWindow,
    #[error("request_timeout must be non-zero")]
    ZeroRequestTimeout,
    #[error("redelivery interval #{index} is zero")]
    ZeroRedeliveryInterval { index: usize },
    #[error("max_priority must be at least 1 when priority is enabled")]
    ZeroMaxPriority,
    #[error("idempotency_sweep_interval must be non-zero")]
    ZeroSweepInterval,
}

// ---------------------------------------------------------------------------
// MessagingOptions
// ---------------------------------------------------------------------------

/// Static broker and consumer settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagingOptions {
    pub host: String,
    pub vhost: String,
    pub username: String,
    pub password: String,
    /// Messages the broker may push ahead of acknowledgement, per endpoint.
    pub prefetch_count: u16,
    /// Concurrent handler invocations per endpoint. `None` uses the prefetch count.
    pub concurrent_message_limit: Option<usize>,
    pub retry_attempts: u32,
    pub retry_min: Duration,
    pub retry_max: Duration,
    pub retry_interval_delta: Duration,
    /// Out-of-band redelivery delays, tried in order after in-process retries.
    pub redelivery_intervals: Vec<Duration>,
    pub configure_dead_letter: bool,
    /// Schedule through the broker's delayed-message plugin instead of a scheduler queue.
    pub use_delayed_message_scheduler: bool,
    pub use_quorum_queues: bool,
    pub enable_priority: bool,
    pub max_priority: u8,
    pub enable_idempotency: bool,
    pub idempotency_window: Duration,
    /// How long `send_and_wait` waits for a response.
    pub request_timeout: Duration,
    /// How often expired idempotency claims are swept from the in-memory store.
    pub idempotency_sweep_interval: Duration,
}

impl Default for MessagingOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            vhost: "/".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            prefetch_count: 32,
            concurrent_message_limit: None,
            retry_attempts: 5,
            retry_min: Duration::from_secs(1),
            retry_max: Duration::from_secs(30),
            retry_interval_delta: Duration::from_secs(2),
            redelivery_intervals: vec![
                Duration::from_secs(10),
                Duration::from_secs(30),
                Duration::from_secs(120),
            ],
            configure_dead_letter: true,
            use_delayed_message_scheduler: false,
            use_quorum_queues: false,
            enable_priority: false,
            max_priority: 10,
            enable_idempotency: true,
            idempotency_window: Duration::from_secs(600),
            request_timeout: Duration::from_secs(30),
            idempotency_sweep_interval: Duration::from_secs(60),
        }
    }
}

impl MessagingOptions {
    /// Checks option combinations that cannot work together.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_min > self.retry_max {
            return Err(ConfigError::RetryBounds {
                min_ms: self.retry_min.as_millis(),
                max_ms: self.retry_max.as_millis(),
            });
        }
        if self.prefetch_count == 0 {
            return Err(ConfigError::ZeroPrefetch);
        }
        if self.concurrent_message_limit == Some(0) {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.enable_idempotency && self.idempotency_window.is_zero() {
            return Err(ConfigError::ZeroIdempotencyWindow);
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::ZeroRequestTimeout);
        }
        if let Some(index) = self.redelivery_intervals.iter().position(Duration::is_zero) {
            return Err(ConfigError::ZeroRedeliveryInterval { index });
        }
        if self.enable_priority && self.max_priority == 0 {
            return Err(ConfigError::ZeroMaxPriority);
        }
        if self.idempotency_sweep_interval.is_zero() {
            return Err(ConfigError::ZeroSweepInterval);
        }
        Ok(())
    }

    /// Effective per-endpoint concurrency: the explicit limit, else the prefetch count.
    #[must_use]
    pub fn concurrency_limit(&self) -> usize {
        self.concurrent_message_limit.unwrap_or(usize::from(self.prefetch_count))
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.retry_attempts,
            self.retry_min,
            self.retry_max,
            self.retry_interval_delta,
        )
    }

    #[must_use]
    pub fn redelivery_policy(&self) -> RedeliveryPolicy {
        RedeliveryPolicy::new(self.redelivery_intervals.clone())
    }

    #[must_use]
    pub fn failure_ladder(&self) -> FailureLadder {
        FailureLadder::new(
            self.retry_policy(),
            self.redelivery_policy(),
            self.configure_dead_letter,
        )
    }

    /// Idempotency window when idempotency is enabled.
    #[must_use]
    pub fn idempotency(&self) -> Option<Duration> {
        self.enable_idempotency.then_some(self.idempotency_window)
    }
}

// ---------------------------------------------------------------------------
// MessagingArgs
// ---------------------------------------------------------------------------

/// Command-line and environment form of [`MessagingOptions`].
///
/// Durations are given in milliseconds; the redelivery list is comma-separated.
#[derive(Debug, Clone, Args)]
pub struct MessagingArgs {
    /// Broker host
    #[arg(long = "broker-host", env = "COURIER_HOST", default_value = "localhost")]
    pub host: String,

    /// Broker virtual host
    #[arg(long, env = "COURIER_VHOST", default_value = "/")]
    pub vhost: String,

    #[arg(long, env = "COURIER_USERNAME", default_value = "guest")]
    pub username: String,

    #[arg(long, env = "COURIER_PASSWORD", default_value = "guest", hide_env_values = true)]
    pub password: String,

    /// Prefetch count per endpoint
    #[arg(long = "prefetch", env = "COURIER_PREFETCH", default_value_t = 32)]
    pub prefetch_count: u16,

    /// Concurrent handler invocations per endpoint (defaults to the prefetch count)
    #[arg(long = "concurrency", env = "COURIER_CONCURRENCY")]
    pub concurrent_message_limit: Option<usize>,

    #[arg(long, env = "COURIER_RETRY_ATTEMPTS", default_value_t = 5)]
    pub retry_attempts: u32,

    #[arg(long, env = "COURIER_RETRY_MIN_MS", default_value_t = 1_000)]
    pub retry_min_ms: u64,

    #[arg(long, env = "COURIER_RETRY_MAX_MS", default_value_t = 30_000)]
    pub retry_max_ms: u64,

    #[arg(long, env = "COURIER_RETRY_DELTA_MS", default_value_t = 2_000)]
    pub retry_delta_ms: u64,

    /// Redelivery delays in milliseconds, comma-separated
    #[arg(
        long = "redelivery-ms",
        env = "COURIER_REDELIVERY_MS",
        value_delimiter = ',',
        default_values_t = [10_000u64, 30_000, 120_000]
    )]
    pub redelivery_ms: Vec<u64>,

    #[arg(long, env = "COURIER_DEAD_LETTER", default_value_t = true, action = ArgAction::Set)]
    pub dead_letter: bool,

    #[arg(long, env = "COURIER_DELAYED_SCHEDULER", default_value_t = false, action = ArgAction::Set)]
    pub delayed_scheduler: bool,

    #[arg(long, env = "COURIER_QUORUM_QUEUES", default_value_t = false, action = ArgAction::Set)]
    pub quorum_queues: bool,

    #[arg(long, env = "COURIER_PRIORITY", default_value_t = false, action = ArgAction::Set)]
    pub priority: bool,

    #[arg(long, env = "COURIER_MAX_PRIORITY", default_value_t = 10)]
    pub max_priority: u8,

    #[arg(long, env = "COURIER_IDEMPOTENCY", default_value_t = true, action = ArgAction::Set)]
    pub idempotency: bool,

    #[arg(long, env = "COURIER_IDEMPOTENCY_WINDOW_MS", default_value_t = 600_000)]
    pub idempotency_window_ms: u64,

    #[arg(long, env = "COURIER_REQUEST_TIMEOUT_MS", default_value_t = 30_000)]
    pub request_timeout_ms: u64,

    #[arg(long, env = "COURIER_SWEEP_INTERVAL_MS", default_value_t = 60_000)]
    pub sweep_interval_ms: u64,
}

impl From<MessagingArgs> for MessagingOptions {
    fn from(args: MessagingArgs) -> Self {
        Self {
            host: args.host,
            vhost: args.vhost,
            username: args.username,
            password: args.password,
            prefetch_count: args.prefetch_count,
            concurrent_message_limit: args.concurrent_message_limit,
            retry_attempts: args.retry_attempts,
            retry_min: Duration::from_millis(args.retry_min_ms),
            retry_max: Duration::from_millis(args.retry_max_ms),
            retry_interval_delta: Duration::from_millis(args.retry_delta_ms),
            redelivery_intervals: args
                .redelivery_ms
                .into_iter()
                .map(Duration::from_millis)
                .collect(),
            configure_dead_letter: args.dead_letter,
            use_delayed_message_scheduler: args.delayed_scheduler,
            use_quorum_queues: args.quorum_queues,
            enable_priority: args.priority,
            max_priority: args.max_priority,
            enable_idempotency: args.idempotency,
            idempotency_window: Duration::from_millis(args.idempotency_window_ms),
            request_timeout: Duration::from_millis(args.request_timeout_ms),
            idempotency_sweep_interval: Duration::from_millis(args.sweep_interval_ms),
        }
    }
}
