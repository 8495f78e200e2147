//! Retry configuration and blocking retry helper for storage calls.

use std::time::Duration;

use backon::{BlockingRetryable, ExponentialBuilder};

use crate::contracts::StorageError;

/// Configuration for storage retry with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts.
    pub max_retries: usize,
    /// Initial delay between retries in milliseconds.
    pub initial_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay_ms: 20,
            max_delay_ms: 2_000,
        }
    }
}

impl RetryConfig {
    /// Creates a RetryConfig from environment variables.
    ///
    /// Environment variables:
    /// - `SEQKEEP_RETRY_MAX`: Maximum retry attempts (default: 5)
    /// - `SEQKEEP_RETRY_INITIAL_MS`: Initial backoff delay in ms (default: 20)
    /// - `SEQKEEP_RETRY_MAX_MS`: Maximum backoff delay in ms (default: 2000)
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            max_retries: std::env::var("SEQKEEP_RETRY_MAX")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_retries),
            initial_delay_ms: std::env::var("SEQKEEP_RETRY_INITIAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.initial_delay_ms),
            max_delay_ms: std::env::var("SEQKEEP_RETRY_MAX_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_delay_ms),
        }
    }

    /// No retries at all. Used by tests that want failures surfaced directly.
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Creates an exponential backoff builder with jitter.
    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.initial_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_max_times(self.max_retries)
            .with_jitter()
    }
}

/// Runs a blocking storage call, retrying transient failures with backoff.
///
/// Only `StorageError::Busy` is retried. Anything else, and the last busy
/// error once attempts run out, is returned to the caller.
pub fn with_retry<T, F>(config: &RetryConfig, context: &str, op: F) -> Result<T, StorageError>
where
    F: FnMut() -> Result<T, StorageError>,
{
    op.retry(config.backoff())
        .sleep(std::thread::sleep)
        .when(StorageError::is_transient)
        .notify(|err, dur| {
            tracing::warn!(
                context = %context,
                error = %err,
                retry_in = ?dur,
                "Storage operation failed, retrying"
            );
        })
        .call()
}
