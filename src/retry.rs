//! Retry with exponential backoff for cluster mutations.
//!
//! Only errors classified as transient (rate limited, server timeout, service
//! unavailable, internal error) consume retry budget. Anything else surfaces on
//! the first attempt. Both the attempt and the backoff sleep observe the
//! caller's [`CancellationToken`], so a cancelled run never waits out a backoff.
//!
//! # Example
//!
//! ```ignore
//! use virtwork::retry::{retry_on_transient, RetryConfig};
//!
//! let vm = retry_on_transient(
//!     &RetryConfig::default(),
//!     &cancel,
//!     "creating VirtualMachine virtwork/virtwork-cpu-0",
//!     || async { client.create_vm(&vm).await },
//! ).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::{Error, Result};

/// Default number of retries after the first attempt
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Backoff configuration for create and delete calls.
///
/// The base delay is a plain field so tests pass a short value directly.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Retries after the first attempt (total attempts = max_retries + 1)
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Multiplier applied after every retry
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Default schedule with a different base delay
    pub fn with_initial_delay(initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            ..Default::default()
        }
    }

    /// Delay slept after the given zero-based failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt as i32);
        let nanos = (self.initial_delay.as_nanos() as f64 * factor).round();
        Duration::from_nanos(nanos.min(u64::MAX as f64) as u64).min(self.max_delay)
    }
}

/// Run `operation`, retrying transient failures with exponential backoff.
///
/// # Returns
/// The operation's value, its first non-transient error, [`Error::Cancelled`]
/// if `cancel` fires, or [`Error::RetriesExhausted`] wrapping the last error.
pub async fn retry_on_transient<F, Fut, T>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::cancelled(operation_name));
        }

        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !err.is_transient() {
            return Err(err);
        }

        if attempt >= config.max_retries {
            error!(
                operation = %operation_name,
                attempts = attempt + 1,
                error = %err,
                "Operation failed after max retries"
            );
            return Err(Error::RetriesExhausted {
                attempts: attempt + 1,
                last: Box::new(err),
            });
        }

        let delay = config.delay_for(attempt);
        warn!(
            operation = %operation_name,
            attempt = attempt + 1,
            error = %err,
            delay_ms = delay.as_millis() as u64,
            "Transient failure, retrying"
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::cancelled(operation_name)),
            _ = tokio::time::sleep(delay) => {}
        }

        attempt += 1;
    }
}
