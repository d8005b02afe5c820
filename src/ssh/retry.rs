//! Opt-in retry with exponential backoff.
//!
//! Nothing in this crate retries on its own. Wrap a call in [`with_retry`] to
//! retry transient connection failures:
//!
//! - **Initial delay**: [`RetryPolicy::min_delay`] (default: 1s)
//! - **Maximum delay**: [`RetryPolicy::max_delay`] (default: 10s)
//! - **Maximum retries**: [`RetryPolicy::max_retries`] (default: 3)
//! - **Jitter**: random jitter is added to prevent thundering herd
//!
//! Only errors for which [`Error::is_retryable`] holds are retried.
//! Authentication failures are never retried to avoid account lockouts.
//!
//! ```ignore
//! let output = with_retry(&RetryPolicy::default(), || {
//!     execute_remote_as_string("uptime", &params)
//! })
//! .await?;
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tracing::{error, info, warn};

use super::error::{Error, Result};

/// Default number of retries after the first attempt
pub const DEFAULT_MAX_RETRIES: usize = 3;

/// Default delay before the first retry
pub const DEFAULT_MIN_DELAY: Duration = Duration::from_secs(1);

/// Cap on the delay between retries
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            min_delay: DEFAULT_MIN_DELAY,
            max_delay: MAX_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay.max(self.min_delay))
            .with_max_times(self.max_retries)
            .with_jitter()
    }
}

/// Run `operation`, retrying transient connection failures under `policy`.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempt_counter = AtomicU32::new(0);

    let result = (|| {
        let attempt = attempt_counter.fetch_add(1, Ordering::SeqCst);
        if attempt > 0 {
            warn!("Retry attempt {}", attempt);
        }
        operation()
    })
    .retry(policy.backoff())
    .when(|e: &Error| {
        let retryable = e.is_retryable();
        if !retryable {
            warn!("Not retrying non-retryable error: {}", e);
        }
        retryable
    })
    .notify(|err, dur| {
        warn!("Operation failed: {}. Retrying in {:?}", err, dur);
    })
    .await;

    let total_attempts = attempt_counter.load(Ordering::SeqCst);
    match &result {
        Ok(_) if total_attempts > 1 => {
            info!("Succeeded after {} retry attempt(s)", total_attempts - 1);
        }
        Err(e) if total_attempts > 1 => {
            error!("Failed after {} attempt(s). Last error: {}", total_attempts, e);
        }
        _ => {}
    }
    result
}
