//! Scoped connect, run, always-disconnect.
//!
//! Sessions and every channel kind implement [`Connectable`]. [`scoped`] is the
//! single place that guarantees a resource is disconnected before control
//! returns to the caller, whatever way the operation ends:
//!
//! - normal return or early `?` return from the operation
//! - an error raised by the operation
//! - a panic inside the operation (resumed after disconnect)
//! - a failed connect
//!
//! A failed disconnect is logged and never replaces the operation's outcome.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::time::error::Elapsed;
use tracing::{debug, warn};

use super::error::{Error, Result};

/// A resource with a connect/disconnect lifecycle.
#[async_trait]
pub trait Connectable: Send {
    fn is_connected(&self) -> bool;

    /// Connect within `timeout`; `Duration::ZERO` waits as long as the engine does.
    async fn connect(&mut self, timeout: Duration) -> Result<()>;

    /// Release the resource. Must be a no-op when nothing is held.
    async fn disconnect(&mut self) -> Result<()>;

    /// Human readable name for log lines.
    fn describe(&self) -> String;
}

/// Connect `resource` if needed, run `operation` with it, then disconnect.
pub async fn scoped<R, T, E, F>(
    resource: &mut R,
    timeout: Duration,
    operation: F,
) -> std::result::Result<T, E>
where
    R: Connectable + ?Sized,
    E: From<Error>,
    F: AsyncFnOnce(&mut R) -> std::result::Result<T, E>,
{
    if !resource.is_connected() {
        debug!("Connecting {}", resource.describe());
        if let Err(e) = resource.connect(timeout).await {
            release(resource).await;
            return Err(e.into());
        }
    }

    let outcome = AssertUnwindSafe(operation(&mut *resource))
        .catch_unwind()
        .await;

    release(resource).await;

    match outcome {
        Ok(result) => result,
        Err(payload) => panic::resume_unwind(payload),
    }
}

async fn release<R: Connectable + ?Sized>(resource: &mut R) {
    if let Err(e) = resource.disconnect().await {
        warn!("Failed to disconnect {}: {}", resource.describe(), e);
    } else {
        debug!("Disconnected {}", resource.describe());
    }
}

/// Await `future`, bounded by `timeout` unless it is zero.
pub(crate) async fn within<F: Future>(
    timeout: Duration,
    future: F,
) -> std::result::Result<F::Output, Elapsed> {
    if timeout.is_zero() {
        Ok(future.await)
    } else {
        tokio::time::timeout(timeout, future).await
    }
}
