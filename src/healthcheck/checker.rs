use crate::error::{Error, Result};
use crate::poll::poll_until;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Health checker for one stack service.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Service name used in messages.
    fn service(&self) -> &str;

    /// `Ok(())` when healthy, otherwise an error describing why not.
    async fn check(&self, ctx: &CancellationToken) -> Result<()>;
}

/// Re-checks every `period` until the service is healthy.
///
/// Failed checks are retried; cancellation and the deadline are not.
pub async fn wait_healthy<C: HealthChecker + ?Sized>(
    ctx: &CancellationToken,
    checker: &C,
    period: Duration,
    timeout: Duration,
) -> Result<()> {
    let last_error: Mutex<Option<String>> = Mutex::new(None);
    let last = &last_error;
    let healthy = poll_until(ctx, period, timeout, move || async move {
        match checker.check(ctx).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                tracing::debug!(service = checker.service(), error = %e, "service not ready");
                *last.lock() = Some(e.to_string());
                Ok(false)
            }
        }
    })
    .await?;

    if healthy {
        return Ok(());
    }
    Err(Error::Timeout(match last_error.into_inner() {
        Some(reason) => format!("{} to become healthy (last error: {})", checker.service(), reason),
        None => format!("{} to become healthy", checker.service()),
    }))
}
