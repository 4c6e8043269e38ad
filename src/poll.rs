//! Cancellable fixed-period polling.

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Calls `predicate` every `period` until it returns `Ok(true)`.
///
/// Returns `Ok(false)` once `timeout` elapses and `Err(Error::Cancelled)` as
/// soon as `ctx` is cancelled; cancellation is checked before every attempt
/// and interrupts the sleep between attempts. Errors from the predicate are
/// returned unchanged.
pub async fn poll_until<F, Fut>(
    ctx: &CancellationToken,
    period: Duration,
    timeout: Duration,
    mut predicate: F,
) -> Result<bool>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if predicate().await? {
            return Ok(true);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(false);
        }
        let wait = period.min(deadline - now);
        tokio::select! {
            _ = ctx.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

/// Sleeps for `duration` unless `ctx` is cancelled first.
pub async fn sleep_or_cancel(ctx: &CancellationToken, duration: Duration) -> Result<()> {
    tokio::select! {
        _ = ctx.cancelled() => Err(Error::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn succeeds_when_predicate_turns_true() {
        let ctx = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let ok = poll_until(&ctx, Duration::from_secs(5), Duration::from_secs(60), || {
            let counter = counter.clone();
            async move { Ok(counter.fetch_add(1, Ordering::SeqCst) >= 2) }
        })
        .await
        .unwrap();
        assert!(ok);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_at_deadline() {
        let ctx = CancellationToken::new();
        let ok = poll_until(&ctx, Duration::from_secs(5), Duration::from_secs(12), || async {
            Ok(false)
        })
        .await
        .unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_first_attempt() {
        let ctx = CancellationToken::new();
        ctx.cancel();
        let calls = AtomicUsize::new(0);
        let result = poll_until(&ctx, Duration::from_secs(5), Duration::from_secs(60), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(false) }
        })
        .await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancellation_interrupts_sleep() {
        let ctx = CancellationToken::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let started = std::time::Instant::now();
        let result = poll_until(&ctx, Duration::from_secs(3600), Duration::from_secs(7200), || async {
            Ok(false)
        })
        .await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test]
    async fn predicate_errors_propagate() {
        let ctx = CancellationToken::new();
        let result = poll_until(&ctx, Duration::from_secs(1), Duration::from_secs(10), || async {
            Err(Error::NotFound("project".to_string()))
        })
        .await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }
}
