//! Readiness polling shared by the platform backends

use relay_foundation::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Probe until it reports ready, the deadline passes, or `cancel` fires.
///
/// The first probe runs immediately. A probe error counts as "not ready
/// yet". On timeout the returned error is `ReadinessTimeout` with no logs;
/// the caller attaches them.
pub async fn poll_until_ready<F, Fut>(
    backend: &str,
    worker: &str,
    timeout: Duration,
    interval: Duration,
    cancel: &CancellationToken,
    mut probe: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = Instant::now() + timeout;

    loop {
        match probe().await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(e) => warn!(backend, worker, "Readiness probe failed: {}", e),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(Error::ReadinessTimeout {
                backend: backend.to_string(),
                worker: worker.to_string(),
                timeout,
                logs: None,
            });
        }

        let pause = interval.min(deadline - now);
        tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            () = tokio::time::sleep(pause) => {}
        }
    }
}
