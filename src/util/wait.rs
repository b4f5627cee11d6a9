//! Polling helpers for conditions that have no event to await.

use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, sleep};

/// Interval between two evaluations of a predicate.
pub const PREDICATE_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Budget used by [`wait_for_predicate_default`].
pub const DEFAULT_PREDICATE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("condition not met within {timeout:?}")]
pub struct TimeoutError {
    pub timeout: Duration,
}

/// Resolve once `predicate` returns `true`, checking it immediately and then
/// every [`PREDICATE_POLL_INTERVAL`].
pub async fn wait_for_predicate<F>(mut predicate: F, timeout: Duration) -> Result<(), TimeoutError>
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if predicate() {
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(TimeoutError { timeout });
        }
        sleep(PREDICATE_POLL_INTERVAL.min(deadline - now)).await;
    }
}

pub async fn wait_for_predicate_default<F>(predicate: F) -> Result<(), TimeoutError>
where
    F: FnMut() -> bool,
{
    wait_for_predicate(predicate, DEFAULT_PREDICATE_TIMEOUT).await
}
