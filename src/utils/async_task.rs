use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio::time::timeout;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::BackoffPolicy;
use crate::Result;

/// Runs `task` until it succeeds, bounding each attempt by the policy's
/// timeout and sleeping `policy.delay_for(attempt)` between attempts.
///
/// `max_retries == 0` retries forever. A timed-out attempt is turned into an
/// error with `on_timeout`.
pub(crate) async fn task_with_timeout_and_exponential_backoff<F, Fut, T, E>(
    name: &str,
    policy: &BackoffPolicy,
    mut task: F,
    on_timeout: impl Fn(Duration) -> E,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Display,
{
    let mut attempt: u32 = 0;
    loop {
        attempt = attempt.saturating_add(1);
        let result = match timeout(policy.timeout(), task()).await {
            Ok(r) => r,
            Err(_) => Err(on_timeout(policy.timeout())),
        };
        match result {
            Ok(v) => return Ok(v),
            Err(e) => {
                if !policy.is_unlimited() && attempt as usize >= policy.max_retries {
                    warn!(task = name, attempt, error = %e, "giving up after {attempt} attempts");
                    return Err(e);
                }
                let delay = policy.delay_for(attempt);
                debug!(task = name, attempt, ?delay, error = %e, "attempt failed");
                sleep(delay).await;
            }
        }
    }
}

/// Spawns a named task, logging its error, and keeps the handle if asked to.
pub(crate) fn spawn_task<F, Fut>(
    name: &str,
    task_fn: F,
    handles: Option<&mut Vec<JoinHandle<()>>>,
) where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let name = name.to_string();
    let handle = tokio::spawn(async move {
        match task_fn().await {
            Ok(()) => debug!(task = %name, "task finished"),
            Err(e) => error!(task = %name, error = %e, "task stopped with error"),
        }
    });

    if let Some(h) = handles {
        h.push(handle);
    }
}
