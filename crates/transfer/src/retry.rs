//! Per-call retry with exponential backoff.

use std::future::Future;
use std::time::Duration;

use teledrive_session::{BackendError, SessionError};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::TransferError;
use crate::config::TransferConfig;

/// Retry schedule applied to every remote part operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per call, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Backoff cap. Does not bound a server-mandated wait.
    pub max_delay: Duration,
    /// Limit for one backend call. The session starts the clock once it
    /// holds the connection, so queueing behind other transfers is free.
    pub call_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&TransferConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &TransferConfig) -> Self {
        Self {
            max_attempts: config.max_retry_attempts.max(1),
            base_delay: Duration::from_millis(config.backoff_base_millis),
            max_delay: Duration::from_millis(config.backoff_max_millis),
            call_timeout: config.call_timeout(),
        }
    }

    /// Backoff after the given failed attempt (1-based): base × 2^(attempt-1),
    /// capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    /// Wait before retrying after `err`: the backoff, or the server's
    /// retry-after hint if that is longer.
    pub fn delay_after(&self, attempt: u32, err: &BackendError) -> Duration {
        let backoff = self.delay_for_attempt(attempt);
        match err.retry_after() {
            Some(hint) => backoff.max(hint),
            None => backoff,
        }
    }
}

/// Runs `call` until it succeeds, fails structurally or exhausts the
/// policy. `index` names the part for logs and errors.
///
/// Cancellation drops the in-flight call and interrupts backoff sleeps.
pub(crate) async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    op: &'static str,
    index: u32,
    cancel: &CancellationToken,
    mut call: F,
) -> Result<T, TransferError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SessionError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            result = call() => result,
        };

        let err = match outcome {
            Ok(value) => return Ok(value),
            Err(SessionError::Backend(err)) if err.is_transient() => err,
            Err(other) => return Err(TransferError::from_session(other)),
        };

        if attempt >= policy.max_attempts {
            warn!(op, part = index, attempts = attempt, error = %err, "retries exhausted");
            return Err(TransferError::RemotePart {
                index,
                attempts: attempt,
                source: SessionError::Backend(err),
            });
        }

        let delay = policy.delay_after(attempt, &err);
        warn!(
            op,
            part = index,
            attempt,
            max_attempts = policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "remote call failed, retrying"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
