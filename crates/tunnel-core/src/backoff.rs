//! Exponential back-off for fallible, cancellable operations.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Exponential back-off configuration. The back-off factor is fixed at 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Minimum back-off delay (required).
    pub min: Duration,
    /// Maximum back-off delay (required).
    pub max: Duration,
    /// Maximum total number of attempts (required).
    pub max_attempts: u32,
}

/// Terminal outcome of a retried operation.
#[derive(Error, Debug)]
pub enum BackoffError<E> {
    /// Every attempt failed; carries the last underlying error.
    #[error("gave up after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: E,
    },
    /// The cancellation token fired during a retry delay.
    #[error("cancelled while waiting to retry")]
    Cancelled,
}

impl BackoffConfig {
    /// Check the configuration invariants: `min <= max`, `max_attempts >= 1`.
    pub fn validate(&self) -> crate::TunnelResult<()> {
        if self.min > self.max {
            return Err(crate::TunnelError::InvalidConfig(
                "back-off min delay exceeds max delay".into(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(crate::TunnelError::InvalidConfig(
                "back-off max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Run `op` until it succeeds or the attempts are exhausted.
    ///
    /// `op` is invoked up to `max_attempts + 1` times in total. The delay
    /// ahead of the first retry is one doubling of `min` rather than `min`
    /// itself; each later delay doubles again, capped at `max`. A token
    /// firing during a delay aborts the wait without re-invoking `op`.
    pub async fn run<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, BackoffError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut delay = self.min;
        for attempt in 1u32.. {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if attempt > self.max_attempts {
                return Err(BackoffError::Exhausted {
                    attempts: attempt,
                    source: err,
                });
            }
            delay = (delay * 2).min(self.max);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying after delay");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(BackoffError::Cancelled),
            }
        }
        unreachable!("attempt counter overflowed")
    }
}

#[cfg(test)]
#[path = "backoff_tests.rs"]
mod tests;
