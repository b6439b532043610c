//! Bidirectional copying between two byte streams.

use tokio::io::{self, AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::trace;

type Result<T> = crate::TunnelResult<T>;

/// Copy `a -> b` and `b -> a` concurrently until both directions have
/// terminated.
///
/// Each direction runs under its own cancellation scope derived from
/// `cancel`. When one direction completes (EOF, error, or its scope firing)
/// the opposite scope is fired, so a direction only stops because its own
/// source reached EOF, the opposite direction finished, or the outer token
/// fired. Neither stream is closed here; that is the caller's job.
///
/// Returns the first I/O error observed in either direction, if any.
pub async fn pipe<A, B>(cancel: &CancellationToken, a: A, b: B) -> Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = io::split(a);
    let (mut b_read, mut b_write) = io::split(b);
    let ab_scope = cancel.child_token();
    let ba_scope = cancel.child_token();

    let a_to_b = async {
        let outcome = tokio::select! {
            res = io::copy(&mut a_read, &mut b_write) => Some(res),
            _ = ab_scope.cancelled() => None,
        };
        ba_scope.cancel();
        outcome
    };
    let b_to_a = async {
        let outcome = tokio::select! {
            res = io::copy(&mut b_read, &mut a_write) => Some(res),
            _ = ba_scope.cancelled() => None,
        };
        ab_scope.cancel();
        outcome
    };

    let (ab, ba) = tokio::join!(a_to_b, b_to_a);
    let mut first_error = None;
    for (direction, outcome) in [("a->b", ab), ("b->a", ba)] {
        match outcome {
            Some(Ok(bytes)) => trace!(direction, bytes, "pipe direction finished"),
            Some(Err(err)) => {
                trace!(direction, %err, "pipe direction failed");
                first_error.get_or_insert(err);
            }
            None => trace!(direction, "pipe direction cancelled"),
        }
    }
    match first_error {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

#[cfg(test)]
#[path = "pipe_tests.rs"]
mod tests;
