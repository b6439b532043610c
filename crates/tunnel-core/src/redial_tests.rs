//! Unit tests for the redial loop, driven by a mock dialler.

use std::sync::{
    Arc,
    Mutex,
    atomic::{AtomicU32, Ordering},
};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;

use super::run_redial;
use crate::backoff::BackoffConfig;
use crate::error::TunnelError;

fn backoff(min_ms: u64, max_ms: u64, max_attempts: u32) -> BackoffConfig {
    BackoffConfig {
        min: Duration::from_millis(min_ms),
        max: Duration::from_millis(max_ms),
        max_attempts,
    }
}

/// Mock dialler yielding numbered "connections" whose closed signals the
/// test fires by hand.
struct MockDialer {
    fail_first: u32,
    calls: Arc<AtomicU32>,
    closed_txs: Arc<Mutex<Vec<oneshot::Sender<TunnelError>>>>,
}

impl MockDialer {
    fn new(fail_first: u32) -> Self {
        Self {
            fail_first,
            calls: Arc::new(AtomicU32::new(0)),
            closed_txs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn close_session(&self, index: usize) {
        let tx = self.closed_txs.lock().unwrap().remove(index);
        let _ = tx.send(TunnelError::TransportClosed("dropped".into()));
    }
}

fn spawn_loop(
    cancel: &CancellationToken,
    dialer: &Arc<MockDialer>,
    backoff: BackoffConfig,
) -> (mpsc::Receiver<u32>, mpsc::Receiver<TunnelError>) {
    let (conn_tx, conn_rx) = mpsc::channel(1);
    let (err_tx, err_rx) = mpsc::channel(1);
    let cancel = cancel.clone();
    let calls = dialer.calls.clone();
    let closed_txs = dialer.closed_txs.clone();
    let fail_first = dialer.fail_first;
    let dial = move || {
        let calls = calls.clone();
        let closed_txs = closed_txs.clone();
        async move {
            let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= fail_first {
                return Err(TunnelError::TransportClosed(format!("refused ({attempt})")));
            }
            let (tx, rx) = oneshot::channel();
            closed_txs.lock().unwrap().push(tx);
            Ok((attempt, rx))
        }
    };
    tokio::spawn(async move {
        run_redial(cancel, dial, backoff, conn_tx, err_tx).await;
    });
    (conn_rx, err_rx)
}

#[tokio::test]
async fn converges_after_transient_failures() {
    let cancel = CancellationToken::new();
    let dialer = Arc::new(MockDialer::new(3));
    let started = Instant::now();
    let (mut conns, mut errs) = spawn_loop(&cancel, &dialer, backoff(10, 100, 5));

    let conn = timeout(Duration::from_secs(2), conns.recv()).await.unwrap().unwrap();
    assert_eq!(conn, 4, "the fourth attempt is the first live connection");
    assert!(
        started.elapsed() >= Duration::from_millis(140),
        "three failures must cost 20+40+80ms of back-off"
    );
    assert!(errs.try_recv().is_err(), "no terminal error after convergence");

    cancel.cancel();
    let err = timeout(Duration::from_secs(1), errs.recv()).await.unwrap().unwrap();
    assert!(matches!(err, TunnelError::Cancelled));
}

#[tokio::test]
async fn exhaustion_publishes_the_terminal_error() {
    let cancel = CancellationToken::new();
    let dialer = Arc::new(MockDialer::new(u32::MAX));
    let (mut conns, mut errs) = spawn_loop(&cancel, &dialer, backoff(1, 4, 2));

    let err = timeout(Duration::from_secs(2), errs.recv()).await.unwrap().unwrap();
    match err {
        TunnelError::BackoffExhausted { attempts, source } => {
            assert_eq!(attempts, 3);
            assert!(matches!(*source, TunnelError::TransportClosed(_)));
        }
        other => panic!("unexpected terminal error: {other}"),
    }
    assert_eq!(dialer.calls.load(Ordering::SeqCst), 3);
    assert!(
        timeout(Duration::from_millis(100), conns.recv()).await.unwrap().is_none(),
        "connection stream must close on terminal failure"
    );
}

#[tokio::test]
async fn dropped_sessions_reconnect_without_backoff() {
    let cancel = CancellationToken::new();
    let dialer = Arc::new(MockDialer::new(0));
    let (mut conns, _errs) = spawn_loop(&cancel, &dialer, backoff(500, 2_000, 3));

    let first = timeout(Duration::from_secs(1), conns.recv()).await.unwrap().unwrap();
    assert_eq!(first, 1);

    // Dropping the live session must produce a fresh connection immediately,
    // not after a back-off delay.
    let started = Instant::now();
    dialer.close_session(0);
    let second = timeout(Duration::from_secs(1), conns.recv()).await.unwrap().unwrap();
    assert_eq!(second, 2);
    assert!(started.elapsed() < Duration::from_millis(400));

    cancel.cancel();
}

#[tokio::test]
async fn cancellation_during_backoff_is_terminal() {
    let cancel = CancellationToken::new();
    let dialer = Arc::new(MockDialer::new(u32::MAX));
    let (_conns, mut errs) = spawn_loop(&cancel, &dialer, backoff(200, 2_000, 10));

    tokio::time::sleep(Duration::from_millis(30)).await;
    cancel.cancel();
    let err = timeout(Duration::from_secs(1), errs.recv()).await.unwrap().unwrap();
    assert!(matches!(err, TunnelError::Cancelled));
    assert_eq!(
        dialer.calls.load(Ordering::SeqCst),
        1,
        "no dial may run after cancellation"
    );
}
