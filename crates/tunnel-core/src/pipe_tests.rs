//! Unit tests for the bidirectional pipe.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::pipe;

#[tokio::test]
async fn copies_both_directions_in_order() {
    let (a, mut a_peer) = tokio::io::duplex(64);
    let (b, mut b_peer) = tokio::io::duplex(64);
    let cancel = CancellationToken::new();
    let piping = tokio::spawn(async move { pipe(&cancel, a, b).await });

    a_peer.write_all(b"one").await.unwrap();
    a_peer.write_all(b"two").await.unwrap();
    let mut buf = [0u8; 6];
    b_peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"onetwo", "a->b bytes must arrive once, in order");

    b_peer.write_all(b"back").await.unwrap();
    let mut buf = [0u8; 4];
    a_peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"back");

    drop(a_peer);
    let outcome = timeout(Duration::from_secs(1), piping).await.unwrap().unwrap();
    assert!(outcome.is_ok());
}

#[tokio::test]
async fn residual_data_flows_until_the_source_side_closes() {
    let (a, mut a_peer) = tokio::io::duplex(64);
    let (b, mut b_peer) = tokio::io::duplex(64);
    let cancel = CancellationToken::new();
    let piping = tokio::spawn(async move { pipe(&cancel, a, b).await });

    // Data keeps moving in the b->a direction while a->b is still open.
    a_peer.write_all(b"up").await.unwrap();
    let mut buf = [0u8; 2];
    b_peer.read_exact(&mut buf).await.unwrap();
    b_peer.write_all(b"dn").await.unwrap();
    a_peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"dn");

    // EOF on a's source ends a->b, which tears down the opposite direction.
    a_peer.shutdown().await.unwrap();
    let outcome = timeout(Duration::from_secs(1), piping).await.unwrap().unwrap();
    assert!(outcome.is_ok());

    // The pipe released both streams; the peers now observe EOF.
    assert_eq!(b_peer.read(&mut buf).await.unwrap(), 0);
}

#[tokio::test]
async fn outer_cancellation_stops_both_directions_promptly() {
    let (a, mut a_peer) = tokio::io::duplex(64);
    let (b, mut b_peer) = tokio::io::duplex(64);
    let cancel = CancellationToken::new();
    let scope = cancel.clone();
    let piping = tokio::spawn(async move { pipe(&scope, a, b).await });

    a_peer.write_all(b"x").await.unwrap();
    let mut buf = [0u8; 1];
    b_peer.read_exact(&mut buf).await.unwrap();

    cancel.cancel();
    let outcome = timeout(Duration::from_millis(50), piping).await;
    assert!(outcome.is_ok(), "pipe must return promptly after cancellation");
}

#[tokio::test]
async fn idle_pipe_is_cancellable() {
    let (a, _a_peer) = tokio::io::duplex(16);
    let (b, _b_peer) = tokio::io::duplex(16);
    let cancel = CancellationToken::new();
    let scope = cancel.clone();
    let piping = tokio::spawn(async move { pipe(&scope, a, b).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    cancel.cancel();
    let outcome = timeout(Duration::from_millis(50), piping).await.unwrap().unwrap();
    assert!(outcome.is_ok(), "cancellation is not an I/O error");
}
