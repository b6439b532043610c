//! Unit tests for network tags and channel-open dispatch.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{ChannelOpener, Network, dial_with, open_channel};
use crate::config::{AuthConfig, TunnelConfig};
use crate::conn::TunnelStream;
use crate::error::TunnelError;

#[derive(Default)]
struct RecordingOpener {
    ops: Mutex<Vec<String>>,
}

#[async_trait]
impl ChannelOpener for RecordingOpener {
    async fn open_direct_tcpip(&self, host: &str, port: u32) -> crate::TunnelResult<TunnelStream> {
        self.ops.lock().unwrap().push(format!("tcpip {host}:{port}"));
        let (client, _server) = tokio::io::duplex(16);
        Ok(Box::new(client))
    }

    async fn open_direct_streamlocal(&self, path: &str) -> crate::TunnelResult<TunnelStream> {
        self.ops.lock().unwrap().push(format!("streamlocal {path}"));
        let (client, _server) = tokio::io::duplex(16);
        Ok(Box::new(client))
    }
}

#[test]
fn network_tags_parse() {
    for tag in ["tcp", "tcp4", "tcp6", "unix", "unixgram", "unixpacket"] {
        assert!(tag.parse::<Network>().is_ok(), "tag {tag} must be supported");
    }
    for tag in ["udp", "udp4", "ip", "", "TCP"] {
        assert!(
            matches!(tag.parse::<Network>(), Err(TunnelError::UnsupportedNetwork(t)) if t == tag),
            "tag {tag} must be rejected"
        );
    }
}

#[tokio::test]
async fn unsupported_network_fails_before_any_io() {
    // The address points nowhere; an unsupported tag must fail without
    // attempting to reach it.
    let config = TunnelConfig::new("203.0.113.1:22", AuthConfig::password("u", "p"));
    let started = std::time::Instant::now();
    let result = dial_with(&CancellationToken::new(), "udp", "127.0.0.1:80", &config).await;
    assert!(matches!(result, Err(TunnelError::UnsupportedNetwork(t)) if t == "udp"));
    assert!(started.elapsed() < std::time::Duration::from_millis(100));
}

#[tokio::test]
async fn tcp_addresses_are_split_for_the_wire() {
    let opener = RecordingOpener::default();
    open_channel(&opener, Network::Tcp, "db.internal:5432").await.unwrap();
    open_channel(&opener, Network::Tcp6, "[::1]:6379").await.unwrap();
    let ops = opener.ops.lock().unwrap().clone();
    assert_eq!(ops, vec!["tcpip db.internal:5432", "tcpip ::1:6379"]);
}

#[tokio::test]
async fn unix_paths_pass_through_unparsed() {
    let opener = RecordingOpener::default();
    for network in [Network::Unix, Network::Unixgram, Network::Unixpacket] {
        open_channel(&opener, network, "/run/app.sock").await.unwrap();
    }
    let ops = opener.ops.lock().unwrap().clone();
    assert_eq!(ops.len(), 3);
    assert!(ops.iter().all(|op| op == "streamlocal /run/app.sock"));
}

#[tokio::test]
async fn malformed_tcp_address_is_rejected() {
    let opener = RecordingOpener::default();
    let result = open_channel(&opener, Network::Tcp, "no-port").await;
    assert!(matches!(result, Err(TunnelError::InvalidAddress { .. })));
    assert!(opener.ops.lock().unwrap().is_empty(), "no channel may be opened");
}

#[tokio::test]
async fn cancelled_token_short_circuits_dialing() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let config = TunnelConfig::new("203.0.113.1:22", AuthConfig::password("u", "p"));
    let result = dial_with(&cancel, "tcp", "127.0.0.1:80", &config).await;
    assert!(matches!(result, Err(TunnelError::Cancelled)));
}
