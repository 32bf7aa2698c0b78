//! Peer table entries.

use serde::{Deserialize, Serialize};

use crate::config::RELIABILITY_SMOOTHING;

/// A directly connected peer as seen by the coordinator.
///
/// An entry exists only while the peer is connected; disconnecting removes
/// it. `connected` flips to false just before removal so concurrent readers
/// holding a snapshot can tell the peer is on its way out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    /// Peer node id.
    pub id: String,
    /// Advertised address.
    pub address: String,
    /// Whether the peer is currently connected.
    pub connected: bool,
    /// Unix ms at which the peer entered the table.
    pub connected_at: u64,
    /// Unix ms of the last heartbeat received from the peer.
    pub last_heartbeat_at: u64,
    /// Most recently observed send latency in milliseconds.
    pub latency_ms: f64,
    /// Exponentially weighted success rate of sends to this peer, in `[0, 1]`.
    pub reliability: f64,
}

impl Peer {
    /// A freshly connected peer. The connect time counts as the first
    /// heartbeat so the peer is not suspected before its first probe lands.
    pub fn new(id: impl Into<String>, address: impl Into<String>, now: u64) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            connected: true,
            connected_at: now,
            last_heartbeat_at: now,
            latency_ms: 0.0,
            reliability: 1.0,
        }
    }

    /// Milliseconds since the last heartbeat.
    pub fn heartbeat_age(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_heartbeat_at)
    }

    /// Connected and heard from within `timeout_ms`.
    pub fn is_reachable(&self, now: u64, timeout_ms: u64) -> bool {
        self.connected && self.heartbeat_age(now) < timeout_ms
    }

    /// Folds the outcome of one send into latency and reliability.
    pub fn record_send(&mut self, success: bool, latency_ms: f64) {
        let target = if success { 1.0 } else { 0.0 };
        self.reliability += RELIABILITY_SMOOTHING * (target - self.reliability);
        self.reliability = self.reliability.clamp(0.0, 1.0);
        if success {
            self.latency_ms = latency_ms;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_peer_is_reachable_until_timeout() {
        let peer = Peer::new("b", "local://b", 1_000);
        assert!(peer.is_reachable(1_000, 500));
        assert!(peer.is_reachable(1_499, 500));
        assert!(!peer.is_reachable(1_500, 500));
        assert_eq!(peer.heartbeat_age(900), 0);
    }

    #[test]
    fn reliability_moves_toward_outcomes() {
        let mut peer = Peer::new("b", "local://b", 0);
        peer.record_send(false, 0.0);
        assert!((peer.reliability - 0.8).abs() < 1e-9);
        peer.record_send(false, 0.0);
        assert!((peer.reliability - 0.64).abs() < 1e-9);

        peer.record_send(true, 7.5);
        assert!(peer.reliability > 0.64);
        assert_eq!(peer.latency_ms, 7.5);
    }
}
