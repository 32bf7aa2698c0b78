//! # Mesh Events
//!
//! Subsystems publish what happens to the mesh on a per-node
//! [`EventBus`]. The bus is a `tokio::sync::broadcast` channel: every
//! subscriber sees every event in emission order, which gives the required
//! FIFO ordering per event type for one subscriber. A subscriber that falls
//! more than [`EVENT_CHANNEL_CAPACITY`] events behind observes `Lagged` and
//! skips ahead.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::config::EVENT_CHANNEL_CAPACITY;
use crate::network::consensus::Decision;
use crate::network::gossip::PeerSummary;
use crate::network::message::Health;

/// Something observable that happened to this node's view of the mesh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MeshEvent {
    /// A peer entered the peer table.
    PeerConnected {
        /// Peer id.
        peer_id: String,
        /// Peer address.
        address: String,
    },
    /// A peer left the peer table.
    PeerDisconnected {
        /// Peer id.
        peer_id: String,
    },
    /// A peer's failure was confirmed by the heartbeat monitor.
    PeerFailure {
        /// Peer id.
        peer_id: String,
        /// Missed checks at confirmation time.
        attempts: u32,
    },
    /// Health flipped to partitioned.
    PartitionDetected {
        /// The sample that crossed the threshold.
        health: Health,
    },
    /// A three-phase proposal executed.
    ConsensusReached {
        /// The recorded decision.
        decision: Decision,
    },
    /// Health was recomputed.
    HealthUpdated {
        /// The new sample.
        health: Health,
    },
    /// Partition healing dropped stale peers; gossip should reconnect.
    PeerDiscoveryNeeded,
    /// Gossip surfaced connected peers this node does not know yet.
    PeerDiscovered {
        /// The candidates.
        peers: Vec<PeerSummary>,
    },
}

impl MeshEvent {
    /// The event type name, matching the serialized tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PeerConnected { .. } => "peer_connected",
            Self::PeerDisconnected { .. } => "peer_disconnected",
            Self::PeerFailure { .. } => "peer_failure",
            Self::PartitionDetected { .. } => "partition_detected",
            Self::ConsensusReached { .. } => "consensus_reached",
            Self::HealthUpdated { .. } => "health_updated",
            Self::PeerDiscoveryNeeded => "peer_discovery_needed",
            Self::PeerDiscovered { .. } => "peer_discovered",
        }
    }
}

/// Fan-out publisher for [`MeshEvent`]s. Cloning shares the channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<MeshEvent>,
}

impl EventBus {
    /// A bus with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(EVENT_CHANNEL_CAPACITY)
    }

    /// A bus buffering at most `capacity` events per lagging subscriber.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event. Having no subscribers is not an error.
    pub fn emit(&self, event: MeshEvent) {
        trace!(kind = event.kind(), "emitting event");
        let _ = self.sender.send(event);
    }

    /// A new subscriber that sees events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
