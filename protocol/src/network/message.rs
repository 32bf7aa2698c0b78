//! # Message Envelopes
//!
//! Everything that crosses the transport is an [`Envelope`] wrapping one
//! [`Message`]. The message enum is internally tagged with snake_case type
//! names (`peer_connect`, `heartbeat`, `gossip`, `consensus_proposal`, ...)
//! so the JSON form stays readable in logs and on the `/ws` event stream.
//!
//! Subsystem payloads (gossip snapshots, consensus phases, DHT entries) are
//! defined next to the subsystem that owns them and re-used here.

use serde::{Deserialize, Serialize};

use crate::network::consensus::{ConsensusVote, PrePrepare};
use crate::network::dht::StoredEntry;
use crate::network::gossip::GossipEnvelope;

/// A message addressed from one node to another.
///
/// Immutable once built: the id and timestamp are assigned by the sending
/// coordinator and never rewritten in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique envelope id (UUID v4).
    pub id: String,
    /// Sending node id.
    pub from: String,
    /// Receiving node id.
    pub to: String,
    /// Unix milliseconds at which the envelope was built.
    pub timestamp: u64,
    /// The wrapped message.
    pub message: Message,
}

/// Every message type the mesh exchanges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// The sender added us to its peer table.
    PeerConnect {
        /// Sender's advertised address.
        address: String,
    },
    /// The sender removed us from its peer table.
    PeerDisconnect,
    /// Liveness probe.
    Heartbeat {
        /// Latency the sender currently observes towards us.
        latency_ms: f64,
        /// Sender's wall clock when the probe went out.
        sent_at: u64,
    },
    /// Membership and health snapshot.
    Gossip(GossipEnvelope),
    /// Consensus pre-prepare.
    ConsensusProposal(PrePrepare),
    /// Consensus prepare or commit vote.
    ConsensusVote(ConsensusVote),
    /// Ask the receiver whether it can still reach `suspect`.
    FailureConfirmationRequest {
        /// The peer the sender suspects.
        suspect: String,
    },
    /// Answer to a [`Message::FailureConfirmationRequest`].
    FailureConfirmationResponse {
        /// The suspected peer.
        suspect: String,
        /// Whether the responder has a fresh heartbeat from the suspect.
        reachable: bool,
    },
    /// Store a replica of an entry.
    DhtStore {
        /// The entry to store.
        entry: StoredEntry,
    },
    /// Reply to a [`Message::DhtStore`].
    DhtStoreAck {
        /// Key that was stored.
        key: String,
    },
    /// Fetch the value stored under `key`.
    DhtRetrieve {
        /// Key to fetch.
        key: String,
    },
    /// Reply to a [`Message::DhtRetrieve`].
    DhtValue {
        /// Key that was fetched.
        key: String,
        /// The value, if the responder holds the key.
        value: Option<serde_json::Value>,
    },
}

impl Message {
    /// The wire type name, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PeerConnect { .. } => "peer_connect",
            Self::PeerDisconnect => "peer_disconnect",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Gossip(_) => "gossip",
            Self::ConsensusProposal(_) => "consensus_proposal",
            Self::ConsensusVote(_) => "consensus_vote",
            Self::FailureConfirmationRequest { .. } => "failure_confirmation_request",
            Self::FailureConfirmationResponse { .. } => "failure_confirmation_response",
            Self::DhtStore { .. } => "dht_store",
            Self::DhtStoreAck { .. } => "dht_store_ack",
            Self::DhtRetrieve { .. } => "dht_retrieve",
            Self::DhtValue { .. } => "dht_value",
        }
    }
}

/// Network health sample computed by the coordinator.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Health {
    /// Fraction of peer-table entries that are currently reachable.
    pub connectivity: f64,
    /// Mean observed peer latency in milliseconds.
    pub latency: f64,
    /// Messages sent per second since the previous sample.
    pub throughput: f64,
    /// Whether fewer than half of the peers are reachable.
    pub partitioned: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_tagged_with_wire_names() {
        let msg = Message::PeerConnect {
            address: "local://a".into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "peer_connect");
        assert_eq!(json["address"], "local://a");

        let json = serde_json::to_value(Message::PeerDisconnect).unwrap();
        assert_eq!(json["type"], "peer_disconnect");
    }

    #[test]
    fn heartbeat_survives_json() {
        let env = Envelope {
            id: "e-1".into(),
            from: "a".into(),
            to: "b".into(),
            timestamp: 42,
            message: Message::Heartbeat {
                latency_ms: 12.5,
                sent_at: 40,
            },
        };
        let bytes = serde_json::to_vec(&env).unwrap();
        let back: Envelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, env);
    }
}
