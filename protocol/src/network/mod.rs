//! # Network Module
//!
//! The mesh coordination layer. Every node runs the same stack: a
//! coordinator owning the peer table, plus four subsystems that talk to
//! peers only through it.
//!
//! ## Architecture
//!
//! ```text
//! transport.rs    Transport trait and the in-process LocalNetwork
//! message.rs      Wire envelope and message variants
//! peers.rs        Peer records and link-quality bookkeeping
//! events.rs       Broadcast bus for mesh events
//! coordinator.rs  Peer table, topology, messaging and health
//! gossip.rs       Epidemic dissemination of peer lists and health
//! consensus.rs    Three-phase BFT agreement with a 2f+1 quorum
//! voting.rs       Weighted advisory voting
//! heartbeat.rs    Liveness probing, failure confirmation, partitions
//! dht.rs          Consistent-hash ring and replicated key/value storage
//! node.rs         MeshNode runtime wiring it all together
//! ```
//!
//! ## Design Decisions
//!
//! - Subsystems never hold a lock across an `.await`. Each returns a list of
//!   actions and the node applies them after the lock is released.
//! - Inbound processing is sequential per node. Inbound handlers perform
//!   one-way sends only, so request/response traffic cannot deadlock.
//! - Membership changes propagate through the event bus. The DHT ring and
//!   the consensus/heartbeat bookkeeping follow the peer table through it.

pub mod consensus;
pub mod coordinator;
pub mod dht;
pub mod events;
pub mod gossip;
pub mod heartbeat;
pub mod message;
pub mod node;
pub mod peers;
pub mod transport;
pub mod voting;

pub use consensus::{
    quorum_size, ConsensusAction, ConsensusEngine, ConsensusError, ConsensusProposal,
    ConsensusVote, Decision, Phase, PrePrepare, VotePhase,
};
pub use coordinator::{Coordinator, SendReport};
pub use dht::{
    ring_hash, DhtConfig, DistributedHashTable, HashRing, StoreOutcome, StoredEntry,
};
pub use events::{EventBus, MeshEvent};
pub use gossip::{
    select_targets, GossipAction, GossipConfig, GossipDisseminator, GossipEnvelope, PeerSummary,
};
pub use heartbeat::{
    detect_partition, Confirmation, FailureSuspicion, HeartbeatAction, HeartbeatConfig,
    HeartbeatMonitor,
};
pub use message::{Envelope, Health, Message};
pub use node::{MeshNode, NodeStatus};
pub use peers::Peer;
pub use transport::{
    Inbound, LatencyModel, LocalNetwork, LocalTransport, Transport, TransportError,
};
pub use voting::{
    median, reject_outliers, tally, vote_weight, PendingRetry, WeightedOutcome, WeightedProposal,
    WeightedVote, WeightedVoting,
};
