//! # Mesh Configuration & Constants
//!
//! Every tunable of the mesh lives here: the defaults each node starts with,
//! the protocol constants that are not worth exposing as options, and the
//! [`MeshConfig`] struct callers override at construction time.
//!
//! Timing values are plain milliseconds (`u64`) so the config serializes
//! cleanly to JSON; the `*_interval()` helpers hand out `Duration`s for the
//! schedulers.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::MeshError;

// ---------------------------------------------------------------------------
// Membership
// ---------------------------------------------------------------------------

/// Maximum number of peers a node keeps in its peer table.
pub const DEFAULT_MAX_PEERS: usize = 5;

/// Smoothing factor for the per-peer reliability estimate. Each send moves
/// the estimate 20% of the way toward 1.0 (success) or 0.0 (failure).
pub const RELIABILITY_SMOOTHING: f64 = 0.2;

// ---------------------------------------------------------------------------
// Heartbeat & Failure Detection
// ---------------------------------------------------------------------------

/// How often liveness probes go out to every connected peer.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 3_000;

/// A peer silent for longer than this is suspected.
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 10_000;

/// Consecutive missed checks required before a suspicion becomes a
/// confirmed failure.
pub const DEFAULT_CONFIRMATION_QUORUM: u32 = 2;

/// Below this fraction of reachable peers the node considers itself
/// partitioned.
pub const PARTITION_THRESHOLD: f64 = 0.5;

/// How often network health is recomputed (and partition healing considered).
pub const DEFAULT_HEALTH_CHECK_INTERVAL_MS: u64 = 5_000;

// ---------------------------------------------------------------------------
// Gossip
// ---------------------------------------------------------------------------

/// Number of peers contacted per gossip round.
pub const DEFAULT_GOSSIP_FANOUT: usize = 3;

/// Maximum hops a gossip envelope travels before it stops being forwarded.
pub const DEFAULT_GOSSIP_MAX_ROUNDS: u32 = 10;

/// Interval between gossip rounds.
pub const DEFAULT_GOSSIP_INTERVAL_MS: u64 = 5_000;

/// Once the dedup history grows past this many entries it is trimmed...
pub const GOSSIP_HISTORY_SOFT_CAP: usize = 1_000;

/// ...down to the most recent this-many entries.
pub const GOSSIP_HISTORY_TRIM_TO: usize = 500;

// ---------------------------------------------------------------------------
// Consensus
// ---------------------------------------------------------------------------

/// Approval ratio required by the weighted-vote path.
pub const DEFAULT_CONSENSUS_THRESHOLD: f64 = 0.67;

/// Weighted votes deviating from the median by more than this fraction are
/// discarded before tallying.
pub const OUTLIER_TOLERANCE: f64 = 0.3;

/// Weight of a vote whose declared expertise matches the decision domain.
pub const EXPERTISE_WEIGHT: f64 = 1.5;

/// Weight of every other vote.
pub const BASE_WEIGHT: f64 = 1.0;

/// How many times an unapproved weighted decision is queued for retry
/// before it is dropped.
pub const MAX_WEIGHTED_RETRIES: u32 = 3;

/// Upper bound on queued weighted-vote retries. The oldest is evicted first.
pub const MAX_PENDING_RETRIES: usize = 256;

/// Upper bound on proposals with buffered (early) votes.
pub const MAX_BUFFERED_PROPOSALS: usize = 1_024;

/// Undecided proposals older than this are garbage-collected.
pub const DEFAULT_PROPOSAL_RETENTION_MS: u64 = 300_000;

/// Decisions older than this are pruned.
pub const DEFAULT_DECISION_RETENTION_MS: u64 = 3_600_000;

// ---------------------------------------------------------------------------
// DHT
// ---------------------------------------------------------------------------

/// Ring positions contributed by each physical node.
pub const DEFAULT_DHT_VIRTUAL_NODES: usize = 150;

/// Number of distinct nodes each key is stored on.
pub const DEFAULT_DHT_REPLICATION_FACTOR: usize = 3;

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Deadline for request/response exchanges (DHT store and retrieve).
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;

/// Capacity of the per-node event broadcast channel. Subscribers that fall
/// further behind than this observe a `Lagged` error.
pub const EVENT_CHANNEL_CAPACITY: usize = 1_024;

/// Current wall-clock time in Unix milliseconds.
pub fn now_ms() -> u64 {
    duration_ms(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default(),
    )
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
pub fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ---------------------------------------------------------------------------
// MeshConfig
// ---------------------------------------------------------------------------

/// Construction-time configuration of a mesh node.
///
/// Every field has a default; deserializing a partial JSON document fills
/// the gaps from [`MeshConfig::default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Address advertised to peers in connect notices and gossip summaries.
    pub node_address: String,
    /// Peer table capacity.
    pub max_peers: usize,
    /// Liveness probe interval.
    pub heartbeat_interval_ms: u64,
    /// Silence after which a peer is suspected.
    pub heartbeat_timeout_ms: u64,
    /// Approval ratio for weighted decisions.
    pub consensus_threshold: f64,
    /// Peers contacted per gossip round.
    pub gossip_fanout: usize,
    /// Hop limit for forwarded gossip.
    pub gossip_max_rounds: u32,
    /// Interval between gossip rounds.
    pub gossip_interval_ms: u64,
    /// Missed checks before a failure is confirmed.
    pub confirmation_quorum: u32,
    /// Virtual ring positions per node.
    pub dht_virtual_nodes: usize,
    /// Replicas per stored key.
    pub dht_replication_factor: usize,
    /// Interval between health recomputations.
    pub health_check_interval_ms: u64,
    /// Retention for undecided proposals.
    pub proposal_retention_ms: u64,
    /// Retention for recorded decisions. At least `proposal_retention_ms`.
    pub decision_retention_ms: u64,
    /// Deadline for request/response exchanges.
    pub request_timeout_ms: u64,
    /// Connect to peers learned through gossip when capacity allows.
    pub auto_connect_discovered: bool,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            node_address: String::new(),
            max_peers: DEFAULT_MAX_PEERS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            heartbeat_timeout_ms: DEFAULT_HEARTBEAT_TIMEOUT_MS,
            consensus_threshold: DEFAULT_CONSENSUS_THRESHOLD,
            gossip_fanout: DEFAULT_GOSSIP_FANOUT,
            gossip_max_rounds: DEFAULT_GOSSIP_MAX_ROUNDS,
            gossip_interval_ms: DEFAULT_GOSSIP_INTERVAL_MS,
            confirmation_quorum: DEFAULT_CONFIRMATION_QUORUM,
            dht_virtual_nodes: DEFAULT_DHT_VIRTUAL_NODES,
            dht_replication_factor: DEFAULT_DHT_REPLICATION_FACTOR,
            health_check_interval_ms: DEFAULT_HEALTH_CHECK_INTERVAL_MS,
            proposal_retention_ms: DEFAULT_PROPOSAL_RETENTION_MS,
            decision_retention_ms: DEFAULT_DECISION_RETENTION_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            auto_connect_discovered: true,
        }
    }
}

impl MeshConfig {
    /// Rejects configurations that would make a subsystem degenerate
    /// (zero fanout, zero replicas, a threshold outside `(0, 1]`, ...).
    pub fn validate(&self) -> Result<(), MeshError> {
        let invalid = |msg: &str| Err(MeshError::InvalidConfig(msg.to_string()));

        if self.max_peers == 0 {
            return invalid("max_peers must be at least 1");
        }
        if self.heartbeat_interval_ms == 0 || self.heartbeat_timeout_ms == 0 {
            return invalid("heartbeat interval and timeout must be non-zero");
        }
        if !(self.consensus_threshold > 0.0 && self.consensus_threshold <= 1.0) {
            return invalid("consensus_threshold must be in (0, 1]");
        }
        if self.gossip_fanout == 0 {
            return invalid("gossip_fanout must be at least 1");
        }
        if self.gossip_interval_ms == 0 || self.health_check_interval_ms == 0 {
            return invalid("gossip and health-check intervals must be non-zero");
        }
        if self.confirmation_quorum == 0 {
            return invalid("confirmation_quorum must be at least 1");
        }
        if self.dht_virtual_nodes == 0 || self.dht_replication_factor == 0 {
            return invalid("dht_virtual_nodes and dht_replication_factor must be at least 1");
        }
        if self.decision_retention_ms < self.proposal_retention_ms {
            return invalid("decision_retention_ms must not be below proposal_retention_ms");
        }
        Ok(())
    }

    /// Gossip round interval.
    pub fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip_interval_ms)
    }

    /// Heartbeat probe interval.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Health recomputation interval.
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Request/response deadline.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
