//! # Heartbeat Monitor
//!
//! Periodic liveness probes plus a two-step failure detector:
//!
//! 1. The first check that finds a peer silent for longer than the timeout
//!    opens a [`FailureSuspicion`] and asks the other peers whether they can
//!    still reach it.
//! 2. Each further silent check escalates the suspicion. Once `attempts`
//!    reaches the confirmation quorum the failure is confirmed: a
//!    `peer_failure` event fires and the peer is disconnected.
//!
//! A fresh heartbeat at any point cancels the suspicion.
//!
//! After a confirmed failure the node checks for a partition (fewer than
//! half of its peers reachable). When partitioned it disconnects every stale
//! peer and asks gossip to rediscover connectivity.

use std::collections::{HashMap, HashSet};

use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{now_ms, MeshConfig, PARTITION_THRESHOLD};
use crate::network::coordinator::Coordinator;
use crate::network::events::MeshEvent;
use crate::network::message::Message;
use crate::network::peers::Peer;

/// Heartbeat parameters derived from [`MeshConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Probe interval in milliseconds.
    pub interval_ms: u64,
    /// Silence after which a peer is suspected.
    pub timeout_ms: u64,
    /// Silent checks needed to confirm a failure.
    pub confirmation_quorum: u32,
}

impl From<&MeshConfig> for HeartbeatConfig {
    fn from(config: &MeshConfig) -> Self {
        Self {
            interval_ms: config.heartbeat_interval_ms,
            timeout_ms: config.heartbeat_timeout_ms,
            confirmation_quorum: config.confirmation_quorum,
        }
    }
}

/// Another peer's answer about a suspect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    /// Peer that answered.
    pub reporter: String,
    /// Whether the reporter can still reach the suspect.
    pub reachable: bool,
    /// Unix ms at which the answer was recorded.
    pub at: u64,
}

/// An open suspicion against one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSuspicion {
    /// The suspect.
    pub peer_id: String,
    /// Unix ms of the first silent check.
    pub first_detected_at: u64,
    /// Silent checks so far.
    pub attempts: u32,
    /// Answers collected from other peers.
    pub confirmations: Vec<Confirmation>,
}

/// What the node should do after a check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Ask the other peers about `suspect`.
    RequestConfirmation {
        /// The newly suspected peer.
        suspect: String,
    },
    /// The peer missed enough checks: remove it.
    ConfirmFailure {
        /// The failed peer.
        peer_id: String,
        /// Silent checks at confirmation.
        attempts: u32,
    },
    /// A suspected peer was heard from again.
    Recovered {
        /// The peer.
        peer_id: String,
    },
}

/// Whether fewer than half of `peers` are reachable. An empty table is not
/// a partition.
pub fn detect_partition<'a>(
    peers: impl IntoIterator<Item = &'a Peer>,
    now: u64,
    timeout_ms: u64,
) -> bool {
    let (total, reachable) = peers.into_iter().fold((0usize, 0usize), |(t, r), p| {
        (t + 1, r + usize::from(p.is_reachable(now, timeout_ms)))
    });
    total > 0 && (reachable as f64 / total as f64) < PARTITION_THRESHOLD
}

/// Failure detector state for one node.
pub struct HeartbeatMonitor {
    node_id: String,
    config: HeartbeatConfig,
    suspicions: Mutex<HashMap<String, FailureSuspicion>>,
}

impl HeartbeatMonitor {
    /// A monitor with no open suspicions.
    pub fn new(node_id: impl Into<String>, config: HeartbeatConfig) -> Self {
        Self {
            node_id: node_id.into(),
            config,
            suspicions: Mutex::new(HashMap::new()),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    /// Opens, escalates or clears suspicions from a peer-table snapshot.
    pub fn evaluate(&self, peers: &[Peer], now: u64) -> Vec<HeartbeatAction> {
        let mut suspicions = self.suspicions.lock();
        let present: HashSet<&str> = peers.iter().map(|p| p.id.as_str()).collect();
        suspicions.retain(|id, _| present.contains(id.as_str()));

        let mut actions = Vec::new();
        for peer in peers {
            if peer.heartbeat_age(now) <= self.config.timeout_ms {
                if suspicions.remove(&peer.id).is_some() {
                    actions.push(HeartbeatAction::Recovered {
                        peer_id: peer.id.clone(),
                    });
                }
                continue;
            }

            let suspicion = suspicions.entry(peer.id.clone()).or_insert_with(|| FailureSuspicion {
                peer_id: peer.id.clone(),
                first_detected_at: now,
                attempts: 0,
                confirmations: Vec::new(),
            });
            suspicion.attempts += 1;
            let attempts = suspicion.attempts;

            if attempts == 1 {
                actions.push(HeartbeatAction::RequestConfirmation {
                    suspect: peer.id.clone(),
                });
            }
            if attempts >= self.config.confirmation_quorum {
                suspicions.remove(&peer.id);
                actions.push(HeartbeatAction::ConfirmFailure {
                    peer_id: peer.id.clone(),
                    attempts,
                });
            }
        }
        actions
    }

    /// Cancels a suspicion after a fresh heartbeat.
    pub fn clear_suspicion(&self, peer_id: &str) -> bool {
        self.suspicions.lock().remove(peer_id).is_some()
    }

    /// Drops all state about a departed peer.
    pub fn forget(&self, peer_id: &str) {
        self.suspicions.lock().remove(peer_id);
    }

    /// Records another peer's answer about a suspect. False if there is no
    /// open suspicion for it.
    pub fn record_confirmation(&self, reporter: &str, suspect: &str, reachable: bool, now: u64) -> bool {
        match self.suspicions.lock().get_mut(suspect) {
            Some(suspicion) => {
                suspicion.confirmations.push(Confirmation {
                    reporter: reporter.to_string(),
                    reachable,
                    at: now,
                });
                true
            }
            None => false,
        }
    }

    /// The open suspicion against a peer.
    pub fn suspicion(&self, peer_id: &str) -> Option<FailureSuspicion> {
        self.suspicions.lock().get(peer_id).cloned()
    }

    /// Number of open suspicions.
    pub fn suspicion_count(&self) -> usize {
        self.suspicions.lock().len()
    }

    /// Answer to another peer asking whether `suspect` is reachable from here.
    pub fn confirmation_response(&self, coordinator: &Coordinator, suspect: &str, now: u64) -> Message {
        let reachable = coordinator
            .peer(suspect)
            .map_or(false, |p| p.is_reachable(now, self.config.timeout_ms));
        Message::FailureConfirmationResponse {
            suspect: suspect.to_string(),
            reachable,
        }
    }

    /// Ids of peers whose heartbeat is older than the timeout.
    pub fn stale_peers(&self, peers: &[Peer], now: u64) -> Vec<String> {
        peers
            .iter()
            .filter(|p| p.heartbeat_age(now) > self.config.timeout_ms)
            .map(|p| p.id.clone())
            .collect()
    }

    /// Probes every peer, then evaluates and acts on suspicions.
    pub async fn run_check(&self, coordinator: &Coordinator) -> Vec<HeartbeatAction> {
        self.run_check_at(coordinator, now_ms()).await
    }

    /// [`run_check`](Self::run_check) as of `now`.
    pub async fn run_check_at(&self, coordinator: &Coordinator, now: u64) -> Vec<HeartbeatAction> {
        let peers = coordinator.peers();

        let probes = peers.iter().map(|peer| {
            let probe = Message::Heartbeat {
                latency_ms: peer.latency_ms,
                sent_at: now,
            };
            async move { (peer.id.as_str(), coordinator.send_message(&peer.id, probe).await) }
        });
        for (peer_id, result) in join_all(probes).await {
            if let Err(e) = result {
                debug!(peer = %peer_id, error = %e, "heartbeat not delivered");
            }
        }

        let actions = self.evaluate(&peers, now);
        for action in &actions {
            match action {
                HeartbeatAction::RequestConfirmation { suspect } => {
                    warn!(node = %self.node_id, peer = %suspect, "peer suspected, requesting confirmation");
                    let others: Vec<String> = coordinator
                        .peer_ids()
                        .into_iter()
                        .filter(|id| id != suspect)
                        .collect();
                    let request = Message::FailureConfirmationRequest {
                        suspect: suspect.clone(),
                    };
                    coordinator.send_to_many(&others, &request).await;
                }
                HeartbeatAction::ConfirmFailure { peer_id, attempts } => {
                    if !coordinator.is_connected(peer_id) {
                        debug!(node = %self.node_id, peer = %peer_id, "already removed by partition healing");
                        continue;
                    }
                    warn!(node = %self.node_id, peer = %peer_id, attempts, "peer failure confirmed");
                    coordinator.events().emit(MeshEvent::PeerFailure {
                        peer_id: peer_id.clone(),
                        attempts: *attempts,
                    });
                    coordinator.disconnect_peer(peer_id).await;
                    if coordinator.update_network_health_at(now).partitioned {
                        self.heal_partition(coordinator, now).await;
                    }
                }
                HeartbeatAction::Recovered { peer_id } => {
                    info!(node = %self.node_id, peer = %peer_id, "suspected peer recovered");
                }
            }
        }
        actions
    }

    /// Disconnects every stale peer and requests rediscovery. Returns the
    /// removed peer ids.
    pub async fn heal_partition(&self, coordinator: &Coordinator, now: u64) -> Vec<String> {
        let stale = self.stale_peers(&coordinator.peers(), now);
        for peer_id in &stale {
            self.forget(peer_id);
            coordinator.disconnect_peer(peer_id).await;
        }
        coordinator.update_network_health_at(now);

        info!(node = %self.node_id, removed = stale.len(), "partition healing, rediscovery requested");
        coordinator.events().emit(MeshEvent::PeerDiscoveryNeeded);
        stale
    }
}
