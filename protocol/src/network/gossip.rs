//! # Gossip Dissemination
//!
//! Epidemic exchange of membership and health snapshots. Every interval the
//! node sends a [`GossipEnvelope`] to `fanout` randomly chosen peers; each
//! receiver merges what it learns and forwards the envelope to a fresh
//! random fanout of its own. Information spreads in O(log N) rounds without
//! any central directory.
//!
//! ## Deduplication
//!
//! An envelope is identified by `(origin, round)`, where `round` is the
//! origin's strictly increasing local counter. Forwarding never changes that
//! key, so a node processes each snapshot at most once no matter how many
//! paths deliver it. The history is purged by age and capped in size.
//!
//! ## Hop limit
//!
//! Forwarded copies carry a hop counter. A copy is only forwarded while
//! `hops + 1 < max_rounds`, so no envelope is ever sent at a hop count of
//! `max_rounds` or more.
//!
//! ## Address book
//!
//! Peer summaries learned from gossip are kept in a small directory. After
//! partition healing asks for rediscovery, the next round offers those
//! entries as reconnection candidates.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::config::{now_ms, MeshConfig, GOSSIP_HISTORY_SOFT_CAP, GOSSIP_HISTORY_TRIM_TO};
use crate::network::coordinator::Coordinator;
use crate::network::message::{Health, Message};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Gossip parameters derived from [`MeshConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipConfig {
    /// Peers contacted per round and per forward.
    pub fanout: usize,
    /// Hop limit for forwarded envelopes.
    pub max_rounds: u32,
    /// Interval between rounds in milliseconds.
    pub interval_ms: u64,
}

impl From<&MeshConfig> for GossipConfig {
    fn from(config: &MeshConfig) -> Self {
        Self {
            fanout: config.gossip_fanout,
            max_rounds: config.gossip_max_rounds,
            interval_ms: config.gossip_interval_ms,
        }
    }
}

impl GossipConfig {
    /// How long a processed `(origin, round)` pair is remembered.
    pub fn history_retention_ms(&self) -> u64 {
        self.interval_ms
            .saturating_mul(u64::from(self.max_rounds))
            .saturating_mul(2)
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// What a node tells the mesh about one of its peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSummary {
    /// Peer id.
    pub id: String,
    /// Peer address.
    pub address: String,
    /// Whether the reporting node considers it connected.
    pub connected: bool,
    /// Last heartbeat the reporting node saw from it (Unix ms).
    pub last_seen: u64,
}

/// A membership and health snapshot. Immutable once sent, except for the
/// hop counter on forwarded copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GossipEnvelope {
    /// Originating node.
    pub node_id: String,
    /// Unix ms at which the origin built the snapshot.
    pub timestamp: u64,
    /// The origin's peers.
    pub peers: Vec<PeerSummary>,
    /// The origin's health sample.
    pub network_health: Health,
    /// The origin's local round counter.
    pub round: u64,
    /// Times this copy has been forwarded.
    pub hops: u32,
}

/// What the node should do in response to an inbound envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum GossipAction {
    /// Send `envelope` to each of `targets`.
    Forward {
        /// The copy to send, hop counter already incremented.
        envelope: GossipEnvelope,
        /// Chosen peers.
        targets: Vec<String>,
    },
    /// Connected peers this node does not know yet.
    Discovered(Vec<PeerSummary>),
    /// A health sample with strictly higher connectivity than ours.
    AdoptHealth(Health),
    /// The origin is our peer and reported these neighbors.
    Adjacency {
        /// The origin.
        peer_id: String,
        /// Its connected peers.
        neighbors: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Disseminator
// ---------------------------------------------------------------------------

/// Per-node gossip state: round counter, dedup history and address book.
pub struct GossipDisseminator {
    node_id: String,
    config: GossipConfig,
    round: AtomicU64,
    history: DashMap<(String, u64), u64>,
    directory: DashMap<String, PeerSummary>,
    discovery_needed: AtomicBool,
}

impl GossipDisseminator {
    /// Creates an empty disseminator.
    pub fn new(node_id: impl Into<String>, config: GossipConfig) -> Self {
        Self {
            node_id: node_id.into(),
            config,
            round: AtomicU64::new(0),
            history: DashMap::new(),
            directory: DashMap::new(),
            discovery_needed: AtomicBool::new(false),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &GossipConfig {
        &self.config
    }

    /// Last round this node originated.
    pub fn current_round(&self) -> u64 {
        self.round.load(Ordering::SeqCst)
    }

    /// Number of remembered `(origin, round)` pairs.
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Builds the next snapshot, advancing the round counter.
    pub fn snapshot(&self, coordinator: &Coordinator, now: u64) -> GossipEnvelope {
        let round = self.round.fetch_add(1, Ordering::SeqCst) + 1;
        let peers = coordinator
            .peers()
            .into_iter()
            .map(|p| PeerSummary {
                id: p.id,
                address: p.address,
                connected: p.connected,
                last_seen: p.last_heartbeat_at,
            })
            .collect();

        self.history.insert((self.node_id.clone(), round), now);
        GossipEnvelope {
            node_id: self.node_id.clone(),
            timestamp: now,
            peers,
            network_health: coordinator.health(),
            round,
            hops: 0,
        }
    }

    /// Runs one gossip round. Returns the number of peers reached.
    pub async fn run_round(&self, coordinator: &Coordinator) -> usize {
        let now = now_ms();
        let targets = select_targets(&coordinator.peer_ids(), self.config.fanout, &[]);

        let mut reached = 0;
        if !targets.is_empty() {
            let envelope = self.snapshot(coordinator, now);
            let round = envelope.round;
            let reports = coordinator
                .send_to_many(&targets, &Message::Gossip(envelope))
                .await;

            for report in &reports {
                match &report.outcome {
                    Ok(_) => reached += 1,
                    Err(e) => warn!(peer = %report.peer_id, error = %e, "gossip send failed"),
                }
            }
            debug!(node = %self.node_id, round, reached, fanout = targets.len(), "gossip round");
        }

        self.purge_history(now);
        reached
    }

    /// Processes an inbound envelope.
    ///
    /// `known_peers` is the local peer table at receipt time. Re-delivering
    /// an already processed `(origin, round)` yields no actions.
    pub fn handle_envelope(
        &self,
        sender: &str,
        envelope: GossipEnvelope,
        known_peers: &[String],
        local_health: &Health,
        now: u64,
    ) -> Vec<GossipAction> {
        let key = (envelope.node_id.clone(), envelope.round);
        if self.history.contains_key(&key) {
            trace!(origin = %envelope.node_id, round = envelope.round, "duplicate gossip dropped");
            return Vec::new();
        }
        self.history.insert(key, now);

        let known: HashSet<&str> = known_peers.iter().map(String::as_str).collect();
        let mut actions = Vec::new();

        let mut discovered = Vec::new();
        for summary in &envelope.peers {
            if summary.id == self.node_id || !summary.connected {
                continue;
            }
            self.remember(summary);
            if !known.contains(summary.id.as_str()) {
                discovered.push(summary.clone());
            }
        }
        if !discovered.is_empty() {
            actions.push(GossipAction::Discovered(discovered));
        }

        if envelope.network_health.connectivity > local_health.connectivity {
            actions.push(GossipAction::AdoptHealth(envelope.network_health.clone()));
        }

        if known.contains(envelope.node_id.as_str()) {
            actions.push(GossipAction::Adjacency {
                peer_id: envelope.node_id.clone(),
                neighbors: envelope
                    .peers
                    .iter()
                    .filter(|s| s.connected)
                    .map(|s| s.id.clone())
                    .collect(),
            });
        }

        if envelope.hops + 1 < self.config.max_rounds {
            let exclude = [sender.to_string(), envelope.node_id.clone()];
            let targets = select_targets(known_peers, self.config.fanout, &exclude);
            if !targets.is_empty() {
                let mut forwarded = envelope;
                forwarded.hops += 1;
                actions.push(GossipAction::Forward {
                    envelope: forwarded,
                    targets,
                });
            }
        }

        actions
    }

    fn remember(&self, summary: &PeerSummary) {
        let fresher = self
            .directory
            .get(&summary.id)
            .map_or(true, |existing| summary.last_seen >= existing.last_seen);
        if fresher {
            self.directory.insert(summary.id.clone(), summary.clone());
        }
    }

    /// Drops history older than the retention window, then trims to the
    /// most recent entries if the history is still oversized.
    pub fn purge_history(&self, now: u64) {
        let retention = self.config.history_retention_ms();
        self.history
            .retain(|_, seen_at| now.saturating_sub(*seen_at) <= retention);

        if self.history.len() > GOSSIP_HISTORY_SOFT_CAP {
            let mut entries: Vec<((String, u64), u64)> = self
                .history
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect();
            entries.sort_by(|a, b| b.1.cmp(&a.1));
            for (key, _) in entries.into_iter().skip(GOSSIP_HISTORY_TRIM_TO) {
                self.history.remove(&key);
            }
        }
    }

    /// Address-book entries that are not in `known_peers`, freshest first.
    pub fn directory_candidates(&self, known_peers: &[String]) -> Vec<PeerSummary> {
        let known: HashSet<&str> = known_peers.iter().map(String::as_str).collect();
        let mut candidates: Vec<PeerSummary> = self
            .directory
            .iter()
            .filter(|e| !known.contains(e.key().as_str()) && *e.key() != self.node_id)
            .map(|e| e.value().clone())
            .collect();
        candidates.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then(a.id.cmp(&b.id)));
        candidates
    }

    /// Removes an address-book entry (for example after it refused us).
    pub fn forget(&self, peer_id: &str) {
        self.directory.remove(peer_id);
    }

    /// Asks the next round to try reconnecting through the address book.
    pub fn request_discovery(&self) {
        self.discovery_needed.store(true, Ordering::SeqCst);
    }

    /// Consumes a pending rediscovery request.
    pub fn take_discovery_request(&self) -> bool {
        self.discovery_needed.swap(false, Ordering::SeqCst)
    }
}

/// Picks up to `fanout` distinct ids uniformly at random, skipping `exclude`.
pub fn select_targets(candidates: &[String], fanout: usize, exclude: &[String]) -> Vec<String> {
    let pool: Vec<&String> = candidates
        .iter()
        .filter(|id| !exclude.contains(id))
        .collect();
    let mut rng = rand::thread_rng();
    pool.choose_multiple(&mut rng, fanout)
        .map(|id| (*id).clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GossipConfig {
        GossipConfig {
            fanout: 3,
            max_rounds: 4,
            interval_ms: 1_000,
        }
    }

    fn summary(id: &str, connected: bool) -> PeerSummary {
        PeerSummary {
            id: id.into(),
            address: format!("local://{id}"),
            connected,
            last_seen: 10,
        }
    }

    fn envelope(origin: &str, round: u64, hops: u32, peers: Vec<PeerSummary>) -> GossipEnvelope {
        GossipEnvelope {
            node_id: origin.into(),
            timestamp: 0,
            peers,
            network_health: Health::default(),
            round,
            hops,
        }
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn redelivery_is_a_no_op() {
        let gossip = GossipDisseminator::new("a", config());
        let known = ids(&["b", "c", "d"]);
        let env = envelope("b", 1, 0, vec![summary("x", true)]);

        let first = gossip.handle_envelope("b", env.clone(), &known, &Health::default(), 0);
        assert!(!first.is_empty());

        let second = gossip.handle_envelope("c", env, &known, &Health::default(), 0);
        assert!(second.is_empty());
        assert_eq!(gossip.history_len(), 1);
    }

    #[test]
    fn forwarding_stops_before_the_hop_limit() {
        let gossip = GossipDisseminator::new("a", config());
        let known = ids(&["b", "c", "d"]);

        let actions = gossip.handle_envelope("b", envelope("z", 1, 2, vec![]), &known, &Health::default(), 0);
        let forward = actions.iter().find_map(|a| match a {
            GossipAction::Forward { envelope, targets } => Some((envelope.hops, targets.clone())),
            _ => None,
        });
        let (hops, targets) = forward.expect("hop 2 of 4 is forwarded");
        assert_eq!(hops, 3);
        assert!(!targets.contains(&"b".to_string()));
        assert!(!targets.contains(&"z".to_string()));

        let actions = gossip.handle_envelope("b", envelope("z", 2, 3, vec![]), &known, &Health::default(), 0);
        assert!(!actions
            .iter()
            .any(|a| matches!(a, GossipAction::Forward { .. })));
    }

    #[test]
    fn unknown_connected_peers_become_candidates() {
        let gossip = GossipDisseminator::new("a", config());
        let known = ids(&["b"]);
        let env = envelope(
            "b",
            1,
            0,
            vec![summary("a", true), summary("b", true), summary("c", true), summary("d", false)],
        );

        let actions = gossip.handle_envelope("b", env, &known, &Health::default(), 0);
        let discovered = actions.iter().find_map(|a| match a {
            GossipAction::Discovered(peers) => Some(peers.clone()),
            _ => None,
        });
        let discovered = discovered.unwrap();
        assert_eq!(discovered.len(), 1);
        assert_eq!(discovered[0].id, "c");

        assert!(actions.contains(&GossipAction::Adjacency {
            peer_id: "b".into(),
            neighbors: ids(&["a", "b", "c"]),
        }));
        assert_eq!(gossip.directory_candidates(&known)[0].id, "c");
    }

    #[test]
    fn only_strictly_better_health_is_proposed() {
        let gossip = GossipDisseminator::new("a", config());
        let known = ids(&["b"]);
        let local = Health {
            connectivity: 0.5,
            ..Health::default()
        };

        let mut same = envelope("b", 1, 0, vec![]);
        same.network_health.connectivity = 0.5;
        let actions = gossip.handle_envelope("b", same, &known, &local, 0);
        assert!(!actions.iter().any(|a| matches!(a, GossipAction::AdoptHealth(_))));

        let mut better = envelope("b", 2, 0, vec![]);
        better.network_health.connectivity = 0.75;
        let actions = gossip.handle_envelope("b", better, &known, &local, 0);
        assert!(actions.iter().any(|a| matches!(a, GossipAction::AdoptHealth(_))));
    }

    #[test]
    fn history_is_purged_by_age_and_capped() {
        let gossip = GossipDisseminator::new("a", config());
        let retention = gossip.config().history_retention_ms();

        for round in 0..(GOSSIP_HISTORY_SOFT_CAP as u64 + 200) {
            gossip.history.insert(("z".into(), round), retention + round);
        }
        gossip.history.insert(("old".into(), 0), 0);

        gossip.purge_history(retention + 1_500);
        assert_eq!(gossip.history_len(), GOSSIP_HISTORY_TRIM_TO);
        assert!(!gossip.history.contains_key(&("old".to_string(), 0)));
        assert!(gossip
            .history
            .contains_key(&("z".to_string(), GOSSIP_HISTORY_SOFT_CAP as u64 + 199)));
    }

    #[test]
    fn target_selection_respects_fanout_and_exclusions() {
        let candidates = ids(&["a", "b", "c", "d", "e"]);
        let picked = select_targets(&candidates, 3, &ids(&["a"]));
        assert_eq!(picked.len(), 3);
        assert!(!picked.contains(&"a".to_string()));

        let all = select_targets(&ids(&["a", "b"]), 3, &[]);
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn discovery_requests_are_consumed_once() {
        let gossip = GossipDisseminator::new("a", config());
        assert!(!gossip.take_discovery_request());
        gossip.request_discovery();
        assert!(gossip.take_discovery_request());
        assert!(!gossip.take_discovery_request());
    }
}
