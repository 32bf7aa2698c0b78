//! # Coordinator
//!
//! Owner of the peer table, the topology map and the network-health sample.
//! Every other subsystem reads membership through the coordinator and asks
//! it to connect or disconnect peers; none of them mutate the table
//! directly.
//!
//! Locks are `parking_lot` and are never held across an `.await`: every
//! method snapshots or mutates the table in a short critical section and
//! then performs transport I/O without any lock taken.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{now_ms, MeshConfig};
use crate::error::MeshError;
use crate::network::events::{EventBus, MeshEvent};
use crate::network::heartbeat::detect_partition;
use crate::network::message::{Envelope, Health, Message};
use crate::network::peers::Peer;
use crate::network::transport::Transport;

/// Outcome of one send within a broadcast.
#[derive(Debug)]
pub struct SendReport {
    /// Target peer.
    pub peer_id: String,
    /// The sent envelope, or why it could not be sent.
    pub outcome: Result<Envelope, MeshError>,
}

impl SendReport {
    /// Whether the send went through.
    pub fn success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Peer table, topology and health owner for one node.
pub struct Coordinator {
    node_id: String,
    address: String,
    max_peers: usize,
    heartbeat_timeout_ms: u64,
    request_timeout: Duration,
    peers: RwLock<HashMap<String, Peer>>,
    topology: RwLock<HashMap<String, BTreeSet<String>>>,
    health: RwLock<Health>,
    transport: Arc<dyn Transport>,
    events: EventBus,
    sent: AtomicU64,
    /// `(sampled_at, sent_at_sample)` of the previous health sample.
    last_sample: Mutex<(u64, u64)>,
}

impl Coordinator {
    /// Creates a coordinator with an empty peer table.
    pub fn new(
        node_id: impl Into<String>,
        config: &MeshConfig,
        transport: Arc<dyn Transport>,
        events: EventBus,
    ) -> Self {
        let node_id = node_id.into();
        let address = if config.node_address.is_empty() {
            format!("local://{node_id}")
        } else {
            config.node_address.clone()
        };
        Self {
            node_id,
            address,
            max_peers: config.max_peers,
            heartbeat_timeout_ms: config.heartbeat_timeout_ms,
            request_timeout: config.request_timeout(),
            peers: RwLock::new(HashMap::new()),
            topology: RwLock::new(HashMap::new()),
            health: RwLock::new(Health::default()),
            transport,
            events,
            sent: AtomicU64::new(0),
            last_sample: Mutex::new((now_ms(), 0)),
        }
    }

    /// This node's id.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// This node's advertised address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Peer table capacity.
    pub fn max_peers(&self) -> usize {
        self.max_peers
    }

    /// Heartbeat silence after which a peer counts as unreachable.
    pub fn heartbeat_timeout_ms(&self) -> u64 {
        self.heartbeat_timeout_ms
    }

    /// The node's event bus.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // -----------------------------------------------------------------------
    // Membership
    // -----------------------------------------------------------------------

    /// Adds a peer and notifies it.
    ///
    /// Idempotent: an already connected peer is returned unchanged and no
    /// notice or event is produced.
    pub async fn connect_peer(&self, id: &str, address: &str) -> Result<Peer, MeshError> {
        let peer = match self.insert_peer(id, address)? {
            Inserted::Existing(peer) => return Ok(peer),
            Inserted::New(peer) => peer,
        };

        let notice = Message::PeerConnect {
            address: self.address.clone(),
        };
        if let Err(e) = self.send_message(id, notice).await {
            warn!(peer = %id, error = %e, "connect notice not delivered");
        }

        info!(node = %self.node_id, peer = %id, "peer connected");
        self.events.emit(MeshEvent::PeerConnected {
            peer_id: peer.id.clone(),
            address: peer.address.clone(),
        });
        Ok(peer)
    }

    /// Handles an inbound connect notice.
    ///
    /// A known sender just counts as a fresh heartbeat. When the table is
    /// full the sender is told to drop us so both tables stay symmetric.
    pub async fn accept_peer(&self, id: &str, address: &str) -> Result<Peer, MeshError> {
        match self.insert_peer(id, address) {
            Ok(Inserted::Existing(peer)) => {
                self.record_heartbeat(id, now_ms());
                Ok(peer)
            }
            Ok(Inserted::New(peer)) => {
                info!(node = %self.node_id, peer = %id, "peer accepted");
                self.events.emit(MeshEvent::PeerConnected {
                    peer_id: peer.id.clone(),
                    address: peer.address.clone(),
                });
                Ok(peer)
            }
            Err(e) => {
                if matches!(e, MeshError::CapacityExceeded { .. }) {
                    debug!(node = %self.node_id, peer = %id, "rejecting inbound peer, table full");
                    self.notify(id, Message::PeerDisconnect).await;
                }
                Err(e)
            }
        }
    }

    fn insert_peer(&self, id: &str, address: &str) -> Result<Inserted, MeshError> {
        if id == self.node_id {
            return Err(MeshError::SelfConnection(id.to_string()));
        }

        let mut peers = self.peers.write();
        if let Some(existing) = peers.get(id) {
            return Ok(Inserted::Existing(existing.clone()));
        }
        if peers.len() >= self.max_peers {
            return Err(MeshError::CapacityExceeded {
                current: peers.len(),
                max: self.max_peers,
            });
        }

        let peer = Peer::new(id, address, now_ms());
        peers.insert(id.to_string(), peer.clone());
        drop(peers);

        self.topology
            .write()
            .insert(id.to_string(), BTreeSet::from([self.node_id.clone()]));
        Ok(Inserted::New(peer))
    }

    /// Removes a peer and tells it so. Returns false if it was unknown.
    pub async fn disconnect_peer(&self, id: &str) -> bool {
        {
            let mut peers = self.peers.write();
            match peers.get_mut(id) {
                Some(peer) => peer.connected = false,
                None => return false,
            }
        }

        self.notify(id, Message::PeerDisconnect).await;
        self.remove_peer(id);
        true
    }

    /// Handles an inbound disconnect notice: removes without notifying back.
    pub fn drop_peer(&self, id: &str) -> bool {
        self.remove_peer(id)
    }

    fn remove_peer(&self, id: &str) -> bool {
        if self.peers.write().remove(id).is_none() {
            return false;
        }
        {
            let mut topology = self.topology.write();
            topology.remove(id);
            for neighbors in topology.values_mut() {
                neighbors.remove(id);
            }
        }

        info!(node = %self.node_id, peer = %id, "peer disconnected");
        self.events.emit(MeshEvent::PeerDisconnected {
            peer_id: id.to_string(),
        });
        self.update_network_health();
        true
    }

    // -----------------------------------------------------------------------
    // Messaging
    // -----------------------------------------------------------------------

    /// Builds an envelope from this node.
    pub fn envelope(&self, to: &str, message: Message) -> Envelope {
        Envelope {
            id: Uuid::new_v4().to_string(),
            from: self.node_id.clone(),
            to: to.to_string(),
            timestamp: now_ms(),
            message,
        }
    }

    /// Sends to a connected peer and returns the sent envelope.
    pub async fn send_message(&self, id: &str, message: Message) -> Result<Envelope, MeshError> {
        self.ensure_connected(id)?;
        let envelope = self.envelope(id, message);

        let started = Instant::now();
        let result = self.transport.send(envelope.clone()).await;
        self.record_send(id, result.is_ok(), started);

        result?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(envelope)
    }

    /// Sends to a connected peer and waits for its reply.
    pub async fn request(&self, id: &str, message: Message) -> Result<Option<Message>, MeshError> {
        self.ensure_connected(id)?;
        let envelope = self.envelope(id, message);

        let started = Instant::now();
        let result = self.transport.request(envelope, self.request_timeout).await;
        self.record_send(id, result.is_ok(), started);

        let reply = result?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(reply)
    }

    /// Sends the same message to each listed peer concurrently.
    pub async fn send_to_many(&self, ids: &[String], message: &Message) -> Vec<SendReport> {
        let sends = ids.iter().map(|id| async move {
            SendReport {
                peer_id: id.clone(),
                outcome: self.send_message(id, message.clone()).await,
            }
        });
        join_all(sends).await
    }

    /// Sends to every connected peer. Failures are reported per peer.
    pub async fn broadcast(&self, message: Message) -> Vec<SendReport> {
        let ids = self.peer_ids();
        let reports = self.send_to_many(&ids, &message).await;
        let failed = reports.iter().filter(|r| !r.success()).count();
        if failed > 0 {
            debug!(
                node = %self.node_id,
                kind = message.kind(),
                failed,
                total = reports.len(),
                "broadcast partially failed"
            );
        }
        reports
    }

    /// Best-effort delivery that bypasses the peer table.
    async fn notify(&self, id: &str, message: Message) {
        let envelope = self.envelope(id, message);
        if let Err(e) = self.transport.send(envelope).await {
            debug!(peer = %id, error = %e, "notice not delivered");
        }
    }

    fn ensure_connected(&self, id: &str) -> Result<(), MeshError> {
        match self.peers.read().get(id) {
            Some(peer) if peer.connected => Ok(()),
            _ => Err(MeshError::PeerNotConnected(id.to_string())),
        }
    }

    fn record_send(&self, id: &str, success: bool, started: Instant) {
        let latency = started.elapsed().as_secs_f64() * 1_000.0;
        if let Some(peer) = self.peers.write().get_mut(id) {
            peer.record_send(success, latency);
        }
    }

    // -----------------------------------------------------------------------
    // Peer table views
    // -----------------------------------------------------------------------

    /// A snapshot of one peer.
    pub fn peer(&self, id: &str) -> Option<Peer> {
        self.peers.read().get(id).cloned()
    }

    /// Snapshot of the peer table, sorted by id.
    pub fn peers(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.read().values().cloned().collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    /// Ids of connected peers, sorted.
    pub fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .peers
            .read()
            .values()
            .filter(|p| p.connected)
            .map(|p| p.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Number of entries in the peer table.
    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Whether `id` is a connected peer.
    pub fn is_connected(&self, id: &str) -> bool {
        self.peers.read().get(id).map_or(false, |p| p.connected)
    }

    /// Refreshes a peer's heartbeat timestamp. False if the peer is unknown.
    pub fn record_heartbeat(&self, id: &str, at: u64) -> bool {
        match self.peers.write().get_mut(id) {
            Some(peer) => {
                peer.last_heartbeat_at = at;
                true
            }
            None => false,
        }
    }

    /// Records the neighbors a peer reported about itself through gossip.
    pub fn record_adjacency(&self, peer_id: &str, neighbors: impl IntoIterator<Item = String>) {
        if !self.is_connected(peer_id) {
            return;
        }
        let mut set: BTreeSet<String> = neighbors.into_iter().collect();
        set.insert(self.node_id.clone());
        self.topology.write().insert(peer_id.to_string(), set);
    }

    /// Snapshot of the topology map.
    pub fn topology(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.topology
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Health
    // -----------------------------------------------------------------------

    /// The current health sample.
    pub fn health(&self) -> Health {
        self.health.read().clone()
    }

    /// Adopts a remote sample if it reports strictly higher connectivity.
    pub fn adopt_health(&self, remote: &Health) -> bool {
        let mut health = self.health.write();
        if remote.connectivity > health.connectivity {
            *health = remote.clone();
            true
        } else {
            false
        }
    }

    /// Recomputes health from the peer table as of now.
    pub fn update_network_health(&self) -> Health {
        self.update_network_health_at(now_ms())
    }

    /// Recomputes health as of `now`.
    ///
    /// Emits `health_updated`, plus `partition_detected` when the sample
    /// flips to partitioned.
    pub fn update_network_health_at(&self, now: u64) -> Health {
        let (connectivity, latency, partitioned) = {
            let peers = self.peers.read();
            let total = peers.len();
            let reachable = peers
                .values()
                .filter(|p| p.is_reachable(now, self.heartbeat_timeout_ms))
                .count();
            let connectivity = if total == 0 {
                0.0
            } else {
                reachable as f64 / total as f64
            };
            let latency = if total == 0 {
                0.0
            } else {
                peers.values().map(|p| p.latency_ms).sum::<f64>() / total as f64
            };
            let partitioned = detect_partition(peers.values(), now, self.heartbeat_timeout_ms);
            (connectivity, latency, partitioned)
        };

        let throughput = {
            let sent = self.sent.load(Ordering::Relaxed);
            let mut last = self.last_sample.lock();
            let elapsed_ms = now.saturating_sub(last.0);
            let rate = if elapsed_ms == 0 {
                0.0
            } else {
                sent.saturating_sub(last.1) as f64 * 1_000.0 / elapsed_ms as f64
            };
            *last = (now, sent);
            rate
        };

        let health = Health {
            connectivity,
            latency,
            throughput,
            partitioned,
        };
        let was_partitioned = {
            let mut current = self.health.write();
            let previous = current.partitioned;
            *current = health.clone();
            previous
        };

        self.events.emit(MeshEvent::HealthUpdated {
            health: health.clone(),
        });
        if partitioned && !was_partitioned {
            warn!(node = %self.node_id, connectivity, "network partition detected");
            self.events.emit(MeshEvent::PartitionDetected {
                health: health.clone(),
            });
        }
        health
    }
}

enum Inserted {
    Existing(Peer),
    New(Peer),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::transport::{Inbound, LatencyModel, LocalNetwork};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn coordinator(
        net: &Arc<LocalNetwork>,
        id: &str,
        max_peers: usize,
    ) -> (Coordinator, UnboundedReceiver<Inbound>) {
        let (transport, rx) = net.attach(id);
        let config = MeshConfig {
            max_peers,
            ..MeshConfig::default()
        };
        (Coordinator::new(id, &config, transport, EventBus::new()), rx)
    }

    #[tokio::test]
    async fn connect_is_idempotent_and_capacity_bound() {
        let net = LocalNetwork::new(LatencyModel::none());
        let (a, _a_rx) = coordinator(&net, "a", 2);
        let (_b, _b_rx) = coordinator(&net, "b", 2);

        let first = a.connect_peer("b", "local://b").await.unwrap();
        let again = a.connect_peer("b", "elsewhere").await.unwrap();
        assert_eq!(again.address, first.address);
        assert_eq!(a.peer_count(), 1);

        a.connect_peer("c", "local://c").await.unwrap();
        let err = a.connect_peer("d", "local://d").await.unwrap_err();
        assert!(matches!(err, MeshError::CapacityExceeded { current: 2, max: 2 }));
    }

    #[tokio::test]
    async fn self_connection_is_rejected() {
        let net = LocalNetwork::new(LatencyModel::none());
        let (a, _a_rx) = coordinator(&net, "a", 2);
        assert!(matches!(
            a.connect_peer("a", "local://a").await,
            Err(MeshError::SelfConnection(_))
        ));
    }

    #[tokio::test]
    async fn topology_starts_with_self_and_is_cleared_on_disconnect() {
        let net = LocalNetwork::new(LatencyModel::none());
        let (a, _a_rx) = coordinator(&net, "a", 4);
        let mut events = a.events().subscribe();

        a.connect_peer("b", "local://b").await.unwrap();
        assert_eq!(a.topology()["b"], BTreeSet::from(["a".to_string()]));

        assert!(a.disconnect_peer("b").await);
        assert!(!a.disconnect_peer("b").await);
        assert!(a.topology().is_empty());
        assert!(!a.is_connected("b"));

        assert_eq!(events.recv().await.unwrap().kind(), "peer_connected");
        assert_eq!(events.recv().await.unwrap().kind(), "peer_disconnected");
        assert_eq!(events.recv().await.unwrap().kind(), "health_updated");
    }

    #[tokio::test]
    async fn send_requires_a_connected_peer() {
        let net = LocalNetwork::new(LatencyModel::none());
        let (a, _a_rx) = coordinator(&net, "a", 4);
        let err = a
            .send_message("ghost", Message::PeerDisconnect)
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::PeerNotConnected(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn broadcast_reports_failures_per_peer() {
        let net = LocalNetwork::new(LatencyModel::none());
        let (a, _a_rx) = coordinator(&net, "a", 4);
        let (_b, _b_rx) = coordinator(&net, "b", 4);
        let (_c, _c_rx) = coordinator(&net, "c", 4);
        a.connect_peer("b", "local://b").await.unwrap();
        a.connect_peer("c", "local://c").await.unwrap();

        net.isolate("c");
        let reports = a
            .broadcast(Message::Heartbeat {
                latency_ms: 0.0,
                sent_at: 0,
            })
            .await;

        assert_eq!(reports.len(), 2);
        let ok: Vec<_> = reports.iter().filter(|r| r.success()).collect();
        assert_eq!(ok.len(), 1);
        assert_eq!(ok[0].peer_id, "b");
        assert!(a.peer("c").unwrap().reliability < 1.0);
    }

    #[tokio::test]
    async fn health_tracks_reachable_fraction() {
        let net = LocalNetwork::new(LatencyModel::none());
        let (a, _a_rx) = coordinator(&net, "a", 8);
        for id in ["b", "c", "d", "e"] {
            a.connect_peer(id, id).await.unwrap();
        }
        let now = now_ms() + 1;
        let stale = now - a.heartbeat_timeout_ms() - 1;
        a.record_heartbeat("d", stale);
        a.record_heartbeat("e", stale);

        let health = a.update_network_health_at(now);
        assert!((health.connectivity - 0.5).abs() < 1e-9);
        assert!(!health.partitioned);

        a.record_heartbeat("c", stale);
        let health = a.update_network_health_at(now);
        assert!((health.connectivity - 0.25).abs() < 1e-9);
        assert!(health.partitioned);
    }

    #[tokio::test]
    async fn only_better_health_is_adopted() {
        let net = LocalNetwork::new(LatencyModel::none());
        let (a, _a_rx) = coordinator(&net, "a", 4);
        let better = Health {
            connectivity: 0.9,
            ..Health::default()
        };
        assert!(a.adopt_health(&better));
        assert!(!a.adopt_health(&better));
        assert_eq!(a.health().connectivity, 0.9);
    }
}
