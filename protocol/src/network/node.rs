//! # Mesh Node
//!
//! The `MeshNode` is the top-level runtime entity for one mesh participant.
//! It owns the coordinator and the four subsystems and drives them from a
//! small set of tokio tasks:
//!
//! ```text
//! inbound loop     one envelope at a time, dispatched by message type
//! gossip tick      every gossip_interval_ms
//! heartbeat tick   every heartbeat_interval_ms
//! health tick      every health_check_interval_ms (also ages out proposals)
//! membership pump  peer_connected / peer_disconnected -> DHT ring + cleanup
//! ```
//!
//! Lifecycle:
//!
//! ```text
//! new() -> start() -> [running] -> stop() -> stopped (cannot restart)
//! ```
//!
//! Inbound handlers only ever perform one-way sends, never requests, so
//! two nodes can never wait on each other's inbound loops.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::config::{duration_ms, now_ms, MeshConfig};
use crate::error::MeshError;
use crate::network::consensus::{ConsensusAction, ConsensusEngine, ConsensusError, Decision};
use crate::network::coordinator::{Coordinator, SendReport};
use crate::network::dht::{DistributedHashTable, StoreOutcome};
use crate::network::events::{EventBus, MeshEvent};
use crate::network::gossip::{GossipAction, GossipDisseminator};
use crate::network::heartbeat::HeartbeatMonitor;
use crate::network::message::{Envelope, Health, Message};
use crate::network::peers::Peer;
use crate::network::transport::{Inbound, LocalNetwork, Transport};
use crate::network::voting::{
    PendingRetry, WeightedOutcome, WeightedProposal, WeightedVote, WeightedVoting,
};

// ---------------------------------------------------------------------------
// Node Status
// ---------------------------------------------------------------------------

/// Snapshot returned by [`MeshNode::status`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    /// Node id.
    pub node_id: String,
    /// Whether the background tasks are running.
    pub initialized: bool,
    /// Peer table, sorted by id.
    pub peers: Vec<Peer>,
    /// Peer id to known neighbors.
    pub topology: BTreeMap<String, BTreeSet<String>>,
    /// Latest health sample.
    pub health: Health,
    /// Active configuration.
    pub config: MeshConfig,
}

// ---------------------------------------------------------------------------
// Mesh Node
// ---------------------------------------------------------------------------

/// A mesh participant. Cloning shares the same node.
///
/// Call [`stop`](Self::stop) before dropping the last handle: the background
/// tasks hold clones of the node and keep it alive while they run.
#[derive(Clone)]
pub struct MeshNode {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    id: String,
    config: MeshConfig,
    coordinator: Coordinator,
    gossip: GossipDisseminator,
    consensus: ConsensusEngine,
    voting: WeightedVoting,
    heartbeat: HeartbeatMonitor,
    dht: DistributedHashTable,
    events: EventBus,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
    stopped: AtomicBool,
}

impl MeshNode {
    /// Builds a node on an arbitrary transport. `inbox` receives every
    /// envelope addressed to this node.
    pub fn new(
        id: impl Into<String>,
        config: MeshConfig,
        transport: Arc<dyn Transport>,
        inbox: mpsc::UnboundedReceiver<Inbound>,
    ) -> Result<Self, MeshError> {
        config.validate()?;
        let id = id.into();
        let events = EventBus::new();
        let (shutdown, _) = watch::channel(false);

        let inner = NodeInner {
            coordinator: Coordinator::new(id.clone(), &config, transport, events.clone()),
            gossip: GossipDisseminator::new(id.clone(), (&config).into()),
            consensus: ConsensusEngine::new(id.clone()),
            voting: WeightedVoting::new(config.consensus_threshold),
            heartbeat: HeartbeatMonitor::new(id.clone(), (&config).into()),
            dht: DistributedHashTable::new(id.clone(), (&config).into()),
            events,
            inbox: Mutex::new(Some(inbox)),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            id,
            config,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Builds a node attached to an in-process network.
    pub fn local(
        id: impl Into<String>,
        config: MeshConfig,
        network: &Arc<LocalNetwork>,
    ) -> Result<Self, MeshError> {
        let id = id.into();
        let (transport, inbox) = network.attach(&id);
        Self::new(id, config, transport, inbox)
    }

    /// Node id.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Active configuration.
    pub fn config(&self) -> &MeshConfig {
        &self.inner.config
    }

    /// The coordinator.
    pub fn coordinator(&self) -> &Coordinator {
        &self.inner.coordinator
    }

    /// The consensus engine.
    pub fn consensus(&self) -> &ConsensusEngine {
        &self.inner.consensus
    }

    /// The gossip disseminator.
    pub fn gossip(&self) -> &GossipDisseminator {
        &self.inner.gossip
    }

    /// The heartbeat monitor.
    pub fn heartbeat(&self) -> &HeartbeatMonitor {
        &self.inner.heartbeat
    }

    /// The DHT.
    pub fn dht(&self) -> &DistributedHashTable {
        &self.inner.dht
    }

    /// Subscribes to this node's event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.inner.events.subscribe()
    }

    /// Whether the background tasks are running.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Spawns the inbound loop, the periodic tasks and the membership pump.
    /// Starting a running node is a no-op; a stopped node cannot restart.
    pub fn start(&self) -> Result<(), MeshError> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(MeshError::Stopped);
        }
        let Some(inbox) = self.inner.inbox.lock().take() else {
            return Ok(());
        };

        let config = &self.inner.config;
        let mut tasks = vec![
            self.spawn_inbound_loop(inbox),
            self.spawn_membership_pump(),
            self.spawn_ticker("gossip", config.gossip_interval(), |node| async move {
                node.gossip_round().await;
            }),
            self.spawn_ticker("heartbeat", config.heartbeat_interval(), |node| async move {
                node.heartbeat_check().await;
            }),
            self.spawn_ticker("health", config.health_check_interval(), |node| async move {
                node.health_check();
            }),
        ];
        self.inner.tasks.lock().append(&mut tasks);
        self.inner.running.store(true, Ordering::SeqCst);

        info!(node = %self.inner.id, address = %self.inner.coordinator.address(), "mesh node started");
        Ok(())
    }

    /// Signals every task to exit and waits for them.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.inbox.lock().take();
        let _ = self.inner.shutdown.send(true);

        let handles: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(node = %self.inner.id, error = %e, "task ended abnormally");
            }
        }
        info!(node = %self.inner.id, "mesh node stopped");
    }

    fn spawn_inbound_loop(&self, mut inbox: mpsc::UnboundedReceiver<Inbound>) -> JoinHandle<()> {
        let node = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    inbound = inbox.recv() => match inbound {
                        Some(inbound) => node.handle_inbound(inbound).await,
                        None => break,
                    },
                }
            }
            debug!(node = %node.inner.id, "inbound loop exited");
        })
    }

    fn spawn_ticker<F, Fut>(&self, task: &'static str, period: Duration, tick: F) -> JoinHandle<()>
    where
        F: Fn(MeshNode) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let node = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = interval.tick() => tick(node.clone()).await,
                }
            }
            debug!(node = %node.inner.id, task, "periodic task exited");
        })
    }

    fn spawn_membership_pump(&self) -> JoinHandle<()> {
        let node = self.clone();
        let mut events = self.subscribe();
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.changed() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(MeshEvent::PeerConnected { .. }) => {
                        node.sync_dht().await;
                    }
                    Ok(MeshEvent::PeerDisconnected { peer_id }) => {
                        node.purge_peer(&peer_id);
                        node.sync_dht().await;
                    }
                    Ok(MeshEvent::PeerDiscoveryNeeded) => node.inner.gossip.request_discovery(),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(node = %node.inner.id, skipped, "membership pump lagged, resyncing");
                        node.sync_dht().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    // -----------------------------------------------------------------------
    // Programmatic API
    // -----------------------------------------------------------------------

    /// Adds a peer. See [`Coordinator::connect_peer`].
    pub async fn connect(&self, id: &str, address: &str) -> Result<Peer, MeshError> {
        self.inner.coordinator.connect_peer(id, address).await
    }

    /// Removes a peer. Returns false if it was not connected.
    pub async fn disconnect(&self, id: &str) -> bool {
        let removed = self.inner.coordinator.disconnect_peer(id).await;
        if removed {
            self.purge_peer(id);
        }
        removed
    }

    /// Sends one message to a connected peer.
    pub async fn send(&self, id: &str, message: Message) -> Result<Envelope, MeshError> {
        self.inner.coordinator.send_message(id, message).await
    }

    /// Sends one message to every connected peer.
    pub async fn broadcast(&self, message: Message) -> Vec<SendReport> {
        self.inner.coordinator.broadcast(message).await
    }

    /// Runs a three-phase proposal and waits up to `timeout` for it to
    /// execute locally.
    pub async fn propose(
        &self,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<Decision, MeshError> {
        if !self.is_running() {
            return Err(MeshError::NotRunning);
        }
        let consensus = &self.inner.consensus;
        let coordinator = &self.inner.coordinator;

        let (pre_prepare, decided) = consensus.begin_proposal(payload)?;
        let proposal_id = pre_prepare.proposal_id.clone();

        let actions =
            consensus.handle_pre_prepare(&self.inner.id, pre_prepare.clone(), &self.members(), now_ms())?;
        coordinator
            .broadcast(Message::ConsensusProposal(pre_prepare))
            .await;
        self.apply_consensus(actions).await;

        match tokio::time::timeout(timeout, decided).await {
            Ok(Ok(decision)) => Ok(decision),
            Ok(Err(_)) | Err(_) => {
                consensus.abandon(&proposal_id);
                warn!(node = %self.inner.id, proposal = %proposal_id, "proposal timed out");
                Err(MeshError::ConsensusTimeout {
                    proposal_id,
                    timeout_ms: duration_ms(timeout),
                })
            }
        }
    }

    /// Tallies a weighted-vote decision.
    pub fn decide_weighted(&self, proposal: &WeightedProposal, votes: &[WeightedVote]) -> WeightedOutcome {
        self.inner.voting.decide(proposal, votes)
    }

    /// Takes the oldest unapproved weighted proposal off the retry queue.
    pub fn take_weighted_retry(&self) -> Option<PendingRetry> {
        self.inner.voting.take_retry()
    }

    /// Tallies a taken retry against fresh votes. Still unapproved
    /// proposals go back on the queue until their attempts run out.
    pub fn retry_weighted(&self, pending: PendingRetry, votes: &[WeightedVote]) -> WeightedOutcome {
        self.inner.voting.retry(pending, votes)
    }

    /// Stores a value on the key's replica set.
    pub async fn store(&self, key: &str, value: serde_json::Value) -> Vec<StoreOutcome> {
        self.sync_dht().await;
        self.inner
            .dht
            .store(&self.inner.coordinator, key, value)
            .await
    }

    /// Fetches a value from the key's primary owner.
    pub async fn retrieve(&self, key: &str) -> Option<serde_json::Value> {
        self.sync_dht().await;
        self.inner.dht.retrieve(&self.inner.coordinator, key).await
    }

    /// Current node snapshot.
    pub fn status(&self) -> NodeStatus {
        let coordinator = &self.inner.coordinator;
        NodeStatus {
            node_id: self.inner.id.clone(),
            initialized: self.is_running(),
            peers: coordinator.peers(),
            topology: coordinator.topology(),
            health: coordinator.health(),
            config: self.inner.config.clone(),
        }
    }

    // -----------------------------------------------------------------------
    // Periodic work
    // -----------------------------------------------------------------------

    /// One gossip round. Pending rediscovery reconnects through the address
    /// book first.
    pub async fn gossip_round(&self) -> usize {
        let coordinator = &self.inner.coordinator;
        let gossip = &self.inner.gossip;

        if gossip.take_discovery_request() {
            for candidate in gossip.directory_candidates(&coordinator.peer_ids()) {
                if coordinator.peer_count() >= coordinator.max_peers() {
                    break;
                }
                match coordinator.connect_peer(&candidate.id, &candidate.address).await {
                    Ok(_) => info!(node = %self.inner.id, peer = %candidate.id, "reconnected through gossip"),
                    Err(e) => {
                        debug!(node = %self.inner.id, peer = %candidate.id, error = %e, "rediscovery failed");
                        gossip.forget(&candidate.id);
                    }
                }
            }
        }

        gossip.run_round(coordinator).await
    }

    /// One heartbeat check.
    pub async fn heartbeat_check(&self) {
        self.inner.heartbeat.run_check(&self.inner.coordinator).await;
    }

    /// Recomputes health and ages out undecided proposals.
    pub fn health_check(&self) -> Health {
        let health = self.inner.coordinator.update_network_health();
        self.inner
            .consensus
            .collect_garbage(
                now_ms(),
                self.inner.config.proposal_retention_ms,
                self.inner.config.decision_retention_ms,
            );
        health
    }

    // -----------------------------------------------------------------------
    // Inbound dispatch
    // -----------------------------------------------------------------------

    async fn handle_inbound(&self, inbound: Inbound) {
        let Inbound { envelope, reply } = inbound;
        let reply_message = self.handle_message(envelope).await;
        if let Some(reply) = reply {
            let _ = reply.send(reply_message);
        }
    }

    /// Dispatches one envelope to the owning subsystem. Returns the reply
    /// for request/response messages.
    pub async fn handle_message(&self, envelope: Envelope) -> Option<Message> {
        let coordinator = &self.inner.coordinator;
        let from = envelope.from;
        let now = now_ms();
        trace!(node = %self.inner.id, from = %from, kind = envelope.message.kind(), "inbound");

        match envelope.message {
            Message::PeerConnect { address } => {
                if let Err(e) = coordinator.accept_peer(&from, &address).await {
                    debug!(node = %self.inner.id, peer = %from, error = %e, "inbound connect refused");
                }
                None
            }
            Message::PeerDisconnect => {
                if coordinator.drop_peer(&from) {
                    self.purge_peer(&from);
                }
                None
            }
            Message::Heartbeat { .. } => {
                if coordinator.record_heartbeat(&from, now) {
                    self.inner.heartbeat.clear_suspicion(&from);
                }
                None
            }
            Message::Gossip(envelope) => {
                if !coordinator.is_connected(&from) {
                    trace!(node = %self.inner.id, from = %from, "gossip from non-peer dropped");
                    return None;
                }
                let actions = self.inner.gossip.handle_envelope(
                    &from,
                    envelope,
                    &coordinator.peer_ids(),
                    &coordinator.health(),
                    now,
                );
                self.apply_gossip(actions).await;
                None
            }
            Message::ConsensusProposal(pre_prepare) => {
                if !coordinator.is_connected(&from) {
                    return None;
                }
                let result =
                    self.inner
                        .consensus
                        .handle_pre_prepare(&from, pre_prepare, &self.members(), now);
                self.consensus_outcome(&from, result).await;
                None
            }
            Message::ConsensusVote(vote) => {
                if !coordinator.is_connected(&from) {
                    return None;
                }
                let result = self
                    .inner
                    .consensus
                    .handle_vote(&from, vote, &self.members(), now);
                self.consensus_outcome(&from, result).await;
                None
            }
            Message::FailureConfirmationRequest { suspect } => {
                let response = self
                    .inner
                    .heartbeat
                    .confirmation_response(coordinator, &suspect, now);
                if let Err(e) = coordinator.send_message(&from, response).await {
                    debug!(node = %self.inner.id, peer = %from, error = %e, "confirmation response not delivered");
                }
                None
            }
            Message::FailureConfirmationResponse { suspect, reachable } => {
                self.inner
                    .heartbeat
                    .record_confirmation(&from, &suspect, reachable, now);
                None
            }
            Message::DhtStore { entry } => {
                let key = entry.key.clone();
                self.inner.dht.store_local(entry);
                Some(Message::DhtStoreAck { key })
            }
            Message::DhtRetrieve { key } => Some(Message::DhtValue {
                value: self.inner.dht.get_local(&key),
                key,
            }),
            Message::DhtStoreAck { .. } | Message::DhtValue { .. } => None,
        }
    }

    async fn consensus_outcome(
        &self,
        from: &str,
        result: Result<Vec<ConsensusAction>, ConsensusError>,
    ) {
        match result {
            Ok(actions) => self.apply_consensus(actions).await,
            Err(ConsensusError::UnknownProposal(id)) => {
                debug!(node = %self.inner.id, from = %from, proposal = %id, "vote for unknown proposal buffered");
            }
            Err(e) => warn!(node = %self.inner.id, from = %from, error = %e, "consensus message rejected"),
        }
    }

    async fn apply_consensus(&self, actions: Vec<ConsensusAction>) {
        for action in actions {
            match action {
                ConsensusAction::Broadcast(message) => {
                    self.inner.coordinator.broadcast(message).await;
                }
                ConsensusAction::Executed(decision) => {
                    self.inner
                        .events
                        .emit(MeshEvent::ConsensusReached { decision });
                }
            }
        }
    }

    async fn apply_gossip(&self, actions: Vec<GossipAction>) {
        let coordinator = &self.inner.coordinator;
        for action in actions {
            match action {
                GossipAction::Forward { envelope, targets } => {
                    coordinator
                        .send_to_many(&targets, &Message::Gossip(envelope))
                        .await;
                }
                GossipAction::Discovered(peers) => {
                    self.inner.events.emit(MeshEvent::PeerDiscovered {
                        peers: peers.clone(),
                    });
                    if !self.inner.config.auto_connect_discovered {
                        continue;
                    }
                    for peer in peers {
                        if coordinator.peer_count() >= coordinator.max_peers() {
                            break;
                        }
                        if let Err(e) = coordinator.connect_peer(&peer.id, &peer.address).await {
                            debug!(node = %self.inner.id, peer = %peer.id, error = %e, "discovered peer not connected");
                        }
                    }
                }
                GossipAction::AdoptHealth(health) => {
                    coordinator.adopt_health(&health);
                }
                GossipAction::Adjacency { peer_id, neighbors } => {
                    coordinator.record_adjacency(&peer_id, neighbors);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Membership bookkeeping
    // -----------------------------------------------------------------------

    fn members(&self) -> HashSet<String> {
        self.inner.coordinator.peer_ids().into_iter().collect()
    }

    fn purge_peer(&self, peer_id: &str) {
        self.inner.consensus.forget_peer(peer_id);
        self.inner.heartbeat.forget(peer_id);
    }

    /// Aligns the DHT ring with the peer table and re-places entries that
    /// lost a replica or are still waiting for one.
    async fn sync_dht(&self) {
        let removed = self
            .inner
            .dht
            .sync_membership(&self.inner.coordinator.peer_ids());
        self.inner
            .dht
            .rebalance(&self.inner.coordinator, &removed)
            .await;
    }
}
