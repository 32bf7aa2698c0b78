//! # Pluggable Transport
//!
//! The coordinator never touches sockets directly. It hands envelopes to a
//! [`Transport`], which is the only point where "the network" enters a node.
//! Two kinds of delivery exist:
//!
//! - `send`: one-way, completes once the envelope is handed to the remote
//!   inbox (after the simulated or real wire delay).
//! - `request`: delivers the envelope together with a reply slot and waits,
//!   bounded by a deadline, for the remote handler's answer. Used by the DHT.
//!
//! [`LocalNetwork`] is the in-process implementation used by tests and the
//! simulated cluster: a registry of per-node inboxes with a configurable
//! latency model and an isolation switch for simulating crashed or
//! partitioned nodes.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use crate::config::duration_ms;
use crate::network::message::{Envelope, Message};

/// Failures of a single delivery. Always scoped to one peer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The target (or this node) cannot be reached.
    #[error("peer {0} is unreachable")]
    Unreachable(String),
    /// The target did not answer a request in time.
    #[error("request to {peer} timed out after {timeout_ms}ms")]
    Timeout {
        /// Target of the request.
        peer: String,
        /// Deadline that elapsed.
        timeout_ms: u64,
    },
    /// The target accepted the request but dropped the reply slot.
    #[error("peer {0} dropped the request without replying")]
    NoReply(String),
}

/// An envelope waiting in a node's inbox.
#[derive(Debug)]
pub struct Inbound {
    /// The delivered envelope.
    pub envelope: Envelope,
    /// Reply slot, present only for request/response deliveries.
    pub reply: Option<oneshot::Sender<Option<Message>>>,
}

/// Delivery interface between a node and the rest of the mesh.
///
/// The target of a delivery is `envelope.to`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// One-way delivery.
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError>;

    /// Delivery that waits up to `timeout` for the receiver's reply.
    async fn request(
        &self,
        envelope: Envelope,
        timeout: Duration,
    ) -> Result<Option<Message>, TransportError>;
}

// ---------------------------------------------------------------------------
// Latency Model
// ---------------------------------------------------------------------------

/// Uniformly distributed simulated wire delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyModel {
    /// Lower bound in milliseconds.
    pub min_ms: u64,
    /// Upper bound in milliseconds (inclusive).
    pub max_ms: u64,
}

impl LatencyModel {
    /// No delay at all. Deliveries complete as soon as they are queued.
    pub fn none() -> Self {
        Self {
            min_ms: 0,
            max_ms: 0,
        }
    }

    /// Delay drawn uniformly from `[min_ms, max_ms]`.
    pub fn uniform(min_ms: u64, max_ms: u64) -> Self {
        Self {
            min_ms: min_ms.min(max_ms),
            max_ms: min_ms.max(max_ms),
        }
    }

    /// Draws one delay.
    pub fn sample(&self) -> Duration {
        if self.max_ms == 0 {
            return Duration::ZERO;
        }
        let ms = rand::thread_rng().gen_range(self.min_ms..=self.max_ms);
        Duration::from_millis(ms)
    }
}

impl Default for LatencyModel {
    fn default() -> Self {
        Self::none()
    }
}

// ---------------------------------------------------------------------------
// Local Network
// ---------------------------------------------------------------------------

/// In-process mesh: routes envelopes between nodes attached to it.
///
/// Each attached node owns the receiving half of an unbounded inbox. No
/// state is shared between nodes beyond the inbox senders held here.
pub struct LocalNetwork {
    inboxes: DashMap<String, mpsc::UnboundedSender<Inbound>>,
    isolated: RwLock<HashSet<String>>,
    latency: LatencyModel,
}

impl LocalNetwork {
    /// Creates an empty network with the given latency model.
    pub fn new(latency: LatencyModel) -> Arc<Self> {
        Arc::new(Self {
            inboxes: DashMap::new(),
            isolated: RwLock::new(HashSet::new()),
            latency,
        })
    }

    /// Attaches a node and returns its transport plus inbox receiver.
    /// Re-attaching an id replaces the previous inbox.
    pub fn attach(
        self: &Arc<Self>,
        node_id: &str,
    ) -> (Arc<LocalTransport>, mpsc::UnboundedReceiver<Inbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.insert(node_id.to_string(), tx);
        let transport = Arc::new(LocalTransport {
            network: Arc::clone(self),
            node_id: node_id.to_string(),
        });
        (transport, rx)
    }

    /// Detaches a node; deliveries to it fail from now on.
    pub fn detach(&self, node_id: &str) {
        self.inboxes.remove(node_id);
    }

    /// Cuts a node off: nothing it sends and nothing sent to it is delivered.
    pub fn isolate(&self, node_id: &str) {
        self.isolated.write().insert(node_id.to_string());
    }

    /// Reverses [`isolate`](Self::isolate).
    pub fn restore(&self, node_id: &str) {
        self.isolated.write().remove(node_id);
    }

    /// Whether the node is currently isolated.
    pub fn is_isolated(&self, node_id: &str) -> bool {
        self.isolated.read().contains(node_id)
    }

    /// Number of attached nodes.
    pub fn node_count(&self) -> usize {
        self.inboxes.len()
    }

    fn check_path(&self, from: &str, to: &str) -> Result<(), TransportError> {
        let isolated = self.isolated.read();
        if isolated.contains(from) || isolated.contains(to) {
            return Err(TransportError::Unreachable(to.to_string()));
        }
        Ok(())
    }

    fn route(
        &self,
        envelope: Envelope,
        reply: Option<oneshot::Sender<Option<Message>>>,
    ) -> Result<(), TransportError> {
        let target = envelope.to.clone();
        let inbox = self
            .inboxes
            .get(&target)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::Unreachable(target.clone()))?;

        trace!(from = %envelope.from, to = %target, kind = envelope.message.kind(), "routing envelope");
        inbox
            .send(Inbound { envelope, reply })
            .map_err(|_| TransportError::Unreachable(target))
    }
}

/// A node's handle onto a [`LocalNetwork`].
pub struct LocalTransport {
    network: Arc<LocalNetwork>,
    node_id: String,
}

impl LocalTransport {
    /// Id of the node this transport belongs to.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.network.check_path(&self.node_id, &envelope.to)?;

        let delay = self.network.latency.sample();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.network.route(envelope, None)
    }

    async fn request(
        &self,
        envelope: Envelope,
        timeout: Duration,
    ) -> Result<Option<Message>, TransportError> {
        let target = envelope.to.clone();
        self.network.check_path(&self.node_id, &target)?;

        let delay = self.network.latency.sample();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let (tx, rx) = oneshot::channel();
        self.network.route(envelope, Some(tx))?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(TransportError::NoReply(target)),
            Err(_) => Err(TransportError::Timeout {
                peer: target,
                timeout_ms: duration_ms(timeout),
            }),
        }
    }
}
