//! # Prometheus Metrics
//!
//! Mesh metrics for the served node, scraped at `/metrics` on the metrics
//! port. Counters follow the node's event stream; gauges are sampled from
//! the node on every health interval.
//!
//! All metrics live in a dedicated [`prometheus::Registry`] with the
//! `trellis` prefix.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder,
};
use std::sync::Arc;

use trellis_protocol::{MeshEvent, MeshNode};

/// Metric handles for one mesh node.
#[derive(Clone)]
pub struct MeshMetrics {
    registry: Registry,
    /// Peers currently in the table.
    pub connected_peers: IntGauge,
    /// Latest connectivity ratio.
    pub health_connectivity: Gauge,
    /// Gossip rounds originated by this node.
    pub gossip_rounds: IntGauge,
    /// Proposals executed locally.
    pub decisions_total: IntCounter,
    /// Confirmed peer failures.
    pub peer_failures_total: IntCounter,
    /// Transitions into the partitioned state.
    pub partitions_total: IntCounter,
    /// Peers learned through gossip.
    pub peers_discovered_total: IntCounter,
    /// Time from API submission to local execution.
    pub proposal_latency_seconds: Histogram,
}

impl MeshMetrics {
    /// Creates and registers all metrics.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("trellis".into()), None)?;

        let connected_peers = IntGauge::new("connected_peers", "Peers in the peer table")?;
        registry.register(Box::new(connected_peers.clone()))?;

        let health_connectivity = Gauge::new(
            "health_connectivity",
            "Fraction of peers with a fresh heartbeat",
        )?;
        registry.register(Box::new(health_connectivity.clone()))?;

        let gossip_rounds = IntGauge::new("gossip_rounds", "Gossip rounds originated by this node")?;
        registry.register(Box::new(gossip_rounds.clone()))?;

        let decisions_total = IntCounter::new("decisions_total", "Proposals executed locally")?;
        registry.register(Box::new(decisions_total.clone()))?;

        let peer_failures_total =
            IntCounter::new("peer_failures_total", "Peer failures confirmed by heartbeat")?;
        registry.register(Box::new(peer_failures_total.clone()))?;

        let partitions_total =
            IntCounter::new("partitions_total", "Times the node entered a partition")?;
        registry.register(Box::new(partitions_total.clone()))?;

        let peers_discovered_total =
            IntCounter::new("peers_discovered_total", "Peers learned through gossip")?;
        registry.register(Box::new(peers_discovered_total.clone()))?;

        let proposal_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "proposal_latency_seconds",
                "Time from proposal submission to local execution",
            )
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        )?;
        registry.register(Box::new(proposal_latency_seconds.clone()))?;

        Ok(Self {
            registry,
            connected_peers,
            health_connectivity,
            gossip_rounds,
            decisions_total,
            peer_failures_total,
            partitions_total,
            peers_discovered_total,
            proposal_latency_seconds,
        })
    }

    /// Updates counters from one mesh event.
    pub fn observe(&self, event: &MeshEvent) {
        match event {
            MeshEvent::ConsensusReached { .. } => self.decisions_total.inc(),
            MeshEvent::PeerFailure { .. } => self.peer_failures_total.inc(),
            MeshEvent::PartitionDetected { .. } => self.partitions_total.inc(),
            MeshEvent::PeerDiscovered { peers } => {
                self.peers_discovered_total.inc_by(peers.len() as u64)
            }
            MeshEvent::HealthUpdated { health } => {
                self.health_connectivity.set(health.connectivity)
            }
            _ => {}
        }
    }

    /// Refreshes gauges from the node.
    pub fn sample(&self, node: &MeshNode) {
        self.connected_peers
            .set(node.coordinator().peer_count() as i64);
        self.health_connectivity
            .set(node.coordinator().health().connectivity);
        self.gossip_rounds
            .set(node.gossip().current_round() as i64);
    }

    /// Encodes all registered metrics into the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Shared metrics handle for axum state and background tasks.
pub type SharedMetrics = Arc<MeshMetrics>;

/// Axum handler that renders `/metrics` in Prometheus text format.
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
