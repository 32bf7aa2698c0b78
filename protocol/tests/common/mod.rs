//! Shared cluster helpers for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use trellis_protocol::network::{LatencyModel, LocalNetwork, MeshNode};
use trellis_protocol::MeshConfig;

/// Config whose periodic tasks never fire during a test.
pub fn quiet_config() -> MeshConfig {
    MeshConfig {
        max_peers: 16,
        gossip_interval_ms: 3_600_000,
        heartbeat_interval_ms: 3_600_000,
        heartbeat_timeout_ms: 3_600_000,
        health_check_interval_ms: 3_600_000,
        auto_connect_discovered: false,
        ..MeshConfig::default()
    }
}

/// Starts `n` nodes named `n0..n{n-1}` on a zero-latency network.
pub fn cluster(n: usize, config: MeshConfig) -> (Arc<LocalNetwork>, Vec<MeshNode>) {
    let net = LocalNetwork::new(LatencyModel::none());
    let nodes = (0..n)
        .map(|i| {
            let node = MeshNode::local(format!("n{i}"), config.clone(), &net).expect("node");
            node.start().expect("start");
            node
        })
        .collect();
    (net, nodes)
}

/// Connects `a` to `b` and waits until `b` has accepted.
pub async fn link(a: &MeshNode, b: &MeshNode) {
    a.connect(b.id(), &format!("local://{}", b.id()))
        .await
        .expect("connect");
    let (b, a_id) = (b.clone(), a.id().to_string());
    assert!(
        wait_until(Duration::from_secs(2), move || b.coordinator().is_connected(&a_id)).await,
        "link was not accepted"
    );
}

/// Connects every pair of nodes.
pub async fn full_mesh(nodes: &[MeshNode]) {
    for i in 0..nodes.len() {
        for j in i + 1..nodes.len() {
            link(&nodes[i], &nodes[j]).await;
        }
    }
}

/// Polls `condition` every 10ms until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn shutdown(nodes: &[MeshNode]) {
    for node in nodes {
        node.stop().await;
    }
}
