//! Three-phase agreement across real node runtimes on the in-process
//! network.

mod common;

use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast::error::TryRecvError;

use trellis_protocol::network::quorum_size;
use trellis_protocol::{MeshError, MeshEvent};

use common::{cluster, full_mesh, quiet_config, shutdown, wait_until};

async fn agree_with_silent(n: usize, silent: usize) {
    let (net, nodes) = cluster(n, quiet_config());
    full_mesh(&nodes).await;
    for node in &nodes[n - silent..] {
        net.isolate(node.id());
    }

    let decision = nodes[0]
        .propose(json!({ "op": "set", "n": n, "silent": silent }), Duration::from_secs(3))
        .await
        .unwrap_or_else(|e| panic!("n={n} silent={silent}: {e}"));
    assert!(decision.approved);
    assert!(decision.participant_count >= quorum_size(n));

    let active = nodes[..n - silent].to_vec();
    let id = decision.proposal_id.clone();
    assert!(
        wait_until(Duration::from_secs(3), || active
            .iter()
            .all(|node| node.consensus().decision(&id).is_some()))
        .await,
        "n={n} silent={silent}: not every live node executed"
    );
    for node in &nodes[n - silent..] {
        assert!(node.consensus().decision(&id).is_none());
    }

    shutdown(&nodes).await;
}

#[tokio::test]
async fn four_nodes_tolerate_one_silent() {
    for silent in 0..=1 {
        agree_with_silent(4, silent).await;
    }
}

#[tokio::test]
async fn seven_nodes_tolerate_two_silent() {
    for silent in 0..=2 {
        agree_with_silent(7, silent).await;
    }
}

#[tokio::test]
async fn ten_nodes_tolerate_three_silent() {
    for silent in 0..=3 {
        agree_with_silent(10, silent).await;
    }
}

#[tokio::test]
async fn too_many_silent_nodes_time_out() {
    let (net, nodes) = cluster(4, quiet_config());
    full_mesh(&nodes).await;
    net.isolate("n2");
    net.isolate("n3");

    let err = nodes[0]
        .propose(json!("stuck"), Duration::from_millis(300))
        .await
        .unwrap_err();
    let (proposal_id, timeout_ms) = match err {
        MeshError::ConsensusTimeout { proposal_id, timeout_ms } => (proposal_id, timeout_ms),
        other => panic!("expected a timeout, got {other}"),
    };
    assert_eq!(timeout_ms, 300);
    assert!(nodes[1].consensus().decision(&proposal_id).is_none());

    shutdown(&nodes).await;
}

#[tokio::test]
async fn each_node_executes_a_proposal_once() {
    let (_net, nodes) = cluster(4, quiet_config());
    full_mesh(&nodes).await;
    let mut events = nodes[1].subscribe();

    let decision = nodes[0]
        .propose(json!({ "op": "once" }), Duration::from_secs(3))
        .await
        .unwrap();
    let id = decision.proposal_id.clone();
    let observer = nodes[1].clone();
    assert!(wait_until(Duration::from_secs(2), || observer.consensus().decision(&id).is_some()).await);

    // Late votes keep arriving after execution.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut executions = 0;
    loop {
        match events.try_recv() {
            Ok(MeshEvent::ConsensusReached { decision }) if decision.proposal_id == id => {
                executions += 1
            }
            Ok(_) => {}
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            Err(TryRecvError::Lagged(_)) => continue,
        }
    }
    assert_eq!(executions, 1);

    shutdown(&nodes).await;
}

#[tokio::test]
async fn empty_payload_is_rejected() {
    let (_net, nodes) = cluster(1, quiet_config());
    let err = nodes[0]
        .propose(serde_json::Value::Null, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::InvalidProposal(_)));
    shutdown(&nodes).await;
}
