//! Error types for the mesh coordination core.
//!
//! Every fallible operation on a node returns a [`MeshError`]. Membership
//! and routing failures are local and synchronous; consensus failures are
//! recoverable conditions the caller may retry.

use thiserror::Error;

use crate::network::transport::TransportError;

/// Errors surfaced by the node's programmatic API.
#[derive(Debug, Error)]
pub enum MeshError {
    /// The peer table is full.
    #[error("peer capacity exceeded: {current}/{max} peers connected")]
    CapacityExceeded {
        /// Peers currently in the table.
        current: usize,
        /// Configured capacity.
        max: usize,
    },

    /// The target peer is not in the peer table.
    #[error("peer not connected: {0}")]
    PeerNotConnected(String),

    /// A node was asked to peer with itself.
    #[error("node {0} cannot peer with itself")]
    SelfConnection(String),

    /// No decision was reached before the caller's deadline.
    #[error("consensus timed out for proposal {proposal_id} after {timeout_ms}ms")]
    ConsensusTimeout {
        /// The proposal that did not decide.
        proposal_id: String,
        /// The deadline the caller supplied.
        timeout_ms: u64,
    },

    /// A consensus message referenced a proposal this node has not seen.
    #[error("unknown proposal: {0}")]
    UnknownProposal(String),

    /// A pre-prepare was missing its id, payload or a usable view.
    #[error("invalid proposal: {0}")]
    InvalidProposal(String),

    /// A single send or request failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The operation needs the node's background tasks, which are not running.
    #[error("node is not running")]
    NotRunning,

    /// The node was stopped; its inbox is gone and it cannot be restarted.
    #[error("node has been stopped")]
    Stopped,
}

impl MeshError {
    /// True for conditions the caller can reasonably retry.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConsensusTimeout { .. } | Self::UnknownProposal(_) | Self::Transport(_)
        )
    }
}
