// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Trellis Mesh Core
//!
//! Coordination core for a peer-to-peer mesh of cooperating nodes. Each node
//! keeps a bounded peer table, spreads what it knows by gossip, agrees with
//! its peers through a three-phase Byzantine-tolerant protocol, detects and
//! confirms peer failures, and shares a replicated key/value store placed on
//! a consistent-hash ring.
//!
//! ## Modules
//!
//! - **config**: Mesh parameters, defaults and validation.
//! - **error**: The crate-wide `MeshError`.
//! - **network**: Transport, coordinator, subsystems and the `MeshNode`
//!   runtime.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::time::Duration;
//! use trellis_protocol::network::{LatencyModel, LocalNetwork, MeshNode};
//! use trellis_protocol::MeshConfig;
//!
//! # async fn run() -> Result<(), trellis_protocol::MeshError> {
//! let net = LocalNetwork::new(LatencyModel::none());
//! let a = MeshNode::local("a", MeshConfig::default(), &net)?;
//! let b = MeshNode::local("b", MeshConfig::default(), &net)?;
//! a.start()?;
//! b.start()?;
//! a.connect("b", "local://b").await?;
//!
//! let decision = a
//!     .propose(serde_json::json!({ "op": "rotate" }), Duration::from_secs(5))
//!     .await?;
//! assert!(decision.approved);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod network;

pub use config::MeshConfig;
pub use error::MeshError;
pub use network::{MeshEvent, MeshNode};
