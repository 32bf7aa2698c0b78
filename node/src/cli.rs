//! # CLI Interface
//!
//! Defines the command-line argument structure for `trellis-node` using
//! `clap` derive. Supports three subcommands: `run`, `config` and
//! `version`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::logging::LogFormat;

/// Trellis mesh node.
///
/// Runs an in-process cluster of mesh nodes over a simulated network and
/// serves the HTTP/WS API and Prometheus metrics for the first of them.
#[derive(Parser, Debug)]
#[command(
    name = "trellis-node",
    about = "Trellis mesh coordination node",
    version,
    propagate_version = true
)]
pub struct TrellisNodeCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a simulated cluster and serve the API.
    Run(RunArgs),
    /// Print the effective mesh configuration as JSON and exit.
    Config(ConfigArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to a JSON mesh configuration file. Missing fields take their
    /// defaults.
    #[arg(long, short = 'c', env = "TRELLIS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Number of nodes in the simulated cluster.
    #[arg(long, short = 'n', env = "TRELLIS_NODES", default_value_t = 4)]
    pub nodes: usize,

    /// Overrides `max_peers` from the configuration.
    #[arg(long, env = "TRELLIS_MAX_PEERS")]
    pub max_peers: Option<usize>,

    /// Port for the REST and WebSocket API.
    #[arg(long, env = "TRELLIS_API_PORT", default_value_t = 9741)]
    pub api_port: u16,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "TRELLIS_METRICS_PORT", default_value_t = 9742)]
    pub metrics_port: u16,

    /// Lower bound of simulated one-way latency.
    #[arg(long, env = "TRELLIS_LATENCY_MIN_MS", default_value_t = 10)]
    pub latency_min_ms: u64,

    /// Upper bound of simulated one-way latency.
    #[arg(long, env = "TRELLIS_LATENCY_MAX_MS", default_value_t = 50)]
    pub latency_max_ms: u64,

    /// Deadline for proposals submitted through the API.
    #[arg(long, env = "TRELLIS_PROPOSAL_TIMEOUT_MS", default_value_t = 5_000)]
    pub proposal_timeout_ms: u64,

    /// Log output format.
    #[arg(long, env = "TRELLIS_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    /// Default log filter when `RUST_LOG` is unset.
    #[arg(
        long,
        env = "TRELLIS_LOG_LEVEL",
        default_value = "trellis_node=info,trellis_protocol=info,tower_http=debug"
    )]
    pub log_level: String,
}

/// Arguments for the `config` subcommand.
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Configuration file to merge over the defaults.
    #[arg(long, short = 'c', env = "TRELLIS_CONFIG")]
    pub config: Option<PathBuf>,
}
