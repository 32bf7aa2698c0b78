// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Trellis Node
//!
//! Entry point for the `trellis-node` binary. Parses CLI arguments,
//! initializes logging and metrics, starts a fully meshed in-process
//! cluster, and serves the HTTP/WS API for its first node.
//!
//! The binary supports three subcommands:
//!
//! - `run`: start the cluster and serve
//! - `config`: print the effective mesh configuration
//! - `version`: print build version information

mod api;
mod cli;
mod logging;
mod metrics;

use anyhow::{ensure, Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;

use trellis_protocol::network::{LatencyModel, LocalNetwork};
use trellis_protocol::{MeshConfig, MeshNode};

use cli::{Commands, TrellisNodeCli};
use metrics::MeshMetrics;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = TrellisNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_cluster(args).await,
        Commands::Config(args) => print_config(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Loads a JSON config file over the defaults, or the defaults alone.
fn load_config(path: Option<&Path>) -> Result<MeshConfig> {
    let config = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse config file {}", path.display()))?
        }
        None => MeshConfig::default(),
    };
    config.validate().context("invalid mesh configuration")?;
    Ok(config)
}

/// Starts the cluster, the API server and the metrics endpoint.
async fn run_cluster(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(&args.log_level, args.log_format);

    ensure!(args.nodes >= 1, "--nodes must be at least 1");
    ensure!(
        args.latency_min_ms <= args.latency_max_ms,
        "--latency-min-ms must not exceed --latency-max-ms"
    );

    let mut config = load_config(args.config.as_deref())?;
    if let Some(max_peers) = args.max_peers {
        config.max_peers = max_peers;
    }
    config.validate().context("invalid mesh configuration")?;
    if config.max_peers + 1 < args.nodes {
        tracing::warn!(
            nodes = args.nodes,
            max_peers = config.max_peers,
            "cluster larger than peer capacity, mesh will be partial"
        );
    }

    tracing::info!(
        nodes = args.nodes,
        api_port = args.api_port,
        metrics_port = args.metrics_port,
        latency_min_ms = args.latency_min_ms,
        latency_max_ms = args.latency_max_ms,
        "starting trellis-node"
    );

    // --- Cluster ---
    let network = LocalNetwork::new(LatencyModel::uniform(args.latency_min_ms, args.latency_max_ms));
    let mut nodes = Vec::with_capacity(args.nodes);
    for i in 0..args.nodes {
        let node = MeshNode::local(format!("node-{i}"), config.clone(), &network)
            .with_context(|| format!("failed to create node-{i}"))?;
        node.start()
            .with_context(|| format!("failed to start node-{i}"))?;
        nodes.push(node);
    }
    for (i, node) in nodes.iter().enumerate() {
        for peer in &nodes[i + 1..] {
            if let Err(e) = node
                .connect(peer.id(), &format!("local://{}", peer.id()))
                .await
            {
                tracing::warn!(node = %node.id(), peer = %peer.id(), error = %e, "initial link failed");
            }
        }
    }
    let served = nodes[0].clone();
    tracing::info!(node = %served.id(), peers = served.coordinator().peer_count(), "cluster meshed");

    // --- Metrics ---
    let mesh_metrics = Arc::new(MeshMetrics::new().context("failed to register metrics")?);
    let metrics_pump = tokio::spawn(pump_metrics(
        served.clone(),
        Arc::clone(&mesh_metrics),
        config.health_check_interval(),
    ));

    // --- API server ---
    let app_state = api::AppState {
        version: env!("CARGO_PKG_VERSION").to_string(),
        node: served.clone(),
        metrics: Arc::clone(&mesh_metrics),
        proposal_timeout: Duration::from_millis(args.proposal_timeout_ms),
    };
    let api_router = api::create_router(app_state);
    let api_addr = format!("0.0.0.0:{}", args.api_port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {}", api_addr))?;
    tracing::info!("API server listening on {}", api_addr);

    // --- Metrics server ---
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(Arc::clone(&mesh_metrics));
    let metrics_addr = format!("0.0.0.0:{}", args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", metrics_addr))?;
    tracing::info!("Metrics server listening on {}", metrics_addr);

    // --- Serve ---
    tokio::select! {
        res = axum::serve(api_listener, api_router) => {
            if let Err(e) = res {
                tracing::error!(error = %e, "API server error");
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!(error = %e, "metrics server error");
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received, stopping cluster");
        }
    }

    metrics_pump.abort();
    for node in &nodes {
        node.stop().await;
    }
    tracing::info!("trellis-node stopped");
    Ok(())
}

/// Feeds the served node's events into the metrics and samples its gauges
/// every `interval`.
async fn pump_metrics(node: MeshNode, metrics: Arc<MeshMetrics>, interval: Duration) {
    let mut events = node.subscribe();
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => metrics.observe(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "metrics pump lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = ticker.tick() => metrics.sample(&node),
        }
    }
}

/// Prints the effective configuration as pretty JSON.
fn print_config(args: cli::ConfigArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let json = serde_json::to_string_pretty(&config).context("failed to encode config")?;
    println!("{json}");
    Ok(())
}

/// Prints version information to stdout.
fn print_version() {
    println!("trellis-node {}", env!("CARGO_PKG_VERSION"));
    println!("rustc        {}", rustc_version());
}

/// Returns the Rust compiler version used to build this binary.
fn rustc_version() -> &'static str {
    option_env!("RUSTC_VERSION").unwrap_or("unknown")
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
