//! # REST + WebSocket API
//!
//! Builds the axum router that exposes one mesh node over HTTP. All
//! endpoints share application state through axum's `State` extractor.
//!
//! ## Endpoints
//!
//! | Method | Path          | Description                              |
//! |--------|---------------|------------------------------------------|
//! | GET    | `/health`     | Liveness probe                           |
//! | GET    | `/status`     | Peers, topology, health and config       |
//! | POST   | `/proposals`  | Run a three-phase proposal               |
//! | PUT    | `/kv/:key`    | Store a JSON value in the DHT            |
//! | GET    | `/kv/:key`    | Fetch a JSON value from the DHT          |
//! | POST   | `/peers`      | Connect a peer                           |
//! | DELETE | `/peers/:id`  | Disconnect a peer                        |
//! | GET    | `/ws`         | WebSocket stream of mesh events          |

use std::time::{Duration, Instant};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use trellis_protocol::network::{NodeStatus, StoreOutcome};
use trellis_protocol::{MeshError, MeshNode};

use crate::metrics::SharedMetrics;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared application state available to all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// The node's reported version string.
    pub version: String,
    /// The served node.
    pub node: MeshNode,
    /// Metrics for in-handler recording.
    pub metrics: SharedMetrics,
    /// Deadline for proposals that do not carry their own.
    pub proposal_timeout: Duration,
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

/// Builds the full axum [`Router`] with all API routes, CORS and tracing.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/proposals", post(proposal_handler))
        .route("/kv/:key", put(kv_put_handler).get(kv_get_handler))
        .route("/peers", post(connect_handler))
        .route("/peers/:id", delete(disconnect_handler))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / Response Types
// ---------------------------------------------------------------------------

/// Response payload for `GET /status`.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    /// Node software version.
    pub version: String,
    /// RFC 3339 timestamp of the response.
    pub timestamp: String,
    /// Node snapshot.
    #[serde(flatten)]
    pub status: NodeStatus,
}

/// Body of `POST /proposals`.
#[derive(Debug, Deserialize)]
pub struct ProposalRequest {
    /// Opaque payload to agree on.
    pub payload: serde_json::Value,
    /// Overrides the default proposal deadline.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Response payload for `PUT /kv/:key`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StoreResponse {
    /// Stored key.
    pub key: String,
    /// Per-replica outcome.
    pub replicas: Vec<StoreOutcome>,
}

/// Response payload for `GET /kv/:key`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ValueResponse {
    /// Requested key.
    pub key: String,
    /// Stored value.
    pub value: serde_json::Value,
}

/// Body of `POST /peers`.
#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
    /// Peer id.
    pub id: String,
    /// Peer address. Defaults to `local://{id}`.
    #[serde(default)]
    pub address: Option<String>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A [`MeshError`] rendered as a JSON error response.
pub struct ApiError(MeshError);

impl From<MeshError> for ApiError {
    fn from(e: MeshError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            MeshError::InvalidProposal(_) | MeshError::SelfConnection(_) | MeshError::InvalidConfig(_) => {
                StatusCode::BAD_REQUEST
            }
            MeshError::PeerNotConnected(_) | MeshError::UnknownProposal(_) => StatusCode::NOT_FOUND,
            MeshError::CapacityExceeded { .. } => StatusCode::CONFLICT,
            MeshError::ConsensusTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            MeshError::Transport(_) => StatusCode::BAD_GATEWAY,
            MeshError::NotRunning | MeshError::Stopped => StatusCode::SERVICE_UNAVAILABLE,
        };
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health`: returns 200 while the process is alive.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "node_id": state.node.id(),
        "running": state.node.is_running(),
    }))
}

/// `GET /status`: node snapshot.
async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatusResponse {
        version: state.version.clone(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        status: state.node.status(),
    })
}

/// `POST /proposals`: runs a proposal and returns the local decision.
async fn proposal_handler(
    State(state): State<AppState>,
    Json(req): Json<ProposalRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let timeout = req
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(state.proposal_timeout);

    let started = Instant::now();
    let decision = state.node.propose(req.payload, timeout).await?;
    state
        .metrics
        .proposal_latency_seconds
        .observe(started.elapsed().as_secs_f64());
    Ok(Json(decision))
}

/// `PUT /kv/:key`: stores the request body on the key's replicas.
///
/// Responds 502 when no replica accepted the write.
async fn kv_put_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(value): Json<serde_json::Value>,
) -> impl IntoResponse {
    let replicas = state.node.store(&key, value).await;
    let status = if replicas.iter().any(|r| r.stored) {
        StatusCode::OK
    } else {
        StatusCode::BAD_GATEWAY
    };
    (status, Json(StoreResponse { key, replicas }))
}

/// `GET /kv/:key`: fetches a value from the key's primary owner.
async fn kv_get_handler(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    match state.node.retrieve(&key).await {
        Some(value) => Json(ValueResponse { key, value }).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("key not found: {key}") })),
        )
            .into_response(),
    }
}

/// `POST /peers`: connects a peer.
async fn connect_handler(
    State(state): State<AppState>,
    Json(req): Json<ConnectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let address = req
        .address
        .unwrap_or_else(|| format!("local://{}", req.id));
    let peer = state.node.connect(&req.id, &address).await?;
    Ok((StatusCode::CREATED, Json(peer)))
}

/// `DELETE /peers/:id`: disconnects a peer.
async fn disconnect_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.node.disconnect(&id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(MeshError::PeerNotConnected(id).into())
    }
}

/// `GET /ws`: WebSocket upgrade for live mesh events.
///
/// The connection is push-only; client messages are ignored.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

/// Forwards mesh events until the client disconnects or the node's event
/// bus closes.
async fn handle_ws_connection(mut socket: WebSocket, state: AppState) {
    let mut rx = state.node.subscribe();

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(ev) => {
                        let payload = match serde_json::to_string(&ev) {
                            Ok(s) => s,
                            Err(e) => {
                                tracing::warn!(error = %e, "failed to serialize ws event");
                                continue;
                            }
                        };
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "ws subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(_)) => {}
                    _ => break,
                }
            }
        }
    }
}
