//! HTTP API Server
//!
//! REST API for agent registration, heartbeat ingestion, status
//! queries, and the realtime WebSocket feed.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::broadcast::BroadcasterStats;
use crate::config::ApiConfig;
use crate::engine::ingest::{HeartbeatPayload, Registration};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::model::{FleetStats, Node};

/// Default page size for event queries
const DEFAULT_EVENT_LIMIT: usize = 50;
/// Hard cap on a single event page
const MAX_EVENT_LIMIT: usize = 500;

/// Shared application state
pub struct AppState {
    /// Collector instance id
    pub engine_id: String,
    /// Liveness engine
    pub engine: Arc<Engine>,
    /// Process start, for uptime reporting
    pub started_at: Instant,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server over the engine
    pub fn new(config: ApiConfig, engine_id: String, engine: Arc<Engine>) -> Self {
        let state = Arc::new(AppState {
            engine_id,
            engine,
            started_at: Instant::now(),
        });
        Self { config, state }
    }

    /// Create the router
    fn create_router(state: Arc<AppState>, cors_enabled: bool) -> Router {
        let router = Router::new()
            // Agent-facing ingestion
            .route("/api/agents", post(handle_register))
            .route("/api/heartbeat", post(handle_heartbeat))
            // Status queries
            .route("/api/nodes", get(handle_nodes))
            .route("/api/nodes/:agent_id", get(handle_node))
            .route("/api/nodes/:agent_id/events", get(handle_node_events))
            .route("/api/snapshot", get(handle_snapshot))
            .route("/api/stats", get(handle_stats))
            .route("/api/health", get(handle_health))
            // Operator actions
            .route("/api/nodes/:agent_id/maintenance", post(handle_maintenance))
            // Realtime feed
            .route("/ws", get(handle_ws))
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        if cors_enabled {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Start the HTTP server
    pub async fn start(&self) -> Result<()> {
        let app = Self::create_router(Arc::clone(&self.state), self.config.cors_enabled);

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Request/Response Types ============

/// Heartbeat acknowledgment
#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    pub agent_id: String,
    pub applied: bool,
    pub status: Option<crate::model::NodeStatus>,
}

/// Event page query parameters
#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<usize>,
    /// Exclusive seq cursor; pass the smallest seq of the previous
    /// page to fetch the next one
    pub before: Option<i64>,
}

/// Maintenance toggle request
#[derive(Debug, Deserialize)]
pub struct MaintenanceRequest {
    pub enabled: bool,
}

/// Node detail with its stored heartbeat count
#[derive(Debug, Serialize)]
pub struct NodeDetailResponse {
    #[serde(flatten)]
    pub node: Node,
    pub heartbeats: u64,
}

/// Stats response
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub engine_id: String,
    pub uptime_seconds: u64,
    pub fleet: FleetStats,
    pub observers: usize,
    pub broadcaster: BroadcasterStats,
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub engine_id: String,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

fn error_response(e: Error) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &e {
        Error::UnknownAgent(_) => StatusCode::NOT_FOUND,
        _ if e.is_client_error() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
            code: e.code().to_string(),
        }),
    )
}

// ============ Handlers ============

async fn handle_register(
    State(state): State<Arc<AppState>>,
    Json(registration): Json<Registration>,
) -> impl IntoResponse {
    match state.engine.register(registration).await {
        Ok(node) => (StatusCode::CREATED, Json(node)).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn handle_heartbeat(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<HeartbeatPayload>,
) -> impl IntoResponse {
    match state.engine.ingest(payload).await {
        Ok(ack) => Json(HeartbeatResponse {
            agent_id: ack.agent_id,
            applied: ack.applied,
            status: Some(ack.status),
        })
        .into_response(),
        // A stale heartbeat is acknowledged, not failed; the agent
        // should not retry it.
        Err(Error::StaleHeartbeat { agent_id, .. }) => Json(HeartbeatResponse {
            agent_id,
            applied: false,
            status: None,
        })
        .into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn handle_nodes(State(state): State<Arc<AppState>>) -> Json<Vec<Node>> {
    Json(state.engine.nodes().await)
}

async fn handle_node(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> impl IntoResponse {
    let Some(node) = state.engine.node(&agent_id).await else {
        return error_response(Error::UnknownAgent(agent_id)).into_response();
    };
    match state.engine.heartbeat_count(&agent_id).await {
        Ok(heartbeats) => Json(NodeDetailResponse { node, heartbeats }).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn handle_node_events(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_EVENT_LIMIT)
        .min(MAX_EVENT_LIMIT);

    match state.engine.events(&agent_id, limit, query.before).await {
        Ok(events) => Json(events).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn handle_snapshot(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.engine.snapshot().await)
}

async fn handle_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let broadcaster = state.engine.broadcaster();
    Json(StatsResponse {
        engine_id: state.engine_id.clone(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        fleet: state.engine.fleet_stats().await,
        observers: broadcaster.observer_count(),
        broadcaster: broadcaster.stats().await,
    })
}

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        healthy: true,
        engine_id: state.engine_id.clone(),
    })
}

async fn handle_maintenance(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    Json(req): Json<MaintenanceRequest>,
) -> impl IntoResponse {
    match state.engine.set_maintenance(&agent_id, req.enabled).await {
        Ok(node) => Json(node).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

// ============ WebSocket ============

async fn handle_ws(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| observer_session(socket, state))
}

/// One observer connection.
///
/// Sends the full state on connect, then forwards deltas until the
/// observer disconnects or falls too far behind the broadcast channel.
async fn observer_session(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    let snapshot = state.engine.snapshot().await;
    let full_state = serde_json::json!({
        "type": "full_state",
        "nodes": snapshot.nodes,
        "stats": snapshot.stats,
    });
    if sender.send(Message::Text(full_state.to_string())).await.is_err() {
        return;
    }

    let mut rx = state.engine.broadcaster().subscribe();
    tracing::debug!("observer connected");

    let mut forward = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(delta) => {
                    let text = match serde_json::to_string(&delta) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::error!("delta serialization failed: {}", e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                // Lagged observers are cut off; they reconnect and
                // resynchronize via the full-state message.
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("observer lagged by {} deltas, closing", n);
                    break;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Drain the read side so close frames are seen
    loop {
        tokio::select! {
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                _ => {}
            },
            _ = &mut forward => break,
        }
    }

    forward.abort();
    tracing::debug!("observer disconnected");
}
