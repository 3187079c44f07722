//! Ping, metrics and inspection handlers for the info port.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use common::{ErrorResponse, MetricsSnapshot, SessionId};
use protocols::PeerSummary;
use tracing::{info, trace};

use crate::manager::SessionSummary;
use crate::state::NodeState;

/// GET /ping
pub async fn ping() -> &'static str {
    trace!("Ping");
    "pong"
}

/// Full node status.
///
/// GET /status
pub async fn status(State(state): State<Arc<NodeState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "tss-node",
        "node_id": state.node_id.to_string(),
        "party": state.party.as_str(),
        "uptime_secs": state.uptime_secs(),
        "pre_params_ready": state.pre_params.is_ready(),
        "active_sessions": state.manager.active_count().await,
        "known_peers": state.registry.len().await,
        "key_shares": state.shares.cached_keys().await,
    }))
}

/// GET /metrics
pub async fn metrics(State(state): State<Arc<NodeState>>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

/// Live and recently finished sessions.
///
/// GET /sessions
pub async fn list_sessions(State(state): State<Arc<NodeState>>) -> Json<Vec<SessionSummary>> {
    Json(state.manager.list().await)
}

/// GET /peers
pub async fn list_peers(State(state): State<Arc<NodeState>>) -> Json<Vec<PeerSummary>> {
    Json(
        state
            .registry
            .peers()
            .await
            .iter()
            .map(PeerSummary::from)
            .collect(),
    )
}

/// Cancel a live session. Waiters receive an abort.
///
/// DELETE /sessions/{session_id}
pub async fn cancel_session(
    State(state): State<Arc<NodeState>>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorResponse>)> {
    let session_id = SessionId::from(session_id.as_str());
    info!("Cancel requested for session {}", session_id.short());

    match state.manager.cancel(&session_id).await {
        Some(outcome) => Ok(Json(serde_json::json!({
            "session_id": session_id,
            "status": outcome.status(),
        }))),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("no live session {}", session_id),
                status: "not_found".to_string(),
                session_id: Some(session_id),
                blame: None,
            }),
        )),
    }
}
