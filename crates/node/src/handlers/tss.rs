//! Keygen and keysign handlers.
//!
//! Both block until the session reaches a terminal state. Concurrent
//! identical requests on one node join the same session and get the same
//! answer.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::{
    ErrorResponse, KeygenHttpRequest, KeygenHttpResponse, KeygenRequest, KeysignHttpRequest,
    KeysignHttpResponse, KeysignRequest, Outcome, PartyId, RequestError, SessionOutput,
    SessionRequest,
};
use tracing::{info, warn};

use crate::manager::{JoinError, SessionHandle};
use crate::state::NodeState;

type ErrorReply = (StatusCode, Json<ErrorResponse>);

fn bad_request(e: impl ToString) -> ErrorReply {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse::bad_request(e.to_string())),
    )
}

fn to_parties(keys: Vec<String>) -> Vec<PartyId> {
    keys.into_iter().map(PartyId::from).collect()
}

async fn start(state: &NodeState, request: SessionRequest) -> Result<SessionHandle, ErrorReply> {
    match state.manager.join(request).await {
        Ok(handle) => Ok(handle),
        Err(JoinError::Request(e)) => Err(bad_request(e)),
        Err(e) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse::unavailable(e.to_string())),
        )),
    }
}

fn failed(handle_id: &common::SessionId, outcome: &Outcome) -> ErrorReply {
    warn!(
        "Session {} ended with {}: {}",
        handle_id.short(),
        outcome.status(),
        outcome
            .error()
            .map(|e| e.to_string())
            .unwrap_or_default()
    );
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse::from_outcome(handle_id, outcome)),
    )
}

/// Run (or join) a keygen.
///
/// POST /keygen
pub async fn keygen(
    State(state): State<Arc<NodeState>>,
    Json(body): Json<KeygenHttpRequest>,
) -> Result<Json<KeygenHttpResponse>, ErrorReply> {
    let request = KeygenRequest::new(to_parties(body.keys)).map_err(bad_request)?;
    info!(
        "Keygen request for {} participants",
        request.participants().len()
    );

    let handle = start(&state, request.into()).await?;
    let session_id = handle.session_id().clone();
    let outcome = handle.wait().await;

    match outcome {
        Outcome::Success {
            output: SessionOutput::Keygen(output),
        } => Ok(Json(KeygenHttpResponse {
            pub_key: output.public_key,
            status: "success".to_string(),
            session_id,
        })),
        other => Err(failed(&session_id, &other)),
    }
}

/// Run (or join) a keysign.
///
/// POST /keysign
pub async fn keysign(
    State(state): State<Arc<NodeState>>,
    Json(body): Json<KeysignHttpRequest>,
) -> Result<Json<KeysignHttpResponse>, ErrorReply> {
    let message = STANDARD
        .decode(body.message.as_bytes())
        .map_err(|e| bad_request(RequestError::InvalidEncoding(e.to_string())))?;
    let request = KeysignRequest::new(
        body.pool_pub_key,
        message,
        to_parties(body.signer_pub_keys),
    )
    .map_err(bad_request)?;
    info!(
        "Keysign request under {} with {} signers",
        request.pool_pub_key(),
        request.participants().len()
    );

    let handle = start(&state, request.into()).await?;
    let session_id = handle.session_id().clone();
    let outcome = handle.wait().await;

    match outcome {
        Outcome::Success {
            output: SessionOutput::Keysign(signature),
        } => Ok(Json(KeysignHttpResponse {
            r: signature.r_base64(),
            s: signature.s_base64(),
            recovery_id: signature.recovery_id,
            status: "success".to_string(),
            session_id,
        })),
        other => Err(failed(&session_id, &other)),
    }
}
