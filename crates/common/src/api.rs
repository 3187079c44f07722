//! HTTP request and response bodies shared by the node and the CLI.

use serde::{Deserialize, Serialize};

use crate::blame::BlameRecord;
use crate::outcome::Outcome;
use crate::types::SessionId;

/// `POST /keygen`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeygenHttpRequest {
    /// Participant public keys (hex).
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeygenHttpResponse {
    pub pub_key: String,
    pub status: String,
    pub session_id: SessionId,
}

/// `POST /keysign`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysignHttpRequest {
    pub pool_pub_key: String,
    /// Base64 message digest.
    pub message: String,
    pub signer_pub_keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysignHttpResponse {
    /// Base64 of the 32-byte R.
    pub r: String,
    /// Base64 of the 32-byte low-S value.
    pub s: String,
    pub recovery_id: u8,
    pub status: String,
    pub session_id: SessionId,
}

/// Error body. Failed sessions carry their blame record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blame: Option<BlameRecord>,
}

impl ErrorResponse {
    pub fn bad_request(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            status: "bad_request".to_string(),
            session_id: None,
            blame: None,
        }
    }

    pub fn unavailable(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            status: "unavailable".to_string(),
            session_id: None,
            blame: None,
        }
    }

    /// Body for a session that did not succeed.
    pub fn from_outcome(session_id: &SessionId, outcome: &Outcome) -> Self {
        Self {
            error: outcome
                .error()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unexpected session output".to_string()),
            status: outcome.status().to_string(),
            session_id: Some(session_id.clone()),
            blame: outcome.blame().cloned(),
        }
    }
}
