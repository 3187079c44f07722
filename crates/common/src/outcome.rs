//! Session outcomes and the failure taxonomy.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::blame::BlameRecord;
use crate::types::PartyId;

/// Why a session did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionError {
    /// Unresolved peers or missing prerequisite material before the deadline.
    #[error("initialization failed: {reason}")]
    InitializationFailure {
        reason: String,
        unresolved: Vec<PartyId>,
    },

    /// A phase deadline elapsed with outstanding senders.
    #[error("protocol timed out in round {round} waiting for {} parties", .missing.len())]
    ProtocolTimeout { round: u16, missing: Vec<PartyId> },

    /// A peer's contribution was malformed or rejected by the engine.
    #[error("message from {party} rejected in round {round}: {reason}")]
    ProtocolRejection {
        party: PartyId,
        round: u16,
        reason: String,
    },

    /// Best-effort send could not reach a peer. Never terminal on its own.
    #[error("could not reach {party}: {reason}")]
    TransportFailure { party: PartyId, reason: String },

    /// Local engine failure not attributable to any peer.
    #[error("protocol engine failed: {reason}")]
    Engine { reason: String },

    #[error("session cancelled: {reason}")]
    Cancelled { reason: String },
}

impl SessionError {
    /// Transport failures only feed blame; every other kind ends the session.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::TransportFailure { .. })
    }
}

/// Result of a successful keygen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeygenOutput {
    /// Joint public key, hex-encoded compressed point.
    pub public_key: String,
}

/// Result of a successful keysign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysignOutput {
    /// 32-byte big-endian R x-coordinate (mod n).
    pub r: Vec<u8>,
    /// 32-byte big-endian S, low-S normalised.
    pub s: Vec<u8>,
    pub recovery_id: u8,
}

impl KeysignOutput {
    pub fn r_base64(&self) -> String {
        STANDARD.encode(&self.r)
    }

    pub fn s_base64(&self) -> String {
        STANDARD.encode(&self.s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionOutput {
    Keygen(KeygenOutput),
    Keysign(KeysignOutput),
}

/// Terminal result of a session, delivered once to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success { output: SessionOutput },
    Timeout { error: SessionError, blame: BlameRecord },
    Abort { error: SessionError, blame: BlameRecord },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn blame(&self) -> Option<&BlameRecord> {
        match self {
            Self::Success { .. } => None,
            Self::Timeout { blame, .. } | Self::Abort { blame, .. } => Some(blame),
        }
    }

    pub fn error(&self) -> Option<&SessionError> {
        match self {
            Self::Success { .. } => None,
            Self::Timeout { error, .. } | Self::Abort { error, .. } => Some(error),
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::Timeout { .. } => "timeout",
            Self::Abort { .. } => "abort",
        }
    }
}
