//! Session requests and deterministic session identifier derivation.
//!
//! Keygen and keysign share one entry point into the session manager through
//! the tagged [`SessionRequest`] variant. Participant lists are canonicalised
//! (sorted) on construction so that every node derives the same
//! [`SessionId`] regardless of the order its caller listed the keys in.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use thiserror::Error;

use crate::types::{PartyId, ProtocolKind, SessionId};

/// Domain separator mixed into every session identifier.
const SESSION_ID_DOMAIN: &[u8] = b"tss-session-v1";

/// Smallest participant set the coordinator accepts.
pub const MIN_PARTICIPANTS: usize = 2;

/// Errors raised while validating an external request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("participant list is empty")]
    EmptyParticipants,

    #[error("at least {min} participants are required, got {got}")]
    TooFewParticipants { got: usize, min: usize },

    #[error("participant {0} is listed more than once")]
    DuplicateParticipant(PartyId),

    #[error("participant identity must not be empty")]
    EmptyParticipantId,

    #[error("message to sign is empty")]
    EmptyMessage,

    #[error("pool public key is empty")]
    EmptyPoolKey,

    #[error("local party {0} is not a participant")]
    LocalPartyNotIncluded(PartyId),

    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),
}

/// Validate and sort a participant list.
fn canonical_participants(participants: Vec<PartyId>) -> Result<Vec<PartyId>, RequestError> {
    if participants.is_empty() {
        return Err(RequestError::EmptyParticipants);
    }
    if participants.len() < MIN_PARTICIPANTS {
        return Err(RequestError::TooFewParticipants {
            got: participants.len(),
            min: MIN_PARTICIPANTS,
        });
    }

    let mut seen = HashSet::with_capacity(participants.len());
    for party in &participants {
        if party.as_str().is_empty() {
            return Err(RequestError::EmptyParticipantId);
        }
        if !seen.insert(party.clone()) {
            return Err(RequestError::DuplicateParticipant(party.clone()));
        }
    }

    let mut sorted = participants;
    sorted.sort();
    Ok(sorted)
}

/// Distributed key generation over a participant set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeygenRequest {
    participants: Vec<PartyId>,
}

impl KeygenRequest {
    pub fn new(participants: Vec<PartyId>) -> Result<Self, RequestError> {
        Ok(Self {
            participants: canonical_participants(participants)?,
        })
    }

    pub fn participants(&self) -> &[PartyId] {
        &self.participants
    }
}

/// Threshold signing of a message digest under a previously generated key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysignRequest {
    pool_pub_key: String,
    message: Vec<u8>,
    participants: Vec<PartyId>,
}

impl KeysignRequest {
    pub fn new(
        pool_pub_key: impl Into<String>,
        message: Vec<u8>,
        participants: Vec<PartyId>,
    ) -> Result<Self, RequestError> {
        let pool_pub_key = pool_pub_key.into();
        if pool_pub_key.is_empty() {
            return Err(RequestError::EmptyPoolKey);
        }
        if message.is_empty() {
            return Err(RequestError::EmptyMessage);
        }
        Ok(Self {
            pool_pub_key,
            message,
            participants: canonical_participants(participants)?,
        })
    }

    pub fn pool_pub_key(&self) -> &str {
        &self.pool_pub_key
    }

    pub fn message(&self) -> &[u8] {
        &self.message
    }

    pub fn participants(&self) -> &[PartyId] {
        &self.participants
    }
}

/// Tagged request consumed by the session manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionRequest {
    Keygen(KeygenRequest),
    Keysign(KeysignRequest),
}

impl SessionRequest {
    pub fn kind(&self) -> ProtocolKind {
        match self {
            Self::Keygen(_) => ProtocolKind::Keygen,
            Self::Keysign(_) => ProtocolKind::Keysign,
        }
    }

    /// Canonical (sorted) participant list.
    pub fn participants(&self) -> &[PartyId] {
        match self {
            Self::Keygen(req) => req.participants(),
            Self::Keysign(req) => req.participants(),
        }
    }

    pub fn includes(&self, party: &PartyId) -> bool {
        self.participants().binary_search(party).is_ok()
    }

    /// Derive the deterministic session identifier.
    ///
    /// Every variable-length field is length-prefixed so that distinct inputs
    /// cannot collide by concatenation.
    pub fn session_id(&self) -> SessionId {
        let mut hasher = Sha256::new();
        hasher.update(SESSION_ID_DOMAIN);
        update_prefixed(&mut hasher, self.kind().as_str().as_bytes());

        hasher.update((self.participants().len() as u32).to_be_bytes());
        for party in self.participants() {
            update_prefixed(&mut hasher, party.as_str().as_bytes());
        }

        if let Self::Keysign(req) = self {
            update_prefixed(&mut hasher, req.message());
            update_prefixed(&mut hasher, req.pool_pub_key().as_bytes());
        }

        SessionId::from_digest(&hasher.finalize())
    }
}

impl From<KeygenRequest> for SessionRequest {
    fn from(req: KeygenRequest) -> Self {
        Self::Keygen(req)
    }
}

impl From<KeysignRequest> for SessionRequest {
    fn from(req: KeysignRequest) -> Self {
        Self::Keysign(req)
    }
}

fn update_prefixed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u32).to_be_bytes());
    hasher.update(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parties(ids: &[&str]) -> Vec<PartyId> {
        ids.iter().map(|id| PartyId::from(*id)).collect()
    }

    #[test]
    fn test_keygen_session_id_is_order_independent() {
        let a = SessionRequest::from(KeygenRequest::new(parties(&["p1", "p2", "p3"])).unwrap());
        let b = SessionRequest::from(KeygenRequest::new(parties(&["p3", "p1", "p2"])).unwrap());
        assert_eq!(a.session_id(), b.session_id());
        assert_eq!(a.participants(), b.participants());
    }

    #[test]
    fn test_session_id_depends_on_participants() {
        let a = SessionRequest::from(KeygenRequest::new(parties(&["p1", "p2", "p3"])).unwrap());
        let b = SessionRequest::from(KeygenRequest::new(parties(&["p1", "p2", "p4"])).unwrap());
        assert_ne!(a.session_id(), b.session_id());
    }

    #[test]
    fn test_session_id_depends_on_kind_and_digest() {
        let keygen =
            SessionRequest::from(KeygenRequest::new(parties(&["p1", "p2"])).unwrap());
        let sign_a = SessionRequest::from(
            KeysignRequest::new("pool", b"hello".to_vec(), parties(&["p1", "p2"])).unwrap(),
        );
        let sign_b = SessionRequest::from(
            KeysignRequest::new("pool", b"world".to_vec(), parties(&["p1", "p2"])).unwrap(),
        );
        let sign_c = SessionRequest::from(
            KeysignRequest::new("other-pool", b"hello".to_vec(), parties(&["p1", "p2"]))
                .unwrap(),
        );

        assert_ne!(keygen.session_id(), sign_a.session_id());
        assert_ne!(sign_a.session_id(), sign_b.session_id());
        assert_ne!(sign_a.session_id(), sign_c.session_id());
    }

    #[test]
    fn test_length_prefix_prevents_concatenation_collision() {
        let a = SessionRequest::from(KeygenRequest::new(parties(&["ab", "c"])).unwrap());
        let b = SessionRequest::from(KeygenRequest::new(parties(&["a", "bc"])).unwrap());
        assert_ne!(a.session_id(), b.session_id());
    }

    #[test]
    fn test_request_validation() {
        assert_eq!(
            KeygenRequest::new(vec![]).unwrap_err(),
            RequestError::EmptyParticipants
        );
        assert!(matches!(
            KeygenRequest::new(parties(&["p1"])).unwrap_err(),
            RequestError::TooFewParticipants { got: 1, .. }
        ));
        assert_eq!(
            KeygenRequest::new(parties(&["p1", "p2", "p1"])).unwrap_err(),
            RequestError::DuplicateParticipant("p1".into())
        );
        assert_eq!(
            KeysignRequest::new("pool", vec![], parties(&["p1", "p2"])).unwrap_err(),
            RequestError::EmptyMessage
        );
        assert_eq!(
            KeysignRequest::new("", vec![1], parties(&["p1", "p2"])).unwrap_err(),
            RequestError::EmptyPoolKey
        );
    }

    #[test]
    fn test_includes() {
        let req = SessionRequest::from(KeygenRequest::new(parties(&["p2", "p1"])).unwrap());
        assert!(req.includes(&"p1".into()));
        assert!(!req.includes(&"p9".into()));
        assert_eq!(req.kind(), ProtocolKind::Keygen);
    }
}
