//! Protocol engine adapter.
//!
//! The cryptographic engines are external: a session only sees an opaque
//! state machine that consumes round messages and emits outbound ones. One
//! engine instance exists per session and is owned by it exclusively.

pub mod reference;

use common::{KeysignOutput, PartyId, SessionId, SessionRequest};
use thiserror::Error;

use crate::pre_params::PreParams;

pub use reference::ReferenceEngineFactory;

/// Engine-local failure not attributable to a peer.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid engine setup: {0}")]
    InvalidSetup(String),

    #[error("missing local key share: {0}")]
    MissingShare(String),

    #[error("cryptographic failure: {0}")]
    Crypto(String),

    #[error("engine used out of order: {0}")]
    State(String),
}

/// Message produced by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Round this message belongs to.
    pub round: u16,
    /// None broadcasts to every other participant.
    pub recipient: Option<PartyId>,
    pub payload: Vec<u8>,
}

impl OutboundMessage {
    pub fn broadcast(round: u16, payload: Vec<u8>) -> Self {
        Self {
            round,
            recipient: None,
            payload,
        }
    }

    pub fn to(round: u16, recipient: PartyId, payload: Vec<u8>) -> Self {
        Self {
            round,
            recipient: Some(recipient),
            payload,
        }
    }
}

/// Why the engine refused a peer's message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Could not be decoded at all.
    Malformed(String),
    /// Decoded but failed protocol verification.
    Invalid(String),
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(reason) => write!(f, "malformed: {}", reason),
            Self::Invalid(reason) => write!(f, "invalid: {}", reason),
        }
    }
}

/// Final engine result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineOutput {
    Keygen {
        /// Hex-encoded compressed joint public key.
        public_key: String,
        /// Opaque local share to persist.
        share: Vec<u8>,
    },
    Keysign(KeysignOutput),
}

/// Result of feeding one message to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Absorbed; the round still expects more input.
    Accepted,
    Rejected(Rejection),
    /// Round finished. Carries the next round's outbound messages.
    RoundAdvanced(Vec<OutboundMessage>),
    Completed(EngineOutput),
}

/// Round-based protocol state machine.
///
/// Calls are synchronous and bounded; the session feeds messages strictly
/// for the current round, at most once per sender.
pub trait ProtocolEngine: Send {
    /// Number of message rounds before completion.
    fn total_rounds(&self) -> u16;

    /// Round the engine is currently collecting, starting at 1.
    fn current_round(&self) -> u16;

    /// Emit round-1 messages.
    fn start(&mut self) -> Result<Vec<OutboundMessage>, EngineError>;

    /// Feed one message from `sender` for `round`.
    fn handle_message(
        &mut self,
        round: u16,
        sender: &PartyId,
        payload: &[u8],
    ) -> Result<EngineEvent, EngineError>;
}

/// Everything an engine needs at creation time.
#[derive(Debug, Clone)]
pub struct EngineContext {
    pub session_id: SessionId,
    pub local: PartyId,
    /// Canonically sorted participants, local party included.
    pub participants: Vec<PartyId>,
    pub request: SessionRequest,
    pub pre_params: PreParams,
    /// Local key share for keysign.
    pub share: Option<Vec<u8>>,
}

impl EngineContext {
    /// Participants other than the local party.
    pub fn peers(&self) -> Vec<PartyId> {
        self.participants
            .iter()
            .filter(|p| **p != self.local)
            .cloned()
            .collect()
    }
}

/// Creates one engine per session.
pub trait EngineFactory: Send + Sync {
    fn create(&self, ctx: EngineContext) -> Result<Box<dyn ProtocolEngine>, EngineError>;

    /// Produce fresh pre-params material. Slow; run off the async runtime.
    fn generate_pre_params(&self) -> Result<Vec<u8>, EngineError>;
}
