//! Blame records attached to every non-successful session outcome.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::PartyId;

/// Why a party is held responsible for a session's non-completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlameReason {
    /// Expected message never arrived before the deadline.
    NoResponse,
    /// Structurally invalid or equivocating message. The peer is provably faulty.
    Malformed,
    /// The protocol engine rejected the peer's contribution.
    ProtocolRejection,
}

impl fmt::Display for BlameReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoResponse => "no_response",
            Self::Malformed => "malformed",
            Self::ProtocolRejection => "protocol_rejection",
        };
        f.write_str(s)
    }
}

/// A single blamed party.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blame {
    pub party: PartyId,
    pub reason: BlameReason,
    /// Round in which the fault was observed (None during initialization).
    pub round: Option<u16>,
    /// Never seen at the network layer during initialization.
    #[serde(default)]
    pub unresolved: bool,
    pub detail: Option<String>,
}

/// Structured list of (party, reason) pairs.
///
/// Each party appears at most once; the first recorded reason wins.
/// `unreachable` carries deferred transport failures. They are reported
/// alongside the blame list but never blame a party on their own.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlameRecord {
    pub blamed: Vec<Blame>,
    #[serde(default)]
    pub unreachable: Vec<PartyId>,
}

impl BlameRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a blame entry. Returns false if the party was already blamed.
    pub fn blame(
        &mut self,
        party: PartyId,
        reason: BlameReason,
        round: Option<u16>,
        detail: Option<String>,
    ) -> bool {
        if self.contains(&party) {
            return false;
        }
        self.blamed.push(Blame {
            party,
            reason,
            round,
            unresolved: false,
            detail,
        });
        true
    }

    /// Blame a party that never became reachable during initialization.
    pub fn blame_unresolved(&mut self, party: PartyId) -> bool {
        if self.contains(&party) {
            return false;
        }
        self.blamed.push(Blame {
            party,
            reason: BlameReason::NoResponse,
            round: None,
            unresolved: true,
            detail: Some("never became ready during initialization".to_string()),
        });
        true
    }

    pub fn add_unreachable(&mut self, party: PartyId) {
        if !self.unreachable.contains(&party) {
            self.unreachable.push(party);
        }
    }

    pub fn contains(&self, party: &PartyId) -> bool {
        self.blamed.iter().any(|b| &b.party == party)
    }

    pub fn reason_for(&self, party: &PartyId) -> Option<BlameReason> {
        self.blamed
            .iter()
            .find(|b| &b.party == party)
            .map(|b| b.reason)
    }

    pub fn parties(&self) -> Vec<PartyId> {
        self.blamed.iter().map(|b| b.party.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.blamed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.blamed.len()
    }
}
