//! Turns a session's terminal state into the [`Outcome`] its waiters see.
//!
//! On success the keygen share is persisted before the outcome is released,
//! so a keysign issued right after a keygen finds it. On failure the deferred
//! transport failures are folded into the blame record's `unreachable` list.

use std::sync::Arc;

use common::{
    BlameRecord, KeygenOutput, Outcome, PartyId, SessionError, SessionOutput, SessionRequest,
};
use protocols::{EngineOutput, KeyShareStore, StoredKeyShare};
use tracing::{error, info};

/// Why a session stopped before producing output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    Timeout {
        error: SessionError,
        blame: BlameRecord,
    },
    Abort {
        error: SessionError,
        blame: BlameRecord,
    },
}

impl Termination {
    pub fn timeout(error: SessionError, blame: BlameRecord) -> Self {
        Self::Timeout { error, blame }
    }

    pub fn abort(error: SessionError, blame: BlameRecord) -> Self {
        Self::Abort { error, blame }
    }

    /// Abort that blames no one.
    pub fn local(error: SessionError) -> Self {
        Self::Abort {
            error,
            blame: BlameRecord::new(),
        }
    }

    pub fn error(&self) -> &SessionError {
        match self {
            Self::Timeout { error, .. } | Self::Abort { error, .. } => error,
        }
    }
}

pub struct ResultReconciler {
    shares: Arc<KeyShareStore>,
}

impl ResultReconciler {
    pub fn new(shares: Arc<KeyShareStore>) -> Self {
        Self { shares }
    }

    /// Build the success outcome, persisting keygen material first.
    ///
    /// A share that cannot be stored turns the session into an abort: the
    /// key would be unusable for signing.
    pub async fn success(&self, request: &SessionRequest, output: EngineOutput) -> Outcome {
        match output {
            EngineOutput::Keygen { public_key, share } => {
                let stored = StoredKeyShare::new(
                    public_key.clone(),
                    request.participants().to_vec(),
                    share,
                );
                if let Err(e) = self.shares.save(stored).await {
                    error!("Failed to persist key share for {}: {}", public_key, e);
                    return Outcome::Abort {
                        error: SessionError::Engine {
                            reason: format!("key share not persisted: {}", e),
                        },
                        blame: BlameRecord::new(),
                    };
                }
                info!("Keygen produced pool key {}", public_key);
                Outcome::Success {
                    output: SessionOutput::Keygen(KeygenOutput { public_key }),
                }
            }
            EngineOutput::Keysign(signature) => Outcome::Success {
                output: SessionOutput::Keysign(signature),
            },
        }
    }

    /// Build the failure outcome from the termination and any transport
    /// failures recorded along the way.
    pub fn failure(&self, termination: Termination, deferred: &[SessionError]) -> Outcome {
        let unreachable = deferred.iter().filter_map(|e| match e {
            SessionError::TransportFailure { party, .. } => Some(party.clone()),
            _ => None,
        });

        match termination {
            Termination::Timeout { error, mut blame } => {
                add_unreachable(&mut blame, unreachable);
                Outcome::Timeout { error, blame }
            }
            Termination::Abort { error, mut blame } => {
                add_unreachable(&mut blame, unreachable);
                Outcome::Abort { error, blame }
            }
        }
    }
}

fn add_unreachable(blame: &mut BlameRecord, parties: impl Iterator<Item = PartyId>) {
    for party in parties {
        blame.add_unreachable(party);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{BlameReason, KeygenRequest, KeysignOutput};

    fn keygen_request() -> SessionRequest {
        KeygenRequest::new(vec!["p1".into(), "p2".into()])
            .unwrap()
            .into()
    }

    #[tokio::test]
    async fn test_keygen_success_persists_share() {
        let shares = Arc::new(KeyShareStore::in_memory());
        let reconciler = ResultReconciler::new(shares.clone());

        let outcome = reconciler
            .success(
                &keygen_request(),
                EngineOutput::Keygen {
                    public_key: "02aa".to_string(),
                    share: vec![7; 4],
                },
            )
            .await;

        assert!(outcome.is_success());
        let stored = shares.load("02aa").await.unwrap().unwrap();
        assert_eq!(stored.share, vec![7; 4]);
        assert_eq!(stored.participants, vec![PartyId::from("p1"), PartyId::from("p2")]);
    }

    #[tokio::test]
    async fn test_unstorable_share_aborts() {
        let reconciler = ResultReconciler::new(Arc::new(KeyShareStore::in_memory()));
        let outcome = reconciler
            .success(
                &keygen_request(),
                EngineOutput::Keygen {
                    public_key: "not-hex".to_string(),
                    share: vec![1],
                },
            )
            .await;
        assert_eq!(outcome.status(), "abort");
        assert!(matches!(outcome.error(), Some(SessionError::Engine { .. })));
    }

    #[tokio::test]
    async fn test_keysign_passthrough() {
        let reconciler = ResultReconciler::new(Arc::new(KeyShareStore::in_memory()));
        let signature = KeysignOutput {
            r: vec![1; 32],
            s: vec![2; 32],
            recovery_id: 1,
        };
        let outcome = reconciler
            .success(&keygen_request(), EngineOutput::Keysign(signature.clone()))
            .await;
        assert_eq!(
            outcome,
            Outcome::Success {
                output: SessionOutput::Keysign(signature)
            }
        );
    }

    #[test]
    fn test_failure_folds_transport_failures() {
        let reconciler = ResultReconciler::new(Arc::new(KeyShareStore::in_memory()));
        let mut blame = BlameRecord::new();
        blame.blame("p3".into(), BlameReason::NoResponse, Some(2), None);

        let deferred = vec![
            SessionError::TransportFailure {
                party: "p4".into(),
                reason: "connection refused".into(),
            },
            SessionError::TransportFailure {
                party: "p4".into(),
                reason: "connection refused".into(),
            },
        ];
        let outcome = reconciler.failure(
            Termination::timeout(
                SessionError::ProtocolTimeout {
                    round: 2,
                    missing: vec!["p3".into()],
                },
                blame,
            ),
            &deferred,
        );

        let blame = outcome.blame().unwrap();
        assert_eq!(blame.parties(), vec![PartyId::from("p3")]);
        assert_eq!(blame.unreachable, vec![PartyId::from("p4")]);
        assert_eq!(outcome.status(), "timeout");
    }
}
