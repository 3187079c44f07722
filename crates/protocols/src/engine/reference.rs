//! Reference two-round engine over secp256k1.
//!
//! Round 1 broadcasts a SHA-256 commitment to a random scalar contribution,
//! round 2 reveals it. Keygen sums the contributions into the joint secret;
//! keysign sums them into the nonce and every party computes the same ECDSA
//! signature locally.
//!
//! Contributions are revealed in the clear, so every participant learns the
//! joint secret. This engine exists to exercise session coordination in tests
//! and local clusters. It is NOT a threshold scheme.

use std::collections::HashMap;

use common::{KeysignOutput, PartyId, SessionId, SessionRequest};
use generic_ec::{curves::Secp256k1, Point, Scalar};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{
    EngineContext, EngineError, EngineEvent, EngineFactory, EngineOutput, OutboundMessage,
    ProtocolEngine, Rejection,
};

const COMMIT_DOMAIN: &[u8] = b"tss-reference-commit-v1";

/// Size of the pre-params blob the reference engine expects.
pub const PRE_PARAMS_LEN: usize = 64;

/// secp256k1 group order / 2, for low-S normalisation.
const HALF_ORDER: [u8; 32] = [
    0x7F, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
    0x5D, 0x57, 0x6E, 0x73, 0x57, 0xA4, 0x50, 0x1D, 0xDF, 0xE9, 0x2F, 0x46, 0x68, 0x1B, 0x20, 0xA0,
];

#[derive(Debug, Serialize, Deserialize)]
enum ReferenceMessage {
    Commit([u8; 32]),
    Reveal(Vec<u8>),
}

/// Persisted local share produced by reference keygen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceShare {
    pub public_key: String,
    pub secret: Vec<u8>,
}

enum Mode {
    Keygen,
    Keysign {
        secret: Scalar<Secp256k1>,
        digest: Scalar<Secp256k1>,
    },
}

/// Commit/reveal engine instance for one session.
pub struct ReferenceEngine {
    session_id: SessionId,
    local: PartyId,
    peers: Vec<PartyId>,
    mode: Mode,
    round: u16,
    contribution: Scalar<Secp256k1>,
    commitments: HashMap<PartyId, [u8; 32]>,
    reveals: HashMap<PartyId, Scalar<Secp256k1>>,
}

impl ReferenceEngine {
    pub fn new(ctx: EngineContext) -> Result<Self, EngineError> {
        if ctx.pre_params.len() != PRE_PARAMS_LEN {
            return Err(EngineError::InvalidSetup(format!(
                "expected {} bytes of pre-params, got {}",
                PRE_PARAMS_LEN,
                ctx.pre_params.len()
            )));
        }

        let peers = ctx.peers();
        if peers.len() + 1 != ctx.participants.len() {
            return Err(EngineError::InvalidSetup(
                "local party is not a participant".to_string(),
            ));
        }

        let mode = match &ctx.request {
            SessionRequest::Keygen(_) => Mode::Keygen,
            SessionRequest::Keysign(req) => {
                let share_bytes = ctx
                    .share
                    .as_deref()
                    .ok_or_else(|| EngineError::MissingShare(req.pool_pub_key().to_string()))?;
                let share: ReferenceShare = serde_json::from_slice(share_bytes)
                    .map_err(|e| EngineError::InvalidSetup(format!("corrupt key share: {}", e)))?;
                if share.public_key != req.pool_pub_key() {
                    return Err(EngineError::InvalidSetup(format!(
                        "key share belongs to {}, not {}",
                        share.public_key,
                        req.pool_pub_key()
                    )));
                }
                let secret = Scalar::<Secp256k1>::from_be_bytes(&share.secret)
                    .map_err(|_| EngineError::InvalidSetup("corrupt secret scalar".to_string()))?;
                Mode::Keysign {
                    secret,
                    digest: message_scalar(req.message()),
                }
            }
        };

        Ok(Self {
            session_id: ctx.session_id,
            local: ctx.local,
            peers,
            mode,
            round: 1,
            contribution: Scalar::<Secp256k1>::random(&mut OsRng),
            commitments: HashMap::new(),
            reveals: HashMap::new(),
        })
    }

    fn commitment(&self, party: &PartyId, contribution: &Scalar<Secp256k1>) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(COMMIT_DOMAIN);
        hasher.update(self.session_id.as_str().as_bytes());
        hasher.update((party.as_str().len() as u32).to_be_bytes());
        hasher.update(party.as_str().as_bytes());
        hasher.update(&contribution.to_be_bytes()[..]);
        hasher.finalize().into()
    }

    fn encode(msg: &ReferenceMessage) -> Result<Vec<u8>, EngineError> {
        bincode::serialize(msg).map_err(|e| EngineError::Crypto(e.to_string()))
    }

    fn handle_commit(
        &mut self,
        sender: &PartyId,
        msg: ReferenceMessage,
    ) -> Result<EngineEvent, EngineError> {
        let commitment = match msg {
            ReferenceMessage::Commit(c) => c,
            ReferenceMessage::Reveal(_) => {
                return Ok(EngineEvent::Rejected(Rejection::Malformed(
                    "reveal sent during commit round".to_string(),
                )))
            }
        };

        self.commitments.entry(sender.clone()).or_insert(commitment);
        if self.commitments.len() < self.peers.len() {
            return Ok(EngineEvent::Accepted);
        }

        self.round = 2;
        let reveal = ReferenceMessage::Reveal(self.contribution.to_be_bytes().to_vec());
        Ok(EngineEvent::RoundAdvanced(vec![OutboundMessage::broadcast(
            2,
            Self::encode(&reveal)?,
        )]))
    }

    fn handle_reveal(
        &mut self,
        sender: &PartyId,
        msg: ReferenceMessage,
    ) -> Result<EngineEvent, EngineError> {
        let bytes = match msg {
            ReferenceMessage::Reveal(bytes) => bytes,
            ReferenceMessage::Commit(_) => {
                return Ok(EngineEvent::Rejected(Rejection::Malformed(
                    "commitment sent during reveal round".to_string(),
                )))
            }
        };

        let contribution = match Scalar::<Secp256k1>::from_be_bytes(&bytes) {
            Ok(scalar) => scalar,
            Err(_) => {
                return Ok(EngineEvent::Rejected(Rejection::Malformed(
                    "contribution is not a valid scalar".to_string(),
                )))
            }
        };

        let expected = self
            .commitments
            .get(sender)
            .ok_or_else(|| EngineError::State(format!("no commitment from {}", sender)))?;
        if *expected != self.commitment(sender, &contribution) {
            return Ok(EngineEvent::Rejected(Rejection::Invalid(
                "reveal does not match commitment".to_string(),
            )));
        }

        self.reveals.entry(sender.clone()).or_insert(contribution);
        if self.reveals.len() < self.peers.len() {
            return Ok(EngineEvent::Accepted);
        }

        let total = self
            .reveals
            .values()
            .fold(self.contribution, |acc, c| acc + *c);
        self.finish(total).map(EngineEvent::Completed)
    }

    fn finish(&self, total: Scalar<Secp256k1>) -> Result<EngineOutput, EngineError> {
        match &self.mode {
            Mode::Keygen => {
                if total == Scalar::<Secp256k1>::zero() {
                    return Err(EngineError::Crypto("joint secret is zero".to_string()));
                }
                let public_key = hex::encode(&public_point(&total).to_bytes(true)[..]);
                let share = ReferenceShare {
                    public_key: public_key.clone(),
                    secret: total.to_be_bytes().to_vec(),
                };
                let share =
                    serde_json::to_vec(&share).map_err(|e| EngineError::Crypto(e.to_string()))?;
                debug!("Reference keygen complete for {}", self.local.short());
                Ok(EngineOutput::Keygen { public_key, share })
            }
            Mode::Keysign { secret, digest } => {
                sign(secret, digest, &total).map(EngineOutput::Keysign)
            }
        }
    }
}

impl ProtocolEngine for ReferenceEngine {
    fn total_rounds(&self) -> u16 {
        2
    }

    fn current_round(&self) -> u16 {
        self.round
    }

    fn start(&mut self) -> Result<Vec<OutboundMessage>, EngineError> {
        let own = self.commitment(&self.local, &self.contribution);
        let commit = ReferenceMessage::Commit(own);
        Ok(vec![OutboundMessage::broadcast(1, Self::encode(&commit)?)])
    }

    fn handle_message(
        &mut self,
        round: u16,
        sender: &PartyId,
        payload: &[u8],
    ) -> Result<EngineEvent, EngineError> {
        if round != self.round {
            return Err(EngineError::State(format!(
                "message for round {} while in round {}",
                round, self.round
            )));
        }
        if !self.peers.contains(sender) {
            return Err(EngineError::State(format!("unknown sender {}", sender)));
        }

        let msg: ReferenceMessage = match bincode::deserialize(payload) {
            Ok(msg) => msg,
            Err(e) => return Ok(EngineEvent::Rejected(Rejection::Malformed(e.to_string()))),
        };

        match self.round {
            1 => self.handle_commit(sender, msg),
            _ => self.handle_reveal(sender, msg),
        }
    }
}

/// Factory for [`ReferenceEngine`]s.
#[derive(Debug, Clone, Default)]
pub struct ReferenceEngineFactory;

impl EngineFactory for ReferenceEngineFactory {
    fn create(&self, ctx: EngineContext) -> Result<Box<dyn ProtocolEngine>, EngineError> {
        Ok(Box::new(ReferenceEngine::new(ctx)?))
    }

    fn generate_pre_params(&self) -> Result<Vec<u8>, EngineError> {
        let mut bytes = vec![0u8; PRE_PARAMS_LEN];
        OsRng.fill_bytes(&mut bytes);
        Ok(bytes)
    }
}

fn public_point(secret: &Scalar<Secp256k1>) -> Point<Secp256k1> {
    Point::<Secp256k1>::generator() * *secret
}

/// 32-byte messages are taken as a digest; anything else is hashed first.
fn message_scalar(message: &[u8]) -> Scalar<Secp256k1> {
    if message.len() == 32 {
        Scalar::<Secp256k1>::from_be_bytes_mod_order(message)
    } else {
        let digest = Sha256::digest(message);
        Scalar::<Secp256k1>::from_be_bytes_mod_order(digest.as_slice())
    }
}

fn sign(
    secret: &Scalar<Secp256k1>,
    digest: &Scalar<Secp256k1>,
    nonce: &Scalar<Secp256k1>,
) -> Result<KeysignOutput, EngineError> {
    let nonce_point = public_point(nonce).to_bytes(true);
    let r = Scalar::<Secp256k1>::from_be_bytes_mod_order(&nonce_point[1..33]);
    if r == Scalar::<Secp256k1>::zero() {
        return Err(EngineError::Crypto("signature r is zero".to_string()));
    }

    let nonce_inv = nonce
        .invert()
        .ok_or_else(|| EngineError::Crypto("nonce is zero".to_string()))?;
    let mut s = nonce_inv * (*digest + r * *secret);
    if s == Scalar::<Secp256k1>::zero() {
        return Err(EngineError::Crypto("signature s is zero".to_string()));
    }

    let mut recovery_id = nonce_point[0] & 1;
    let mut s_arr = [0u8; 32];
    s_arr.copy_from_slice(&s.to_be_bytes());
    if s_arr > HALF_ORDER {
        s = -s;
        recovery_id ^= 1;
    }

    Ok(KeysignOutput {
        r: r.to_be_bytes().to_vec(),
        s: s.to_be_bytes().to_vec(),
        recovery_id,
    })
}
