//! Node identity derived from its long-lived secp256k1 key.
//!
//! The key arrives base64-encoded. Either the base64 decodes to the 32 raw
//! secret bytes, or it decodes to 64 ASCII hex characters that in turn
//! decode to them. The party id is the hex of the compressed public key.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::PartyId;
use generic_ec::{curves::Secp256k1, Point, Scalar};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("private key is not valid base64: {0}")]
    Base64(String),

    #[error("private key must be 32 bytes, got {0}")]
    Length(usize),

    #[error("private key is not a valid secp256k1 scalar")]
    InvalidScalar,
}

pub struct NodeIdentity {
    party: PartyId,
}

impl NodeIdentity {
    pub fn from_base64(encoded: &str) -> Result<Self, IdentityError> {
        let decoded = STANDARD
            .decode(encoded.trim())
            .map_err(|e| IdentityError::Base64(e.to_string()))?;

        let secret = match decoded.len() {
            32 => decoded,
            64 => hex::decode(&decoded).map_err(|_| IdentityError::Length(64))?,
            other => return Err(IdentityError::Length(other)),
        };

        let scalar =
            Scalar::<Secp256k1>::from_be_bytes(&secret).map_err(|_| IdentityError::InvalidScalar)?;
        if scalar == Scalar::<Secp256k1>::zero() {
            return Err(IdentityError::InvalidScalar);
        }

        let public = Point::<Secp256k1>::generator() * scalar;
        Ok(Self {
            party: PartyId::new(hex::encode(&public.to_bytes(true)[..])),
        })
    }

    pub fn party(&self) -> &PartyId {
        &self.party
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Secret scalar 1: the public key is the generator.
    const GENERATOR: &str = "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";

    fn one() -> [u8; 32] {
        let mut secret = [0u8; 32];
        secret[31] = 1;
        secret
    }

    #[test]
    fn test_raw_key() {
        let identity = NodeIdentity::from_base64(&STANDARD.encode(one())).unwrap();
        assert_eq!(identity.party().as_str(), GENERATOR);
    }

    #[test]
    fn test_hex_wrapped_key() {
        let wrapped = STANDARD.encode(hex::encode(one()));
        let identity = NodeIdentity::from_base64(&wrapped).unwrap();
        assert_eq!(identity.party().as_str(), GENERATOR);
    }

    #[test]
    fn test_invalid_keys() {
        assert!(matches!(
            NodeIdentity::from_base64("not base64!").err(),
            Some(IdentityError::Base64(_))
        ));
        assert_eq!(
            NodeIdentity::from_base64(&STANDARD.encode([1u8; 16])).err(),
            Some(IdentityError::Length(16))
        );
        assert_eq!(
            NodeIdentity::from_base64(&STANDARD.encode([0u8; 32])).err(),
            Some(IdentityError::InvalidScalar)
        );
    }
}
