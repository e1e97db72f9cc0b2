//! # Identity and Keys
//!
//! Peer identity in meshmq is a 32-byte Ed25519 public key. Master nodes hold
//! long-term keypairs; ordinary clients use ephemeral ones generated at
//! construction. The same keypair doubles as the static key for the curve
//! transport: the Ed25519 keys are mapped birationally onto X25519 for the
//! Noise handshake, so the verified handshake static *is* the peer identity.
//!
//! - [`Identity`]: 32-byte public key, the wire-level peer identifier
//! - [`Keypair`]: Ed25519 signing keypair with X25519 conversion for transport

use std::fmt;

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// A peer identity: the raw 32 bytes of an Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity([u8; 32]);

impl Identity {
    /// Construct from raw bytes. Any 32-byte value is accepted here; whether
    /// it is a valid curve point only matters when dialing it.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from a 64-character hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let raw = hex::decode(s).ok()?;
        let bytes: [u8; 32] = raw.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Short prefix used in log lines.
    pub(crate) fn log_id(&self) -> String {
        hex::encode(&self.0[..8])
    }

    /// The X25519 (Montgomery) form of this key, as required by the Noise
    /// handshake. Fails for byte patterns that are not valid Ed25519 points.
    pub(crate) fn to_x25519(&self) -> Option<[u8; 32]> {
        let vk = VerifyingKey::from_bytes(&self.0).ok()?;
        Some(vk.to_montgomery().to_bytes())
    }
}

impl From<[u8; 32]> for Identity {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Identity {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({}…)", self.log_id())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// An Ed25519 signing keypair identifying this node.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a fresh ephemeral keypair.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Reconstruct from a 32-byte Ed25519 secret seed.
    pub fn from_secret(secret: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&secret),
        }
    }

    pub fn identity(&self) -> Identity {
        Identity(self.signing_key.verifying_key().to_bytes())
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Convert to an X25519 keypair for the Noise handshake.
    ///
    /// Uses the standard birational map: Ed25519 secret to the SHA-512 left
    /// half as X25519 scalar, Ed25519 public to the Montgomery u-coordinate.
    pub(crate) fn to_x25519(&self) -> snow::Keypair {
        snow::Keypair {
            private: self.signing_key.to_scalar_bytes().to_vec(),
            public: self
                .signing_key
                .verifying_key()
                .to_montgomery()
                .to_bytes()
                .to_vec(),
        }
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keypair({}…)", self.identity().log_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_round_trips_through_bytes() {
        let kp = Keypair::generate();
        let id = kp.identity();
        assert_eq!(Identity::from_bytes(*id.as_bytes()), id);
    }

    #[test]
    fn identity_hex_round_trip() {
        let id = Keypair::generate().identity();
        let hex = id.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(Identity::from_hex(&hex), Some(id));
        assert_eq!(Identity::from_hex("zz"), None);
    }

    #[test]
    fn x25519_conversion_is_consistent() {
        let kp = Keypair::generate();
        let from_pair = kp.to_x25519();
        let from_identity = kp.identity().to_x25519().expect("valid point");
        assert_eq!(from_pair.public, from_identity.to_vec());
        assert_eq!(from_pair.private.len(), 32);
    }

    #[test]
    fn x25519_conversion_rejects_non_points() {
        // [2; 32] does not decompress to a valid Ed25519 point
        assert!(Identity::from_bytes([2u8; 32]).to_x25519().is_none());
    }

    #[test]
    fn keypair_secret_round_trip() {
        let kp = Keypair::generate();
        let again = Keypair::from_secret(kp.secret_bytes());
        assert_eq!(again.identity(), kp.identity());
    }
}
