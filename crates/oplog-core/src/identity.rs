//! Identity capabilities: producing and checking entry signatures.
//!
//! The log never manages key material itself. It receives a [`Signer`] when
//! appending and holds an [`IdentityVerifier`] for checking entries that
//! arrive from peers. Both are plain traits so a keystore or an external
//! identity provider can stand in for the ed25519 implementations here.

use crate::codec::Encoder;
use crate::entry::Entry;
use crate::hash::{Hash, Hasher};
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use std::fmt;

/// Identity type tag for ed25519 keys.
pub const ED25519: &str = "ed25519";

/// Errors raised by identity providers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("signing failed: {0}")]
    Signing(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),
}

/// Something able to sign entries on behalf of an identity.
pub trait Signer: Send + Sync {
    /// Stable identity id, also used as the clock id of appended entries.
    fn id(&self) -> &str;

    /// Public key bytes, written into the entry's `key` field.
    fn public_key(&self) -> &[u8];

    /// Hash of the identity object, written into the entry's `identity` field.
    fn identity(&self) -> Hash;

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, IdentityError>;
}

/// Checks that an entry was signed by the identity it names.
///
/// Implementations must be pure: they may be called concurrently from
/// several joins and must never panic on malformed input.
pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, entry: &Entry) -> bool;
}

/// Hash of an identity object of the given type and public key.
pub fn identity_hash(kind: &str, public_key: &[u8]) -> Hash {
    let mut enc = Encoder::new();
    enc.str(kind).bytes(public_key);
    Hasher::hash(&enc.finish())
}

/// Hex form of a public key; the id of ed25519 identities.
pub fn key_id(public_key: &[u8]) -> String {
    public_key.iter().map(|b| format!("{:02x}", b)).collect()
}

/// An ed25519 identity holding its signing key in memory.
pub struct Ed25519Identity {
    id: String,
    signing_key: SigningKey,
    public_key: [u8; 32],
    identity: Hash,
}

impl Ed25519Identity {
    /// Generate a fresh identity from random key material.
    pub fn generate() -> Self {
        Self::from_seed(rand::random::<[u8; 32]>())
    }

    /// Deterministic identity from a 32-byte secret seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&seed);
        let public_key = signing_key.verifying_key().to_bytes();
        Ed25519Identity {
            id: key_id(&public_key),
            identity: identity_hash(ED25519, &public_key),
            signing_key,
            public_key,
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

impl fmt::Debug for Ed25519Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ed25519Identity")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl Signer for Ed25519Identity {
    fn id(&self) -> &str {
        &self.id
    }

    fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    fn identity(&self) -> Hash {
        self.identity
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, IdentityError> {
        let signature: Signature = self.signing_key.sign(data);
        Ok(signature.to_bytes().to_vec())
    }
}

/// Stateless verifier for entries signed by [`Ed25519Identity`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Verifier;

impl IdentityVerifier for Ed25519Verifier {
    fn verify(&self, entry: &Entry) -> bool {
        if entry.identity != identity_hash(ED25519, &entry.key) {
            return false;
        }
        let Ok(key_bytes) = <[u8; 32]>::try_from(entry.key.as_slice()) else {
            return false;
        };
        let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(&entry.sig) else {
            return false;
        };
        verifying_key
            .verify(&entry.signable_bytes(), &signature)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_identity_is_deterministic() {
        let a = Ed25519Identity::from_seed([7u8; 32]);
        let b = Ed25519Identity::from_seed([7u8; 32]);
        assert_eq!(a.id(), b.id());
        assert_eq!(a.identity(), b.identity());
        assert_eq!(a.id().len(), 64);
        assert_ne!(a.id(), Ed25519Identity::from_seed([8u8; 32]).id());
    }

    #[test]
    fn test_identity_hash_binds_key_and_type() {
        let id = Ed25519Identity::from_seed([1u8; 32]);
        assert_eq!(id.identity(), identity_hash(ED25519, id.public_key()));
        assert_ne!(id.identity(), identity_hash("secp256k1", id.public_key()));
    }

    #[test]
    fn test_signature_verifies_with_dalek() {
        let id = Ed25519Identity::from_seed([3u8; 32]);
        let sig = id.sign(b"message").unwrap();
        let sig = Signature::from_slice(&sig).unwrap();
        assert!(id.verifying_key().verify(b"message", &sig).is_ok());
        assert!(id.verifying_key().verify(b"other", &sig).is_err());
    }

    #[test]
    fn test_debug_hides_secret() {
        let id = Ed25519Identity::from_seed([9u8; 32]);
        let shown = format!("{:?}", id);
        assert!(shown.contains("Ed25519Identity"));
        assert!(!shown.contains("signing_key"));
    }
}
