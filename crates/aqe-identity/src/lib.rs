//! # AQE Identity Crate
//!
//! Replica identity and message signing for the AQE mesh. The coordination
//! plane authenticates peers with a challenge/response handshake; this
//! crate supplies the [`Signer`] interface it consumes and an Ed25519
//! implementation of it. The mesh core never implements cryptographic
//! primitives itself.

use aqe_common::ReplicaId;
use ed25519_dalek::{Signer as DalekSigner, Verifier};
use serde::{Deserialize, Serialize};

pub use ed25519_dalek::{Signature, SigningKey, VerifyingKey};

/// Errors raised by identity and signature operations.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid signature encoding: {0}")]
    InvalidSignature(String),

    #[error("Signature verification failed for {0}")]
    VerificationFailed(ReplicaId),
}

/// Result type for identity operations.
pub type IdentityResult<T> = Result<T, IdentityError>;

/// Raw signature bytes as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureBytes(#[serde(with = "serde_bytes")] pub Vec<u8>);

impl SignatureBytes {
    /// Decode into a dalek signature.
    pub fn to_signature(&self) -> IdentityResult<Signature> {
        let bytes: [u8; 64] = self
            .0
            .as_slice()
            .try_into()
            .map_err(|_| IdentityError::InvalidSignature(format!("{} bytes", self.0.len())))?;
        Ok(Signature::from_bytes(&bytes))
    }
}

impl From<Signature> for SignatureBytes {
    fn from(sig: Signature) -> Self {
        SignatureBytes(sig.to_bytes().to_vec())
    }
}

/// Public key bytes as declared by a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyBytes(#[serde(with = "serde_bytes")] pub Vec<u8>);

impl PublicKeyBytes {
    /// Decode into a dalek verifying key.
    pub fn to_verifying_key(&self) -> IdentityResult<VerifyingKey> {
        let bytes: [u8; 32] = self
            .0
            .as_slice()
            .try_into()
            .map_err(|_| IdentityError::InvalidPublicKey(format!("{} bytes", self.0.len())))?;
        VerifyingKey::from_bytes(&bytes)
            .map_err(|e| IdentityError::InvalidPublicKey(e.to_string()))
    }
}

impl From<&VerifyingKey> for PublicKeyBytes {
    fn from(vk: &VerifyingKey) -> Self {
        PublicKeyBytes(vk.to_bytes().to_vec())
    }
}

/// Signing interface consumed by the coordination plane.
///
/// Implementations must be cheap to call; signing happens on every
/// coordination message and auth handshake.
pub trait Signer: Send + Sync {
    /// Sign the given bytes with the local key.
    fn sign(&self, bytes: &[u8]) -> SignatureBytes;

    /// The public key peers should verify our signatures against.
    fn public_key(&self) -> PublicKeyBytes;

    /// Verify a signature made by `public_key` over `bytes`.
    fn verify(&self, bytes: &[u8], signature: &SignatureBytes, public_key: &PublicKeyBytes)
        -> bool;
}

/// Generate a fresh Ed25519 keypair from the OS RNG.
pub fn generate_ed25519_keypair() -> (SigningKey, VerifyingKey) {
    let mut csprng = rand_core::OsRng;
    let signing_key = SigningKey::generate(&mut csprng);
    let verifying_key = signing_key.verifying_key();
    (signing_key, verifying_key)
}

/// Derive a stable replica id from a verifying key.
pub fn replica_id_from_key(vk: &VerifyingKey) -> ReplicaId {
    ReplicaId::new(format!("aqe:ed25519:{}", hex::encode(vk.to_bytes())))
}

/// Ed25519-backed [`Signer`].
pub struct Ed25519Signer {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl Ed25519Signer {
    /// Wrap an existing signing key.
    pub fn new(signing_key: SigningKey) -> Self {
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Generate a signer with a fresh keypair.
    pub fn generate() -> Self {
        let (signing_key, verifying_key) = generate_ed25519_keypair();
        Self {
            signing_key,
            verifying_key,
        }
    }

    /// The replica id derived from this signer's public key.
    pub fn replica_id(&self) -> ReplicaId {
        replica_id_from_key(&self.verifying_key)
    }
}

impl Signer for Ed25519Signer {
    fn sign(&self, bytes: &[u8]) -> SignatureBytes {
        self.signing_key.sign(bytes).into()
    }

    fn public_key(&self) -> PublicKeyBytes {
        PublicKeyBytes::from(&self.verifying_key)
    }

    fn verify(
        &self,
        bytes: &[u8],
        signature: &SignatureBytes,
        public_key: &PublicKeyBytes,
    ) -> bool {
        let Ok(vk) = public_key.to_verifying_key() else {
            return false;
        };
        let Ok(sig) = signature.to_signature() else {
            return false;
        };
        vk.verify(bytes, &sig).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify_roundtrip() {
        let signer = Ed25519Signer::generate();
        let msg = b"auth-nonce:replica-b";

        let sig = signer.sign(msg);
        assert!(signer.verify(msg, &sig, &signer.public_key()));
    }

    #[test]
    fn test_verify_rejects_tampered_message() {
        let signer = Ed25519Signer::generate();
        let sig = signer.sign(b"original");
        assert!(!signer.verify(b"tampered", &sig, &signer.public_key()));
    }

    #[test]
    fn test_verify_rejects_wrong_key() {
        let alice = Ed25519Signer::generate();
        let mallory = Ed25519Signer::generate();

        let sig = mallory.sign(b"hello");
        assert!(!alice.verify(b"hello", &sig, &alice.public_key()));
    }

    #[test]
    fn test_replica_id_is_stable() {
        let signer = Ed25519Signer::generate();
        let id = signer.replica_id();
        assert!(id.as_str().starts_with("aqe:ed25519:"));
        assert_eq!(id, signer.replica_id());
    }

    #[test]
    fn test_signature_bytes_rejects_bad_length() {
        let bad = SignatureBytes(vec![0u8; 10]);
        assert!(bad.to_signature().is_err());

        let bad_key = PublicKeyBytes(vec![1u8; 5]);
        assert!(bad_key.to_verifying_key().is_err());
    }
}
