//! Identity Keys
//!
//! Long-lived key material: an Ed25519 signing keypair and an X25519
//! static keypair for Noise. Neither ever changes; the 32-byte fingerprint
//! of the Noise static public key is the stable name other peers know a
//! node by across ephemeral rotation.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use crate::error::{MeshError, MeshResult};
use crate::protocol::PeerId;

/// 32-byte digest of a peer's Noise static public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    /// Fingerprint a raw X25519 public key.
    pub fn of_static_key(public_key: &[u8; 32]) -> Self {
        Fingerprint(Sha256::digest(public_key).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First 8 bytes; the on-wire peer ID when rotation is disabled.
    pub fn short_id(&self) -> PeerId {
        let mut id = [0u8; 8];
        id.copy_from_slice(&self.0[..8]);
        PeerId(id)
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// A node's long-lived key material.
pub struct Identity {
    signing_key: SigningKey,
    noise_static: StaticSecret,
}

impl Identity {
    /// Generate a fresh identity from the OS RNG.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        let signing_key = SigningKey::from_bytes(&seed);
        seed.zeroize();

        let noise_static = StaticSecret::random_from_rng(rand::rngs::OsRng);
        Self {
            signing_key,
            noise_static,
        }
    }

    /// Rebuild an identity from stored secret bytes.
    pub fn from_bytes(signing: &[u8], noise: &[u8]) -> MeshResult<Self> {
        let signing: [u8; 32] = signing
            .try_into()
            .map_err(|_| MeshError::IdentityKeyUnavailable("signing key length".into()))?;
        let noise: [u8; 32] = noise
            .try_into()
            .map_err(|_| MeshError::IdentityKeyUnavailable("noise key length".into()))?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&signing),
            noise_static: StaticSecret::from(noise),
        })
    }

    /// Secret bytes for persistence, wiped on drop.
    pub fn signing_secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing_key.to_bytes())
    }

    pub fn noise_secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.noise_static.to_bytes())
    }

    pub fn signing_public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn noise_public_key(&self) -> [u8; 32] {
        X25519PublicKey::from(&self.noise_static).to_bytes()
    }

    pub fn noise_static_secret(&self) -> StaticSecret {
        self.noise_static.clone()
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of_static_key(&self.noise_public_key())
    }

    /// Peer ID used when rotation is disabled.
    pub fn static_peer_id(&self) -> PeerId {
        self.fingerprint().short_id()
    }

    /// Seed for deriving rotating peer IDs. Depends only on the secret
    /// noise key, so rotated IDs cannot be linked to the public
    /// fingerprint by an observer.
    pub fn rotation_seed(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"peer-rotation-seed");
        hasher.update(self.noise_static.to_bytes());
        hasher.finalize().into()
    }

    /// Sign a canonical pre-image (see `codec::encode_for_signing`).
    pub fn sign(&self, preimage: &[u8]) -> [u8; 64] {
        self.signing_key.sign(preimage).to_bytes()
    }

    /// Verify a signature against a peer's announced signing key.
    pub fn verify(preimage: &[u8], signature: &[u8; 64], signing_key: &[u8; 32]) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(signing_key) else {
            return false;
        };
        key.verify(preimage, &Signature::from_bytes(signature)).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_stable_across_reload() {
        let identity = Identity::generate();
        let reloaded = Identity::from_bytes(
            identity.signing_secret_bytes().as_ref(),
            identity.noise_secret_bytes().as_ref(),
        )
        .unwrap();
        assert_eq!(identity.fingerprint(), reloaded.fingerprint());
        assert_eq!(identity.static_peer_id(), reloaded.static_peer_id());
    }

    #[test]
    fn sign_verify_round_trip() {
        let identity = Identity::generate();
        let signature = identity.sign(b"preimage");
        assert!(Identity::verify(
            b"preimage",
            &signature,
            &identity.signing_public_key()
        ));
        assert!(!Identity::verify(
            b"tampered",
            &signature,
            &identity.signing_public_key()
        ));
    }

    #[test]
    fn bad_key_lengths_rejected() {
        assert!(matches!(
            Identity::from_bytes(&[0u8; 16], &[0u8; 32]),
            Err(MeshError::IdentityKeyUnavailable(_))
        ));
    }

    #[test]
    fn rotation_seed_differs_between_identities() {
        assert_ne!(
            Identity::generate().rotation_seed(),
            Identity::generate().rotation_seed()
        );
    }
}
