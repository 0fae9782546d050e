//! Noise XX Primitives
//!
//! Noise_XX_25519_ChaChaPoly_SHA256 built from the curve/AEAD/hash crates
//! directly: `CipherState`, `SymmetricState` and `HandshakeState` as the
//! Noise specification defines them, restricted to the XX pattern:
//!
//! ```text
//!   -> e
//!   <- e, ee, s, es
//!   -> s, se
//! ```
//!
//! Transport nonces are 64-bit counters, little-endian in the final 8
//! bytes of the ChaChaPoly nonce, independent per direction, and a failed
//! decryption never advances the receive counter.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::error::{MeshError, MeshResult};

type HmacSha256 = Hmac<Sha256>;

/// Exactly 32 bytes, so it seeds the handshake hash without padding.
const PROTOCOL_NAME: &[u8; 32] = b"Noise_XX_25519_ChaChaPoly_SHA256";

/// Sessions rekey once the send counter crosses this line, well before
/// the nonce space runs out.
pub const REKEY_NONCE_THRESHOLD: u64 = 1 << 48;

/// AEAD tag appended to every ciphertext.
pub const TAG_SIZE: usize = 16;

/// Size of handshake message 1 (`e`).
pub const MESSAGE_1_SIZE: usize = 32;
/// Size of handshake message 2 (`e, ee, s, es` with empty payload).
pub const MESSAGE_2_SIZE: usize = 96;
/// Size of handshake message 3 (`s, se` with empty payload).
pub const MESSAGE_3_SIZE: usize = 64;

/// One direction of a transport session: key plus monotonic nonce.
pub struct CipherState {
    key: Option<[u8; 32]>,
    nonce: u64,
}

impl CipherState {
    fn empty() -> Self {
        Self {
            key: None,
            nonce: 0,
        }
    }

    fn initialize_key(&mut self, key: [u8; 32]) {
        self.key = Some(key);
        self.nonce = 0;
    }

    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Force the counter; used by tests and by rekey bookkeeping.
    pub fn set_nonce(&mut self, nonce: u64) {
        self.nonce = nonce;
    }

    fn nonce_bytes(n: u64) -> [u8; 12] {
        let mut bytes = [0u8; 12];
        bytes[4..].copy_from_slice(&n.to_le_bytes());
        bytes
    }

    /// Encrypt with the current nonce and advance it. Without a key the
    /// plaintext passes through (pre-key handshake payloads).
    pub fn encrypt_with_ad(&mut self, ad: &[u8], plaintext: &[u8]) -> MeshResult<Vec<u8>> {
        let Some(key) = &self.key else {
            return Ok(plaintext.to_vec());
        };
        if self.nonce >= REKEY_NONCE_THRESHOLD {
            return Err(MeshError::CryptoNonceExhausted);
        }
        let cipher = ChaCha20Poly1305::new_from_slice(key)
            .map_err(|_| MeshError::CryptoHandshakeState("cipher key"))?;
        let nonce_bytes = Self::nonce_bytes(self.nonce);
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: ad,
                },
            )
            .map_err(|_| MeshError::CryptoDecryptFailed)?;
        self.nonce += 1;
        Ok(ciphertext)
    }

    /// Decrypt with the current nonce; the counter advances only on
    /// success, so an out-of-order ciphertext is dropped without skewing
    /// the window.
    pub fn decrypt_with_ad(&mut self, ad: &[u8], ciphertext: &[u8]) -> MeshResult<Vec<u8>> {
        let Some(key) = &self.key else {
            return Ok(ciphertext.to_vec());
        };
        let cipher = ChaCha20Poly1305::new_from_slice(key)
            .map_err(|_| MeshError::CryptoHandshakeState("cipher key"))?;
        let nonce_bytes = Self::nonce_bytes(self.nonce);
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: ad,
                },
            )
            .map_err(|_| MeshError::CryptoDecryptFailed)?;
        self.nonce += 1;
        Ok(plaintext)
    }
}

impl Drop for CipherState {
    fn drop(&mut self) {
        if let Some(key) = &mut self.key {
            key.zeroize();
        }
    }
}

/// HKDF as the Noise spec uses it: two outputs from HMAC-SHA256.
fn hkdf2(chaining_key: &[u8; 32], ikm: &[u8]) -> ([u8; 32], [u8; 32]) {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(chaining_key).expect("hmac accepts any key size");
    mac.update(ikm);
    let temp: [u8; 32] = mac.finalize().into_bytes().into();

    let mut mac = <HmacSha256 as Mac>::new_from_slice(&temp).expect("hmac accepts any key size");
    mac.update(&[0x01]);
    let out1: [u8; 32] = mac.finalize().into_bytes().into();

    let mut mac = <HmacSha256 as Mac>::new_from_slice(&temp).expect("hmac accepts any key size");
    mac.update(&out1);
    mac.update(&[0x02]);
    let out2: [u8; 32] = mac.finalize().into_bytes().into();

    (out1, out2)
}

/// Chaining key + handshake hash + the handshake cipher.
struct SymmetricState {
    cipher: CipherState,
    chaining_key: [u8; 32],
    hash: [u8; 32],
}

impl SymmetricState {
    fn initialize() -> Self {
        Self {
            cipher: CipherState::empty(),
            chaining_key: *PROTOCOL_NAME,
            hash: *PROTOCOL_NAME,
        }
    }

    fn mix_hash(&mut self, data: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(self.hash);
        hasher.update(data);
        self.hash = hasher.finalize().into();
    }

    fn mix_key(&mut self, ikm: &[u8]) {
        let (ck, temp_k) = hkdf2(&self.chaining_key, ikm);
        self.chaining_key = ck;
        self.cipher.initialize_key(temp_k);
    }

    fn encrypt_and_hash(&mut self, plaintext: &[u8]) -> MeshResult<Vec<u8>> {
        let hash = self.hash;
        let ciphertext = self.cipher.encrypt_with_ad(&hash, plaintext)?;
        self.mix_hash(&ciphertext);
        Ok(ciphertext)
    }

    fn decrypt_and_hash(&mut self, ciphertext: &[u8]) -> MeshResult<Vec<u8>> {
        let hash = self.hash;
        let plaintext = self.cipher.decrypt_with_ad(&hash, ciphertext)?;
        self.mix_hash(ciphertext);
        Ok(plaintext)
    }

    fn split(self) -> (CipherState, CipherState) {
        let (k1, k2) = hkdf2(&self.chaining_key, &[]);
        let mut c1 = CipherState::empty();
        let mut c2 = CipherState::empty();
        c1.initialize_key(k1);
        c2.initialize_key(k2);
        (c1, c2)
    }
}

/// Which side of the XX pattern this state drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Both directions of an established session plus the remote static key.
pub struct TransportPair {
    pub send: CipherState,
    pub recv: CipherState,
    pub remote_static: [u8; 32],
}

/// In-flight XX handshake.
pub struct HandshakeState {
    symmetric: SymmetricState,
    role: Role,
    local_static: StaticSecret,
    local_static_pub: PublicKey,
    ephemeral: Option<StaticSecret>,
    remote_static: Option<PublicKey>,
    remote_ephemeral: Option<PublicKey>,
    /// 1-based index of the next handshake message to process.
    next_message: u8,
}

impl HandshakeState {
    pub fn new(role: Role, local_static: StaticSecret) -> Self {
        let mut symmetric = SymmetricState::initialize();
        symmetric.mix_hash(&[]); // empty prologue
        let local_static_pub = PublicKey::from(&local_static);
        Self {
            symmetric,
            role,
            local_static,
            local_static_pub,
            ephemeral: None,
            remote_static: None,
            remote_ephemeral: None,
            next_message: 1,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_complete(&self) -> bool {
        self.next_message > 3
    }

    fn expect(&self, role: Role, message: u8) -> MeshResult<()> {
        if self.role != role || self.next_message != message {
            return Err(MeshError::CryptoHandshakeState("unexpected message"));
        }
        Ok(())
    }

    fn read_public(bytes: &[u8]) -> MeshResult<PublicKey> {
        let raw: [u8; 32] = bytes
            .try_into()
            .map_err(|_| MeshError::CryptoHandshakeState("public key length"))?;
        Ok(PublicKey::from(raw))
    }

    /// `-> e`
    pub fn write_message_1(&mut self) -> MeshResult<Vec<u8>> {
        self.expect(Role::Initiator, 1)?;
        let e = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let e_pub = PublicKey::from(&e);
        self.symmetric.mix_hash(e_pub.as_bytes());
        let payload = self.symmetric.encrypt_and_hash(&[])?;
        self.ephemeral = Some(e);

        let mut out = Vec::with_capacity(MESSAGE_1_SIZE);
        out.extend_from_slice(e_pub.as_bytes());
        out.extend_from_slice(&payload);
        self.next_message = 2;
        Ok(out)
    }

    pub fn read_message_1(&mut self, message: &[u8]) -> MeshResult<()> {
        self.expect(Role::Responder, 1)?;
        if message.len() < 32 {
            return Err(MeshError::CryptoHandshakeState("message 1 length"));
        }
        let re = Self::read_public(&message[..32])?;
        self.symmetric.mix_hash(re.as_bytes());
        self.symmetric.decrypt_and_hash(&message[32..])?;
        self.remote_ephemeral = Some(re);
        self.next_message = 2;
        Ok(())
    }

    /// `<- e, ee, s, es`
    pub fn write_message_2(&mut self) -> MeshResult<Vec<u8>> {
        self.expect(Role::Responder, 2)?;
        let re = self
            .remote_ephemeral
            .ok_or(MeshError::CryptoHandshakeState("missing remote ephemeral"))?;

        let e = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let e_pub = PublicKey::from(&e);
        self.symmetric.mix_hash(e_pub.as_bytes());

        // ee
        self.symmetric.mix_key(e.diffie_hellman(&re).as_bytes());
        // s
        let s_pub = self.local_static_pub;
        let encrypted_s = self.symmetric.encrypt_and_hash(s_pub.as_bytes())?;
        // es (responder side: local static with remote ephemeral)
        self.symmetric
            .mix_key(self.local_static.diffie_hellman(&re).as_bytes());
        let payload = self.symmetric.encrypt_and_hash(&[])?;

        self.ephemeral = Some(e);
        let mut out = Vec::with_capacity(MESSAGE_2_SIZE);
        out.extend_from_slice(e_pub.as_bytes());
        out.extend_from_slice(&encrypted_s);
        out.extend_from_slice(&payload);
        self.next_message = 3;
        Ok(out)
    }

    pub fn read_message_2(&mut self, message: &[u8]) -> MeshResult<()> {
        self.expect(Role::Initiator, 2)?;
        if message.len() < MESSAGE_2_SIZE {
            return Err(MeshError::CryptoHandshakeState("message 2 length"));
        }
        let e = self
            .ephemeral
            .as_ref()
            .ok_or(MeshError::CryptoHandshakeState("missing local ephemeral"))?
            .clone();

        let re = Self::read_public(&message[..32])?;
        self.symmetric.mix_hash(re.as_bytes());
        // ee
        self.symmetric.mix_key(e.diffie_hellman(&re).as_bytes());
        // s
        let s_bytes = self.symmetric.decrypt_and_hash(&message[32..80])?;
        let rs = Self::read_public(&s_bytes)?;
        // es (initiator side: local ephemeral with remote static)
        self.symmetric.mix_key(e.diffie_hellman(&rs).as_bytes());
        self.symmetric.decrypt_and_hash(&message[80..])?;

        self.remote_ephemeral = Some(re);
        self.remote_static = Some(rs);
        self.next_message = 3;
        Ok(())
    }

    /// `-> s, se`
    pub fn write_message_3(&mut self) -> MeshResult<Vec<u8>> {
        self.expect(Role::Initiator, 3)?;
        let re = self
            .remote_ephemeral
            .ok_or(MeshError::CryptoHandshakeState("missing remote ephemeral"))?;

        let encrypted_s = self
            .symmetric
            .encrypt_and_hash(self.local_static_pub.as_bytes())?;
        // se (initiator side: local static with remote ephemeral)
        self.symmetric
            .mix_key(self.local_static.diffie_hellman(&re).as_bytes());
        let payload = self.symmetric.encrypt_and_hash(&[])?;

        let mut out = Vec::with_capacity(MESSAGE_3_SIZE);
        out.extend_from_slice(&encrypted_s);
        out.extend_from_slice(&payload);
        self.next_message = 4;
        Ok(out)
    }

    pub fn read_message_3(&mut self, message: &[u8]) -> MeshResult<()> {
        self.expect(Role::Responder, 3)?;
        if message.len() < MESSAGE_3_SIZE {
            return Err(MeshError::CryptoHandshakeState("message 3 length"));
        }
        let e = self
            .ephemeral
            .as_ref()
            .ok_or(MeshError::CryptoHandshakeState("missing local ephemeral"))?
            .clone();

        let s_bytes = self.symmetric.decrypt_and_hash(&message[..48])?;
        let rs = Self::read_public(&s_bytes)?;
        // se (responder side: local ephemeral with remote static)
        self.symmetric.mix_key(e.diffie_hellman(&rs).as_bytes());
        self.symmetric.decrypt_and_hash(&message[48..])?;

        self.remote_static = Some(rs);
        self.next_message = 4;
        Ok(())
    }

    /// Split into transport ciphers once all three messages are done.
    pub fn finalize(self) -> MeshResult<TransportPair> {
        if !self.is_complete() {
            return Err(MeshError::CryptoHandshakeState("handshake incomplete"));
        }
        let remote_static = self
            .remote_static
            .ok_or(MeshError::CryptoHandshakeState("missing remote static"))?
            .to_bytes();
        let role = self.role;
        let (c1, c2) = self.symmetric.split();
        let (send, recv) = match role {
            Role::Initiator => (c1, c2),
            Role::Responder => (c2, c1),
        };
        Ok(TransportPair {
            send,
            recv,
            remote_static,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_handshake() -> (TransportPair, TransportPair) {
        let initiator_static = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let responder_static = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let initiator_pub = PublicKey::from(&initiator_static).to_bytes();
        let responder_pub = PublicKey::from(&responder_static).to_bytes();

        let mut initiator = HandshakeState::new(Role::Initiator, initiator_static);
        let mut responder = HandshakeState::new(Role::Responder, responder_static);

        let m1 = initiator.write_message_1().unwrap();
        assert_eq!(m1.len(), MESSAGE_1_SIZE);
        responder.read_message_1(&m1).unwrap();

        let m2 = responder.write_message_2().unwrap();
        assert_eq!(m2.len(), MESSAGE_2_SIZE);
        initiator.read_message_2(&m2).unwrap();

        let m3 = initiator.write_message_3().unwrap();
        assert_eq!(m3.len(), MESSAGE_3_SIZE);
        responder.read_message_3(&m3).unwrap();

        let i = initiator.finalize().unwrap();
        let r = responder.finalize().unwrap();
        assert_eq!(i.remote_static, responder_pub);
        assert_eq!(r.remote_static, initiator_pub);
        (i, r)
    }

    #[test]
    fn handshake_yields_working_transport() {
        let (mut i, mut r) = run_handshake();
        let ciphertext = i.send.encrypt_with_ad(&[], b"over the mesh").unwrap();
        assert_eq!(
            r.recv.decrypt_with_ad(&[], &ciphertext).unwrap(),
            b"over the mesh"
        );

        let reply = r.send.encrypt_with_ad(&[], b"ack").unwrap();
        assert_eq!(i.recv.decrypt_with_ad(&[], &reply).unwrap(), b"ack");
    }

    #[test]
    fn nonce_mismatch_rejected_without_advancing() {
        let (mut i, mut r) = run_handshake();
        let c0 = i.send.encrypt_with_ad(&[], b"zero").unwrap();
        let c1 = i.send.encrypt_with_ad(&[], b"one").unwrap();

        // Out-of-order ciphertext: rejected, counter untouched.
        assert!(r.recv.decrypt_with_ad(&[], &c1).is_err());
        assert_eq!(r.recv.nonce(), 0);

        // In-order delivery still works afterwards.
        assert_eq!(r.recv.decrypt_with_ad(&[], &c0).unwrap(), b"zero");
        assert_eq!(r.recv.decrypt_with_ad(&[], &c1).unwrap(), b"one");
    }

    #[test]
    fn explicit_nonce_window_is_exact() {
        let (mut i, mut r) = run_handshake();
        i.send.set_nonce(5);
        let c5 = i.send.encrypt_with_ad(&[], b"five").unwrap();

        r.recv.set_nonce(4);
        assert!(r.recv.decrypt_with_ad(&[], &c5).is_err());
        r.recv.set_nonce(7);
        assert!(r.recv.decrypt_with_ad(&[], &c5).is_err());
        r.recv.set_nonce(5);
        assert_eq!(r.recv.decrypt_with_ad(&[], &c5).unwrap(), b"five");
    }

    #[test]
    fn tampered_ciphertext_rejected() {
        let (mut i, mut r) = run_handshake();
        let mut c = i.send.encrypt_with_ad(&[], b"payload").unwrap();
        c[0] ^= 0x01;
        assert!(matches!(
            r.recv.decrypt_with_ad(&[], &c),
            Err(MeshError::CryptoDecryptFailed)
        ));
    }

    #[test]
    fn nonce_threshold_forces_rekey() {
        let (mut i, _) = run_handshake();
        i.send.set_nonce(REKEY_NONCE_THRESHOLD);
        assert!(matches!(
            i.send.encrypt_with_ad(&[], b"x"),
            Err(MeshError::CryptoNonceExhausted)
        ));
    }

    #[test]
    fn out_of_pattern_message_rejected() {
        let local = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let mut responder = HandshakeState::new(Role::Responder, local);
        assert!(responder.write_message_1().is_err());
        assert!(responder.read_message_3(&[0u8; MESSAGE_3_SIZE]).is_err());
    }
}
