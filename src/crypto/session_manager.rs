//! Noise Session Manager
//!
//! Owns every Noise session the node runs. Handshakes in flight are keyed
//! by the remote's on-wire peer ID (the static fingerprint is unknown
//! until message 2 or 3); established sessions are keyed by the remote
//! static fingerprint so ephemeral rotation never invalidates them.
//!
//! Simultaneous initiation is resolved by the ephemeral-ID tie-break: the
//! lexicographically smaller peer keeps the initiator role, the larger
//! side abandons its own attempt and answers as responder.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use log::{debug, info, warn};

use super::identity::{Fingerprint, Identity};
use super::noise::{HandshakeState, Role, TransportPair, REKEY_NONCE_THRESHOLD};
use crate::error::{MeshError, MeshResult};
use crate::protocol::PeerId;

/// A handshake not finished within this window is abandoned.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Decrypt failures tolerated inside [`FAILURE_WINDOW`] before the session
/// is marked failed and a fresh handshake is scheduled.
pub const FAILURE_LIMIT: usize = 3;
pub const FAILURE_WINDOW: Duration = Duration::from_secs(60);

/// Coarse session phase reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    None,
    Handshaking,
    Established,
    Failed,
}

/// What processing one handshake payload produced.
#[derive(Debug)]
pub enum HandshakeOutcome {
    /// Send this handshake payload back to the peer.
    Reply(Vec<u8>),
    /// Session established; no further message owed.
    Established(Fingerprint),
    /// Send the final message and consider the session established.
    ReplyAndEstablished(Vec<u8>, Fingerprint),
    /// Message absorbed (or discarded by the tie-break); nothing to send.
    Absorbed,
}

struct PendingHandshake {
    state: HandshakeState,
    started: Instant,
}

struct EstablishedSession {
    transport: TransportPair,
    remote_peer_id: PeerId,
    failures: VecDeque<Instant>,
}

/// Per-peer Noise session table.
pub struct SessionManager {
    identity: Arc<Identity>,
    pending: DashMap<PeerId, PendingHandshake>,
    established: DashMap<Fingerprint, EstablishedSession>,
    /// Last known on-wire ID for each fingerprint, learned from
    /// announces and completed handshakes.
    peer_index: DashMap<PeerId, Fingerprint>,
    handshake_timeout: Duration,
}

impl SessionManager {
    pub fn new(identity: Arc<Identity>) -> Self {
        Self {
            identity,
            pending: DashMap::new(),
            established: DashMap::new(),
            peer_index: DashMap::new(),
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }

    #[cfg(test)]
    fn with_timeout(identity: Arc<Identity>, timeout: Duration) -> Self {
        let mut manager = Self::new(identity);
        manager.handshake_timeout = timeout;
        manager
    }

    /// Record a peer-ID-to-fingerprint binding from an announce.
    pub fn learn_peer(&self, peer_id: PeerId, fingerprint: Fingerprint) {
        self.peer_index.insert(peer_id, fingerprint);
    }

    pub fn fingerprint_for(&self, peer_id: PeerId) -> Option<Fingerprint> {
        self.peer_index.get(&peer_id).map(|entry| *entry)
    }

    /// Reverse lookup: the last on-wire ID a fingerprint was seen under.
    pub fn peer_for_fingerprint(&self, fingerprint: &Fingerprint) -> Option<PeerId> {
        if let Some(session) = self.established.get(fingerprint) {
            return Some(session.remote_peer_id);
        }
        self.peer_index
            .iter()
            .find(|entry| entry.value() == fingerprint)
            .map(|entry| *entry.key())
    }

    pub fn state_for(&self, fingerprint: &Fingerprint) -> SessionState {
        if self.established.contains_key(fingerprint) {
            return SessionState::Established;
        }
        let handshaking = self
            .peer_index
            .iter()
            .any(|entry| entry.value() == fingerprint && self.pending.contains_key(entry.key()));
        if handshaking {
            SessionState::Handshaking
        } else {
            SessionState::None
        }
    }

    pub fn has_session(&self, fingerprint: &Fingerprint) -> bool {
        self.established.contains_key(fingerprint)
    }

    /// Begin a handshake toward a peer. Returns the first handshake
    /// payload (index byte included) to put on the wire.
    pub fn initiate(&self, remote_peer_id: PeerId) -> MeshResult<Vec<u8>> {
        let mut handshake =
            HandshakeState::new(Role::Initiator, self.identity.noise_static_secret());
        let message = handshake.write_message_1()?;
        self.pending.insert(
            remote_peer_id,
            PendingHandshake {
                state: handshake,
                started: Instant::now(),
            },
        );
        debug!("initiating noise handshake with {}", remote_peer_id);
        Ok(with_index(1, &message))
    }

    /// Process one inbound `noise_handshake` payload.
    pub fn handle_handshake(
        &self,
        local_peer_id: PeerId,
        remote_peer_id: PeerId,
        payload: &[u8],
    ) -> MeshResult<HandshakeOutcome> {
        let (index, message) = split_index(payload)?;
        match index {
            1 => self.handle_message_1(local_peer_id, remote_peer_id, message),
            2 => self.handle_message_2(remote_peer_id, message),
            3 => self.handle_message_3(remote_peer_id, message),
            _ => Err(MeshError::CryptoHandshakeState("handshake index")),
        }
    }

    fn handle_message_1(
        &self,
        local_peer_id: PeerId,
        remote_peer_id: PeerId,
        message: &[u8],
    ) -> MeshResult<HandshakeOutcome> {
        if let Some(entry) = self.pending.get(&remote_peer_id) {
            if entry.state.role() == Role::Initiator {
                // Simultaneous initiation: the smaller ephemeral ID keeps
                // the initiator role.
                if local_peer_id < remote_peer_id {
                    debug!(
                        "tie-break with {}: we initiate, discarding their message 1",
                        remote_peer_id
                    );
                    return Ok(HandshakeOutcome::Absorbed);
                }
                debug!(
                    "tie-break with {}: they initiate, abandoning our attempt",
                    remote_peer_id
                );
                drop(entry);
                self.pending.remove(&remote_peer_id);
            } else {
                // A repeated message 1 restarts the responder side.
                drop(entry);
                self.pending.remove(&remote_peer_id);
            }
        }

        let mut handshake =
            HandshakeState::new(Role::Responder, self.identity.noise_static_secret());
        handshake.read_message_1(message)?;
        let reply = handshake.write_message_2()?;
        self.pending.insert(
            remote_peer_id,
            PendingHandshake {
                state: handshake,
                started: Instant::now(),
            },
        );
        Ok(HandshakeOutcome::Reply(with_index(2, &reply)))
    }

    fn handle_message_2(
        &self,
        remote_peer_id: PeerId,
        message: &[u8],
    ) -> MeshResult<HandshakeOutcome> {
        let (_, mut pending) = self
            .pending
            .remove(&remote_peer_id)
            .ok_or(MeshError::CryptoHandshakeState("no pending handshake"))?;
        pending.state.read_message_2(message)?;
        let reply = pending.state.write_message_3()?;
        let fingerprint = self.install(pending.state, remote_peer_id)?;
        Ok(HandshakeOutcome::ReplyAndEstablished(
            with_index(3, &reply),
            fingerprint,
        ))
    }

    fn handle_message_3(
        &self,
        remote_peer_id: PeerId,
        message: &[u8],
    ) -> MeshResult<HandshakeOutcome> {
        let (_, mut pending) = self
            .pending
            .remove(&remote_peer_id)
            .ok_or(MeshError::CryptoHandshakeState("no pending handshake"))?;
        pending.state.read_message_3(message)?;
        let fingerprint = self.install(pending.state, remote_peer_id)?;
        Ok(HandshakeOutcome::Established(fingerprint))
    }

    fn install(&self, handshake: HandshakeState, remote_peer_id: PeerId) -> MeshResult<Fingerprint> {
        let transport = handshake.finalize()?;
        let fingerprint = Fingerprint::of_static_key(&transport.remote_static);
        self.peer_index.insert(remote_peer_id, fingerprint);
        self.established.insert(
            fingerprint,
            EstablishedSession {
                transport,
                remote_peer_id,
                failures: VecDeque::new(),
            },
        );
        info!("noise session established with {}", fingerprint);
        Ok(fingerprint)
    }

    /// Encrypt an application payload for an established session.
    pub fn wrap(&self, fingerprint: &Fingerprint, plaintext: &[u8]) -> MeshResult<Vec<u8>> {
        let mut session = self
            .established
            .get_mut(fingerprint)
            .ok_or(MeshError::CryptoSessionMissing)?;
        if session.transport.send.nonce() >= REKEY_NONCE_THRESHOLD {
            return Err(MeshError::CryptoNonceExhausted);
        }
        session.transport.send.encrypt_with_ad(&[], plaintext)
    }

    /// Decrypt a transport ciphertext. Repeated failures inside the
    /// window tear the session down; the caller surfaces a peer event and
    /// schedules a fresh handshake.
    pub fn unwrap(&self, fingerprint: &Fingerprint, ciphertext: &[u8]) -> MeshResult<Vec<u8>> {
        let mut session = self
            .established
            .get_mut(fingerprint)
            .ok_or(MeshError::CryptoSessionMissing)?;
        match session.transport.recv.decrypt_with_ad(&[], ciphertext) {
            Ok(plaintext) => Ok(plaintext),
            Err(err) => {
                let now = Instant::now();
                session.failures.push_back(now);
                while let Some(&front) = session.failures.front() {
                    if now.duration_since(front) > FAILURE_WINDOW {
                        session.failures.pop_front();
                    } else {
                        break;
                    }
                }
                if session.failures.len() >= FAILURE_LIMIT {
                    drop(session);
                    self.established.remove(fingerprint);
                    warn!(
                        "session with {} failed after repeated decrypt errors",
                        fingerprint
                    );
                }
                Err(err)
            }
        }
    }

    /// The current send nonce, used to decide proactive rekeys.
    pub fn needs_rekey(&self, fingerprint: &Fingerprint) -> bool {
        self.established
            .get(fingerprint)
            .map(|s| s.transport.send.nonce() >= REKEY_NONCE_THRESHOLD)
            .unwrap_or(false)
    }

    /// Drop the established session so a new handshake can replace it.
    pub fn invalidate(&self, fingerprint: &Fingerprint) -> Option<PeerId> {
        self.established
            .remove(fingerprint)
            .map(|(_, session)| session.remote_peer_id)
    }

    /// Abandon handshakes past the timeout. Returns the affected peers so
    /// the caller can emit handshake-failed events.
    pub fn sweep_timeouts(&self) -> Vec<PeerId> {
        let now = Instant::now();
        let timeout = self.handshake_timeout;
        let expired: Vec<PeerId> = self
            .pending
            .iter()
            .filter(|entry| now.duration_since(entry.value().started) >= timeout)
            .map(|entry| *entry.key())
            .collect();
        for peer in &expired {
            self.pending.remove(peer);
            debug!("handshake with {} timed out", peer);
        }
        expired
    }

    pub fn established_count(&self) -> usize {
        self.established.len()
    }
}

fn with_index(index: u8, message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + message.len());
    out.push(index);
    out.extend_from_slice(message);
    out
}

fn split_index(payload: &[u8]) -> MeshResult<(u8, &[u8])> {
    match payload.split_first() {
        Some((&index, rest)) => Ok((index, rest)),
        None => Err(MeshError::CryptoHandshakeState("empty handshake payload")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (SessionManager, Fingerprint) {
        let identity = Arc::new(Identity::generate());
        let fingerprint = identity.fingerprint();
        (SessionManager::new(identity), fingerprint)
    }

    fn drive(
        a: &SessionManager,
        a_id: PeerId,
        b: &SessionManager,
        b_id: PeerId,
    ) -> (Fingerprint, Fingerprint) {
        // a initiates; messages bounce until both sides are established.
        let m1 = a.initiate(b_id).unwrap();
        let HandshakeOutcome::Reply(m2) = b.handle_handshake(b_id, a_id, &m1).unwrap() else {
            panic!("responder should reply with message 2");
        };
        let HandshakeOutcome::ReplyAndEstablished(m3, b_fp) =
            a.handle_handshake(a_id, b_id, &m2).unwrap()
        else {
            panic!("initiator should finish with message 3");
        };
        let HandshakeOutcome::Established(a_fp) = b.handle_handshake(b_id, a_id, &m3).unwrap()
        else {
            panic!("responder should establish on message 3");
        };
        (a_fp, b_fp)
    }

    #[test]
    fn full_handshake_and_transport() {
        let (a, a_fp) = manager();
        let (b, b_fp) = manager();
        let a_id = PeerId([1; 8]);
        let b_id = PeerId([2; 8]);

        let (seen_a, seen_b) = drive(&a, a_id, &b, b_id);
        assert_eq!(seen_a, a_fp);
        assert_eq!(seen_b, b_fp);

        let ciphertext = a.wrap(&b_fp, b"sealed").unwrap();
        assert_eq!(b.unwrap(&a_fp, &ciphertext).unwrap(), b"sealed");
    }

    #[test]
    fn simultaneous_initiation_resolves_by_tie_break() {
        let (a, a_fp) = manager();
        let (b, b_fp) = manager();
        // a has the smaller ephemeral ID: a stays initiator.
        let a_id = PeerId([1; 8]);
        let b_id = PeerId([2; 8]);

        let m1_from_a = a.initiate(b_id).unwrap();
        let m1_from_b = b.initiate(a_id).unwrap();

        // a discards b's initiation.
        assert!(matches!(
            a.handle_handshake(a_id, b_id, &m1_from_b).unwrap(),
            HandshakeOutcome::Absorbed
        ));
        // b abandons its own attempt and answers a's.
        let HandshakeOutcome::Reply(m2) = b.handle_handshake(b_id, a_id, &m1_from_a).unwrap()
        else {
            panic!("expected message 2");
        };
        let HandshakeOutcome::ReplyAndEstablished(m3, _) =
            a.handle_handshake(a_id, b_id, &m2).unwrap()
        else {
            panic!("expected message 3");
        };
        assert!(matches!(
            b.handle_handshake(b_id, a_id, &m3).unwrap(),
            HandshakeOutcome::Established(_)
        ));

        // Three exchanges total; both sides hold one session.
        assert!(a.has_session(&b_fp));
        assert!(b.has_session(&a_fp));
    }

    #[test]
    fn repeated_decrypt_failures_fail_the_session() {
        let (a, a_fp) = manager();
        let (b, b_fp) = manager();
        drive(&a, PeerId([1; 8]), &b, PeerId([2; 8]));

        for _ in 0..FAILURE_LIMIT {
            assert!(b.unwrap(&a_fp, b"not a real ciphertext").is_err());
        }
        assert!(!b.has_session(&a_fp));
        // The other direction is untouched.
        assert!(a.has_session(&b_fp));
    }

    #[test]
    fn handshake_timeout_sweep() {
        let identity = Arc::new(Identity::generate());
        let manager = SessionManager::with_timeout(identity, Duration::from_millis(0));
        manager.initiate(PeerId([9; 8])).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(manager.sweep_timeouts(), vec![PeerId([9; 8])]);
        assert_eq!(manager.sweep_timeouts(), Vec::<PeerId>::new());
    }

    #[test]
    fn wrap_without_session_errors() {
        let (a, _) = manager();
        assert!(matches!(
            a.wrap(&Fingerprint([0; 32]), b"x"),
            Err(MeshError::CryptoSessionMissing)
        ));
    }
}
