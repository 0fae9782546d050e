//! Typed Events
//!
//! The core exposes typed events through a registered observer, not
//! loosely-typed listener objects. Observers are called on the router's
//! dispatch task after all decoding, decryption and reassembly.

use crate::bluetooth::connection_tracker::LinkRole;
use crate::crypto::Fingerprint;
use crate::protocol::{PacketType, PeerId};

/// A fully decoded application payload.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub packet_type: PacketType,
    /// On-wire sender ID of the originating node.
    pub sender: PeerId,
    /// Stable identity of the sender, when a session or announce has
    /// bound one to the on-wire ID.
    pub sender_fingerprint: Option<Fingerprint>,
    /// Decrypted, decompressed, reassembled payload bytes.
    pub payload: Vec<u8>,
}

/// Peer and link lifecycle notifications.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A device advertising a valid service UUID entered scan range.
    Discovered { address: String, rssi: i16 },
    /// An announce bound a nickname and keys to an on-wire ID.
    Announced {
        peer_id: PeerId,
        nickname: String,
        fingerprint: Fingerprint,
    },
    Connected { address: String, role: LinkRole },
    Subscribed { address: String, role: LinkRole },
    Disconnected { address: String, role: LinkRole },
    /// A peer sent a leave packet.
    Left { peer_id: PeerId },
    SessionEstablished { fingerprint: Fingerprint },
    /// The handshake did not complete inside the timeout.
    HandshakeFailed { peer_id: PeerId },
    /// Repeated decrypt failures; a fresh handshake will be scheduled.
    SessionFailed { fingerprint: Fingerprint },
}

/// Observer interface registered once at startup.
pub trait MeshObserver: Send + Sync {
    fn on_packet(&self, event: &MessageEvent);
    fn on_peer(&self, event: &PeerEvent);
}

/// Adapter turning two closures into an observer, for callers that do not
/// want to implement the trait.
pub struct ClosureObserver<P, Q>
where
    P: Fn(&MessageEvent) + Send + Sync,
    Q: Fn(&PeerEvent) + Send + Sync,
{
    on_packet: P,
    on_peer: Q,
}

impl<P, Q> ClosureObserver<P, Q>
where
    P: Fn(&MessageEvent) + Send + Sync,
    Q: Fn(&PeerEvent) + Send + Sync,
{
    pub fn new(on_packet: P, on_peer: Q) -> Self {
        Self { on_packet, on_peer }
    }
}

impl<P, Q> MeshObserver for ClosureObserver<P, Q>
where
    P: Fn(&MessageEvent) + Send + Sync,
    Q: Fn(&PeerEvent) + Send + Sync,
{
    fn on_packet(&self, event: &MessageEvent) {
        (self.on_packet)(event)
    }

    fn on_peer(&self, event: &PeerEvent) {
        (self.on_peer)(event)
    }
}
