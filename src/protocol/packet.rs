//! Packet Entity
//!
//! The single wire entity exchanged between mesh nodes. Field order and
//! sizes are fixed by the binary codec in `codec.rs`; this module defines
//! the decoded representation plus the builders the rest of the core uses.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::MeshError;

/// Hop budget applied to freshly built packets.
pub const DEFAULT_TTL: u8 = 7;

/// 8-byte identifier appearing as sender/recipient on the wire.
///
/// Rotates hourly when rotation is enabled; otherwise it is the first
/// 8 bytes of the static fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub [u8; 8]);

impl PeerId {
    /// The broadcast sentinel: a recipient of all 0xFF addresses everyone.
    pub const BROADCAST: PeerId = PeerId([0xFF; 8]);

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == [0xFF; 8]
    }

    /// An all-0xFF sender is reserved and never produced by a conforming
    /// node; inbound frames claiming it are rejected by the codec.
    pub fn is_reserved(&self) -> bool {
        self.0 == [0xFF; 8]
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 8] = bytes.try_into().ok()?;
        Some(PeerId(arr))
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Wire packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Peer presence, nickname and public keys.
    Announce = 0x01,
    /// User message (broadcast or addressed).
    Message = 0x02,
    /// Graceful departure notification.
    Leave = 0x03,
    /// Noise XX handshake message (payload carries the message index).
    NoiseHandshake = 0x10,
    /// Noise transport ciphertext addressed to a specific peer.
    NoiseEncrypted = 0x11,
    /// One fragment of a larger inner frame.
    Fragment = 0x20,
    /// Request for retransmission of recent traffic.
    SyncRequest = 0x21,
    /// File transfer sub-payload (TLV encoded).
    FileTransfer = 0x22,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Result<Self, MeshError> {
        match value {
            0x01 => Ok(PacketType::Announce),
            0x02 => Ok(PacketType::Message),
            0x03 => Ok(PacketType::Leave),
            0x10 => Ok(PacketType::NoiseHandshake),
            0x11 => Ok(PacketType::NoiseEncrypted),
            0x20 => Ok(PacketType::Fragment),
            0x21 => Ok(PacketType::SyncRequest),
            0x22 => Ok(PacketType::FileTransfer),
            _ => Err(MeshError::WireMalformed("unknown packet type")),
        }
    }
}

/// Header flag bits.
pub mod flags {
    /// Frame carries an 8-byte recipient ID.
    pub const HAS_RECIPIENT: u8 = 0x01;
    /// Frame ends with a 64-byte Ed25519 signature.
    pub const HAS_SIGNATURE: u8 = 0x02;
    /// Payload section is DEFLATE compressed with a 2-byte original size.
    pub const IS_COMPRESSED: u8 = 0x04;
    /// Frame carries a source route (1-byte count + 8-byte hop IDs).
    pub const HAS_ROUTE: u8 = 0x08;
}

/// Decoded wire packet.
///
/// `payload` always holds the raw (decompressed) bytes; compression and
/// padding are transport dressing applied and removed by the codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub version: u8,
    pub packet_type: PacketType,
    pub ttl: u8,
    /// Milliseconds since the Unix epoch, big-endian on the wire.
    pub timestamp_ms: u64,
    pub sender_id: PeerId,
    pub recipient_id: Option<PeerId>,
    /// Optional source route pinning the packet to a hop sequence.
    pub route: Option<Vec<PeerId>>,
    pub payload: Vec<u8>,
    pub signature: Option<[u8; 64]>,
}

impl Packet {
    /// Build a broadcast packet with the default hop budget.
    pub fn broadcast(packet_type: PacketType, sender_id: PeerId, payload: Vec<u8>) -> Self {
        Self {
            version: 1,
            packet_type,
            ttl: DEFAULT_TTL,
            timestamp_ms: now_millis(),
            sender_id,
            recipient_id: Some(PeerId::BROADCAST),
            route: None,
            payload,
            signature: None,
        }
    }

    /// Build a packet addressed to a single peer.
    pub fn addressed(
        packet_type: PacketType,
        sender_id: PeerId,
        recipient_id: PeerId,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            version: 1,
            packet_type,
            ttl: DEFAULT_TTL,
            timestamp_ms: now_millis(),
            sender_id,
            recipient_id: Some(recipient_id),
            route: None,
            payload,
            signature: None,
        }
    }

    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_route(mut self, route: Vec<PeerId>) -> Self {
        self.route = Some(route);
        self
    }

    pub fn with_signature(mut self, signature: [u8; 64]) -> Self {
        self.signature = Some(signature);
        self
    }

    /// Whether the packet addresses everyone (no recipient, or the
    /// broadcast sentinel).
    pub fn is_broadcast(&self) -> bool {
        match self.recipient_id {
            None => true,
            Some(r) => r.is_broadcast(),
        }
    }

    /// Flag byte as it will appear on the wire, ignoring the compression
    /// bit which only the codec decides.
    pub fn base_flags(&self) -> u8 {
        let mut f = 0u8;
        if self.recipient_id.is_some() {
            f |= flags::HAS_RECIPIENT;
        }
        if self.signature.is_some() {
            f |= flags::HAS_SIGNATURE;
        }
        if self.route.is_some() {
            f |= flags::HAS_ROUTE;
        }
        f
    }

    /// Copy for relaying: one hop spent. Returns `None` once the budget is
    /// exhausted.
    pub fn decrement_ttl(&self) -> Option<Packet> {
        if self.ttl == 0 {
            return None;
        }
        let mut relayed = self.clone();
        relayed.ttl -= 1;
        Some(relayed)
    }
}

/// Current time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
