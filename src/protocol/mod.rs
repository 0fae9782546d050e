//! Wire Protocol
//!
//! The binary packet format, its codec, the fragmentation engine and the
//! TLV sub-payloads carried inside announce and file-transfer packets.

pub mod announce;
pub mod codec;
pub mod file_transfer;
pub mod fragmentation;
pub mod packet;

use uuid::Uuid;

/// Fixed legacy service UUID, always part of the valid scan set so nodes
/// that predate rotation remain reachable.
pub const LEGACY_SERVICE_UUID: Uuid = Uuid::from_u128(0xF47B_5E2D_4A9E_4C5A_9B3F_8E1D_2C3A_4B5C);

/// The single message-exchange characteristic under the service.
pub const CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0xA1B2_C3D4_E5F6_4A5B_8C9D_0E1F_2A3B_4C5D);

/// MTU requested on every central-role connection.
pub const TARGET_MTU: usize = 517;

/// Smallest MTU any BLE stack guarantees; links below this are unusable.
pub const MINIMUM_MTU: usize = 23;

pub use announce::Announce;
pub use codec::{decode, encode, encode_for_signing, CodecOptions};
pub use file_transfer::FileTransfer;
pub use fragmentation::{FragmentBatch, ReassembledFrame, Reassembler};
pub use packet::{Packet, PacketType, PeerId, DEFAULT_TTL};
