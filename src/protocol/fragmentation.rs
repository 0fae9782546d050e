//! Fragmentation Engine
//!
//! Splits encoded frames that exceed the link MTU into ordered fragment
//! packets and reassembles them on the receiving side. Fragments are
//! relayed like any other packet, so every node on the path forwards them
//! without waiting for reassembly.
//!
//! Fragment payload layout:
//! `fragment_id (2 B) || index (2 B) || total (2 B) || original_type (1 B) || chunk`

use std::collections::HashMap;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use log::debug;
use rand::Rng;

use super::packet::{Packet, PacketType, PeerId};
use crate::error::{MeshError, MeshResult};

/// Bytes of the fragment payload taken by the fragment header itself.
pub const FRAGMENT_HEADER_SIZE: usize = 7;

/// Outer frame overhead reserved per fragment: v1 packet header (14),
/// sender (8) and recipient (8). Together with the fragment header this
/// keeps every fragment frame within the link MTU.
pub const FRAMING_OVERHEAD: usize = 30;

/// Partial reassemblies older than this are dropped silently.
pub const REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(30);

/// A split inner frame, ready for transmission in order.
#[derive(Debug)]
pub struct FragmentBatch {
    /// Random 16-bit identifier shared by every fragment of the batch.
    pub fragment_id: u16,
    pub packets: Vec<Packet>,
}

/// Split an encoded inner frame into fragment packets.
///
/// `inner_frame` is the complete wire encoding of the original packet;
/// `original_type` tells the receiver which decode path to re-enter after
/// reassembly.
pub fn split(
    inner_frame: &[u8],
    original_type: PacketType,
    sender_id: PeerId,
    recipient_id: Option<PeerId>,
    ttl: u8,
    mtu: usize,
) -> MeshResult<FragmentBatch> {
    let chunk_size = mtu.saturating_sub(FRAMING_OVERHEAD);
    if chunk_size <= FRAGMENT_HEADER_SIZE {
        return Err(MeshError::LinkMtuFailed);
    }
    let chunk_size = chunk_size - FRAGMENT_HEADER_SIZE;

    let total = inner_frame.len().div_ceil(chunk_size);
    if total > u16::MAX as usize {
        return Err(MeshError::FragmentOversized);
    }

    let fragment_id: u16 = rand::thread_rng().gen();
    let mut packets = Vec::with_capacity(total);
    for (index, chunk) in inner_frame.chunks(chunk_size).enumerate() {
        let mut payload = Vec::with_capacity(FRAGMENT_HEADER_SIZE + chunk.len());
        payload.extend_from_slice(&fragment_id.to_be_bytes());
        payload.extend_from_slice(&(index as u16).to_be_bytes());
        payload.extend_from_slice(&(total as u16).to_be_bytes());
        payload.push(original_type as u8);
        payload.extend_from_slice(chunk);

        let mut packet = match recipient_id {
            Some(recipient) => {
                Packet::addressed(PacketType::Fragment, sender_id, recipient, payload)
            }
            None => Packet::broadcast(PacketType::Fragment, sender_id, payload),
        };
        packet.ttl = ttl;
        packets.push(packet);
    }

    debug!(
        "split {} bytes into {} fragments (id {:04x})",
        inner_frame.len(),
        total,
        fragment_id
    );
    Ok(FragmentBatch {
        fragment_id,
        packets,
    })
}

/// Parsed fragment header plus chunk.
struct FragmentPayload<'a> {
    fragment_id: u16,
    index: u16,
    total: u16,
    original_type: PacketType,
    chunk: &'a [u8],
}

fn parse_fragment(payload: &[u8]) -> MeshResult<FragmentPayload<'_>> {
    if payload.len() < FRAGMENT_HEADER_SIZE {
        return Err(MeshError::WireMalformed("fragment header"));
    }
    Ok(FragmentPayload {
        fragment_id: u16::from_be_bytes([payload[0], payload[1]]),
        index: u16::from_be_bytes([payload[2], payload[3]]),
        total: u16::from_be_bytes([payload[4], payload[5]]),
        original_type: PacketType::from_u8(payload[6])?,
        chunk: &payload[FRAGMENT_HEADER_SIZE..],
    })
}

struct ReassemblyEntry {
    total: u16,
    original_type: PacketType,
    received: HashMap<u16, Vec<u8>>,
    first_seen: Instant,
}

/// A completed reassembly: the reconstructed inner frame and the decode
/// path it should re-enter.
#[derive(Debug)]
pub struct ReassembledFrame {
    pub inner_frame: Vec<u8>,
    pub original_type: PacketType,
    pub sender_id: PeerId,
}

/// Index-ordered reassembly table keyed by `(sender, fragment_id)`.
pub struct Reassembler {
    entries: DashMap<(PeerId, u16), ReassemblyEntry>,
    timeout: Duration,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::with_timeout(REASSEMBLY_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            timeout,
        }
    }

    /// Feed one fragment packet. Returns the reconstructed inner frame
    /// once every index has arrived, in any order.
    pub fn accept(&self, packet: &Packet) -> MeshResult<Option<ReassembledFrame>> {
        let fragment = parse_fragment(&packet.payload)?;
        if fragment.total == 0 || fragment.index >= fragment.total {
            return Err(MeshError::WireMalformed("fragment index"));
        }

        let key = (packet.sender_id, fragment.fragment_id);
        let complete = {
            let mut entry = self.entries.entry(key).or_insert_with(|| ReassemblyEntry {
                total: fragment.total,
                original_type: fragment.original_type,
                received: HashMap::new(),
                first_seen: Instant::now(),
            });
            if entry.total != fragment.total || entry.original_type != fragment.original_type {
                // A colliding fragment_id from the same sender; keep the
                // first claim and drop the stray.
                debug!(
                    "fragment metadata mismatch from {} (id {:04x})",
                    packet.sender_id, fragment.fragment_id
                );
                return Ok(None);
            }
            entry
                .received
                .entry(fragment.index)
                .or_insert_with(|| fragment.chunk.to_vec());
            entry.received.len() == entry.total as usize
        };

        if !complete {
            return Ok(None);
        }

        let (_, entry) = self
            .entries
            .remove(&key)
            .ok_or(MeshError::WireMalformed("fragment entry vanished"))?;
        let mut inner_frame = Vec::new();
        for index in 0..entry.total {
            match entry.received.get(&index) {
                Some(chunk) => inner_frame.extend_from_slice(chunk),
                None => return Err(MeshError::WireMalformed("fragment gap")),
            }
        }
        debug!(
            "reassembled {} bytes from {} fragments (id {:04x})",
            inner_frame.len(),
            entry.total,
            fragment.fragment_id
        );
        Ok(Some(ReassembledFrame {
            inner_frame,
            original_type: entry.original_type,
            sender_id: packet.sender_id,
        }))
    }

    /// Drop partial reassemblies past the timeout. Returns how many were
    /// discarded; the loss is silent by design of the relay layer.
    pub fn sweep(&self) -> usize {
        let cutoff = Instant::now();
        let before = self.entries.len();
        let timeout = self.timeout;
        self.entries
            .retain(|_, entry| cutoff.duration_since(entry.first_seen) < timeout);
        before - self.entries.len()
    }

    pub fn pending(&self) -> usize {
        self.entries.len()
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> PeerId {
        PeerId([1, 2, 3, 4, 5, 6, 7, 8])
    }

    #[test]
    fn split_counts_chunks() {
        let mtu = 517;
        let chunk = mtu - FRAMING_OVERHEAD - FRAGMENT_HEADER_SIZE;
        let frame = vec![0xAA; chunk * 3 + 1];
        let batch = split(&frame, PacketType::Message, sender(), None, 7, mtu).unwrap();
        assert_eq!(batch.packets.len(), 4);

        // Indices are a permutation of 0..total.
        let mut indices: Vec<u16> = batch
            .packets
            .iter()
            .map(|p| u16::from_be_bytes([p.payload[2], p.payload[3]]))
            .collect();
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn out_of_order_reassembly_matches_original() {
        let frame: Vec<u8> = (0..2000u32).map(|i| i as u8).collect();
        let batch = split(&frame, PacketType::Message, sender(), None, 7, 517).unwrap();
        assert_eq!(batch.packets.len(), 5);

        let reassembler = Reassembler::new();
        let order = [4usize, 2, 0, 3, 1];
        let mut surfaced = Vec::new();
        for &i in &order {
            if let Some(out) = reassembler.accept(&batch.packets[i]).unwrap() {
                surfaced.push(out);
            }
        }
        // Surfaced exactly once, on the final fragment.
        assert_eq!(surfaced.len(), 1);
        let reassembled = surfaced.pop().unwrap();
        assert_eq!(reassembled.inner_frame, frame);
        assert_eq!(reassembled.original_type, PacketType::Message);
    }

    #[test]
    fn missing_one_fragment_never_completes() {
        let frame = vec![0x42u8; 2000];
        let batch = split(&frame, PacketType::Message, sender(), None, 7, 517).unwrap();
        let reassembler = Reassembler::new();
        for packet in batch.packets.iter().skip(1) {
            assert!(reassembler.accept(packet).unwrap().is_none());
        }
        assert_eq!(reassembler.pending(), 1);
    }

    #[test]
    fn duplicate_fragment_is_harmless() {
        let frame = vec![0x17u8; 1200];
        let batch = split(&frame, PacketType::Message, sender(), None, 7, 517).unwrap();
        let reassembler = Reassembler::new();
        assert!(reassembler.accept(&batch.packets[0]).unwrap().is_none());
        assert!(reassembler.accept(&batch.packets[0]).unwrap().is_none());
        for packet in batch.packets.iter().skip(1) {
            let _ = reassembler.accept(packet).unwrap();
        }
    }

    #[test]
    fn sweep_discards_stale_entries() {
        let frame = vec![0x55u8; 2000];
        let batch = split(&frame, PacketType::Message, sender(), None, 7, 517).unwrap();
        let reassembler = Reassembler::with_timeout(Duration::from_millis(0));
        reassembler.accept(&batch.packets[0]).unwrap();
        assert_eq!(reassembler.pending(), 1);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(reassembler.sweep(), 1);
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn tiny_mtu_rejected() {
        assert!(matches!(
            split(&[0u8; 10], PacketType::Message, sender(), None, 7, 24),
            Err(MeshError::LinkMtuFailed)
        ));
    }
}
