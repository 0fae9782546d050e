//! Binary Wire Codec
//!
//! Bidirectionally maps [`Packet`] to the framed binary format carried in
//! GATT writes and notifications. Two header versions are supported: v1
//! carries a 2-byte payload length, v2 a 4-byte one. Frames are optionally
//! DEFLATE compressed and PKCS#7 padded to a small set of block sizes so
//! that frame lengths leak less about content.

use std::io::Write;

use flate2::write::{DeflateDecoder, DeflateEncoder, ZlibDecoder};
use flate2::Compression;
use log::debug;

use super::packet::{flags, Packet, PacketType, PeerId};
use crate::error::{MeshError, MeshResult};

/// Fixed header size for a v1 frame (2-byte payload length).
pub const HEADER_SIZE_V1: usize = 14;
/// Fixed header size for a v2 frame (4-byte payload length).
pub const HEADER_SIZE_V2: usize = 16;
/// Sender and recipient identifiers are always 8 bytes.
pub const PEER_ID_SIZE: usize = 8;
/// Ed25519 signatures are always 64 bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// Payloads below this size are never worth compressing.
pub const COMPRESSION_THRESHOLD: usize = 100;

/// Padding targets; a frame is padded to the smallest block that fits.
const PADDING_BLOCKS: [usize; 4] = [256, 512, 1024, 2048];

/// Transport dressing applied at encode time.
#[derive(Debug, Clone, Copy)]
pub struct CodecOptions {
    /// PKCS#7-pad the finished frame to the next block size.
    pub padding: bool,
    /// DEFLATE the payload when it is large enough to benefit.
    pub compression: bool,
}

impl Default for CodecOptions {
    fn default() -> Self {
        Self {
            padding: true,
            compression: true,
        }
    }
}

impl CodecOptions {
    /// No padding, no compression. Used for signing pre-images and tests.
    pub fn plain() -> Self {
        Self {
            padding: false,
            compression: false,
        }
    }
}

/// Encode a packet to wire bytes.
pub fn encode(packet: &Packet, opts: CodecOptions) -> MeshResult<Vec<u8>> {
    if packet.sender_id.is_reserved() {
        return Err(MeshError::WireMalformed("reserved sender id"));
    }

    // Route section precedes the payload and is counted by payload_length.
    let mut route_bytes = Vec::new();
    if let Some(route) = &packet.route {
        if route.len() > 255 {
            return Err(MeshError::WireRouteTooLong(route.len()));
        }
        route_bytes.push(route.len() as u8);
        for hop in route {
            route_bytes.extend_from_slice(hop.as_bytes());
        }
    }

    // Compression only pays off past the threshold, and the 2-byte
    // original-size prefix caps what it can describe.
    let mut body = packet.payload.clone();
    let mut compressed = false;
    let mut original_size = 0u16;
    if opts.compression
        && packet.payload.len() >= COMPRESSION_THRESHOLD
        && packet.payload.len() <= u16::MAX as usize
    {
        let deflated = deflate(&packet.payload)?;
        if deflated.len() < packet.payload.len() {
            original_size = packet.payload.len() as u16;
            body = deflated;
            compressed = true;
        }
    }

    let payload_length = route_bytes.len() + if compressed { 2 } else { 0 } + body.len();

    // v1 unless the length field can no longer hold the payload section.
    let version = if payload_length > u16::MAX as usize {
        2
    } else {
        packet.version
    };
    if version == 1 && payload_length > u16::MAX as usize {
        return Err(MeshError::WirePayloadTooLarge(payload_length));
    }
    if version != 1 && version != 2 {
        return Err(MeshError::WireBadVersion(version));
    }

    let header_size = if version == 1 {
        HEADER_SIZE_V1
    } else {
        HEADER_SIZE_V2
    };
    let mut frame = Vec::with_capacity(
        header_size
            + PEER_ID_SIZE
            + if packet.recipient_id.is_some() { 8 } else { 0 }
            + payload_length
            + if packet.signature.is_some() { 64 } else { 0 },
    );

    let mut flag_byte = packet.base_flags();
    if compressed {
        flag_byte |= flags::IS_COMPRESSED;
    }

    frame.push(version);
    frame.push(packet.packet_type as u8);
    frame.push(packet.ttl);
    frame.extend_from_slice(&packet.timestamp_ms.to_be_bytes());
    frame.push(flag_byte);
    if version == 1 {
        frame.extend_from_slice(&(payload_length as u16).to_be_bytes());
    } else {
        frame.extend_from_slice(&(payload_length as u32).to_be_bytes());
    }

    frame.extend_from_slice(packet.sender_id.as_bytes());
    if let Some(recipient) = &packet.recipient_id {
        frame.extend_from_slice(recipient.as_bytes());
    }
    frame.extend_from_slice(&route_bytes);
    if compressed {
        frame.extend_from_slice(&original_size.to_be_bytes());
    }
    frame.extend_from_slice(&body);
    if let Some(signature) = &packet.signature {
        frame.extend_from_slice(signature);
    }

    if opts.padding {
        frame = pad_to_block(frame)?;
    }

    Ok(frame)
}

/// Decode wire bytes to a packet.
///
/// The buffer is parsed as-is first; if that fails, one PKCS#7 padding
/// layer is stripped and parsing retried once. A single layer, never two.
pub fn decode(data: &[u8]) -> MeshResult<Packet> {
    match parse(data) {
        Ok(packet) => Ok(packet),
        Err(first) => match strip_pkcs7(data) {
            Some(stripped) => parse(stripped).map_err(|_| first),
            None => Err(first),
        },
    }
}

/// Deterministic pre-image for Ed25519 signing.
///
/// TTL is forced to 0 (it changes on every relay hop), the signature is
/// omitted, and neither padding nor compression is applied, so the bytes
/// are identical at every hop and on every platform.
pub fn encode_for_signing(packet: &Packet) -> MeshResult<Vec<u8>> {
    let mut canonical = packet.clone();
    canonical.ttl = 0;
    canonical.signature = None;
    encode(&canonical, CodecOptions::plain())
}

fn parse(data: &[u8]) -> MeshResult<Packet> {
    if data.len() < HEADER_SIZE_V1 {
        return Err(MeshError::WireMalformed("short frame"));
    }

    let version = data[0];
    let header_size = match version {
        1 => HEADER_SIZE_V1,
        2 => HEADER_SIZE_V2,
        other => return Err(MeshError::WireBadVersion(other)),
    };
    if data.len() < header_size {
        return Err(MeshError::WireMalformed("short frame"));
    }

    let packet_type = PacketType::from_u8(data[1])?;
    let ttl = data[2];
    let timestamp_ms = u64::from_be_bytes(data[3..11].try_into().unwrap());
    let flag_byte = data[11];

    let payload_length = if version == 1 {
        u16::from_be_bytes(data[12..14].try_into().unwrap()) as usize
    } else {
        u32::from_be_bytes(data[12..16].try_into().unwrap()) as usize
    };

    let has_recipient = flag_byte & flags::HAS_RECIPIENT != 0;
    let has_signature = flag_byte & flags::HAS_SIGNATURE != 0;
    let is_compressed = flag_byte & flags::IS_COMPRESSED != 0;
    let has_route = flag_byte & flags::HAS_ROUTE != 0;

    let expected = header_size
        + PEER_ID_SIZE
        + if has_recipient { PEER_ID_SIZE } else { 0 }
        + payload_length
        + if has_signature { SIGNATURE_SIZE } else { 0 };
    if data.len() < expected {
        return Err(MeshError::WireMalformed("short frame"));
    }

    let mut offset = header_size;

    let sender_id = PeerId::from_slice(&data[offset..offset + PEER_ID_SIZE])
        .ok_or(MeshError::WireMalformed("sender id"))?;
    offset += PEER_ID_SIZE;
    if sender_id.is_reserved() {
        return Err(MeshError::WireMalformed("reserved sender id"));
    }

    let recipient_id = if has_recipient {
        let id = PeerId::from_slice(&data[offset..offset + PEER_ID_SIZE])
            .ok_or(MeshError::WireMalformed("recipient id"))?;
        offset += PEER_ID_SIZE;
        Some(id)
    } else {
        None
    };

    // Everything counted by payload_length: route, original size, body.
    let section_end = offset + payload_length;
    let mut cursor = offset;

    let route = if has_route {
        if cursor >= section_end {
            return Err(MeshError::WireMalformed("route count"));
        }
        let count = data[cursor] as usize;
        cursor += 1;
        if cursor + count * PEER_ID_SIZE > section_end {
            return Err(MeshError::WireMalformed("route hops"));
        }
        let mut hops = Vec::with_capacity(count);
        for _ in 0..count {
            let hop = PeerId::from_slice(&data[cursor..cursor + PEER_ID_SIZE])
                .ok_or(MeshError::WireMalformed("route hop"))?;
            hops.push(hop);
            cursor += PEER_ID_SIZE;
        }
        Some(hops)
    } else {
        None
    };

    let payload = if is_compressed {
        if cursor + 2 > section_end {
            return Err(MeshError::WireMalformed("original size"));
        }
        let original_size =
            u16::from_be_bytes(data[cursor..cursor + 2].try_into().unwrap()) as usize;
        cursor += 2;
        inflate(&data[cursor..section_end], original_size)?
    } else {
        data[cursor..section_end].to_vec()
    };

    let signature = if has_signature {
        let start = section_end;
        let sig: [u8; 64] = data[start..start + SIGNATURE_SIZE]
            .try_into()
            .map_err(|_| MeshError::WireMalformed("signature"))?;
        Some(sig)
    } else {
        None
    };

    Ok(Packet {
        version,
        packet_type,
        ttl,
        timestamp_ms,
        sender_id,
        recipient_id,
        route,
        payload,
        signature,
    })
}

/// PKCS#7-pad to the smallest block that fits. Padding longer than 255
/// bytes cannot be expressed, in which case the frame is left unpadded;
/// with padding requested a frame beyond the largest block is an error.
fn pad_to_block(frame: Vec<u8>) -> MeshResult<Vec<u8>> {
    let len = frame.len();
    let Some(&block) = PADDING_BLOCKS.iter().find(|&&b| b >= len) else {
        return Err(MeshError::WireOversize(len));
    };
    let needed = block - len;
    if needed == 0 || needed > 255 {
        return Ok(frame);
    }
    let mut padded = frame;
    padded.resize(block, needed as u8);
    Ok(padded)
}

/// Strip one valid PKCS#7 layer, or `None` when the tail is not padding.
fn strip_pkcs7(data: &[u8]) -> Option<&[u8]> {
    let &last = data.last()?;
    let pad = last as usize;
    if pad == 0 || pad > data.len() {
        return None;
    }
    if !data[data.len() - pad..].iter().all(|&b| b == last) {
        return None;
    }
    Some(&data[..data.len() - pad])
}

fn deflate(data: &[u8]) -> MeshResult<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|_| MeshError::WireCompressionFailed)?;
    encoder.finish().map_err(|_| MeshError::WireCompressionFailed)
}

/// Raw DEFLATE first; some platforms wrap the stream in a zlib envelope,
/// so that is tried once as a fallback. The declared original size must
/// match either way.
fn inflate(data: &[u8], original_size: usize) -> MeshResult<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(Vec::new());
    if let Ok(out) = decoder.write_all(data).and_then(|_| decoder.finish()) {
        if out.len() == original_size {
            return Ok(out);
        }
        debug!(
            "raw deflate produced {} bytes, declared {}; trying zlib",
            out.len(),
            original_size
        );
    }

    let mut zlib = ZlibDecoder::new(Vec::new());
    let out = zlib
        .write_all(data)
        .and_then(|_| zlib.finish())
        .map_err(|_| MeshError::WireCompressionFailed)?;
    if out.len() != original_size {
        return Err(MeshError::WireCompressionFailed);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::DEFAULT_TTL;

    fn sample_sender() -> PeerId {
        PeerId([0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08])
    }

    fn sample_packet(payload: Vec<u8>) -> Packet {
        Packet {
            version: 1,
            packet_type: PacketType::Message,
            ttl: DEFAULT_TTL,
            timestamp_ms: 1_700_000_000_000,
            sender_id: sample_sender(),
            recipient_id: None,
            route: None,
            payload,
            signature: None,
        }
    }

    #[test]
    fn broadcast_text_pads_to_256_and_round_trips() {
        let packet = sample_packet(b"hi".to_vec());
        let frame = encode(&packet, CodecOptions::default()).unwrap();
        assert_eq!(frame.len(), 256);
        let decoded = decode(&frame).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn plain_round_trip_is_exact() {
        let mut packet = sample_packet(b"round trip".to_vec());
        packet.recipient_id = Some(PeerId([9; 8]));
        packet.signature = Some([0x5A; 64]);
        let frame = encode(&packet, CodecOptions::plain()).unwrap();
        assert_eq!(decode(&frame).unwrap(), packet);
    }

    #[test]
    fn compression_threshold_respected() {
        let below = sample_packet(vec![0x41; 99]);
        let frame = encode(&below, CodecOptions::default()).unwrap();
        // Flag byte sits at offset 11 for both header versions.
        assert_eq!(frame[11] & flags::IS_COMPRESSED, 0);

        let above = sample_packet(vec![0x41; 500]);
        let frame = encode(&above, CodecOptions::default()).unwrap();
        assert_ne!(frame[11] & flags::IS_COMPRESSED, 0);
        let decoded = decode(&frame).unwrap();
        assert_eq!(decoded.payload, vec![0x41; 500]);
    }

    #[test]
    fn incompressible_payload_stays_raw() {
        // High-entropy bytes: deflate cannot shrink them.
        let mut state = 0x12345678u32;
        let payload: Vec<u8> = (0..300)
            .map(|_| {
                state = state.wrapping_mul(1664525).wrapping_add(1013904223);
                (state >> 24) as u8
            })
            .collect();
        let packet = sample_packet(payload.clone());
        let frame = encode(&packet, CodecOptions::default()).unwrap();
        assert_eq!(frame[11] & flags::IS_COMPRESSED, 0);
        let decoded = decode(&frame).unwrap();
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn single_padding_layer_stripped_never_two() {
        let packet = sample_packet(b"pad me".to_vec());
        let frame = encode(&packet, CodecOptions::default()).unwrap();
        // The padded frame parses back to the original; a frame whose
        // payload happens to end in padding-shaped bytes must not lose it.
        assert_eq!(decode(&frame).unwrap(), packet);

        let tricky = sample_packet(vec![0x02, 0x02]);
        let plain = encode(&tricky, CodecOptions::plain()).unwrap();
        assert_eq!(decode(&plain).unwrap().payload, vec![0x02, 0x02]);
    }

    #[test]
    fn signing_preimage_invariant_under_ttl_and_signature() {
        let packet = sample_packet(b"sign me".to_vec());
        let base = encode_for_signing(&packet).unwrap();

        let mut hopped = packet.clone();
        hopped.ttl = 1;
        assert_eq!(encode_for_signing(&hopped).unwrap(), base);

        let signed = packet.clone().with_signature([7u8; 64]);
        assert_eq!(encode_for_signing(&signed).unwrap(), base);
    }

    #[test]
    fn route_round_trips() {
        let mut packet = sample_packet(b"routed".to_vec());
        packet.route = Some(vec![PeerId([0x11; 8]), PeerId([0x22; 8])]);
        packet.recipient_id = Some(PeerId([0x33; 8]));
        let frame = encode(&packet, CodecOptions::default()).unwrap();
        assert_eq!(decode(&frame).unwrap(), packet);
    }

    #[test]
    fn route_too_long_rejected() {
        let mut packet = sample_packet(vec![]);
        packet.route = Some(vec![PeerId([1; 8]); 256]);
        assert!(matches!(
            encode(&packet, CodecOptions::plain()),
            Err(MeshError::WireRouteTooLong(256))
        ));
    }

    #[test]
    fn large_payload_promotes_to_v2() {
        let packet = sample_packet(vec![0xAB; 70_000]);
        let frame = encode(&packet, CodecOptions::plain()).unwrap();
        assert_eq!(frame[0], 2);
        let decoded = decode(&frame).unwrap();
        assert_eq!(decoded.version, 2);
        assert_eq!(decoded.payload.len(), 70_000);
    }

    #[test]
    fn short_frame_and_bad_version_rejected() {
        assert!(matches!(
            decode(&[1u8, 2, 3]),
            Err(MeshError::WireMalformed(_))
        ));
        let mut frame = encode(&sample_packet(b"v".to_vec()), CodecOptions::plain()).unwrap();
        frame[0] = 9;
        assert!(matches!(decode(&frame), Err(MeshError::WireBadVersion(9))));
    }

    #[test]
    fn reserved_sender_rejected_both_ways() {
        let mut packet = sample_packet(vec![]);
        packet.sender_id = PeerId::BROADCAST;
        assert!(encode(&packet, CodecOptions::plain()).is_err());

        let mut frame = encode(&sample_packet(vec![]), CodecOptions::plain()).unwrap();
        for b in &mut frame[HEADER_SIZE_V1..HEADER_SIZE_V1 + 8] {
            *b = 0xFF;
        }
        assert!(decode(&frame).is_err());
    }

    #[test]
    fn zlib_wrapped_stream_accepted() {
        use flate2::write::ZlibEncoder;
        let original = vec![0x41u8; 500];
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&original).unwrap();
        let zlibbed = encoder.finish().unwrap();
        assert_eq!(inflate(&zlibbed, original.len()).unwrap(), original);
    }
}
