//! Announce Payload
//!
//! Binary TLV carried by `announce` packets: nickname plus the long-lived
//! public keys a peer needs to open a Noise session and verify signatures.
//! Nothing on the wire is JSON; unknown tags are skipped for forward
//! compatibility.

use crate::error::{MeshError, MeshResult};

const TAG_NICKNAME: u8 = 0x01;
const TAG_NOISE_STATIC_KEY: u8 = 0x02;
const TAG_SIGNING_KEY: u8 = 0x03;

/// Nicknames longer than this are rejected before they reach the wire.
pub const MAX_NICKNAME_BYTES: usize = 64;

/// Decoded announce payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announce {
    pub nickname: String,
    pub noise_static_key: [u8; 32],
    pub signing_key: [u8; 32],
}

impl Announce {
    pub fn encode(&self) -> MeshResult<Vec<u8>> {
        let nickname = self.nickname.as_bytes();
        if nickname.len() > MAX_NICKNAME_BYTES {
            return Err(MeshError::WireMalformed("nickname too long"));
        }

        let mut out = Vec::with_capacity(nickname.len() + 64 + 9);
        push_tlv(&mut out, TAG_NICKNAME, nickname);
        push_tlv(&mut out, TAG_NOISE_STATIC_KEY, &self.noise_static_key);
        push_tlv(&mut out, TAG_SIGNING_KEY, &self.signing_key);
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> MeshResult<Self> {
        let mut nickname = None;
        let mut noise_static_key = None;
        let mut signing_key = None;

        let mut cursor = 0usize;
        while cursor < data.len() {
            let (tag, value, next) = read_tlv(data, cursor)?;
            match tag {
                TAG_NICKNAME => {
                    if value.len() > MAX_NICKNAME_BYTES {
                        return Err(MeshError::WireMalformed("nickname too long"));
                    }
                    let s = std::str::from_utf8(value)
                        .map_err(|_| MeshError::WireMalformed("nickname utf-8"))?;
                    nickname = Some(s.to_string());
                }
                TAG_NOISE_STATIC_KEY => {
                    let key: [u8; 32] = value
                        .try_into()
                        .map_err(|_| MeshError::WireMalformed("noise key length"))?;
                    noise_static_key = Some(key);
                }
                TAG_SIGNING_KEY => {
                    let key: [u8; 32] = value
                        .try_into()
                        .map_err(|_| MeshError::WireMalformed("signing key length"))?;
                    signing_key = Some(key);
                }
                _ => {} // forward compatibility
            }
            cursor = next;
        }

        Ok(Self {
            nickname: nickname.ok_or(MeshError::WireMalformed("missing nickname"))?,
            noise_static_key: noise_static_key
                .ok_or(MeshError::WireMalformed("missing noise key"))?,
            signing_key: signing_key.ok_or(MeshError::WireMalformed("missing signing key"))?,
        })
    }
}

fn push_tlv(out: &mut Vec<u8>, tag: u8, value: &[u8]) {
    out.push(tag);
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(value);
}

fn read_tlv(data: &[u8], cursor: usize) -> MeshResult<(u8, &[u8], usize)> {
    if cursor + 3 > data.len() {
        return Err(MeshError::WireMalformed("tlv header"));
    }
    let tag = data[cursor];
    let len = u16::from_be_bytes([data[cursor + 1], data[cursor + 2]]) as usize;
    let start = cursor + 3;
    let end = start + len;
    if end > data.len() {
        return Err(MeshError::WireMalformed("tlv value"));
    }
    Ok((tag, &data[start..end], end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let announce = Announce {
            nickname: "ember".to_string(),
            noise_static_key: [0x11; 32],
            signing_key: [0x22; 32],
        };
        let bytes = announce.encode().unwrap();
        assert_eq!(Announce::decode(&bytes).unwrap(), announce);
    }

    #[test]
    fn unknown_tags_skipped() {
        let announce = Announce {
            nickname: "n".to_string(),
            noise_static_key: [1; 32],
            signing_key: [2; 32],
        };
        let mut bytes = announce.encode().unwrap();
        push_tlv(&mut bytes, 0x7E, b"future field");
        assert_eq!(Announce::decode(&bytes).unwrap(), announce);
    }

    #[test]
    fn oversized_nickname_rejected() {
        let announce = Announce {
            nickname: "x".repeat(65),
            noise_static_key: [0; 32],
            signing_key: [0; 32],
        };
        assert!(announce.encode().is_err());
    }

    #[test]
    fn truncated_tlv_rejected() {
        let announce = Announce {
            nickname: "n".to_string(),
            noise_static_key: [1; 32],
            signing_key: [2; 32],
        };
        let bytes = announce.encode().unwrap();
        assert!(Announce::decode(&bytes[..bytes.len() - 1]).is_err());
    }
}
