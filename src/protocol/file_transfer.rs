//! File Transfer Sub-Payload
//!
//! TLV format carried by `file_transfer` packets. The CONTENT TLV uses a
//! 4-byte length so transfers are not capped at 64 KiB; every other TLV
//! keeps a 2-byte length. A SHA-256 TLV terminates the payload; a digest
//! mismatch drops the transfer.

use sha2::{Digest, Sha256};

use crate::error::{MeshError, MeshResult};

const TAG_FILE_NAME: u8 = 0x01;
const TAG_FILE_SIZE: u8 = 0x02;
const TAG_MIME_TYPE: u8 = 0x03;
const TAG_CONTENT: u8 = 0x10;
const TAG_SHA256: u8 = 0xFF;

/// Decoded file transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTransfer {
    pub file_name: String,
    pub mime_type: String,
    pub content: Vec<u8>,
}

impl FileTransfer {
    pub fn encode(&self) -> MeshResult<Vec<u8>> {
        if self.file_name.len() > u16::MAX as usize || self.mime_type.len() > u16::MAX as usize {
            return Err(MeshError::WireMalformed("file metadata too long"));
        }
        if self.content.len() > u32::MAX as usize {
            return Err(MeshError::WireMalformed("file content too long"));
        }

        let mut out = Vec::with_capacity(self.content.len() + 128);
        push_short(&mut out, TAG_FILE_NAME, self.file_name.as_bytes());
        push_short(&mut out, TAG_FILE_SIZE, &(self.content.len() as u64).to_be_bytes());
        push_short(&mut out, TAG_MIME_TYPE, self.mime_type.as_bytes());

        out.push(TAG_CONTENT);
        out.extend_from_slice(&(self.content.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.content);

        let digest = Sha256::digest(&self.content);
        push_short(&mut out, TAG_SHA256, &digest);
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> MeshResult<Self> {
        let mut file_name = None;
        let mut mime_type = None;
        let mut declared_size = None;
        let mut content: Option<Vec<u8>> = None;
        let mut digest = None;

        let mut cursor = 0usize;
        while cursor < data.len() {
            if cursor + 1 > data.len() {
                return Err(MeshError::WireMalformed("tlv tag"));
            }
            let tag = data[cursor];
            cursor += 1;

            // CONTENT carries a 4-byte length; everything else 2 bytes.
            let (value, next) = if tag == TAG_CONTENT {
                if cursor + 4 > data.len() {
                    return Err(MeshError::WireMalformed("content length"));
                }
                let len =
                    u32::from_be_bytes(data[cursor..cursor + 4].try_into().unwrap()) as usize;
                let start = cursor + 4;
                let end = start
                    .checked_add(len)
                    .filter(|&e| e <= data.len())
                    .ok_or(MeshError::WireMalformed("content value"))?;
                (&data[start..end], end)
            } else {
                if cursor + 2 > data.len() {
                    return Err(MeshError::WireMalformed("tlv length"));
                }
                let len =
                    u16::from_be_bytes(data[cursor..cursor + 2].try_into().unwrap()) as usize;
                let start = cursor + 2;
                let end = start
                    .checked_add(len)
                    .filter(|&e| e <= data.len())
                    .ok_or(MeshError::WireMalformed("tlv value"))?;
                (&data[start..end], end)
            };

            match tag {
                TAG_FILE_NAME => {
                    file_name = Some(
                        std::str::from_utf8(value)
                            .map_err(|_| MeshError::WireMalformed("file name utf-8"))?
                            .to_string(),
                    );
                }
                TAG_FILE_SIZE => {
                    let size: [u8; 8] = value
                        .try_into()
                        .map_err(|_| MeshError::WireMalformed("file size"))?;
                    declared_size = Some(u64::from_be_bytes(size));
                }
                TAG_MIME_TYPE => {
                    mime_type = Some(
                        std::str::from_utf8(value)
                            .map_err(|_| MeshError::WireMalformed("mime utf-8"))?
                            .to_string(),
                    );
                }
                TAG_CONTENT => content = Some(value.to_vec()),
                TAG_SHA256 => {
                    let d: [u8; 32] = value
                        .try_into()
                        .map_err(|_| MeshError::WireMalformed("digest length"))?;
                    digest = Some(d);
                }
                _ => {}
            }
            cursor = next;
        }

        let content = content.ok_or(MeshError::WireMalformed("missing content"))?;
        let digest = digest.ok_or(MeshError::WireMalformed("missing digest"))?;

        let computed: [u8; 32] = Sha256::digest(&content).into();
        if computed != digest {
            return Err(MeshError::WireMalformed("digest mismatch"));
        }
        if let Some(size) = declared_size {
            if size != content.len() as u64 {
                return Err(MeshError::WireMalformed("size mismatch"));
            }
        }

        Ok(Self {
            file_name: file_name.ok_or(MeshError::WireMalformed("missing file name"))?,
            mime_type: mime_type.unwrap_or_default(),
            content,
        })
    }
}

fn push_short(out: &mut Vec<u8>, tag: u8, value: &[u8]) {
    out.push(tag);
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FileTransfer {
        FileTransfer {
            file_name: "notes.txt".to_string(),
            mime_type: "text/plain".to_string(),
            content: vec![0x61; 100_000],
        }
    }

    #[test]
    fn round_trip_large_content() {
        let transfer = sample();
        let bytes = transfer.encode().unwrap();
        assert_eq!(FileTransfer::decode(&bytes).unwrap(), transfer);
    }

    #[test]
    fn corrupted_content_dropped() {
        let transfer = sample();
        let mut bytes = transfer.encode().unwrap();
        // Flip one content byte; the trailing digest no longer matches.
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        assert!(FileTransfer::decode(&bytes).is_err());
    }

    #[test]
    fn truncated_payload_dropped() {
        let bytes = sample().encode().unwrap();
        assert!(FileTransfer::decode(&bytes[..bytes.len() - 10]).is_err());
    }
}
