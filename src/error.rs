//! Error Types
//!
//! Distinct error kinds for every layer of the mesh core. Wire errors are
//! logged at debug level and the offending frame is dropped; crypto errors
//! surface as peer events; link errors feed the connection tracker's
//! backoff; identity errors are fatal at startup.

use thiserror::Error;

/// Errors produced by the mesh core.
#[derive(Debug, Error)]
pub enum MeshError {
    // Wire / codec
    #[error("malformed frame: {0}")]
    WireMalformed(&'static str),

    #[error("unsupported protocol version: {0}")]
    WireBadVersion(u8),

    #[error("frame exceeds largest padding block: {0} bytes")]
    WireOversize(usize),

    #[error("payload too large for v1 length field: {0} bytes")]
    WirePayloadTooLarge(usize),

    #[error("route exceeds 255 hops: {0}")]
    WireRouteTooLong(usize),

    #[error("payload compression failed")]
    WireCompressionFailed,

    // Noise / crypto
    #[error("noise handshake timed out")]
    CryptoHandshakeTimeout,

    #[error("noise handshake violated the XX pattern: {0}")]
    CryptoHandshakeState(&'static str),

    #[error("transport message failed to decrypt")]
    CryptoDecryptFailed,

    #[error("send nonce space exhausted, rekey required")]
    CryptoNonceExhausted,

    #[error("no established session for peer")]
    CryptoSessionMissing,

    // Link lifecycle
    #[error("connection attempt failed: {0}")]
    LinkConnectFailed(String),

    #[error("characteristic subscription failed: {0}")]
    LinkSubscribeFailed(String),

    #[error("connection attempt rate limited")]
    LinkRateLimited,

    #[error("MTU negotiation failed")]
    LinkMtuFailed,

    // Fragmentation
    #[error("fragment reassembly timed out")]
    FragmentTimeout,

    #[error("payload requires more than 65535 fragments")]
    FragmentOversized,

    // Identity / storage
    #[error("identity key material unavailable: {0}")]
    IdentityKeyUnavailable(String),
}

/// Convenience alias used throughout the codec and crypto layers.
pub type MeshResult<T> = Result<T, MeshError>;

impl MeshError {
    /// Wire errors reflect unrelated BLE noise as often as real peers; they
    /// are dropped silently rather than surfaced to callers.
    pub fn is_wire(&self) -> bool {
        matches!(
            self,
            MeshError::WireMalformed(_)
                | MeshError::WireBadVersion(_)
                | MeshError::WireOversize(_)
                | MeshError::WirePayloadTooLarge(_)
                | MeshError::WireRouteTooLong(_)
                | MeshError::WireCompressionFailed
        )
    }
}
