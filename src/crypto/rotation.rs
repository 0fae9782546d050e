//! Identity Rotation
//!
//! Hourly rotation of the on-wire peer ID and the advertised BLE service
//! UUID. The UUID is derived from a network-wide secret so that peers
//! compute the same bucket schedule; the peer ID is derived from a
//! node-local seed so rotated IDs stay unlinkable. During the final five
//! minutes of a bucket both the outgoing and the incoming UUID are valid,
//! covering clock skew across nodes.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

use crate::protocol::{PeerId, LEGACY_SERVICE_UUID};

type HmacSha256 = Hmac<Sha256>;

/// One rotation bucket.
pub const BUCKET_MILLIS: u64 = 60 * 60 * 1000;

/// Tail of a bucket during which the next UUID is already accepted.
pub const OVERLAP_WINDOW_MILLIS: u64 = 5 * 60 * 1000;

const UUID_CONTEXT: &str = "mesh-svc";
const PEER_ID_CONTEXT: &str = "mesh-peer";

/// Derives the rotating identifiers for one node.
pub struct RotationSchedule {
    enabled: bool,
    /// Shared across the mesh; drives the service UUID schedule.
    network_secret: [u8; 32],
    /// Node-local; drives the ephemeral peer ID schedule.
    peer_seed: [u8; 32],
    /// Fallback peer ID when rotation is disabled.
    static_peer_id: PeerId,
}

impl RotationSchedule {
    pub fn new(
        enabled: bool,
        network_secret: [u8; 32],
        peer_seed: [u8; 32],
        static_peer_id: PeerId,
    ) -> Self {
        Self {
            enabled,
            network_secret,
            peer_seed,
            static_peer_id,
        }
    }

    pub fn bucket(now_ms: u64) -> u64 {
        now_ms / BUCKET_MILLIS
    }

    /// Whether `now` falls in the overlap tail of its bucket.
    pub fn in_overlap_window(now_ms: u64) -> bool {
        now_ms % BUCKET_MILLIS >= BUCKET_MILLIS - OVERLAP_WINDOW_MILLIS
    }

    /// The peer ID to put on the wire right now.
    pub fn ephemeral_peer_id(&self, now_ms: u64) -> PeerId {
        if !self.enabled {
            return self.static_peer_id;
        }
        let digest = keyed_digest(&self.peer_seed, PEER_ID_CONTEXT, Self::bucket(now_ms));
        let mut id = [0u8; 8];
        id.copy_from_slice(&digest[..8]);
        // The all-0xFF sender is reserved; nudge the improbable collision.
        if id == [0xFF; 8] {
            id[7] = 0xFE;
        }
        PeerId(id)
    }

    /// The service UUID to advertise right now.
    pub fn current_service_uuid(&self, now_ms: u64) -> Uuid {
        if !self.enabled {
            return LEGACY_SERVICE_UUID;
        }
        self.derive_uuid(Self::bucket(now_ms))
    }

    /// Every UUID a peer may legitimately advertise right now: current
    /// bucket, previous bucket, the next bucket once inside the overlap
    /// window, and the fixed legacy UUID.
    pub fn valid_uuids(&self, now_ms: u64) -> Vec<Uuid> {
        let mut set = Vec::with_capacity(4);
        if self.enabled {
            let bucket = Self::bucket(now_ms);
            set.push(self.derive_uuid(bucket));
            if bucket > 0 {
                set.push(self.derive_uuid(bucket - 1));
            }
            if Self::in_overlap_window(now_ms) {
                set.push(self.derive_uuid(bucket + 1));
            }
        }
        set.push(LEGACY_SERVICE_UUID);
        set
    }

    /// HMAC-SHA256 over "<prefix>-<bucket>", truncated to 16 bytes with
    /// the RFC 4122 v4 version and variant bits set.
    fn derive_uuid(&self, bucket: u64) -> Uuid {
        let digest = keyed_digest(&self.network_secret, UUID_CONTEXT, bucket);
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        bytes[6] = (bytes[6] & 0x0F) | 0x40;
        bytes[8] = (bytes[8] & 0x3F) | 0x80;
        Uuid::from_bytes(bytes)
    }
}

fn keyed_digest(key: &[u8; 32], context: &str, bucket: u64) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key size");
    mac.update(context.as_bytes());
    mac.update(b"-");
    mac.update(bucket.to_string().as_bytes());
    mac.finalize().into_bytes().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(enabled: bool, network: u8, seed: u8) -> RotationSchedule {
        RotationSchedule::new(enabled, [network; 32], [seed; 32], PeerId([0xAB; 8]))
    }

    #[test]
    fn disabled_rotation_uses_static_identifiers() {
        let s = schedule(false, 1, 2);
        assert_eq!(s.ephemeral_peer_id(123), PeerId([0xAB; 8]));
        assert_eq!(s.current_service_uuid(123), LEGACY_SERVICE_UUID);
    }

    #[test]
    fn peer_id_changes_across_buckets() {
        let s = schedule(true, 1, 2);
        let a = s.ephemeral_peer_id(0);
        let b = s.ephemeral_peer_id(BUCKET_MILLIS);
        assert_ne!(a, b);
        // Stable within a bucket.
        assert_eq!(a, s.ephemeral_peer_id(BUCKET_MILLIS - 1));
    }

    #[test]
    fn shared_secret_nodes_always_intersect() {
        let a = schedule(true, 7, 1);
        let b = schedule(true, 7, 2);

        // Same instant: identical current UUID.
        let now = 5 * BUCKET_MILLIS + 17_000;
        assert_eq!(a.current_service_uuid(now), b.current_service_uuid(now));

        // Inside the overlap window one node may already advertise the
        // next bucket; the other still accepts it.
        let late = 6 * BUCKET_MILLIS - 60_000;
        assert!(RotationSchedule::in_overlap_window(late));
        let next_uuid = a.derive_uuid(RotationSchedule::bucket(late) + 1);
        assert!(b.valid_uuids(late).contains(&next_uuid));

        // Just across the boundary the old UUID is still valid.
        let early = 6 * BUCKET_MILLIS + 1_000;
        let previous = a.derive_uuid(RotationSchedule::bucket(early) - 1);
        assert!(b.valid_uuids(early).contains(&previous));
    }

    #[test]
    fn different_network_secrets_diverge() {
        let a = schedule(true, 1, 1);
        let b = schedule(true, 9, 1);
        let now = 3 * BUCKET_MILLIS;
        assert_ne!(a.current_service_uuid(now), b.current_service_uuid(now));
    }

    #[test]
    fn derived_uuid_carries_v4_bits() {
        let s = schedule(true, 3, 3);
        let uuid = s.current_service_uuid(42 * BUCKET_MILLIS);
        assert_eq!(uuid.get_version_num(), 4);
        let bytes = uuid.as_bytes();
        assert_eq!(bytes[8] & 0xC0, 0x80);
    }

    #[test]
    fn legacy_uuid_always_valid() {
        let s = schedule(true, 1, 1);
        assert!(s.valid_uuids(0).contains(&LEGACY_SERVICE_UUID));
        let s = schedule(false, 1, 1);
        assert!(s.valid_uuids(0).contains(&LEGACY_SERVICE_UUID));
    }
}
