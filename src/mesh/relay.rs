//! Relay & Deduplication
//!
//! Every inbound frame passes the seen-cache first; duplicates are dropped
//! silently, which also collapses role-race double delivery to a single
//! upstream event. Survivors are classified: delivered upstream, relayed
//! with one hop spent, or both. Packets carrying a source route relay only
//! along the prescribed path.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use crate::protocol::{Packet, PeerId};

/// Bounded dedup set: oldest entries evicted past the cap.
pub const SEEN_CACHE_CAP: usize = 10_000;

/// Entries expire so legitimate re-broadcasts after a partition heal are
/// not rejected forever.
pub const SEEN_TTL: Duration = Duration::from_secs(300);

/// Payload prefix length folded into the dedup key.
const KEY_PAYLOAD_PREFIX: usize = 32;

/// Identity key of one packet for dedup purposes.
pub fn dedup_key(packet: &Packet) -> [u8; 16] {
    let mut hasher = Sha256::new();
    hasher.update(packet.sender_id.as_bytes());
    hasher.update(packet.timestamp_ms.to_be_bytes());
    let prefix_len = packet.payload.len().min(KEY_PAYLOAD_PREFIX);
    hasher.update(&packet.payload[..prefix_len]);
    let digest = hasher.finalize();
    let mut key = [0u8; 16];
    key.copy_from_slice(&digest[..16]);
    key
}

struct SeenInner {
    entries: HashMap<[u8; 16], Instant>,
    order: VecDeque<[u8; 16]>,
}

/// Bounded, time-expiring set of recently seen packet keys.
pub struct SeenCache {
    inner: Mutex<SeenInner>,
    cap: usize,
    ttl: Duration,
}

impl SeenCache {
    pub fn new() -> Self {
        Self::with_limits(SEEN_CACHE_CAP, SEEN_TTL)
    }

    pub fn with_limits(cap: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(SeenInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            cap,
            ttl,
        }
    }

    /// Returns `true` when the key is fresh (and records it); `false` for
    /// a duplicate inside the TTL window.
    pub fn check_and_insert(&self, key: [u8; 16]) -> bool {
        let mut inner = self.inner.lock().expect("seen cache poisoned");
        let now = Instant::now();

        if let Some(&seen_at) = inner.entries.get(&key) {
            if now.duration_since(seen_at) < self.ttl {
                return false;
            }
            inner.entries.remove(&key);
        }

        // Age-based eviction on overflow.
        while inner.entries.len() >= self.cap {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.entries.remove(&oldest);
                }
                None => break,
            }
        }

        inner.entries.insert(key, now);
        inner.order.push_back(key);
        true
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("seen cache poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SeenCache {
    fn default() -> Self {
        Self::new()
    }
}

/// What to do with a deduplicated inbound packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayAction {
    /// Hop budget spent or route excludes us; nothing further.
    Drop,
    /// Addressed to this node; pass upstream, never relay.
    Deliver,
    /// Someone else's traffic; forward the decremented copy.
    Relay {
        packet: Packet,
        /// Set in source-route mode: forward only toward this hop.
        next_hop: Option<PeerId>,
    },
    /// Broadcast traffic: both deliver upstream and forward.
    DeliverAndRelay {
        packet: Packet,
        next_hop: Option<PeerId>,
    },
}

/// Classify a packet against this node's current identifiers.
///
/// `local_ids` holds the current ephemeral ID and the static short ID so
/// traffic addressed to either is accepted across rotation boundaries.
pub fn evaluate(packet: &Packet, local_ids: &[PeerId]) -> RelayAction {
    let addressed_to_us = matches!(packet.recipient_id, Some(r) if local_ids.contains(&r));
    if addressed_to_us {
        return RelayAction::Deliver;
    }

    let is_broadcast = packet.is_broadcast();

    // One hop is consumed here; a packet arriving with a single remaining
    // hop dies at this node.
    let relayed = if packet.ttl > 1 {
        packet.decrement_ttl()
    } else {
        None
    };

    let Some(relayed) = relayed else {
        return if is_broadcast {
            RelayAction::Deliver
        } else {
            RelayAction::Drop
        };
    };

    // Source-route mode: only the hop after us, and only if we are on the
    // path at all.
    let next_hop = match &packet.route {
        Some(route) => {
            let position = route
                .iter()
                .position(|hop| local_ids.contains(hop));
            match position {
                Some(i) if i + 1 < route.len() => Some(route[i + 1]),
                _ => {
                    return if is_broadcast {
                        RelayAction::Deliver
                    } else {
                        RelayAction::Drop
                    };
                }
            }
        }
        None => None,
    };

    if is_broadcast {
        RelayAction::DeliverAndRelay {
            packet: relayed,
            next_hop,
        }
    } else {
        RelayAction::Relay {
            packet: relayed,
            next_hop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PacketType, Packet};

    fn local() -> Vec<PeerId> {
        vec![PeerId([0xA0; 8]), PeerId([0xA1; 8])]
    }

    fn broadcast(ttl: u8) -> Packet {
        Packet::broadcast(PacketType::Message, PeerId([1; 8]), b"payload".to_vec()).with_ttl(ttl)
    }

    #[test]
    fn broadcast_relays_with_decremented_ttl() {
        let action = evaluate(&broadcast(7), &local());
        match action {
            RelayAction::DeliverAndRelay { packet, next_hop } => {
                assert_eq!(packet.ttl, 6);
                assert!(next_hop.is_none());
            }
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn last_hop_delivers_without_forwarding() {
        // ttl=1: this node consumes the final hop.
        assert_eq!(evaluate(&broadcast(1), &local()), RelayAction::Deliver);
        assert_eq!(evaluate(&broadcast(0), &local()), RelayAction::Deliver);
    }

    #[test]
    fn addressed_to_us_never_relays() {
        let packet = Packet::addressed(
            PacketType::Message,
            PeerId([1; 8]),
            PeerId([0xA0; 8]),
            b"mine".to_vec(),
        );
        assert_eq!(evaluate(&packet, &local()), RelayAction::Deliver);
    }

    #[test]
    fn addressed_to_other_relays_silently() {
        let packet = Packet::addressed(
            PacketType::Message,
            PeerId([1; 8]),
            PeerId([9; 8]),
            b"theirs".to_vec(),
        );
        match evaluate(&packet, &local()) {
            RelayAction::Relay { packet, .. } => assert_eq!(packet.ttl, 6),
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn source_route_picks_next_hop() {
        let packet = Packet::addressed(
            PacketType::Message,
            PeerId([1; 8]),
            PeerId([9; 8]),
            b"routed".to_vec(),
        )
        .with_route(vec![PeerId([0xA0; 8]), PeerId([5; 8]), PeerId([9; 8])]);
        match evaluate(&packet, &local()) {
            RelayAction::Relay { next_hop, .. } => assert_eq!(next_hop, Some(PeerId([5; 8]))),
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn source_route_excluding_us_drops() {
        let packet = Packet::addressed(
            PacketType::Message,
            PeerId([1; 8]),
            PeerId([9; 8]),
            b"routed".to_vec(),
        )
        .with_route(vec![PeerId([5; 8]), PeerId([9; 8])]);
        assert_eq!(evaluate(&packet, &local()), RelayAction::Drop);
    }

    #[test]
    fn seen_cache_forwards_exactly_once() {
        let cache = SeenCache::new();
        let packet = broadcast(7);
        let key = dedup_key(&packet);
        assert!(cache.check_and_insert(key));
        assert!(!cache.check_and_insert(key));
    }

    #[test]
    fn relayed_copy_shares_the_dedup_key() {
        let packet = broadcast(7);
        let relayed = packet.decrement_ttl().unwrap();
        assert_eq!(dedup_key(&packet), dedup_key(&relayed));
    }

    #[test]
    fn cache_evicts_oldest_on_overflow() {
        let cache = SeenCache::with_limits(3, SEEN_TTL);
        for i in 0u8..3 {
            assert!(cache.check_and_insert([i; 16]));
        }
        assert!(cache.check_and_insert([9; 16]));
        assert_eq!(cache.len(), 3);
        // Oldest entry was evicted; it reads as fresh again.
        assert!(cache.check_and_insert([0; 16]));
    }

    #[test]
    fn expired_entries_read_as_fresh() {
        let cache = SeenCache::with_limits(10, Duration::from_millis(0));
        assert!(cache.check_and_insert([1; 16]));
        std::thread::sleep(Duration::from_millis(2));
        assert!(cache.check_and_insert([1; 16]));
    }
}
