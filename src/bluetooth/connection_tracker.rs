//! Connection Tracker
//!
//! Authoritative table of per-device link state. A device reachable both
//! as our central and as our peripheral during a role race is tracked as
//! two records; payload dedup upstream keeps delivery single. The tracker
//! also owns the connection rate limits: a minimum gap between attempts
//! per address and exponential backoff after consecutive failures.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use log::debug;

use crate::protocol::{PeerId, TARGET_MTU};

/// Minimum gap between connection attempts to the same address.
pub const MIN_ATTEMPT_INTERVAL: Duration = Duration::from_secs(5);

/// Exponential backoff after consecutive failures.
pub const BACKOFF_BASE: Duration = Duration::from_secs(3);
pub const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Which GATT role we play on a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkRole {
    /// We connected out to them.
    Central,
    /// They connected in to us.
    Peripheral,
}

/// Link lifecycle: discovered → pending → connected → subscribed →
/// disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Discovered,
    Pending,
    Connected,
    Subscribed,
    Disconnected,
}

/// One (address, role) link.
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub address: String,
    pub role: LinkRole,
    pub state: LinkState,
    pub rssi: Option<i16>,
    pub last_attempt_at: Option<Instant>,
    pub consecutive_failures: u32,
    pub mtu: usize,
    /// On-wire peer ID learned from the first frame seen on this link.
    pub peer_id: Option<PeerId>,
}

impl ConnectionRecord {
    fn new(address: String, role: LinkRole) -> Self {
        Self {
            address,
            role,
            state: LinkState::Discovered,
            rssi: None,
            last_attempt_at: None,
            consecutive_failures: 0,
            mtu: TARGET_MTU,
            peer_id: None,
        }
    }

    fn is_active(&self) -> bool {
        matches!(
            self.state,
            LinkState::Pending | LinkState::Connected | LinkState::Subscribed
        )
    }

    fn backoff(&self) -> Duration {
        if self.consecutive_failures == 0 {
            return MIN_ATTEMPT_INTERVAL;
        }
        let exp = self.consecutive_failures.saturating_sub(1).min(8);
        let backoff = BACKOFF_BASE * 2u32.pow(exp);
        backoff.min(BACKOFF_CAP).max(MIN_ATTEMPT_INTERVAL)
    }
}

/// A link ready for outgoing sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub address: String,
    pub role: LinkRole,
    pub mtu: usize,
    pub peer_id: Option<PeerId>,
}

/// The connection table.
pub struct ConnectionTracker {
    records: DashMap<(String, LinkRole), ConnectionRecord>,
    max_connections: usize,
}

impl ConnectionTracker {
    pub fn new(max_connections: usize) -> Self {
        Self {
            records: DashMap::new(),
            max_connections,
        }
    }

    /// Update best-known RSSI for a scanned device.
    pub fn register_scan_result(&self, address: &str, rssi: i16) {
        let key = (address.to_string(), LinkRole::Central);
        let mut record = self
            .records
            .entry(key)
            .or_insert_with(|| ConnectionRecord::new(address.to_string(), LinkRole::Central));
        match record.rssi {
            Some(best) if best >= rssi => {}
            _ => record.rssi = Some(rssi),
        }
    }

    /// Whether a central-role connection attempt may start now.
    pub fn is_connect_allowed(&self, address: &str) -> bool {
        let active = self
            .records
            .iter()
            .filter(|entry| entry.value().role == LinkRole::Central && entry.value().is_active())
            .count();
        if active >= self.max_connections {
            return false;
        }

        let key = (address.to_string(), LinkRole::Central);
        match self.records.get(&key) {
            None => true,
            Some(record) => {
                if record.is_active() {
                    return false;
                }
                match record.last_attempt_at {
                    None => true,
                    Some(at) => at.elapsed() >= record.backoff(),
                }
            }
        }
    }

    /// Insert a pending record for a starting attempt.
    pub fn begin_attempt(&self, address: &str) {
        let key = (address.to_string(), LinkRole::Central);
        let mut record = self
            .records
            .entry(key)
            .or_insert_with(|| ConnectionRecord::new(address.to_string(), LinkRole::Central));
        record.state = LinkState::Pending;
        record.last_attempt_at = Some(Instant::now());
    }

    pub fn mark_connected(&self, address: &str, role: LinkRole, mtu: usize) {
        let key = (address.to_string(), role);
        let mut record = self
            .records
            .entry(key)
            .or_insert_with(|| ConnectionRecord::new(address.to_string(), role));
        record.state = LinkState::Connected;
        record.mtu = mtu;
    }

    pub fn mark_subscribed(&self, address: &str, role: LinkRole) {
        if let Some(mut record) = self.records.get_mut(&(address.to_string(), role)) {
            record.state = LinkState::Subscribed;
            record.consecutive_failures = 0;
            debug!("link {} ({:?}) usable", address, role);
        }
    }

    /// Mark a link down. `failed` distinguishes an aborted attempt (feeds
    /// the backoff) from a clean disconnect.
    pub fn mark_disconnected(&self, address: &str, role: LinkRole, failed: bool) {
        if let Some(mut record) = self.records.get_mut(&(address.to_string(), role)) {
            record.state = LinkState::Disconnected;
            if failed {
                record.consecutive_failures = record.consecutive_failures.saturating_add(1);
            } else {
                record.consecutive_failures = 0;
            }
        }
    }

    /// Bind the on-wire peer ID observed on a link.
    pub fn bind_peer(&self, address: &str, role: LinkRole, peer_id: PeerId) {
        if let Some(mut record) = self.records.get_mut(&(address.to_string(), role)) {
            record.peer_id = Some(peer_id);
        }
    }

    pub fn update_rssi(&self, address: &str, role: LinkRole, rssi: i16) {
        if let Some(mut record) = self.records.get_mut(&(address.to_string(), role)) {
            record.rssi = Some(rssi);
        }
    }

    /// Every subscribed link, best RSSI first. For a device connected in
    /// both roles the first ready record wins at send time.
    pub fn best_links(&self) -> Vec<Link> {
        let mut links: Vec<(Option<i16>, Link)> = self
            .records
            .iter()
            .filter(|entry| entry.value().state == LinkState::Subscribed)
            .map(|entry| {
                let r = entry.value();
                (
                    r.rssi,
                    Link {
                        address: r.address.clone(),
                        role: r.role,
                        mtu: r.mtu,
                        peer_id: r.peer_id,
                    },
                )
            })
            .collect();
        links.sort_by(|a, b| b.0.unwrap_or(i16::MIN).cmp(&a.0.unwrap_or(i16::MIN)));
        links.into_iter().map(|(_, link)| link).collect()
    }

    pub fn active_central_count(&self) -> usize {
        self.records
            .iter()
            .filter(|entry| entry.value().role == LinkRole::Central && entry.value().is_active())
            .count()
    }

    pub fn record(&self, address: &str, role: LinkRole) -> Option<ConnectionRecord> {
        self.records
            .get(&(address.to_string(), role))
            .map(|entry| entry.value().clone())
    }

    /// Forget long-disconnected records so the table stays bounded.
    pub fn prune_disconnected(&self) {
        self.records
            .retain(|_, record| record.state != LinkState::Disconnected || record.rssi.is_some());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_rate_limited_per_address() {
        let tracker = ConnectionTracker::new(8);
        assert!(tracker.is_connect_allowed("AA"));
        tracker.begin_attempt("AA");
        // Active pending record: no second attempt.
        assert!(!tracker.is_connect_allowed("AA"));
        tracker.mark_disconnected("AA", LinkRole::Central, true);
        // Failed moments ago: backoff applies.
        assert!(!tracker.is_connect_allowed("AA"));
        // Unrelated address is unaffected.
        assert!(tracker.is_connect_allowed("BB"));
    }

    #[test]
    fn connection_cap_enforced() {
        let tracker = ConnectionTracker::new(2);
        tracker.begin_attempt("AA");
        tracker.begin_attempt("BB");
        assert!(!tracker.is_connect_allowed("CC"));
        tracker.mark_disconnected("AA", LinkRole::Central, false);
        assert!(tracker.is_connect_allowed("CC"));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let mut record = ConnectionRecord::new("AA".into(), LinkRole::Central);
        record.consecutive_failures = 1;
        assert_eq!(record.backoff(), MIN_ATTEMPT_INTERVAL);
        record.consecutive_failures = 3;
        assert_eq!(record.backoff(), Duration::from_secs(12));
        record.consecutive_failures = 10;
        assert_eq!(record.backoff(), BACKOFF_CAP);
    }

    #[test]
    fn role_race_tracked_as_two_records() {
        let tracker = ConnectionTracker::new(8);
        tracker.mark_connected("AA", LinkRole::Central, 517);
        tracker.mark_connected("AA", LinkRole::Peripheral, 185);
        tracker.mark_subscribed("AA", LinkRole::Central);
        tracker.mark_subscribed("AA", LinkRole::Peripheral);
        let links = tracker.best_links();
        assert_eq!(links.len(), 2);
        assert!(links.iter().any(|l| l.role == LinkRole::Central));
        assert!(links.iter().any(|l| l.role == LinkRole::Peripheral));
    }

    #[test]
    fn best_links_only_subscribed_sorted_by_rssi() {
        let tracker = ConnectionTracker::new(8);
        tracker.mark_connected("AA", LinkRole::Central, 517);
        tracker.mark_subscribed("AA", LinkRole::Central);
        tracker.update_rssi("AA", LinkRole::Central, -80);

        tracker.mark_connected("BB", LinkRole::Central, 517);
        tracker.mark_subscribed("BB", LinkRole::Central);
        tracker.update_rssi("BB", LinkRole::Central, -40);

        tracker.mark_connected("CC", LinkRole::Central, 517);
        // CC never subscribed: not sendable.

        let links = tracker.best_links();
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].address, "BB");
        assert_eq!(links[1].address, "AA");
    }

    #[test]
    fn scan_result_keeps_best_rssi() {
        let tracker = ConnectionTracker::new(8);
        tracker.register_scan_result("AA", -90);
        tracker.register_scan_result("AA", -60);
        tracker.register_scan_result("AA", -95);
        assert_eq!(
            tracker.record("AA", LinkRole::Central).unwrap().rssi,
            Some(-60)
        );
    }
}
