//! Peripheral-Role GATT Server
//!
//! Serves one writable + notifiable characteristic under the rotating
//! service UUID. btleplug offers no peripheral mode on most platforms, so
//! the state machine runs over an abstract [`PeripheralBackend`]: platform
//! integrations (BlueZ, Core Bluetooth) implement advertising and
//! notification delivery, a loopback backend drives the same machine in
//! tests.
//!
//! A central becomes a usable link only after it writes 0x0001 to the
//! CCCD; until then nothing is notified to it.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use dashmap::DashMap;
use log::{debug, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::connection_tracker::{ConnectionTracker, LinkRole};
use super::InboundFrame;
use crate::protocol::TARGET_MTU;

/// CCCD value enabling notifications.
pub const CCCD_ENABLE: [u8; 2] = [0x01, 0x00];
/// CCCD value disabling notifications.
pub const CCCD_DISABLE: [u8; 2] = [0x00, 0x00];

/// Events surfaced by a platform peripheral implementation.
#[derive(Debug, Clone)]
pub enum PeripheralEvent {
    CentralConnected { address: String },
    CentralDisconnected { address: String },
    /// A write to the CCCD descriptor of the mesh characteristic.
    DescriptorWrite { address: String, value: Vec<u8> },
    /// A write to the mesh characteristic itself: one inbound frame.
    CharacteristicWrite { address: String, value: Vec<u8> },
    MtuChanged { address: String, mtu: usize },
}

/// Platform hooks the server drives.
pub trait PeripheralBackend: Send + Sync + 'static {
    /// (Re)start advertising the given service UUID with the connectable
    /// flag set.
    fn start_advertising(&self, service_uuid: Uuid) -> Result<()>;

    fn stop_advertising(&self) -> Result<()>;

    /// Deliver a notification to one connected central.
    fn notify(&self, address: &str, payload: &[u8]) -> Result<()>;
}

struct CentralState {
    subscribed: bool,
    mtu: usize,
}

/// The peripheral-role state machine.
pub struct PeripheralServer {
    backend: Arc<dyn PeripheralBackend>,
    centrals: DashMap<String, CentralState>,
    tracker: Arc<ConnectionTracker>,
    inbound: mpsc::Sender<InboundFrame>,
}

impl PeripheralServer {
    pub fn new(
        backend: Arc<dyn PeripheralBackend>,
        tracker: Arc<ConnectionTracker>,
        inbound: mpsc::Sender<InboundFrame>,
    ) -> Self {
        Self {
            backend,
            centrals: DashMap::new(),
            tracker,
            inbound,
        }
    }

    /// (Re)publish the current service UUID. Some stacks silently stop
    /// advertising, so the caller refreshes this periodically.
    pub fn advertise(&self, service_uuid: Uuid) -> Result<()> {
        self.backend.start_advertising(service_uuid)
    }

    pub fn stop_advertising(&self) -> Result<()> {
        self.backend.stop_advertising()
    }

    /// Process one event from the platform layer.
    pub async fn handle_event(&self, event: PeripheralEvent) {
        match event {
            PeripheralEvent::CentralConnected { address } => {
                debug!("central {} connected to our server", address);
                self.centrals.insert(
                    address.clone(),
                    CentralState {
                        subscribed: false,
                        mtu: TARGET_MTU,
                    },
                );
                self.tracker
                    .mark_connected(&address, LinkRole::Peripheral, TARGET_MTU);
            }
            PeripheralEvent::CentralDisconnected { address } => {
                debug!("central {} left our server", address);
                self.centrals.remove(&address);
                self.tracker
                    .mark_disconnected(&address, LinkRole::Peripheral, false);
            }
            PeripheralEvent::DescriptorWrite { address, value } => {
                let enable = value.as_slice() == CCCD_ENABLE;
                if let Some(mut central) = self.centrals.get_mut(&address) {
                    central.subscribed = enable;
                }
                if enable {
                    self.tracker.mark_subscribed(&address, LinkRole::Peripheral);
                } else {
                    self.tracker
                        .mark_disconnected(&address, LinkRole::Peripheral, false);
                }
            }
            PeripheralEvent::CharacteristicWrite { address, value } => {
                let frame = InboundFrame {
                    address,
                    role: LinkRole::Peripheral,
                    bytes: value,
                };
                if self.inbound.send(frame).await.is_err() {
                    warn!("inbound queue closed; peripheral write dropped");
                }
            }
            PeripheralEvent::MtuChanged { address, mtu } => {
                if let Some(mut central) = self.centrals.get_mut(&address) {
                    central.mtu = mtu;
                }
                self.tracker.mark_connected(&address, LinkRole::Peripheral, mtu);
            }
        }
    }

    /// Notify every subscribed central; returns how many were reached.
    pub fn notify_subscribed(&self, payload: &[u8]) -> usize {
        let mut reached = 0;
        for entry in self.centrals.iter() {
            if !entry.value().subscribed {
                continue;
            }
            match self.backend.notify(entry.key(), payload) {
                Ok(()) => reached += 1,
                Err(err) => debug!("notify to {} failed: {}", entry.key(), err),
            }
        }
        reached
    }

    /// Notify one central, if it is subscribed.
    pub fn notify_one(&self, address: &str, payload: &[u8]) -> Result<()> {
        match self.centrals.get(address) {
            Some(central) if central.subscribed => self.backend.notify(address, payload),
            _ => anyhow::bail!("central {} not subscribed", address),
        }
    }

    pub fn is_subscribed(&self, address: &str) -> bool {
        self.centrals
            .get(address)
            .map(|c| c.subscribed)
            .unwrap_or(false)
    }
}

/// Backend for platforms without peripheral support: advertising becomes
/// a no-op and the node runs central-only, which the mesh tolerates.
pub struct NoopBackend;

impl PeripheralBackend for NoopBackend {
    fn start_advertising(&self, service_uuid: Uuid) -> Result<()> {
        debug!(
            "peripheral mode unavailable on this platform; would advertise {}",
            service_uuid
        );
        Ok(())
    }

    fn stop_advertising(&self) -> Result<()> {
        Ok(())
    }

    fn notify(&self, _address: &str, _payload: &[u8]) -> Result<()> {
        anyhow::bail!("peripheral mode unavailable")
    }
}

/// In-memory backend recording everything; drives the server in tests.
#[derive(Default)]
pub struct LoopbackBackend {
    pub advertised: Mutex<Vec<Uuid>>,
    pub notifications: Mutex<Vec<(String, Vec<u8>)>>,
}

impl PeripheralBackend for LoopbackBackend {
    fn start_advertising(&self, service_uuid: Uuid) -> Result<()> {
        self.advertised
            .lock()
            .expect("loopback poisoned")
            .push(service_uuid);
        Ok(())
    }

    fn stop_advertising(&self) -> Result<()> {
        Ok(())
    }

    fn notify(&self, address: &str, payload: &[u8]) -> Result<()> {
        self.notifications
            .lock()
            .expect("loopback poisoned")
            .push((address.to_string(), payload.to_vec()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> (Arc<LoopbackBackend>, PeripheralServer, mpsc::Receiver<InboundFrame>) {
        let backend = Arc::new(LoopbackBackend::default());
        let tracker = Arc::new(ConnectionTracker::new(8));
        let (tx, rx) = mpsc::channel(16);
        let server = PeripheralServer::new(backend.clone(), tracker, tx);
        (backend, server, rx)
    }

    #[tokio::test]
    async fn cccd_gates_notifications() {
        let (backend, server, _rx) = server();
        server
            .handle_event(PeripheralEvent::CentralConnected {
                address: "AA".into(),
            })
            .await;

        // Connected but not subscribed: nothing is notified.
        assert_eq!(server.notify_subscribed(b"frame"), 0);

        server
            .handle_event(PeripheralEvent::DescriptorWrite {
                address: "AA".into(),
                value: CCCD_ENABLE.to_vec(),
            })
            .await;
        assert!(server.is_subscribed("AA"));
        assert_eq!(server.notify_subscribed(b"frame"), 1);
        assert_eq!(
            *backend.notifications.lock().unwrap(),
            vec![("AA".to_string(), b"frame".to_vec())]
        );

        server
            .handle_event(PeripheralEvent::DescriptorWrite {
                address: "AA".into(),
                value: CCCD_DISABLE.to_vec(),
            })
            .await;
        assert_eq!(server.notify_subscribed(b"frame"), 0);
    }

    #[tokio::test]
    async fn characteristic_writes_flow_inbound() {
        let (_backend, server, mut rx) = server();
        server
            .handle_event(PeripheralEvent::CentralConnected {
                address: "BB".into(),
            })
            .await;
        server
            .handle_event(PeripheralEvent::CharacteristicWrite {
                address: "BB".into(),
                value: vec![1, 2, 3],
            })
            .await;

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.address, "BB");
        assert_eq!(frame.role, LinkRole::Peripheral);
        assert_eq!(frame.bytes, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn disconnect_clears_subscription() {
        let (_backend, server, _rx) = server();
        server
            .handle_event(PeripheralEvent::CentralConnected {
                address: "CC".into(),
            })
            .await;
        server
            .handle_event(PeripheralEvent::DescriptorWrite {
                address: "CC".into(),
                value: CCCD_ENABLE.to_vec(),
            })
            .await;
        server
            .handle_event(PeripheralEvent::CentralDisconnected {
                address: "CC".into(),
            })
            .await;
        assert!(!server.is_subscribed("CC"));
        assert_eq!(server.notify_subscribed(b"x"), 0);
    }
}
