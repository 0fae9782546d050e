//! Bluetooth LE Mesh Service
//!
//! Runs the radio side of the mesh: a scanner with a rotating service
//! UUID filter (and an unfiltered fallback for stacks that drop filtered
//! results), a periodically refreshed advertiser, and the central-role
//! GATT flow from connect through CCCD subscription. Inbound bytes go up
//! through a channel; outbound frames drain from the router's queue into
//! bounded per-link queues that drop their oldest entry on overflow.
//!
//! Every BLE callback is serialized through channels; no BLE call is made
//! from inside a BLE event handler.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use dashmap::DashSet;
use futures::stream::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch, Notify, RwLock};
use tokio::time;

use super::connection_tracker::{ConnectionTracker, LinkRole};
use super::peripheral::PeripheralServer;
use super::{InboundFrame, LinkKey, OutboundFrame, OutboundTarget};
use crate::crypto::RotationSchedule;
use crate::mesh::events::PeerEvent;
use crate::protocol::{self, CHARACTERISTIC_UUID, TARGET_MTU};
use crate::PowerProfile;

/// Central-role connection attempt budget.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Minimum gap between scan starts; stacks report "scanning too
/// frequently" below this.
const MIN_SCAN_GAP: Duration = Duration::from_secs(5);

/// Cool-down after a scan start failure.
const SCAN_RECOVERY: Duration = Duration::from_secs(10);

/// Advertiser republish period; some stacks silently stop advertising.
const ADVERTISE_REFRESH: Duration = Duration::from_secs(30);

/// RSSI refresh period for connected peers.
const RSSI_POLL: Duration = Duration::from_secs(10);

/// Grace period before cleaning up a cleanly disconnected link, letting
/// in-flight operations drain.
const CLEAN_DISCONNECT_DELAY: Duration = Duration::from_millis(500);

/// Per-link outbound queue depth; oldest frames drop on overflow.
const LINK_QUEUE_CAP: usize = 64;

/// Bounded drop-oldest frame queue feeding one link's writer task.
struct LinkQueue {
    frames: Mutex<VecDeque<Vec<u8>>>,
    notify: Notify,
}

impl LinkQueue {
    fn new() -> Self {
        Self {
            frames: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    fn push(&self, bytes: Vec<u8>) {
        let mut frames = self.frames.lock().expect("link queue poisoned");
        if frames.len() >= LINK_QUEUE_CAP {
            frames.pop_front();
        }
        frames.push_back(bytes);
        drop(frames);
        self.notify.notify_one();
    }

    async fn pop(&self) -> Vec<u8> {
        loop {
            if let Some(bytes) = self
                .frames
                .lock()
                .expect("link queue poisoned")
                .pop_front()
            {
                return bytes;
            }
            self.notify.notified().await;
        }
    }
}

/// One central-role link.
struct CentralConnection {
    peripheral: Peripheral,
    characteristic: Characteristic,
    queue: Arc<LinkQueue>,
}

/// The BLE engine.
pub struct BluetoothMeshService {
    adapter: tokio::sync::Mutex<Option<Adapter>>,
    tracker: Arc<ConnectionTracker>,
    peripheral_server: Arc<PeripheralServer>,
    rotation: Arc<RotationSchedule>,
    connections: Arc<RwLock<HashMap<String, CentralConnection>>>,
    /// PeripheralId → address, for disconnect events.
    id_index: Arc<RwLock<HashMap<PeripheralId, String>>>,
    inbound_tx: mpsc::Sender<InboundFrame>,
    events_tx: mpsc::Sender<PeerEvent>,
    cancelled: Arc<DashSet<u64>>,
    stop_rx: watch::Receiver<bool>,
    last_scan_start: Arc<Mutex<Instant>>,
    profile: PowerProfile,
}

impl BluetoothMeshService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tracker: Arc<ConnectionTracker>,
        peripheral_server: Arc<PeripheralServer>,
        rotation: Arc<RotationSchedule>,
        inbound_tx: mpsc::Sender<InboundFrame>,
        events_tx: mpsc::Sender<PeerEvent>,
        cancelled: Arc<DashSet<u64>>,
        stop_rx: watch::Receiver<bool>,
        profile: PowerProfile,
    ) -> Self {
        Self {
            adapter: tokio::sync::Mutex::new(None),
            tracker,
            peripheral_server,
            rotation,
            connections: Arc::new(RwLock::new(HashMap::new())),
            id_index: Arc::new(RwLock::new(HashMap::new())),
            inbound_tx,
            events_tx,
            cancelled,
            stop_rx,
            last_scan_start: Arc::new(Mutex::new(
                Instant::now() - MIN_SCAN_GAP - Duration::from_secs(1),
            )),
            profile,
        }
    }

    /// Bring the radio up and spawn every long-lived loop.
    pub async fn start(
        self: &Arc<Self>,
        outbound_rx: mpsc::Receiver<OutboundFrame>,
    ) -> Result<()> {
        info!("starting Bluetooth LE mesh engine");

        let manager = Manager::new()
            .await
            .context("failed to create Bluetooth manager")?;
        let adapters = manager.adapters().await.context("failed to list adapters")?;
        let Some(adapter) = adapters.into_iter().next() else {
            bail!("no Bluetooth adapter found");
        };
        info!("using adapter {:?}", adapter.adapter_info().await?);
        *self.adapter.lock().await = Some(adapter);

        self.start_scan(true).await?;
        self.spawn_event_loop().await?;
        self.spawn_scan_restart_loop();
        self.spawn_advertise_loop();
        self.spawn_rssi_loop();
        self.spawn_outbound_consumer(outbound_rx);

        info!("Bluetooth LE mesh engine running");
        Ok(())
    }

    /// Stop scanning and advertising and close every link.
    pub async fn shutdown(&self) {
        info!("stopping Bluetooth LE mesh engine");
        if let Some(adapter) = self.adapter.lock().await.as_ref() {
            let _ = adapter.stop_scan().await;
        }
        let _ = self.peripheral_server.stop_advertising();

        let connections = std::mem::take(&mut *self.connections.write().await);
        for (address, connection) in connections {
            if let Err(err) = connection.peripheral.disconnect().await {
                warn!("disconnect from {} failed: {}", address, err);
            }
            self.tracker
                .mark_disconnected(&address, LinkRole::Central, false);
        }
        self.id_index.write().await.clear();
    }

    fn stopped(&self) -> bool {
        *self.stop_rx.borrow()
    }

    // ------------------------------------------------------------------
    // Scanning
    // ------------------------------------------------------------------

    /// Start a scan, filtered on the valid UUID set or unfiltered as the
    /// fallback for stacks that drop filtered results.
    async fn start_scan(&self, filtered: bool) -> Result<()> {
        let adapter = self.adapter.lock().await;
        let adapter = adapter.as_ref().context("adapter not initialized")?;

        {
            let mut last = self.last_scan_start.lock().expect("scan clock poisoned");
            let since = last.elapsed();
            if since < MIN_SCAN_GAP {
                bail!("scan started {}ms ago", since.as_millis());
            }
            *last = Instant::now();
        }

        let filter = if filtered {
            ScanFilter {
                services: self
                    .rotation
                    .valid_uuids(protocol::packet::now_millis()),
            }
        } else {
            ScanFilter::default()
        };

        adapter.start_scan(filter).await.context("scan start failed")?;
        debug!("scan started (filtered: {})", filtered);
        Ok(())
    }

    async fn restart_scan(&self, filtered: bool) {
        if let Some(adapter) = self.adapter.lock().await.as_ref() {
            let _ = adapter.stop_scan().await;
        }
        time::sleep(Duration::from_millis(100)).await;
        if let Err(err) = self.start_scan(filtered).await {
            warn!("scan restart failed: {}; backing off", err);
            time::sleep(SCAN_RECOVERY).await;
        }
    }

    /// Forced scan restart at the power-profile period, alternating the
    /// filtered and unfiltered modes.
    fn spawn_scan_restart_loop(self: &Arc<Self>) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = time::interval(service.profile.scan_restart_period());
            interval.tick().await; // immediate first tick
            let mut filtered = false;
            while !service.stopped() {
                interval.tick().await;
                if service.stopped() {
                    break;
                }
                service.restart_scan(filtered).await;
                filtered = !filtered;
            }
        });
    }

    // ------------------------------------------------------------------
    // Advertising
    // ------------------------------------------------------------------

    fn spawn_advertise_loop(self: &Arc<Self>) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = time::interval(ADVERTISE_REFRESH);
            while !service.stopped() {
                interval.tick().await;
                if service.stopped() {
                    break;
                }
                let uuid = service
                    .rotation
                    .current_service_uuid(protocol::packet::now_millis());
                if let Err(err) = service.peripheral_server.advertise(uuid) {
                    debug!("advertise refresh failed: {}", err);
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Central role
    // ------------------------------------------------------------------

    async fn spawn_event_loop(self: &Arc<Self>) -> Result<()> {
        let events = {
            let adapter = self.adapter.lock().await;
            let adapter = adapter.as_ref().context("adapter not initialized")?;
            adapter.events().await?
        };

        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut events = events;
            while let Some(event) = events.next().await {
                if service.stopped() {
                    break;
                }
                match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        if let Err(err) = service.consider_device(id).await {
                            debug!("scan candidate rejected: {}", err);
                        }
                    }
                    CentralEvent::DeviceDisconnected(id) => {
                        service.handle_disconnect(id, false).await;
                    }
                    _ => {}
                }
            }
        });
        Ok(())
    }

    /// Scan-result gate: RSSI threshold, UUID membership, tracker rate
    /// limits. Survivors get a connection attempt.
    async fn consider_device(self: &Arc<Self>, id: PeripheralId) -> Result<()> {
        let peripheral = {
            let adapter = self.adapter.lock().await;
            let adapter = adapter.as_ref().context("adapter not initialized")?;
            adapter.peripheral(&id).await?
        };

        let properties = peripheral
            .properties()
            .await?
            .context("no advertisement properties")?;
        let address = properties.address.to_string();

        if let Some(rssi) = properties.rssi {
            self.tracker.register_scan_result(&address, rssi);
            if rssi < self.profile.rssi_threshold() {
                bail!("rssi {} below threshold", rssi);
            }
            let _ = self.events_tx.try_send(PeerEvent::Discovered {
                address: address.clone(),
                rssi,
            });
        }

        // The unfiltered fallback scan surfaces everything; check the
        // advertised services when the stack reports them at all.
        if !properties.services.is_empty() {
            let valid = self.rotation.valid_uuids(protocol::packet::now_millis());
            if !properties.services.iter().any(|uuid| valid.contains(uuid)) {
                bail!("no mesh service advertised");
            }
        }

        if self.connections.read().await.contains_key(&address) {
            bail!("already connected");
        }
        if !self.tracker.is_connect_allowed(&address) {
            bail!("rate limited");
        }
        self.tracker.begin_attempt(&address);

        let service = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = service.connect_and_subscribe(peripheral, &address).await {
                // Status 147 style establishment failures clean up
                // immediately and feed the backoff.
                warn!("connection to {} failed: {}", address, err);
                service
                    .tracker
                    .mark_disconnected(&address, LinkRole::Central, true);
            }
        });
        Ok(())
    }

    /// connect → discover → locate characteristic → subscribe. The link
    /// counts as usable only after the subscription succeeds.
    async fn connect_and_subscribe(
        self: &Arc<Self>,
        peripheral: Peripheral,
        address: &str,
    ) -> Result<()> {
        time::timeout(CONNECT_TIMEOUT, peripheral.connect())
            .await
            .context("connection attempt timed out")?
            .context("connection establishment failed")?;

        peripheral
            .discover_services()
            .await
            .context("service discovery failed")?;

        let valid = self.rotation.valid_uuids(protocol::packet::now_millis());
        let services = peripheral.services();
        let mesh_service = services
            .iter()
            .find(|s| valid.contains(&s.uuid))
            .context("mesh service not present")?;
        let characteristic = mesh_service
            .characteristics
            .iter()
            .find(|c| c.uuid == CHARACTERISTIC_UUID)
            .context("mesh characteristic not present")?
            .clone();

        // MTU target; btleplug negotiates under the hood, the recorded
        // value sizes our fragments.
        self.tracker
            .mark_connected(address, LinkRole::Central, TARGET_MTU);
        let _ = self.events_tx.try_send(PeerEvent::Connected {
            address: address.to_string(),
            role: LinkRole::Central,
        });

        // Subscription failure makes the link useless: disconnect.
        if let Err(err) = peripheral.subscribe(&characteristic).await {
            let _ = peripheral.disconnect().await;
            return Err(err).context("notification subscription failed");
        }
        self.tracker.mark_subscribed(address, LinkRole::Central);
        let _ = self.events_tx.try_send(PeerEvent::Subscribed {
            address: address.to_string(),
            role: LinkRole::Central,
        });

        let queue = Arc::new(LinkQueue::new());
        self.connections.write().await.insert(
            address.to_string(),
            CentralConnection {
                peripheral: peripheral.clone(),
                characteristic: characteristic.clone(),
                queue: Arc::clone(&queue),
            },
        );
        self.id_index
            .write()
            .await
            .insert(peripheral.id(), address.to_string());

        self.spawn_notification_task(peripheral.clone(), address.to_string());
        self.spawn_writer_task(peripheral, characteristic, queue, address.to_string());

        info!("central link to {} usable", address);
        Ok(())
    }

    fn spawn_notification_task(self: &Arc<Self>, peripheral: Peripheral, address: String) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut notifications = match peripheral.notifications().await {
                Ok(stream) => stream,
                Err(err) => {
                    error!("notification stream for {} failed: {}", address, err);
                    return;
                }
            };
            while let Some(notification) = notifications.next().await {
                if service.stopped() {
                    break;
                }
                let frame = InboundFrame {
                    address: address.clone(),
                    role: LinkRole::Central,
                    bytes: notification.value,
                };
                if service.inbound_tx.send(frame).await.is_err() {
                    break;
                }
            }
            debug!("notification stream for {} ended", address);
        });
    }

    /// One writer per link keeps per-peer transmission order while links
    /// stay independent.
    fn spawn_writer_task(
        self: &Arc<Self>,
        peripheral: Peripheral,
        characteristic: Characteristic,
        queue: Arc<LinkQueue>,
        address: String,
    ) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let bytes = queue.pop().await;
                if service.stopped() {
                    break;
                }
                if let Err(err) = peripheral
                    .write(&characteristic, &bytes, WriteType::WithoutResponse)
                    .await
                {
                    warn!("write to {} failed: {}", address, err);
                    service
                        .tracker
                        .mark_disconnected(&address, LinkRole::Central, true);
                    break;
                }
            }
        });
    }

    async fn handle_disconnect(self: &Arc<Self>, id: PeripheralId, failed: bool) {
        let Some(address) = self.id_index.write().await.remove(&id) else {
            return;
        };
        if failed {
            self.cleanup_link(&address, true).await;
            return;
        }
        // Clean disconnects drain pending operations first.
        let service = Arc::clone(self);
        tokio::spawn(async move {
            time::sleep(CLEAN_DISCONNECT_DELAY).await;
            service.cleanup_link(&address, false).await;
        });
    }

    async fn cleanup_link(&self, address: &str, failed: bool) {
        self.connections.write().await.remove(address);
        self.tracker
            .mark_disconnected(address, LinkRole::Central, failed);
        let _ = self.events_tx.try_send(PeerEvent::Disconnected {
            address: address.to_string(),
            role: LinkRole::Central,
        });
        info!("link to {} closed (failed: {})", address, failed);
    }

    // ------------------------------------------------------------------
    // RSSI
    // ------------------------------------------------------------------

    fn spawn_rssi_loop(self: &Arc<Self>) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = time::interval(RSSI_POLL);
            while !service.stopped() {
                interval.tick().await;
                if service.stopped() {
                    break;
                }
                let peripherals: Vec<(String, Peripheral)> = service
                    .connections
                    .read()
                    .await
                    .iter()
                    .map(|(address, conn)| (address.clone(), conn.peripheral.clone()))
                    .collect();
                for (address, peripheral) in peripherals {
                    if let Ok(Some(properties)) = peripheral.properties().await {
                        if let Some(rssi) = properties.rssi {
                            service.tracker.update_rssi(&address, LinkRole::Central, rssi);
                        }
                    }
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Drain the router's queue into per-link queues and the peripheral
    /// server.
    fn spawn_outbound_consumer(self: &Arc<Self>, mut rx: mpsc::Receiver<OutboundFrame>) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if service.stopped() {
                    break;
                }
                if let Some(handle) = frame.handle {
                    if service.cancelled.contains(&handle) {
                        debug!("skipping cancelled transfer frame");
                        continue;
                    }
                }
                service.route_frame(frame).await;
            }
        });
    }

    async fn route_frame(&self, frame: OutboundFrame) {
        match frame.target {
            OutboundTarget::AllLinks { except } => {
                self.send_all(&frame.bytes, except.as_ref()).await;
            }
            OutboundTarget::Link(link) => {
                self.send_link(&link, &frame.bytes).await;
            }
            OutboundTarget::Peer(peer) => {
                let link = self
                    .tracker
                    .best_links()
                    .into_iter()
                    .find(|l| l.peer_id == Some(peer));
                match link {
                    Some(link) => {
                        self.send_link(
                            &LinkKey {
                                address: link.address,
                                role: link.role,
                            },
                            &frame.bytes,
                        )
                        .await;
                    }
                    None => debug!("no link bound to peer {}; frame dropped", peer),
                }
            }
        }
    }

    async fn send_all(&self, bytes: &[u8], except: Option<&LinkKey>) {
        // Central-role links.
        let connections = self.connections.read().await;
        for (address, connection) in connections.iter() {
            let key = LinkKey {
                address: address.clone(),
                role: LinkRole::Central,
            };
            if Some(&key) == except {
                continue;
            }
            connection.queue.push(bytes.to_vec());
        }
        drop(connections);

        // Peripheral-role links: notify every subscribed central except
        // the excluded one.
        match except {
            Some(key) if key.role == LinkRole::Peripheral => {
                for link in self.tracker.best_links() {
                    if link.role == LinkRole::Peripheral && link.address != key.address {
                        let _ = self.peripheral_server.notify_one(&link.address, bytes);
                    }
                }
            }
            _ => {
                self.peripheral_server.notify_subscribed(bytes);
            }
        }
    }

    async fn send_link(&self, link: &LinkKey, bytes: &[u8]) {
        match link.role {
            LinkRole::Central => {
                if let Some(connection) = self.connections.read().await.get(&link.address) {
                    connection.queue.push(bytes.to_vec());
                } else {
                    debug!("no central connection to {}; frame dropped", link.address);
                }
            }
            LinkRole::Peripheral => {
                if let Err(err) = self.peripheral_server.notify_one(&link.address, bytes) {
                    debug!("notify to {} failed: {}", link.address, err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_queue_drops_oldest_on_overflow() {
        let queue = LinkQueue::new();
        for i in 0..(LINK_QUEUE_CAP + 3) {
            queue.push(vec![i as u8]);
        }
        let frames = queue.frames.lock().unwrap();
        assert_eq!(frames.len(), LINK_QUEUE_CAP);
        // The three oldest frames are gone.
        assert_eq!(frames.front().unwrap(), &vec![3u8]);
    }

    #[tokio::test]
    async fn link_queue_pop_waits_for_push() {
        let queue = Arc::new(LinkQueue::new());
        let popper = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;
        queue.push(vec![7]);
        assert_eq!(popper.await.unwrap(), vec![7]);
    }
}
