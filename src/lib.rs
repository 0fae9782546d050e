//! bitmesh - Decentralized Bluetooth LE Mesh Messaging Core
//!
//! A peer-to-peer encrypted mesh messaging node. Every node acts as a BLE
//! central (scanning, connecting, subscribing) and peripheral (advertising,
//! serving GATT writes) at once, exchanges framed binary packets, relays
//! them with TTL-bounded flooding, and layers Noise XX end-to-end
//! encryption over addressed traffic.
//!
//! [`MeshCore`] is the single context object owning all long-lived state;
//! collaborators drive it through the narrow send/receive surface:
//! [`MeshCore::broadcast`], [`MeshCore::send_private`],
//! [`MeshCore::subscribe`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashSet;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, watch};
use tokio::time;

pub mod bluetooth;
pub mod crypto;
pub mod error;
pub mod mesh;
pub mod protocol;
pub mod storage;

use bluetooth::{
    BluetoothMeshService, ConnectionTracker, InboundFrame, NoopBackend, OutboundFrame,
    PeripheralBackend, PeripheralServer,
};
use crypto::{Fingerprint, Identity, RotationSchedule, SessionManager};
use error::{MeshError, MeshResult};
use mesh::{ClosureObserver, MessageEvent, MeshObserver, PeerEvent, Router, TransferHandle};
use storage::StateStore;

/// Queue depths for the channels crossing the BLE/router boundary.
const INBOUND_QUEUE: usize = 256;
const OUTBOUND_QUEUE: usize = 256;
const EVENT_QUEUE: usize = 64;

/// Cadence of the reaper task sweeping reassembly and handshake state.
const MAINTENANCE_TICK: Duration = Duration::from_secs(1);

/// Connection and scan aggressiveness by power budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerProfile {
    Performance,
    Balanced,
    PowerSaver,
}

impl PowerProfile {
    pub fn max_connections(&self) -> usize {
        match self {
            PowerProfile::Performance => 8,
            PowerProfile::Balanced => 4,
            PowerProfile::PowerSaver => 2,
        }
    }

    /// Scan results below this are ignored.
    pub fn rssi_threshold(&self) -> i16 {
        match self {
            PowerProfile::Performance => -95,
            PowerProfile::Balanced => -90,
            PowerProfile::PowerSaver => -85,
        }
    }

    /// Forced scan restart period; stacks silently stall delivery
    /// without it.
    pub fn scan_restart_period(&self) -> Duration {
        match self {
            PowerProfile::Performance | PowerProfile::Balanced => Duration::from_secs(25),
            PowerProfile::PowerSaver => Duration::from_secs(30),
        }
    }
}

/// Startup configuration.
#[derive(Clone)]
pub struct Config {
    pub nickname: String,
    pub rotation_enabled: bool,
    /// Reserved for the outer transport layer; the mesh core itself never
    /// opens internet sockets.
    pub tor_disabled: bool,
    pub power_profile: PowerProfile,
    /// Directory holding the encrypted identity and settings files.
    pub data_dir: PathBuf,
    /// Master key for at-rest encryption, held by the host OS keystore.
    pub master_key: [u8; 32],
    /// Network-wide secret driving the service UUID rotation schedule.
    /// Nodes must share it to find each other; the default derives from
    /// the public service namespace.
    pub rotation_secret: [u8; 32],
}

impl Config {
    pub fn new(nickname: impl Into<String>, data_dir: impl Into<PathBuf>, master_key: [u8; 32]) -> Self {
        Self {
            nickname: nickname.into(),
            rotation_enabled: true,
            tor_disabled: false,
            power_profile: PowerProfile::Balanced,
            data_dir: data_dir.into(),
            master_key,
            rotation_secret: default_rotation_secret(),
        }
    }
}

/// Out-of-the-box nodes agree on the schedule by deriving the secret from
/// the fixed service namespace; closed meshes override it.
pub fn default_rotation_secret() -> [u8; 32] {
    Sha256::digest(protocol::LEGACY_SERVICE_UUID.as_bytes()).into()
}

/// The mesh core: one context object owning identity, rotation, sessions,
/// the connection table, the BLE engine and the router.
pub struct MeshCore {
    router: Arc<Router>,
    service: Arc<BluetoothMeshService>,
    sessions: Arc<SessionManager>,
    identity: Arc<Identity>,
    store: Arc<StateStore>,
    stop_tx: watch::Sender<bool>,
}

impl MeshCore {
    /// Bring the core up: storage → identity → rotation → connection
    /// tracker → BLE engine → router.
    pub async fn start(config: Config) -> Result<Self> {
        Self::start_with_backend(config, Arc::new(NoopBackend)).await
    }

    /// Same as [`MeshCore::start`] with a platform peripheral backend.
    pub async fn start_with_backend(
        config: Config,
        backend: Arc<dyn PeripheralBackend>,
    ) -> Result<Self> {
        info!("starting mesh core (profile {:?})", config.power_profile);
        if config.tor_disabled {
            debug!("outer tor transport disabled by config");
        }

        // Storage, then identity: key material failure is fatal.
        let store = Arc::new(StateStore::new(&config.data_dir, config.master_key)?);
        let identity = Arc::new(
            store
                .load_or_create_identity()
                .map_err(|err| MeshError::IdentityKeyUnavailable(err.to_string()))
                .context("refusing to start without identity keys")?,
        );

        // Rotation schedule.
        let rotation = Arc::new(RotationSchedule::new(
            config.rotation_enabled,
            config.rotation_secret,
            identity.rotation_seed(),
            identity.static_peer_id(),
        ));

        // Connection tracker.
        let tracker = Arc::new(ConnectionTracker::new(
            config.power_profile.max_connections(),
        ));

        // Channels crossing the BLE/router boundary.
        let (inbound_tx, mut inbound_rx) = mpsc::channel::<InboundFrame>(INBOUND_QUEUE);
        let (outbound_tx, outbound_rx) = mpsc::channel::<OutboundFrame>(OUTBOUND_QUEUE);
        let (events_tx, mut events_rx) = mpsc::channel::<PeerEvent>(EVENT_QUEUE);
        let (stop_tx, stop_rx) = watch::channel(false);
        let cancelled: Arc<DashSet<u64>> = Arc::new(DashSet::new());

        // BLE engine.
        let peripheral_server = Arc::new(PeripheralServer::new(
            backend,
            Arc::clone(&tracker),
            inbound_tx.clone(),
        ));
        let service = Arc::new(BluetoothMeshService::new(
            Arc::clone(&tracker),
            Arc::clone(&peripheral_server),
            Arc::clone(&rotation),
            inbound_tx,
            events_tx,
            Arc::clone(&cancelled),
            stop_rx.clone(),
            config.power_profile,
        ));

        // Sessions and router.
        let sessions = Arc::new(SessionManager::new(Arc::clone(&identity)));
        let mut settings = store.load_settings();
        settings.nickname = config.nickname.clone();
        settings.power_profile = config.power_profile;
        let router = Arc::new(Router::new(
            Arc::clone(&identity),
            Arc::clone(&rotation),
            Arc::clone(&sessions),
            Arc::clone(&tracker),
            outbound_tx,
            Arc::clone(&cancelled),
            config.nickname.clone(),
        ));

        service.start(outbound_rx).await?;
        peripheral_server
            .advertise(rotation.current_service_uuid(protocol::packet::now_millis()))
            .ok();

        // Inbound pump: the dispatch task every frame and event runs on.
        {
            let router = Arc::clone(&router);
            let mut stop = stop_rx.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        frame = inbound_rx.recv() => match frame {
                            Some(frame) => router.handle_inbound(frame).await,
                            None => break,
                        },
                        _ = stop.changed() => break,
                    }
                }
                debug!("inbound pump drained");
            });
        }

        // Peer event pump: forwards BLE lifecycle events to observers and
        // announces on every fresh usable link.
        {
            let router = Arc::clone(&router);
            let mut stop = stop_rx.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        event = events_rx.recv() => match event {
                            Some(event) => {
                                let fresh_link =
                                    matches!(event, PeerEvent::Subscribed { .. });
                                router.emit_peer(event);
                                if fresh_link {
                                    if let Err(err) = router.announce().await {
                                        warn!("announce failed: {}", err);
                                    }
                                }
                            }
                            None => break,
                        },
                        _ = stop.changed() => break,
                    }
                }
            });
        }

        // Reaper: reassembly timeouts, handshake timeouts, rotation
        // bucket changes.
        {
            let router = Arc::clone(&router);
            let rotation = Arc::clone(&rotation);
            let store = Arc::clone(&store);
            let mut stop = stop_rx.clone();
            tokio::spawn(async move {
                let mut interval = time::interval(MAINTENANCE_TICK);
                let mut last_bucket =
                    RotationSchedule::bucket(protocol::packet::now_millis());
                loop {
                    tokio::select! {
                        _ = interval.tick() => {},
                        _ = stop.changed() => break,
                    }
                    router.sweep_reassembly();
                    router.sweep_handshakes();

                    let now = protocol::packet::now_millis();
                    let bucket = RotationSchedule::bucket(now);
                    if bucket != last_bucket {
                        last_bucket = bucket;
                        info!("rotation bucket advanced; re-announcing");
                        if let Err(err) = router.announce().await {
                            warn!("rotation announce failed: {}", err);
                        }
                        let mut settings = store.load_settings();
                        settings.last_ephemeral_id =
                            Some(rotation.ephemeral_peer_id(now).to_string());
                        settings.last_rotation_time = now;
                        if let Err(err) = store.save_settings(&settings) {
                            warn!("saving rotation state failed: {}", err);
                        }
                    }
                }
            });
        }

        // Persist the merged settings and announce ourselves.
        settings.last_rotation_time = protocol::packet::now_millis();
        settings.last_ephemeral_id = Some(
            rotation
                .ephemeral_peer_id(protocol::packet::now_millis())
                .to_string(),
        );
        if let Err(err) = store.save_settings(&settings) {
            warn!("saving settings failed: {}", err);
        }
        router.announce().await.ok();

        info!(
            "mesh core running as {} ({})",
            identity.fingerprint(),
            config.nickname
        );
        Ok(Self {
            router,
            service,
            sessions,
            identity,
            store,
            stop_tx,
        })
    }

    /// Drain and close everything: leave packet, stop signal, links.
    pub async fn stop(&self) {
        info!("stopping mesh core");
        self.router.leave().await.ok();
        let _ = self.stop_tx.send(true);
        self.service.shutdown().await;
    }

    /// Register message and peer-event callbacks; delivered on the
    /// dispatch task.
    pub fn subscribe<M, P>(&self, on_message: M, on_peer_event: P)
    where
        M: Fn(&MessageEvent) + Send + Sync + 'static,
        P: Fn(&PeerEvent) + Send + Sync + 'static,
    {
        self.router
            .add_observer(Arc::new(ClosureObserver::new(on_message, on_peer_event)));
    }

    /// Register a full observer implementation.
    pub fn add_observer(&self, observer: Arc<dyn MeshObserver>) {
        self.router.add_observer(observer);
    }

    /// Queue a broadcast payload for every reachable peer.
    pub async fn broadcast(&self, payload: Vec<u8>) -> MeshResult<TransferHandle> {
        self.router.broadcast(payload).await
    }

    /// Queue an end-to-end encrypted payload for one peer, establishing a
    /// Noise session first when needed.
    pub async fn send_private(
        &self,
        recipient: Fingerprint,
        payload: Vec<u8>,
    ) -> MeshResult<TransferHandle> {
        self.router.send_private(recipient, payload).await
    }

    /// Abort pending fragments of a queued transfer.
    pub fn cancel(&self, handle: TransferHandle) {
        self.router.cancel(handle);
    }

    /// Update the nickname (≤ 64 bytes) and announce it.
    pub async fn set_nickname(&self, nickname: impl Into<String>) -> MeshResult<()> {
        self.router.set_nickname(nickname.into()).await
    }

    /// This node's stable fingerprint.
    pub fn fingerprint(&self) -> Fingerprint {
        self.identity.fingerprint()
    }

    /// Noise session state for a peer, for UI surfaces.
    pub fn session_state(&self, fingerprint: &Fingerprint) -> crypto::SessionState {
        self.sessions.state_for(fingerprint)
    }

    /// Stop the core and atomically delete the identity and settings
    /// files. The next start generates fresh keys.
    pub async fn panic_wipe(&self) -> Result<()> {
        self.stop().await;
        self.store.panic_wipe()
    }
}
