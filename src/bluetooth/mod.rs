//! Bluetooth LE Engine
//!
//! Scanner, advertiser and the paired central/peripheral GATT state
//! machines, plus the connection tracker that rations attempts. Frames
//! cross the boundary to the router as [`InboundFrame`]s and come back as
//! [`OutboundFrame`]s on a queue, so no BLE call ever happens inside a
//! BLE callback.

pub mod connection_tracker;
pub mod mesh_service;
pub mod peripheral;

pub use connection_tracker::{ConnectionTracker, Link, LinkRole, LinkState};
pub use mesh_service::BluetoothMeshService;
pub use peripheral::{
    LoopbackBackend, NoopBackend, PeripheralBackend, PeripheralEvent, PeripheralServer,
};

use crate::protocol::PeerId;

/// Identifies one physical link: device address plus our GATT role on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LinkKey {
    pub address: String,
    pub role: LinkRole,
}

/// A frame received from the radio, before any decoding.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub address: String,
    pub role: LinkRole,
    pub bytes: Vec<u8>,
}

impl InboundFrame {
    pub fn link_key(&self) -> LinkKey {
        LinkKey {
            address: self.address.clone(),
            role: self.role,
        }
    }
}

/// Where an outbound frame should go.
#[derive(Debug, Clone)]
pub enum OutboundTarget {
    /// Every ready link, optionally excluding the one a relayed frame
    /// arrived on.
    AllLinks { except: Option<LinkKey> },
    /// One specific link.
    Link(LinkKey),
    /// Whichever link is bound to this on-wire peer ID.
    Peer(PeerId),
}

/// An encoded frame queued for transmission.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub target: OutboundTarget,
    pub bytes: Vec<u8>,
    /// Local transfer handle, consulted against the cancel registry right
    /// before the write.
    pub handle: Option<u64>,
}
