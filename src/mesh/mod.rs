//! Mesh Layer
//!
//! The relay/dedup policy, the typed event surface and the router facade
//! that ties codec, fragmentation, Noise and the BLE engine together.

pub mod events;
pub mod relay;
pub mod router;

pub use events::{ClosureObserver, MessageEvent, MeshObserver, PeerEvent};
pub use relay::{dedup_key, evaluate, RelayAction, SeenCache};
pub use router::{Router, TransferHandle};
