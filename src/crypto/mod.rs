//! Cryptography
//!
//! Long-lived identity keys, the hourly rotation schedule, the Noise XX
//! primitives and the per-peer session manager built on top of them.

pub mod identity;
pub mod noise;
pub mod rotation;
pub mod session_manager;

pub use identity::{Fingerprint, Identity};
pub use noise::{CipherState, HandshakeState, Role, TransportPair, REKEY_NONCE_THRESHOLD};
pub use rotation::{RotationSchedule, BUCKET_MILLIS, OVERLAP_WINDOW_MILLIS};
pub use session_manager::{
    HandshakeOutcome, SessionManager, SessionState, FAILURE_LIMIT, FAILURE_WINDOW,
    HANDSHAKE_TIMEOUT,
};
