//! Shared protocol primitives for the relay.
//!
//! This crate hosts everything both halves of a relayed session agree on,
//! with no I/O of its own:
//! - handshake: the 20-byte connection handshake codec
//! - mux: wire-record ↔ canonical ARQ segment conversion
//! - framing: application frame layout, validation and XOR crypto
//! - keys: bootstrap key material and session-key derivation
//! - tables: per-dialect packet-id tables and version pinning
//! - config: relay configuration (TOML + environment overrides)
//!
//! Keep this crate lean: anything that touches sockets, timers or tasks
//! belongs in the `relay` crate.

pub mod config;
pub mod framing;
pub mod handshake;
pub mod ids;
pub mod keys;
pub mod mux;
pub mod tables;

/// Convenience prelude for downstream crates.
pub mod prelude {
    pub use crate::config::RelayConfig;
    pub use crate::framing::{FrameLayout, FramingError, HEAD_MAGIC, TAIL_MAGIC};
    pub use crate::handshake::{HandshakeKind, HandshakeMessage};
    pub use crate::ids::{NetworkIdentity, ProtocolVersion};
    pub use crate::keys::KeySet;
    pub use crate::tables::TableSet;
}
