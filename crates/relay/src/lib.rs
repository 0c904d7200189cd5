//! Protocol-version-translating relay.
//!
//! The relay terminates a reliable-ARQ-over-UDP session independently with
//! a real client and a real server, decrypts and decodes application
//! frames, remaps their packet ids through a canonical hub dialect, runs
//! optional per-message mutation hooks, and re-encodes for the opposite
//! side. Module map:
//! - endpoint: listening socket, dispatch, downstream writer
//! - session: per-session task, registry, lifecycle
//! - transport: reliable-ARQ leg adapter
//! - handshake: acceptor/initiator negotiation
//! - translate: decrypt → remap → decode → hook → encode pipeline
//! - codec: schema codec seam (descriptor-pool default)
//! - hooks: per-message mutation hook registry

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;

use relay_shared::config::RelayConfig;
use relay_shared::keys::KeySet;
use relay_shared::tables::TableSet;

pub mod codec;
pub mod endpoint;
pub mod handshake;
pub mod hooks;
pub mod session;
pub mod translate;
pub mod transport;

pub use endpoint::run;

/// Immutable state shared by the endpoint and every session task.
pub struct RelayContext {
    pub config: RelayConfig,
    pub tables: Arc<TableSet>,
    pub translator: Arc<translate::Translator>,
    pub keys: KeySet,
    /// Sink of the main socket's writer task; downstream ARQ legs send
    /// through it.
    pub downstream_tx: UnboundedSender<transport::OutboundDatagram>,
}
