//! UDP endpoint: the relay's listening socket and dispatch loop.
//!
//! Datagrams of at most 20 bytes are handshakes and answered inline;
//! everything longer is a transport record routed to its session's task.
//! All downstream sends flow through one writer task so session tasks never
//! block on socket I/O.

use std::sync::Arc;

use anyhow::Context as _;
use bytes::Bytes;
use time::OffsetDateTime;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
use tracing::{debug, info, warn};

use relay_shared::config::RelayConfig;
use relay_shared::handshake::{HandshakeKind, HandshakeMessage};
use relay_shared::ids::NetworkIdentity;
use relay_shared::keys::KeySet;
use relay_shared::tables::TableSet;

use crate::RelayContext;
use crate::codec::DescriptorCodec;
use crate::handshake::accept;
use crate::hooks::HookRegistry;
use crate::session::{SessionEvent, SessionRegistry};
use crate::translate::Translator;
use crate::transport::OutboundDatagram;

/// Builds the shared context and runs the relay until the socket dies.
pub async fn run(config: RelayConfig) -> anyhow::Result<()> {
    let keys = KeySet::load(&config.keys.initial, &config.keys.post)
        .context("loading bootstrap keys")?;
    let tables = Arc::new(
        TableSet::load(&config.versions, &config.pin_message).context("loading packet tables")?,
    );
    let codec = Arc::new(DescriptorCodec::new(
        config
            .versions
            .iter()
            .map(|v| (v.version, v.schema_root.clone())),
    ));
    let hooks = HookRegistry::with_builtins(config.account.clone());
    let translator = Arc::new(Translator::new(
        tables.clone(),
        codec,
        hooks,
        keys.clone(),
        config.seed_message.clone(),
        config.log_blacklist.iter().cloned(),
    ));

    let socket = Arc::new(
        UdpSocket::bind(config.listen_addr)
            .await
            .with_context(|| format!("binding {}", config.listen_addr))?,
    );
    info!(target: "relay::net", "listening on {}", socket.local_addr()?);
    info!(target: "relay::net", "relaying to {}", config.upstream_addr);

    let (downstream_tx, downstream_rx) = unbounded_channel();
    tokio::spawn(downstream_writer(socket.clone(), downstream_rx));

    let ctx = Arc::new(RelayContext {
        config,
        tables,
        translator,
        keys,
        downstream_tx,
    });
    let registry = SessionRegistry::new();

    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let (n, peer) = socket.recv_from(&mut buf).await.context("udp recv")?;
        handle_datagram(&ctx, &registry, peer, &buf[..n]).await;
    }
}

async fn downstream_writer(socket: Arc<UdpSocket>, mut rx: UnboundedReceiver<OutboundDatagram>) {
    while let Some((addr, datagram)) = rx.recv().await {
        if let Err(err) = socket.send_to(&datagram, addr).await {
            warn!(target: "relay::net", "send to {addr} failed: {err}");
        }
    }
}

async fn handle_datagram(
    ctx: &Arc<RelayContext>,
    registry: &SessionRegistry,
    peer: std::net::SocketAddr,
    datagram: &[u8],
) {
    if HandshakeMessage::is_candidate(datagram) {
        handle_handshake(ctx, registry, peer, datagram).await;
        return;
    }

    let Some(identity) = NetworkIdentity::from_datagram(peer, datagram) else {
        return;
    };
    let wire_token = u32::from_le_bytes(datagram[4..8].try_into().unwrap());
    let handle = registry.ensure(identity, wire_token, ctx).await;
    if !handle.send(SessionEvent::FromClient(Bytes::copy_from_slice(datagram))) {
        // The task raced a teardown; the next datagram recreates it.
        debug!(target: "relay::net::session", "{identity} event after teardown dropped");
    }
}

async fn handle_handshake(
    ctx: &Arc<RelayContext>,
    registry: &SessionRegistry,
    peer: std::net::SocketAddr,
    datagram: &[u8],
) {
    let msg = match HandshakeMessage::decode(datagram) {
        Ok(msg) => msg,
        // Unrecognized handshakes are logged and dropped, never answered.
        Err(err) => {
            warn!(target: "relay::net::handshake", "from {peer}: {err}");
            return;
        }
    };

    if msg.kind == HandshakeKind::Disconnect {
        let identity = NetworkIdentity::new(peer, msg.conv);
        if registry.destroy(identity).await {
            debug!(target: "relay::net::handshake", "{identity} disconnected by client");
        }
    }

    match accept(&msg, unix_ms()) {
        Some(reply) => {
            let _ = ctx
                .downstream_tx
                .send((peer, Bytes::copy_from_slice(&reply.encode())));
            debug!(target: "relay::net::handshake", "{:?} from {peer} answered", msg.kind);
        }
        None => {
            warn!(target: "relay::net::handshake", "unexpected {:?} from {peer}, dropped", msg.kind);
        }
    }
}

fn unix_ms() -> u64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datagram_size_splits_handshakes_from_records() {
        assert!(HandshakeMessage::is_candidate(&[0u8; 20]));
        assert!(HandshakeMessage::is_candidate(&[0u8; 8]));
        assert!(!HandshakeMessage::is_candidate(&[0u8; 21]));
    }
}
