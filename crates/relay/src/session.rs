//! Session state, registry and lifecycle.
//!
//! One session binds a real client to a real server through the relay. Each
//! session runs as its own task owning all mutable state, so the two legs'
//! traffic can never interleave on the same session; everything else talks
//! to it through its event channel. The registry maps network identities to
//! those channels and owns create/lookup/destroy.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use relay_shared::handshake::{HANDSHAKE_LEN, HandshakeMessage};
use relay_shared::ids::{NetworkIdentity, ProtocolVersion};
use relay_shared::keys::KeySet;
use relay_shared::mux;

use crate::RelayContext;
use crate::handshake::connect_request;
use crate::translate::Direction;
use crate::transport::{ArqLeg, OutboundDatagram};

/// Mutable per-session translation state. Owned by the session task and
/// borrowed mutably by the translator and hooks.
pub struct SessionState {
    pub identity: NetworkIdentity,
    /// Pinned from the first version-identifying packet the client sends.
    pub protocol: Option<ProtocolVersion>,
    /// True once the key rotation has happened.
    pub post: bool,
    client_key: Arc<Vec<u8>>,
    server_key: Arc<Vec<u8>>,
    keys: KeySet,
}

impl SessionState {
    pub fn new(identity: NetworkIdentity, keys: KeySet) -> Self {
        Self {
            identity,
            protocol: None,
            post: false,
            client_key: keys.initial.clone(),
            server_key: keys.initial.clone(),
            keys,
        }
    }

    /// Active key on the client leg.
    pub fn client_key(&self) -> Arc<Vec<u8>> {
        self.client_key.clone()
    }

    /// Active key on the server leg.
    pub fn server_key(&self) -> Arc<Vec<u8>> {
        self.server_key.clone()
    }

    /// Switches to post-handshake keys. At most once per session; later
    /// calls are ignored.
    pub fn rotate(&mut self, derived: Vec<u8>) {
        if self.post {
            return;
        }
        self.server_key = Arc::new(derived);
        self.client_key = self.keys.post.clone();
        self.post = true;
        debug!(target: "relay::net::session", "{} rotated to session keys", self.identity);
    }
}

/// Frames translated before the upstream leg finished negotiating. Bounded;
/// overflow drops the oldest entry so a stalled handshake cannot grow
/// memory without limit.
pub struct PendingQueue {
    items: VecDeque<Bytes>,
    cap: usize,
}

impl PendingQueue {
    pub fn new(cap: usize) -> Self {
        Self {
            items: VecDeque::new(),
            cap: cap.max(1),
        }
    }

    /// Appends a frame, returning the dropped oldest entry on overflow.
    pub fn push(&mut self, frame: Bytes) -> Option<Bytes> {
        let dropped = if self.items.len() >= self.cap {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(frame);
        dropped
    }

    /// Removes and returns all queued frames in arrival order.
    pub fn drain(&mut self) -> Vec<Bytes> {
        self.items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Events delivered to a session task.
#[derive(Debug)]
pub enum SessionEvent {
    /// Raw data datagram from the client.
    FromClient(Bytes),
    /// Raw data datagram from the server.
    FromServer(Bytes),
    /// Handshake reply on the upstream socket.
    UpstreamHandshake(HandshakeMessage),
    Tick(Leg),
    Shutdown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Leg {
    Downstream,
    Upstream,
}

/// Cheap clonable address of a session task.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    tx: UnboundedSender<SessionEvent>,
}

impl SessionHandle {
    pub fn new(tx: UnboundedSender<SessionEvent>) -> Self {
        Self { tx }
    }

    /// Delivers an event; false if the session task is already gone.
    pub fn send(&self, event: SessionEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Owns every live session, keyed by network identity.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<NetworkIdentity, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lookup(&self, identity: NetworkIdentity) -> Option<SessionHandle> {
        self.sessions.read().await.get(&identity).cloned()
    }

    /// Returns the session for `identity`, creating it on first contact.
    pub async fn ensure(
        &self,
        identity: NetworkIdentity,
        wire_token: u32,
        ctx: &Arc<RelayContext>,
    ) -> SessionHandle {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(identity)
            .or_insert_with(|| {
                info!(target: "relay::net::session", "new session {identity}");
                spawn_session(identity, wire_token, ctx.clone())
            })
            .clone()
    }

    /// Removes the session and tells its task to stop. Returns false if the
    /// identity was unknown.
    pub async fn destroy(&self, identity: NetworkIdentity) -> bool {
        let Some(handle) = self.sessions.write().await.remove(&identity) else {
            return false;
        };
        handle.send(SessionEvent::Shutdown);
        info!(target: "relay::net::session", "session {identity} destroyed");
        true
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// Spawns the session task and returns its handle.
pub fn spawn_session(
    identity: NetworkIdentity,
    wire_token: u32,
    ctx: Arc<RelayContext>,
) -> SessionHandle {
    let (tx, rx) = unbounded_channel();
    let handle = SessionHandle::new(tx.clone());
    tokio::spawn(async move {
        if let Err(err) = run_session(identity, wire_token, ctx, tx, rx).await {
            warn!(target: "relay::net::session", "session {identity} ended: {err:#}");
        }
    });
    handle
}

struct Session {
    state: SessionState,
    downstream: ArqLeg,
    upstream: Option<ArqLeg>,
    established: bool,
    /// Set after an upstream protocol error; the leg is not retried.
    upstream_closed: bool,
    pending: PendingQueue,
    ctx: Arc<RelayContext>,
    upstream_tx: UnboundedSender<OutboundDatagram>,
}

async fn run_session(
    identity: NetworkIdentity,
    wire_token: u32,
    ctx: Arc<RelayContext>,
    events_tx: UnboundedSender<SessionEvent>,
    mut events_rx: UnboundedReceiver<SessionEvent>,
) -> anyhow::Result<()> {
    let downstream = ArqLeg::new(
        identity.conv,
        wire_token,
        identity.addr,
        ctx.downstream_tx.clone(),
        &ctx.config.transport,
    )?;

    // The upstream leg gets its own socket: independent RTT, loss and
    // conv/token from the real server.
    let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
    socket.connect(ctx.config.upstream_addr).await?;

    let (upstream_tx, upstream_rx) = unbounded_channel();
    let mut tasks = vec![
        spawn_upstream_writer(socket.clone(), upstream_rx),
        spawn_upstream_reader(socket.clone(), identity, events_tx.clone()),
        spawn_ticker(Leg::Downstream, &ctx, events_tx.clone()),
        spawn_ticker(Leg::Upstream, &ctx, events_tx.clone()),
    ];

    // Open the upstream negotiation right away; data waits in the pending
    // queue until the server answers.
    socket.send(&connect_request(identity.conv).encode()).await?;
    debug!(target: "relay::net::session", "{identity} sent upstream connect");

    let mut session = Session {
        state: SessionState::new(identity, ctx.keys.clone()),
        downstream,
        upstream: None,
        established: false,
        upstream_closed: false,
        pending: PendingQueue::new(ctx.config.pending_queue_cap),
        ctx,
        upstream_tx,
    };

    while let Some(event) = events_rx.recv().await {
        if !session.handle_event(event).await {
            break;
        }
    }

    for task in tasks.drain(..) {
        task.abort();
    }
    Ok(())
}

fn spawn_upstream_writer(
    socket: Arc<UdpSocket>,
    mut rx: UnboundedReceiver<OutboundDatagram>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some((_, datagram)) = rx.recv().await {
            if let Err(err) = socket.send(&datagram).await {
                warn!(target: "relay::net::session", "upstream send failed: {err}");
                break;
            }
        }
    })
}

fn spawn_upstream_reader(
    socket: Arc<UdpSocket>,
    identity: NetworkIdentity,
    events: UnboundedSender<SessionEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = match socket.recv(&mut buf).await {
                Ok(n) => n,
                Err(err) => {
                    warn!(target: "relay::net::session", "{identity} upstream recv failed: {err}");
                    break;
                }
            };
            let event = if n <= HANDSHAKE_LEN {
                match HandshakeMessage::decode(&buf[..n]) {
                    Ok(msg) => SessionEvent::UpstreamHandshake(msg),
                    Err(err) => {
                        warn!(
                            target: "relay::net::handshake",
                            "{identity} bad upstream handshake: {err}"
                        );
                        continue;
                    }
                }
            } else {
                SessionEvent::FromServer(Bytes::copy_from_slice(&buf[..n]))
            };
            if events.send(event).is_err() {
                break;
            }
        }
    })
}

fn spawn_ticker(
    leg: Leg,
    ctx: &Arc<RelayContext>,
    events: UnboundedSender<SessionEvent>,
) -> JoinHandle<()> {
    let period = Duration::from_millis(ctx.config.transport.tick_interval_ms.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if events.send(SessionEvent::Tick(leg)).is_err() {
                break;
            }
        }
    })
}

impl Session {
    /// Handles one event; false ends the session.
    async fn handle_event(&mut self, event: SessionEvent) -> bool {
        match event {
            SessionEvent::FromClient(raw) => self.on_datagram(&raw, Direction::FromClient),
            SessionEvent::FromServer(raw) => self.on_datagram(&raw, Direction::FromServer),
            SessionEvent::UpstreamHandshake(msg) => self.on_upstream_handshake(msg).await,
            SessionEvent::Tick(leg) => self.on_tick(leg),
            SessionEvent::Shutdown => return false,
        }
        true
    }

    fn on_datagram(&mut self, raw: &[u8], direction: Direction) {
        let identity = self.state.identity;
        let canonical = match mux::demultiplex(raw) {
            Ok(canonical) => canonical,
            Err(err) => {
                warn!(target: "relay::net::session", "{identity} bad datagram: {err}");
                return;
            }
        };

        let leg = match direction {
            Direction::FromClient => Some(&mut self.downstream),
            Direction::FromServer => self.upstream.as_mut(),
        };
        let Some(leg) = leg else {
            warn!(
                target: "relay::net::session",
                "{identity} data from server before establishment, dropped"
            );
            return;
        };
        if let Err(err) = leg.feed(&canonical) {
            warn!(target: "relay::net::session", "{identity} feed failed: {err}");
            return;
        }
        if let Err(err) = leg.tick() {
            warn!(target: "relay::net::session", "{identity} tick failed: {err}");
        }

        let payloads = leg.drain();
        for payload in payloads {
            match self
                .ctx
                .translator
                .translate(&payload, direction, &mut self.state)
            {
                Ok(frame) => self.forward(frame, direction),
                // Packet-scoped by design: the session survives every
                // translation failure.
                Err(err) => {
                    warn!(target: "relay::net::translate", "{identity} packet dropped: {err}");
                }
            }
        }
    }

    fn forward(&mut self, frame: Vec<u8>, direction: Direction) {
        let identity = self.state.identity;
        match direction {
            Direction::FromClient => {
                if self.established
                    && let Some(upstream) = self.upstream.as_mut()
                {
                    if let Err(err) = upstream.enqueue(&frame) {
                        warn!(target: "relay::net::session", "{identity} upstream enqueue: {err}");
                    }
                } else if self.pending.push(Bytes::from(frame)).is_some() {
                    warn!(
                        target: "relay::net::session",
                        "{identity} pending queue full, dropped oldest frame"
                    );
                }
            }
            Direction::FromServer => {
                if let Err(err) = self.downstream.enqueue(&frame) {
                    warn!(target: "relay::net::session", "{identity} downstream enqueue: {err}");
                }
            }
        }
    }

    async fn on_upstream_handshake(&mut self, msg: HandshakeMessage) {
        use relay_shared::handshake::HandshakeKind;

        let identity = self.state.identity;
        if self.upstream_closed {
            return;
        }
        match msg.kind {
            HandshakeKind::Initialize if !self.established => {
                let leg = ArqLeg::new(
                    msg.conv,
                    msg.token,
                    self.ctx.config.upstream_addr,
                    self.upstream_tx.clone(),
                    &self.ctx.config.transport,
                );
                match leg {
                    Ok(leg) => {
                        info!(
                            target: "relay::net::handshake",
                            "{identity} upstream established (conv {:#x})", msg.conv
                        );
                        self.upstream = Some(leg);
                        self.established = true;
                        let delay = self.ctx.config.drain_delay_ms;
                        if delay > 0 {
                            tokio::time::sleep(Duration::from_millis(delay)).await;
                        }
                        self.drain_pending();
                    }
                    Err(err) => {
                        error!(
                            target: "relay::net::handshake",
                            "{identity} upstream leg setup failed: {err}"
                        );
                        self.upstream_closed = true;
                    }
                }
            }
            HandshakeKind::Initialize => {
                debug!(target: "relay::net::handshake", "{identity} duplicate initialize ignored");
            }
            other => {
                // Protocol error: close the upstream leg, no automatic retry.
                error!(
                    target: "relay::net::handshake",
                    "{identity} unexpected upstream handshake {other:?}, closing leg"
                );
                self.upstream = None;
                self.established = false;
                self.upstream_closed = true;
            }
        }
    }

    /// Flushes frames queued before establishment, once, in arrival order.
    fn drain_pending(&mut self) {
        let Some(upstream) = self.upstream.as_mut() else {
            return;
        };
        let frames = self.pending.drain();
        let count = frames.len();
        for frame in frames {
            if let Err(err) = upstream.enqueue(&frame) {
                warn!(
                    target: "relay::net::session",
                    "{} queued frame lost: {err}", self.state.identity
                );
            }
        }
        if count > 0 {
            debug!(
                target: "relay::net::session",
                "{} drained {count} queued frames", self.state.identity
            );
            if let Err(err) = upstream.tick() {
                warn!(target: "relay::net::session", "{} tick failed: {err}", self.state.identity);
            }
        }
    }

    fn on_tick(&mut self, leg: Leg) {
        let leg = match leg {
            Leg::Downstream => Some(&mut self.downstream),
            Leg::Upstream => self.upstream.as_mut(),
        };
        if let Some(leg) = leg
            && let Err(err) = leg.tick()
        {
            warn!(target: "relay::net::session", "{} tick failed: {err}", self.state.identity);
        }
    }
}
