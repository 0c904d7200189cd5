//! Reliable-transport leg adapter.
//!
//! Each session drives two independent ARQ instances — one per leg —
//! because the two legs see unrelated RTT and loss. The adapter wraps the
//! `kcp` primitive behind the small surface the session needs: feed inbound
//! canonical segments, drain complete payloads, enqueue outbound frames,
//! and tick retransmission. Outbound segments leave through a channel (the
//! socket writer task owns the actual send) after the leg's transport token
//! is reattached.

use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use kcp::Kcp;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

use relay_shared::config::ArqConfig;
use relay_shared::mux::{self, MuxError};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("arq: {0}")]
    Arq(#[from] kcp::Error),
    #[error(transparent)]
    Mux(#[from] MuxError),
}

/// Datagram handed to a socket writer task.
pub type OutboundDatagram = (SocketAddr, Bytes);

/// `Write` sink for the ARQ primitive: remultiplexes flushed segments into
/// wire records and forwards them to the leg's socket writer.
pub struct ChannelOutput {
    peer: SocketAddr,
    token: u32,
    tx: UnboundedSender<OutboundDatagram>,
}

impl io::Write for ChannelOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let records = mux::remultiplex(buf, self.token)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        // The writer task may already be gone during teardown; the bytes are
        // discarded with it.
        let _ = self.tx.send((self.peer, Bytes::from(records)));
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One leg's reliable transport instance.
pub struct ArqLeg {
    kcp: Kcp<ChannelOutput>,
    epoch: Instant,
    recv_buf: Vec<u8>,
}

impl ArqLeg {
    pub fn new(
        conv: u32,
        token: u32,
        peer: SocketAddr,
        tx: UnboundedSender<OutboundDatagram>,
        config: &ArqConfig,
    ) -> Result<Self, TransportError> {
        let output = ChannelOutput { peer, token, tx };
        let mut kcp = Kcp::new(conv, output);
        kcp.set_nodelay(true, 10, 2, true);
        kcp.set_wndsize(config.send_window, config.recv_window);
        kcp.set_mtu(config.mtu)?;
        Ok(Self {
            kcp,
            epoch: Instant::now(),
            recv_buf: vec![0; 64 * 1024],
        })
    }

    fn now_ms(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }

    /// Feeds an inbound canonical segment stream.
    pub fn feed(&mut self, canonical: &[u8]) -> Result<(), TransportError> {
        self.kcp.input(canonical)?;
        Ok(())
    }

    /// Drains every complete application payload. An empty result means
    /// nothing is ready yet; that is not an error.
    pub fn drain(&mut self) -> Vec<Bytes> {
        let mut payloads = Vec::new();
        loop {
            let Ok(size) = self.kcp.peeksize() else {
                break;
            };
            if self.recv_buf.len() < size {
                self.recv_buf.resize(size, 0);
            }
            match self.kcp.recv(&mut self.recv_buf) {
                Ok(n) => payloads.push(Bytes::copy_from_slice(&self.recv_buf[..n])),
                Err(_) => break,
            }
        }
        payloads
    }

    /// Queues one outbound application frame.
    pub fn enqueue(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.kcp.send(frame)?;
        Ok(())
    }

    /// Drives retransmission and pushes queued sends onto the wire.
    pub fn tick(&mut self) -> Result<(), TransportError> {
        let now = self.now_ms();
        self.kcp.update(now)?;
        self.kcp.flush()?;
        Ok(())
    }

    /// Number of frames not yet acknowledged by the peer.
    pub fn pending_sends(&self) -> usize {
        self.kcp.wait_snd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    fn leg(conv: u32, token: u32, tx: UnboundedSender<OutboundDatagram>) -> ArqLeg {
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        ArqLeg::new(conv, token, peer, tx, &ArqConfig::default()).expect("leg")
    }

    #[test]
    fn frames_cross_between_two_legs() {
        let (tx_a, mut rx_a) = unbounded_channel();
        let (tx_b, _rx_b) = unbounded_channel();
        let mut a = leg(7, 0xAABB_CCDD, tx_a);
        let mut b = leg(7, 0xAABB_CCDD, tx_b);

        a.enqueue(b"first frame").unwrap();
        a.enqueue(b"second frame").unwrap();
        a.tick().unwrap();

        let mut received = Vec::new();
        while let Ok((_, records)) = rx_a.try_recv() {
            let canonical = mux::demultiplex(&records).expect("demux");
            b.feed(&canonical).unwrap();
            received.extend(b.drain());
        }
        assert_eq!(received.len(), 2);
        assert_eq!(&received[0][..], b"first frame");
        assert_eq!(&received[1][..], b"second frame");
    }

    #[test]
    fn drain_on_idle_leg_is_empty_not_an_error() {
        let (tx, _rx) = unbounded_channel();
        let mut leg = leg(1, 0, tx);
        assert!(leg.drain().is_empty());
    }

    #[test]
    fn conv_mismatch_is_rejected_on_feed() {
        let (tx_a, mut rx_a) = unbounded_channel();
        let (tx_b, _rx_b) = unbounded_channel();
        let mut a = leg(7, 0, tx_a);
        let mut b = leg(8, 0, tx_b);

        a.enqueue(b"frame").unwrap();
        a.tick().unwrap();
        let (_, records) = rx_a.try_recv().expect("flushed records");
        let canonical = mux::demultiplex(&records).expect("demux");
        assert!(b.feed(&canonical).is_err());
    }

    #[test]
    fn pending_sends_counts_unacked_frames() {
        let (tx, _rx) = unbounded_channel();
        let mut leg = leg(1, 0, tx);
        assert_eq!(leg.pending_sends(), 0);
        leg.enqueue(b"one").unwrap();
        leg.enqueue(b"two").unwrap();
        assert_eq!(leg.pending_sends(), 2);
    }
}
