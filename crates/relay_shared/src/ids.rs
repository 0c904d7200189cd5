//! Strongly typed identifiers for sessions and protocol dialects.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Uniquely keys one relayed session.
///
/// `conv` is the conversation id embedded in the first four bytes of every
/// data datagram (little-endian on the wire). Handshake datagrams carry the
/// same value in their big-endian `conv` field, so both paths resolve to the
/// same identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NetworkIdentity {
    pub addr: SocketAddr,
    pub conv: u32,
}

impl NetworkIdentity {
    pub const fn new(addr: SocketAddr, conv: u32) -> Self {
        Self { addr, conv }
    }

    /// Derives the identity of a data datagram from its source address and
    /// leading conversation id.
    pub fn from_datagram(addr: SocketAddr, datagram: &[u8]) -> Option<Self> {
        let conv = datagram.get(..4)?;
        let conv = u32::from_le_bytes([conv[0], conv[1], conv[2], conv[3]]);
        Some(Self { addr, conv })
    }
}

impl fmt::Display for NetworkIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{:08x}", self.addr, self.conv)
    }
}

/// A protocol dialect, as declared in configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolVersion(u16);

impl ProtocolVersion {
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u16 {
        self.0
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self(0)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_from_datagram_reads_le_conv() {
        let addr: SocketAddr = "127.0.0.1:22102".parse().unwrap();
        let datagram = [0x78, 0x56, 0x34, 0x12, 0xFF, 0xFF];
        let id = NetworkIdentity::from_datagram(addr, &datagram).unwrap();
        assert_eq!(id.conv, 0x1234_5678);
        assert_eq!(id.addr, addr);
    }

    #[test]
    fn identity_requires_four_bytes() {
        let addr: SocketAddr = "127.0.0.1:22102".parse().unwrap();
        assert!(NetworkIdentity::from_datagram(addr, &[1, 2, 3]).is_none());
    }
}
