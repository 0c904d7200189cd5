//! Connection handshake codec.
//!
//! Handshakes are exactly 20 bytes: five big-endian u32 fields
//! `magic1 | conv | token | data | magic2`. The magic pair selects the kind;
//! anything unrecognized is rejected so the caller can log and drop it
//! without touching session state.

use thiserror::Error;

/// Wire size of every handshake datagram.
pub const HANDSHAKE_LEN: usize = 20;

/// Magic pairs (magic1, magic2) for the three recognized handshake kinds.
pub const MAGIC_CONNECT: (u32, u32) = (0xFF, 0xFFFF_FFFF);
pub const MAGIC_INITIALIZE: (u32, u32) = (0x145, 0x1451_4545);
pub const MAGIC_DISCONNECT: (u32, u32) = (0x194, 0x1941_9494);

/// Recognized handshake kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeKind {
    Connect,
    Initialize,
    Disconnect,
}

impl HandshakeKind {
    const fn magic(self) -> (u32, u32) {
        match self {
            Self::Connect => MAGIC_CONNECT,
            Self::Initialize => MAGIC_INITIALIZE,
            Self::Disconnect => MAGIC_DISCONNECT,
        }
    }

    fn from_magic(magic1: u32, magic2: u32) -> Option<Self> {
        match (magic1, magic2) {
            MAGIC_CONNECT => Some(Self::Connect),
            MAGIC_INITIALIZE => Some(Self::Initialize),
            MAGIC_DISCONNECT => Some(Self::Disconnect),
            _ => None,
        }
    }
}

/// Decode/encode failures for handshake datagrams.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake must be exactly {HANDSHAKE_LEN} bytes, got {0}")]
    Length(usize),
    #[error("unrecognized handshake magic {0:#x}/{1:#x}")]
    UnknownMagic(u32, u32),
}

/// One decoded handshake datagram.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandshakeMessage {
    pub kind: HandshakeKind,
    pub conv: u32,
    pub token: u32,
    pub data: u32,
}

impl HandshakeMessage {
    pub const fn new(kind: HandshakeKind, conv: u32, token: u32, data: u32) -> Self {
        Self {
            kind,
            conv,
            token,
            data,
        }
    }

    /// Decodes a handshake from its 20-byte wire form.
    pub fn decode(buf: &[u8]) -> Result<Self, HandshakeError> {
        if buf.len() != HANDSHAKE_LEN {
            return Err(HandshakeError::Length(buf.len()));
        }
        let field = |i: usize| u32::from_be_bytes(buf[i..i + 4].try_into().unwrap());
        let magic1 = field(0);
        let magic2 = field(16);
        let kind = HandshakeKind::from_magic(magic1, magic2)
            .ok_or(HandshakeError::UnknownMagic(magic1, magic2))?;
        Ok(Self {
            kind,
            conv: field(4),
            token: field(8),
            data: field(12),
        })
    }

    /// Encodes the handshake into its 20-byte wire form.
    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let (magic1, magic2) = self.kind.magic();
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0..4].copy_from_slice(&magic1.to_be_bytes());
        buf[4..8].copy_from_slice(&self.conv.to_be_bytes());
        buf[8..12].copy_from_slice(&self.token.to_be_bytes());
        buf[12..16].copy_from_slice(&self.data.to_be_bytes());
        buf[16..20].copy_from_slice(&magic2.to_be_bytes());
        buf
    }

    /// Returns true for datagrams short enough to be a handshake at all.
    pub fn is_candidate(datagram: &[u8]) -> bool {
        datagram.len() <= HANDSHAKE_LEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_all_kinds() {
        for kind in [
            HandshakeKind::Connect,
            HandshakeKind::Initialize,
            HandshakeKind::Disconnect,
        ] {
            let msg = HandshakeMessage::new(kind, 0xDEAD_BEEF, 0x1234, 42);
            let decoded = HandshakeMessage::decode(&msg.encode()).expect("decode");
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn encode_preserves_conv_and_token() {
        // The reply's conv/token must survive the wire; a peer validates both.
        let msg = HandshakeMessage::new(HandshakeKind::Initialize, 0x0102_0304, 0xAABB_CCDD, 0);
        let wire = msg.encode();
        assert_eq!(&wire[4..8], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&wire[8..12], &[0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(&wire[16..20], &[0x14, 0x51, 0x45, 0x45]);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(matches!(
            HandshakeMessage::decode(&[0u8; 19]),
            Err(HandshakeError::Length(19))
        ));
        assert!(matches!(
            HandshakeMessage::decode(&[0u8; 21]),
            Err(HandshakeError::Length(21))
        ));
    }

    #[test]
    fn rejects_unknown_magic() {
        let mut wire = HandshakeMessage::new(HandshakeKind::Connect, 1, 2, 3).encode();
        wire[0] = 0x77;
        assert!(matches!(
            HandshakeMessage::decode(&wire),
            Err(HandshakeError::UnknownMagic(..))
        ));
    }
}
