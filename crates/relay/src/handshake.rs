//! Handshake negotiation.
//!
//! The relay plays both roles: acceptor toward the real client (answering
//! its CONNECT/DISCONNECT datagrams) and initiator toward the real server
//! (opening each session's upstream leg). The pure request/reply logic
//! lives here; delivery and session bookkeeping stay with the endpoint and
//! the session task.

use relay_shared::handshake::{HandshakeKind, HandshakeMessage};

/// XORed with the low 32 bits of the current time to form the acceptor's
/// transport token.
pub const TOKEN_MASK: u32 = 0xFFCC_EEBB;

/// Literal carried in the initiator's CONNECT `data` field; the server
/// echoes it nowhere but expects it on the wire.
pub const CONNECT_SENTINEL: u32 = 1_234_567_890;

/// Acceptor: computes the reply for an inbound handshake, if any.
///
/// CONNECT gets an INITIALIZE whose conv is the current time and whose
/// token mixes the same instant; repeated CONNECTs simply get a fresh
/// reply, existing session state is never touched. DISCONNECT is echoed so
/// the client knows it may drop its side. Anything else is dropped by the
/// caller.
pub fn accept(msg: &HandshakeMessage, now_ms: u64) -> Option<HandshakeMessage> {
    match msg.kind {
        HandshakeKind::Connect => {
            let conv = now_ms as u32;
            Some(HandshakeMessage::new(
                HandshakeKind::Initialize,
                conv,
                TOKEN_MASK ^ conv,
                0,
            ))
        }
        HandshakeKind::Disconnect => Some(HandshakeMessage::new(
            HandshakeKind::Disconnect,
            msg.conv,
            msg.token,
            0,
        )),
        HandshakeKind::Initialize => None,
    }
}

/// Initiator: the CONNECT opening a session's upstream leg, carrying the
/// client-facing conv.
pub fn connect_request(conv: u32) -> HandshakeMessage {
    HandshakeMessage::new(HandshakeKind::Connect, conv, 0, CONNECT_SENTINEL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_shared::handshake::MAGIC_INITIALIZE;

    #[test]
    fn connect_yields_initialize_with_timestamp_conv() {
        let connect = HandshakeMessage::new(HandshakeKind::Connect, 0, 0, 0);
        let now_ms = 1_700_000_123_456u64;
        let reply = accept(&connect, now_ms).expect("reply");

        assert_eq!(reply.kind, HandshakeKind::Initialize);
        assert_eq!(reply.conv, now_ms as u32);
        assert_eq!(reply.token, TOKEN_MASK ^ now_ms as u32);

        let wire = reply.encode();
        let magic2 = u32::from_be_bytes(wire[16..20].try_into().unwrap());
        assert_eq!(magic2, MAGIC_INITIALIZE.1);
        assert_eq!(magic2, 0x1451_4545);
    }

    #[test]
    fn disconnect_is_echoed() {
        let disconnect = HandshakeMessage::new(HandshakeKind::Disconnect, 77, 88, 0);
        let reply = accept(&disconnect, 0).expect("reply");
        assert_eq!(reply.kind, HandshakeKind::Disconnect);
        assert_eq!(reply.conv, 77);
    }

    #[test]
    fn stray_initialize_gets_no_reply() {
        let msg = HandshakeMessage::new(HandshakeKind::Initialize, 1, 2, 3);
        assert!(accept(&msg, 0).is_none());
    }

    #[test]
    fn connect_request_carries_conv_and_sentinel() {
        let msg = connect_request(0xAB12_CD34);
        assert_eq!(msg.kind, HandshakeKind::Connect);
        assert_eq!(msg.conv, 0xAB12_CD34);
        assert_eq!(msg.data, CONNECT_SENTINEL);
    }
}
