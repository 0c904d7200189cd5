//! Application frame codec.
//!
//! Frames travel XOR-encrypted inside ARQ payloads:
//!
//! ```text
//! 0x4567 | packet id | head len | payload len | head | payload | 0x89AB
//!  u16be    u16be       u16be       u32be       ...     ...      u16be
//! ```
//!
//! Older dialect generations used byte offsets instead of the explicit
//! length fields; which parser applies is a per-dialect configuration
//! choice, never a guess (see [`FrameLayout`]).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Leading frame magic (big-endian u16 at offset 0).
pub const HEAD_MAGIC: u16 = 0x4567;

/// Trailing frame magic (big-endian u16 in the last two bytes).
pub const TAIL_MAGIC: u16 = 0x89AB;

/// Fixed bytes around head and payload: two magics, id, and length fields.
pub const FRAME_OVERHEAD: usize = 12;

/// Parser strategy for a dialect generation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameLayout {
    /// Explicit big-endian head (u16) and payload (u32) length fields.
    #[default]
    LengthPrefixed,
    /// Single-byte offsets as used by the oldest observed generation: head
    /// length in byte 5, a secondary skip in byte 6, and the last four
    /// bytes of the frame dropped.
    Legacy,
}

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("frame too short ({0} bytes)")]
    Truncated(usize),
    #[error("bad frame magic (head {head:#06x}, tail {tail:#06x})")]
    BadMagic { head: u16, tail: u16 },
    #[error("frame length fields inconsistent (head {head}, payload {payload}, frame {frame})")]
    Lengths {
        head: usize,
        payload: usize,
        frame: usize,
    },
}

/// Borrowed view into a parsed (already decrypted) frame.
#[derive(Debug, PartialEq, Eq)]
pub struct ParsedFrame<'a> {
    pub id: u16,
    pub head: &'a [u8],
    pub payload: &'a [u8],
}

/// In-place XOR with a cyclically repeated key. Self-inverse.
pub fn xor_in_place(buf: &mut [u8], key: &[u8]) {
    if key.is_empty() {
        return;
    }
    for (i, b) in buf.iter_mut().enumerate() {
        *b ^= key[i % key.len()];
    }
}

/// Validates the decrypted frame envelope: minimum length and both magics.
pub fn is_valid(buf: &[u8]) -> bool {
    buf.len() > 5
        && u16::from_be_bytes([buf[0], buf[1]]) == HEAD_MAGIC
        && u16::from_be_bytes([buf[buf.len() - 2], buf[buf.len() - 1]]) == TAIL_MAGIC
}

/// Extracts id, head and payload from a decrypted frame.
pub fn parse(buf: &[u8], layout: FrameLayout) -> Result<ParsedFrame<'_>, FramingError> {
    if buf.len() < FRAME_OVERHEAD {
        return Err(FramingError::Truncated(buf.len()));
    }
    if !is_valid(buf) {
        return Err(FramingError::BadMagic {
            head: u16::from_be_bytes([buf[0], buf[1]]),
            tail: u16::from_be_bytes([buf[buf.len() - 2], buf[buf.len() - 1]]),
        });
    }
    let id = u16::from_be_bytes([buf[2], buf[3]]);
    match layout {
        FrameLayout::LengthPrefixed => {
            let head_len = u16::from_be_bytes([buf[4], buf[5]]) as usize;
            let payload_len =
                u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]) as usize;
            if FRAME_OVERHEAD + head_len + payload_len != buf.len() {
                return Err(FramingError::Lengths {
                    head: head_len,
                    payload: payload_len,
                    frame: buf.len(),
                });
            }
            Ok(ParsedFrame {
                id,
                head: &buf[10..10 + head_len],
                payload: &buf[10 + head_len..buf.len() - 2],
            })
        }
        FrameLayout::Legacy => {
            let head_len = buf[5] as usize;
            let skip = buf[6] as usize;
            let head_start = 10;
            let end = buf.len() - 4;
            let payload_start = head_start + head_len + skip;
            if head_start + head_len > end || payload_start > end {
                return Err(FramingError::Lengths {
                    head: head_len,
                    payload: skip,
                    frame: buf.len(),
                });
            }
            Ok(ParsedFrame {
                id,
                head: &buf[head_start..head_start + head_len],
                payload: &buf[payload_start..end],
            })
        }
    }
}

/// Assembles a cleartext frame in the length-prefixed layout.
pub fn assemble(id: u16, head: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FRAME_OVERHEAD + head.len() + payload.len());
    buf.extend_from_slice(&HEAD_MAGIC.to_be_bytes());
    buf.extend_from_slice(&id.to_be_bytes());
    buf.extend_from_slice(&(head.len() as u16).to_be_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(head);
    buf.extend_from_slice(payload);
    buf.extend_from_slice(&TAIL_MAGIC.to_be_bytes());
    buf
}

/// Assembles and encrypts a frame with the given key.
pub fn encode(id: u16, head: &[u8], payload: &[u8], key: &[u8]) -> Vec<u8> {
    let mut buf = assemble(id, head, payload);
    xor_in_place(&mut buf, key);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8] = &[0x5A, 0xC3, 0x0F, 0x99, 0x21];

    #[test]
    fn xor_is_involution() {
        let original: Vec<u8> = (0..=255u8).collect();
        let mut buf = original.clone();
        xor_in_place(&mut buf, KEY);
        assert_ne!(buf, original);
        xor_in_place(&mut buf, KEY);
        assert_eq!(buf, original);
    }

    #[test]
    fn parse_recovers_encoded_frame() {
        for (id, head, payload) in [
            (1u16, &b"hd"[..], &b"payload"[..]),
            (0x7FFF, &[][..], &[][..]),
            (42, &[9u8; 300][..], &[7u8; 1024][..]),
        ] {
            let mut wire = encode(id, head, payload, KEY);
            xor_in_place(&mut wire, KEY);
            let parsed = parse(&wire, FrameLayout::LengthPrefixed).expect("parse");
            assert_eq!(parsed.id, id);
            assert_eq!(parsed.head, head);
            assert_eq!(parsed.payload, payload);
        }
    }

    #[test]
    fn is_valid_rejects_bad_tail_magic() {
        let mut frame = assemble(1, b"", b"data");
        let n = frame.len();
        frame[n - 1] ^= 0xFF;
        assert!(!is_valid(&frame));
        assert!(matches!(
            parse(&frame, FrameLayout::LengthPrefixed),
            Err(FramingError::BadMagic { .. })
        ));
    }

    #[test]
    fn is_valid_requires_minimum_length() {
        assert!(!is_valid(&[0x45, 0x67, 0x89, 0xAB]));
    }

    #[test]
    fn inconsistent_lengths_rejected() {
        let mut frame = assemble(1, b"head", b"payload");
        // Claim a longer payload than the frame carries.
        frame[9] = frame[9].wrapping_add(4);
        assert!(matches!(
            parse(&frame, FrameLayout::LengthPrefixed),
            Err(FramingError::Lengths { .. })
        ));
    }

    #[test]
    fn legacy_layout_drops_trailing_four_bytes() {
        // Legacy frames: head length in byte 5, skip in byte 6, payload runs
        // to len-4. Build one by hand around the standard envelope.
        let head = b"ABCD";
        let body = b"legacy-payload";
        let mut frame = Vec::new();
        frame.extend_from_slice(&HEAD_MAGIC.to_be_bytes());
        frame.extend_from_slice(&77u16.to_be_bytes());
        frame.push(0);
        frame.push(head.len() as u8); // byte 5: head length
        frame.push(0); // byte 6: secondary skip
        frame.extend_from_slice(&[0, 0, 0]);
        frame.extend_from_slice(head);
        frame.extend_from_slice(body);
        frame.extend_from_slice(&[0, 0]); // dropped with the footer
        frame.extend_from_slice(&TAIL_MAGIC.to_be_bytes());

        let parsed = parse(&frame, FrameLayout::Legacy).expect("parse");
        assert_eq!(parsed.id, 77);
        assert_eq!(parsed.head, head);
        assert_eq!(parsed.payload, body);
    }
}
