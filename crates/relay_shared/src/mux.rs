//! Wire-record (de)multiplexing.
//!
//! A physical datagram packs one or more transport records. Each record
//! carries a 28-byte header: the 4-byte conversation id, a 4-byte transport
//! token, and the 20 remaining ARQ header bytes, the last four of which are
//! the little-endian content length. The ARQ primitive itself knows nothing
//! about the token, so inbound records are rewritten into the canonical
//! 24-byte-header segment stream before being fed to it, and outbound
//! segments get the token reattached before hitting the wire.

use thiserror::Error;

/// Header length of a record as it appears in a physical datagram.
pub const RECORD_HEADER_LEN: usize = 28;

/// Header length of a canonical ARQ segment (token stripped).
pub const SEGMENT_HEADER_LEN: usize = 24;

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("truncated record header at offset {0}")]
    TruncatedHeader(usize),
    #[error("record content at offset {offset} runs past the datagram ({want} of {have} bytes)")]
    TruncatedContent {
        offset: usize,
        want: usize,
        have: usize,
    },
}

/// Rewrites a physical datagram into the canonical segment stream.
///
/// Per record: conv (4 bytes, copied verbatim) + header bytes [8..28) +
/// content. The 4-byte token at [4..8) is dropped.
pub fn demultiplex(raw: &[u8]) -> Result<Vec<u8>, MuxError> {
    // Every record shrinks by exactly the 4-byte token.
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw.len() - i < RECORD_HEADER_LEN {
            return Err(MuxError::TruncatedHeader(i));
        }
        let content_len =
            u32::from_le_bytes(raw[i + 24..i + 28].try_into().unwrap()) as usize;
        let end = i + RECORD_HEADER_LEN + content_len;
        if end > raw.len() {
            return Err(MuxError::TruncatedContent {
                offset: i,
                want: content_len,
                have: raw.len() - i - RECORD_HEADER_LEN,
            });
        }
        out.extend_from_slice(&raw[i..i + 4]);
        out.extend_from_slice(&raw[i + 8..end]);
        i = end;
    }
    Ok(out)
}

/// Rewrites a flushed ARQ buffer back into wire records.
///
/// The buffer holds consecutive canonical segments; each gets the leg's
/// token (little-endian, as on the inbound wire) reinserted after conv.
pub fn remultiplex(flushed: &[u8], token: u32) -> Result<Vec<u8>, MuxError> {
    let mut out = Vec::with_capacity(flushed.len() + flushed.len() / SEGMENT_HEADER_LEN * 4 + 4);
    let mut i = 0;
    while i < flushed.len() {
        if flushed.len() - i < SEGMENT_HEADER_LEN {
            return Err(MuxError::TruncatedHeader(i));
        }
        let content_len =
            u32::from_le_bytes(flushed[i + 20..i + 24].try_into().unwrap()) as usize;
        let end = i + SEGMENT_HEADER_LEN + content_len;
        if end > flushed.len() {
            return Err(MuxError::TruncatedContent {
                offset: i,
                want: content_len,
                have: flushed.len() - i - SEGMENT_HEADER_LEN,
            });
        }
        out.extend_from_slice(&flushed[i..i + 4]);
        out.extend_from_slice(&token.to_le_bytes());
        out.extend_from_slice(&flushed[i + 4..end]);
        i = end;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(conv: u32, token: u32, content: &[u8]) -> Vec<u8> {
        let mut r = Vec::new();
        r.extend_from_slice(&conv.to_le_bytes());
        r.extend_from_slice(&token.to_le_bytes());
        // cmd/frg/wnd/ts/sn/una: opaque to the mux layer.
        r.extend_from_slice(&[0u8; 16]);
        r.extend_from_slice(&(content.len() as u32).to_le_bytes());
        r.extend_from_slice(content);
        r
    }

    #[test]
    fn demultiplex_strips_token() {
        let raw = record(7, 0xDDCC_BBAA, b"hello");
        let canonical = demultiplex(&raw).expect("demux");
        assert_eq!(canonical.len(), SEGMENT_HEADER_LEN + 5);
        assert_eq!(&canonical[..4], &7u32.to_le_bytes());
        assert_eq!(&canonical[24..], b"hello");
    }

    #[test]
    fn demultiplex_handles_multiple_records() {
        let mut raw = record(7, 1, b"one");
        raw.extend_from_slice(&record(7, 1, b"three"));
        let canonical = demultiplex(&raw).expect("demux");
        assert_eq!(canonical.len(), 2 * SEGMENT_HEADER_LEN + 3 + 5);
        assert_eq!(&canonical[SEGMENT_HEADER_LEN..SEGMENT_HEADER_LEN + 3], b"one");
    }

    #[test]
    fn remultiplex_is_inverse_of_demultiplex() {
        let token = 0x1122_3344;
        let mut raw = record(9, token, b"payload-a");
        raw.extend_from_slice(&record(9, token, b"b"));
        let canonical = demultiplex(&raw).expect("demux");
        let rebuilt = remultiplex(&canonical, token).expect("remux");
        assert_eq!(rebuilt, raw);
    }

    #[test]
    fn truncated_header_rejected() {
        let raw = [0u8; 10];
        assert!(matches!(
            demultiplex(&raw),
            Err(MuxError::TruncatedHeader(0))
        ));
    }

    #[test]
    fn truncated_content_rejected() {
        let mut raw = record(7, 1, b"hello");
        raw.truncate(raw.len() - 2);
        assert!(matches!(
            demultiplex(&raw),
            Err(MuxError::TruncatedContent { .. })
        ));
    }
}
