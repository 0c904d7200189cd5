//! Dialect translation pipeline.
//!
//! Every complete ARQ payload runs through here: decrypt, validate, remap
//! the packet id through the hub dialect, decode the body, run the mutation
//! hook, re-encode for the opposite leg. All failures are scoped to the one
//! packet; nothing in this module tears a session down.

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;
use time::OffsetDateTime;
use tracing::debug;

use relay_shared::framing::{self, FramingError};
use relay_shared::ids::ProtocolVersion;
use relay_shared::keys::KeySet;
use relay_shared::tables::TableSet;

use crate::codec::{SchemaCodec, SchemaCodecError};
use crate::hooks::HookRegistry;
use crate::session::SessionState;

/// Which leg a payload arrived on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    FromClient,
    FromServer,
}

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("session version not pinned yet (packet id {0})")]
    Unpinned(u16),
    #[error("unknown packet id {id} for {version}")]
    UnknownPacketId { id: u16, version: ProtocolVersion },
    #[error("packet {name:?} has no id in {version}")]
    UnknownPacketName {
        name: String,
        version: ProtocolVersion,
    },
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error(transparent)]
    Codec(#[from] SchemaCodecError),
}

pub struct Translator {
    tables: Arc<TableSet>,
    codec: Arc<dyn SchemaCodec>,
    hooks: HookRegistry,
    keys: KeySet,
    seed_message: String,
    log_blacklist: HashSet<String>,
}

impl Translator {
    pub fn new(
        tables: Arc<TableSet>,
        codec: Arc<dyn SchemaCodec>,
        hooks: HookRegistry,
        keys: KeySet,
        seed_message: impl Into<String>,
        log_blacklist: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            tables,
            codec,
            hooks,
            keys,
            seed_message: seed_message.into(),
            log_blacklist: log_blacklist.into_iter().collect(),
        }
    }

    /// Translates one decrypted-and-reframed payload for the opposite leg.
    ///
    /// Returns the fully encoded (encrypted) frame ready to enqueue on the
    /// outbound ARQ instance.
    pub fn translate(
        &self,
        raw: &[u8],
        direction: Direction,
        state: &mut SessionState,
    ) -> Result<Vec<u8>, TranslateError> {
        let inbound_key = match direction {
            Direction::FromClient => state.client_key(),
            Direction::FromServer => state.server_key(),
        };
        let frame = self.decrypt(raw, &inbound_key)?;
        let id = u16::from_be_bytes([frame[2], frame[3]]);

        // The first version-identifying packet a client sends pins its
        // dialect for the session's lifetime.
        if direction == Direction::FromClient
            && state.protocol.is_none()
            && let Some(version) = self.tables.pin_version(id)
        {
            debug!(
                target: "relay::net::translate",
                "{} pinned to {version}", state.identity
            );
            state.protocol = Some(version);
        }

        let (version_in, version_out) = match direction {
            Direction::FromClient => (
                state.protocol.ok_or(TranslateError::Unpinned(id))?,
                self.tables.hub(),
            ),
            Direction::FromServer => (
                self.tables.hub(),
                state.protocol.ok_or(TranslateError::Unpinned(id))?,
            ),
        };

        let parsed = framing::parse(&frame, self.tables.layout(version_in))?;
        let name = self
            .tables
            .get(version_in)
            .and_then(|table| table.name_of(id))
            .ok_or(TranslateError::UnknownPacketId {
                id,
                version: version_in,
            })?
            .to_string();
        let new_id = self
            .tables
            .get(version_out)
            .and_then(|table| table.id_of(&name))
            .ok_or_else(|| TranslateError::UnknownPacketName {
                name: name.clone(),
                version: version_out,
            })?;

        let mut message = self.codec.decode(parsed.payload, &name, version_in)?;
        self.hooks.apply(&name, &mut message, state);
        let payload = self.codec.encode(&message, &name, version_out)?;

        // Toward the server the client's own head travels along; toward the
        // client a fresh head carries the send timestamp.
        let head = match direction {
            Direction::FromClient => parsed.head.to_vec(),
            Direction::FromServer => self.codec.encode_head(version_out, unix_ms())?,
        };

        // The seed carrier is always encoded with the bootstrap key to match
        // the peer's own switch point; everything else uses the outbound
        // leg's active key (the hook above may just have rotated it).
        let outbound_key = if name == self.seed_message {
            self.keys.initial.clone()
        } else {
            match direction {
                Direction::FromClient => state.server_key(),
                Direction::FromServer => state.client_key(),
            }
        };

        if !self.log_blacklist.contains(&name) {
            match direction {
                Direction::FromClient => debug!(
                    target: "relay::net::translate",
                    ">> {name} ({id} -> {new_id})"
                ),
                Direction::FromServer => debug!(
                    target: "relay::net::translate",
                    "<< {name} ({id} -> {new_id})"
                ),
            }
        }

        Ok(framing::encode(new_id, &head, &payload, &outbound_key))
    }

    /// Decrypts with the active key, retrying exactly once with the
    /// bootstrap key before declaring the payload corrupt.
    fn decrypt(&self, raw: &[u8], active_key: &[u8]) -> Result<Vec<u8>, TranslateError> {
        let mut frame = raw.to_vec();
        framing::xor_in_place(&mut frame, active_key);
        if framing::is_valid(&frame) {
            return Ok(frame);
        }

        let mut fallback = raw.to_vec();
        framing::xor_in_place(&mut fallback, &self.keys.initial);
        if framing::is_valid(&fallback) {
            return Ok(fallback);
        }

        let tail = if frame.len() >= 2 {
            u16::from_be_bytes([frame[frame.len() - 2], frame[frame.len() - 1]])
        } else {
            0
        };
        let head = if frame.len() >= 2 {
            u16::from_be_bytes([frame[0], frame[1]])
        } else {
            0
        };
        if head == framing::HEAD_MAGIC {
            // A valid header with a corrupt tail usually means a key
            // mismatch rather than wire damage; worth the extra detail.
            debug!(
                target: "relay::net::translate",
                "frame has a valid header but bad footer (size {}, tail {tail:#06x})",
                frame.len()
            );
        }
        Err(FramingError::BadMagic { head, tail }.into())
    }
}

fn unix_ms() -> u64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as u64
}
