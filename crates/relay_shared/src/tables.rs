//! Per-dialect packet-id tables.
//!
//! Each dialect ships a newline-separated `name,id` file. Both directions
//! are materialized once at startup: forward (name → id) for encoding
//! toward a dialect, backward (id → name) for resolving inbound packets.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use thiserror::Error;
use tracing::warn;

use crate::config::VersionConfig;
use crate::framing::FrameLayout;
use crate::ids::ProtocolVersion;

#[derive(Debug, Error)]
pub enum TableError {
    #[error("table file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("table for {0} declared twice")]
    Duplicate(ProtocolVersion),
    #[error("pin message {name:?} missing from table for {version}")]
    PinMissing {
        version: ProtocolVersion,
        name: String,
    },
}

/// Bidirectional name↔id mapping for one dialect.
#[derive(Debug, Default, Clone)]
pub struct PacketIdTable {
    forward: HashMap<String, u16>,
    backward: HashMap<u16, String>,
}

impl PacketIdTable {
    /// Parses `name,id` records. Malformed lines are skipped with a warning;
    /// table files routinely end in a trailing newline.
    pub fn parse(text: &str) -> Self {
        let mut table = Self::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some((name, id)) = line.split_once(',') else {
                warn!(target: "relay::net::tables", "skipping malformed table line {line:?}");
                continue;
            };
            let Ok(id) = id.trim().parse::<u16>() else {
                warn!(target: "relay::net::tables", "skipping non-numeric packet id in {line:?}");
                continue;
            };
            table.forward.insert(name.trim().to_string(), id);
            table.backward.insert(id, name.trim().to_string());
        }
        table
    }

    pub fn id_of(&self, name: &str) -> Option<u16> {
        self.forward.get(name).copied()
    }

    pub fn name_of(&self, id: u16) -> Option<&str> {
        self.backward.get(&id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.backward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backward.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.backward.keys().copied()
    }
}

/// All dialect tables plus the derived lookups the relay needs at runtime.
#[derive(Debug, Default)]
pub struct TableSet {
    tables: HashMap<ProtocolVersion, PacketIdTable>,
    layouts: HashMap<ProtocolVersion, FrameLayout>,
    /// Per-dialect id of the pin message → dialect; resolves a session's
    /// version from the first version-identifying packet it sends.
    pin_ids: HashMap<u16, ProtocolVersion>,
    hub: ProtocolVersion,
}

impl TableSet {
    /// Loads every declared dialect table and precomputes the pin-id map.
    pub fn load(versions: &[VersionConfig], pin_message: &str) -> Result<Self, TableError> {
        let mut set = Self::default();
        for v in versions {
            let table = Self::read_table(&v.table)?;
            if v.hub {
                set.hub = v.version;
            } else {
                // Only non-hub dialects are pinned from the wire; the hub is
                // what the relay itself speaks upstream.
                let id = table
                    .id_of(pin_message)
                    .ok_or_else(|| TableError::PinMissing {
                        version: v.version,
                        name: pin_message.to_string(),
                    })?;
                set.pin_ids.insert(id, v.version);
            }
            if set.tables.insert(v.version, table).is_some() {
                return Err(TableError::Duplicate(v.version));
            }
            set.layouts.insert(v.version, v.layout);
        }
        Ok(set)
    }

    fn read_table(path: &Path) -> Result<PacketIdTable, TableError> {
        let text = fs::read_to_string(path).map_err(|source| TableError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(PacketIdTable::parse(&text))
    }

    /// Builds a table set from in-memory parts; used by tests.
    pub fn from_parts(
        tables: impl IntoIterator<Item = (ProtocolVersion, PacketIdTable, FrameLayout)>,
        hub: ProtocolVersion,
        pin_message: &str,
    ) -> Self {
        let mut set = Self {
            hub,
            ..Self::default()
        };
        for (version, table, layout) in tables {
            if version != hub
                && let Some(id) = table.id_of(pin_message)
            {
                set.pin_ids.insert(id, version);
            }
            set.tables.insert(version, table);
            set.layouts.insert(version, layout);
        }
        set
    }

    pub fn get(&self, version: ProtocolVersion) -> Option<&PacketIdTable> {
        self.tables.get(&version)
    }

    pub fn layout(&self, version: ProtocolVersion) -> FrameLayout {
        self.layouts.get(&version).copied().unwrap_or_default()
    }

    pub fn hub(&self) -> ProtocolVersion {
        self.hub
    }

    /// Resolves the dialect a packet id pins, if it is a pin id.
    pub fn pin_version(&self, id: u16) -> Option<ProtocolVersion> {
        self.pin_ids.get(&id).copied()
    }
}
