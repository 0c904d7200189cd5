//! Relay configuration.
//!
//! Loaded once at startup from a TOML file, with a small set of environment
//! overrides on top (the deployment containers only speak env vars). All
//! structures are plain serde types so the settings file stays the single
//! source of truth.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::{env, fs};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::framing::FrameLayout;
use crate::ids::ProtocolVersion;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// One protocol dialect the relay can speak.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionConfig {
    pub version: ProtocolVersion,
    /// Newline-separated `name,id` records for this dialect.
    pub table: PathBuf,
    /// Root of the schema artifacts for this dialect.
    pub schema_root: PathBuf,
    #[serde(default)]
    pub layout: FrameLayout,
    /// Exactly one dialect is the canonical hub all translation routes
    /// through; the real server speaks this one.
    #[serde(default)]
    pub hub: bool,
}

/// Bootstrap key blob locations (base64 files).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyFilesConfig {
    pub initial: PathBuf,
    pub post: PathBuf,
}

/// Reliable-transport tuning shared by both legs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArqConfig {
    pub mtu: usize,
    pub send_window: u16,
    pub recv_window: u16,
    /// Per-leg retransmission tick interval.
    pub tick_interval_ms: u64,
}

impl Default for ArqConfig {
    fn default() -> Self {
        Self {
            mtu: 1200,
            send_window: 256,
            recv_window: 256,
            tick_interval_ms: 20,
        }
    }
}

/// Optional account override applied to the login request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountOverride {
    pub uid: String,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub upstream_addr: SocketAddr,
    pub keys: KeyFilesConfig,
    pub versions: Vec<VersionConfig>,
    /// Message name whose per-dialect id pins a session's protocol version.
    #[serde(default = "default_pin_message")]
    pub pin_message: String,
    /// The message carrying the 64-bit key seed; always processed with the
    /// bootstrap key on both sides of the rotation.
    #[serde(default = "default_seed_message")]
    pub seed_message: String,
    #[serde(default)]
    pub transport: ArqConfig,
    /// Upper bound on frames queued while the upstream leg negotiates.
    #[serde(default = "default_pending_cap")]
    pub pending_queue_cap: usize,
    /// Optional delay between upstream establishment and queue drain.
    #[serde(default)]
    pub drain_delay_ms: u64,
    #[serde(default)]
    pub account: Option<AccountOverride>,
    /// Message names excluded from per-packet translation logging.
    #[serde(default)]
    pub log_blacklist: Vec<String>,
}

fn default_pin_message() -> String {
    "GetPlayerTokenReq".to_string()
}

fn default_seed_message() -> String {
    "GetPlayerTokenRsp".to_string()
}

fn default_pending_cap() -> usize {
    256
}

impl RelayConfig {
    /// Reads, parses and validates the configuration file, then applies
    /// environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Environment overrides: `RELAY_PORT`, `RELAY_UPSTREAM`.
    pub fn apply_env(&mut self) {
        if let Ok(port) = env::var("RELAY_PORT")
            && let Ok(port) = port.parse::<u16>()
        {
            self.listen_addr.set_port(port);
        }
        if let Ok(upstream) = env::var("RELAY_UPSTREAM")
            && let Ok(addr) = upstream.parse::<SocketAddr>()
        {
            self.upstream_addr = addr;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.versions.is_empty() {
            return Err(ConfigError::Invalid("no protocol versions declared".into()));
        }
        let hubs = self.versions.iter().filter(|v| v.hub).count();
        if hubs != 1 {
            return Err(ConfigError::Invalid(format!(
                "exactly one hub version required, found {hubs}"
            )));
        }
        for (i, v) in self.versions.iter().enumerate() {
            if self.versions[..i].iter().any(|o| o.version == v.version) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate protocol version {}",
                    v.version
                )));
            }
        }
        Ok(())
    }

    /// The canonical hub dialect.
    pub fn hub(&self) -> &VersionConfig {
        // validate() guarantees exactly one.
        self.versions
            .iter()
            .find(|v| v.hub)
            .expect("validated config always has a hub version")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal(versions: Vec<VersionConfig>) -> RelayConfig {
        RelayConfig {
            listen_addr: "0.0.0.0:22102".parse().unwrap(),
            upstream_addr: "127.0.0.1:22101".parse().unwrap(),
            keys: KeyFilesConfig {
                initial: "keys/initial.b64".into(),
                post: "keys/post.b64".into(),
            },
            versions,
            pin_message: default_pin_message(),
            seed_message: default_seed_message(),
            transport: ArqConfig::default(),
            pending_queue_cap: default_pending_cap(),
            drain_delay_ms: 0,
            account: None,
            log_blacklist: Vec::new(),
        }
    }

    fn version(n: u16, hub: bool) -> VersionConfig {
        VersionConfig {
            version: ProtocolVersion::new(n),
            table: format!("tables/{n}.csv").into(),
            schema_root: format!("schema/{n}").into(),
            layout: FrameLayout::LengthPrefixed,
            hub,
        }
    }

    #[test]
    fn exactly_one_hub_required() {
        assert!(minimal(vec![version(2, false)]).validate().is_err());
        assert!(minimal(vec![version(2, true), version(3, true)])
            .validate()
            .is_err());
        assert!(minimal(vec![version(2, false), version(3, true)])
            .validate()
            .is_ok());
    }

    #[test]
    fn duplicate_versions_rejected() {
        let config = minimal(vec![version(3, true), version(3, false)]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_minimal_toml() {
        let text = r#"
            listen_addr = "0.0.0.0:22102"
            upstream_addr = "10.0.0.5:22101"

            [keys]
            initial = "keys/initial.b64"
            post = "keys/post.b64"

            [[versions]]
            version = 2
            table = "tables/two.csv"
            schema_root = "schema/two"
            layout = "legacy"

            [[versions]]
            version = 3
            table = "tables/three.csv"
            schema_root = "schema/three"
            hub = true
        "#;
        let config: RelayConfig = toml::from_str(text).expect("parse");
        config.validate().expect("valid");
        assert_eq!(config.hub().version, ProtocolVersion::new(3));
        assert_eq!(config.versions[0].layout, FrameLayout::Legacy);
        assert_eq!(config.pin_message, "GetPlayerTokenReq");
    }
}
