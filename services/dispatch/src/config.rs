//! Dispatcher configuration.
//!
//! Groups are described in a JSON file. Field names follow the established
//! on-disk format (`privKey`, `xver`, `TCPFastOpen`, ...), so existing
//! configuration files load unchanged.
//!
//! ```json
//! {
//!   "groups": [{
//!     "name": "main",
//!     "port": 443,
//!     "fallback": "127.0.0.1:8443",
//!     "authTimeoutSec": 10,
//!     "servers": [
//!       { "name": "a", "target": "127.0.0.1:9001", "privKey": "<base64url>" }
//!     ]
//!   }]
//! }
//! ```

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use rnm_reality::KeyError;
use serde::Deserialize;
use thiserror::Error;

use crate::cache::StickyKey;
use crate::group::Group;

/// Default sticky-cache TTL (30 minutes).
pub const DEFAULT_STICKY_TTL_SEC: u64 = 30 * 60;

/// Configuration errors. These are fatal at startup and cause a reload to be
/// rejected; they never surface at connection time.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The config file is not valid JSON for this schema.
    #[error("invalid config: {0}")]
    Json(#[from] serde_json::Error),

    /// A private key does not decode to 32 bytes.
    #[error("invalid private key in server '{server}': {source}")]
    InvalidKey {
        server: String,
        #[source]
        source: KeyError,
    },

    /// Two identities in one group share a key, making routing ambiguous.
    #[error("make sure the privKey in group '{group}' are diverse: '{first}' and '{second}' share a key")]
    DuplicateKey {
        group: String,
        first: String,
        second: String,
    },

    /// PROXY protocol version outside {0, 1, 2}.
    #[error("invalid proxy protocol version {xver} in server '{server}' (expected 0, 1 or 2)")]
    InvalidProxyVersion { server: String, xver: u8 },

    /// A server has no target address.
    #[error("server '{server}' has an empty target")]
    EmptyTarget { server: String },

    /// Port 0 is not a listening port.
    #[error("group '{group}' has no port")]
    MissingPort { group: String },

    /// Two groups bind the same port.
    #[error("port {port} is used by more than one group")]
    DuplicatePort { port: u16 },
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
}

/// One listening port and its candidate identities.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupConfig {
    #[serde(default)]
    pub name: String,

    pub port: u16,

    /// Enable TCP Fast Open on the listening socket.
    #[serde(default, rename = "listenerTCPFastOpen")]
    pub listener_tcp_fast_open: bool,

    /// Expect a PROXY protocol header on inbound connections.
    #[serde(default)]
    pub accept_proxy_protocol: bool,

    /// Candidate identities, in trial order.
    #[serde(default)]
    pub servers: Vec<ServerConfig>,

    /// Target for unauthenticated connections. Empty means none.
    #[serde(default)]
    pub fallback: Option<String>,

    /// Read deadline for the ClientHello, in seconds (0 = none).
    #[serde(default)]
    pub auth_timeout_sec: u64,

    /// Connect timeout for backends, in seconds (0 = system default).
    #[serde(default)]
    pub dial_timeout_sec: u64,

    /// Drain instead of falling back when authentication fails.
    #[serde(default)]
    pub drain_on_auth_fail: bool,

    /// Sticky-cache entry lifetime, in seconds.
    #[serde(default = "default_sticky_ttl_sec")]
    pub sticky_ttl_sec: u64,

    /// What identifies a client in the sticky cache.
    #[serde(default)]
    pub sticky_key: StickyKey,
}

/// One backend identity.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub name: String,

    pub target: String,

    /// PROXY protocol version to send to the target (0 = off).
    #[serde(default)]
    pub xver: u8,

    #[serde(default, rename = "TCPFastOpen")]
    pub tcp_fast_open: bool,

    /// X25519 private key, base64url without padding.
    #[serde(rename = "privKey")]
    pub priv_key: String,
}

fn default_sticky_ttl_sec() -> u64 {
    DEFAULT_STICKY_TTL_SEC
}

impl Config {
    /// Read and parse a config file. Call [`Config::build_groups`] to validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        text.parse()
    }

    /// Validate every group and build the runtime model.
    pub fn build_groups(&self) -> Result<Vec<Group>, ConfigError> {
        let mut ports = HashSet::new();
        let mut groups = Vec::with_capacity(self.groups.len());

        for group in &self.groups {
            if !ports.insert(group.port) {
                return Err(ConfigError::DuplicatePort { port: group.port });
            }
            groups.push(Group::from_config(group)?);
        }

        Ok(groups)
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(serde_json::from_str(s)?)
    }
}
