//! Runtime model of a listening port and its candidate identities.
//!
//! A [`Group`] is immutable once built. Reload builds a fresh group (with a
//! fresh sticky cache) and swaps it in whole; connections that already hold
//! the old one keep using it until they finish.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use rnm_reality::PrivateKey;

use crate::cache::{StickyCache, StickyKey};
use crate::config::{ConfigError, GroupConfig, ServerConfig, DEFAULT_STICKY_TTL_SEC};

/// The live group for a port. Readers take a snapshot with `load_full`;
/// reload stores a new one.
pub type SharedGroup = Arc<ArcSwap<Group>>;

/// PROXY protocol version sent to a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProxyProtocol {
    #[default]
    Off,
    /// Human-readable v1 header.
    V1,
    /// Binary v2 header.
    V2,
}

impl TryFrom<u8> for ProxyProtocol {
    type Error = u8;

    fn try_from(xver: u8) -> Result<Self, Self::Error> {
        match xver {
            0 => Ok(Self::Off),
            1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            other => Err(other),
        }
    }
}

/// A backend a client can authenticate as.
#[derive(Debug, Clone)]
pub struct Identity {
    pub name: String,
    /// Backend address (`host:port`).
    pub target: String,
    pub proxy_protocol: ProxyProtocol,
    /// Dial the backend with TCP Fast Open.
    pub fast_open: bool,
    pub key: PrivateKey,
}

impl Identity {
    pub fn new(name: impl Into<String>, target: impl Into<String>, key: PrivateKey) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            proxy_protocol: ProxyProtocol::Off,
            fast_open: false,
            key,
        }
    }

    fn from_config(server: &ServerConfig) -> Result<Self, ConfigError> {
        let proxy_protocol =
            ProxyProtocol::try_from(server.xver).map_err(|xver| ConfigError::InvalidProxyVersion {
                server: server.name.clone(),
                xver,
            })?;

        if server.target.trim().is_empty() {
            return Err(ConfigError::EmptyTarget {
                server: server.name.clone(),
            });
        }

        let key = PrivateKey::from_base64(&server.priv_key).map_err(|source| {
            ConfigError::InvalidKey {
                server: server.name.clone(),
                source,
            }
        })?;

        Ok(Self {
            name: server.name.clone(),
            target: server.target.clone(),
            proxy_protocol,
            fast_open: server.tcp_fast_open,
            key,
        })
    }
}

/// Per-group behavior knobs.
#[derive(Debug, Clone)]
pub struct GroupOptions {
    /// Target for connections that do not authenticate.
    pub fallback: Option<String>,
    /// Deadline for receiving the ClientHello.
    pub auth_timeout: Option<Duration>,
    /// Backend connect timeout.
    pub dial_timeout: Option<Duration>,
    /// Swallow unauthenticated connections instead of using the fallback.
    pub drain_on_auth_fail: bool,
    pub listener_fast_open: bool,
    /// Strip an inbound PROXY protocol header before reading the ClientHello.
    pub accept_proxy_protocol: bool,
    pub sticky_ttl: Duration,
    pub sticky_key: StickyKey,
}

impl Default for GroupOptions {
    fn default() -> Self {
        Self {
            fallback: None,
            auth_timeout: None,
            dial_timeout: None,
            drain_on_auth_fail: false,
            listener_fast_open: false,
            accept_proxy_protocol: false,
            sticky_ttl: Duration::from_secs(DEFAULT_STICKY_TTL_SEC),
            sticky_key: StickyKey::default(),
        }
    }
}

/// A port's identity set, options and sticky cache.
#[derive(Debug)]
pub struct Group {
    name: String,
    port: u16,
    identities: Vec<Identity>,
    options: GroupOptions,
    cache: StickyCache,
}

impl Group {
    /// Build a group, rejecting identities that share a key.
    pub fn new(
        name: impl Into<String>,
        port: u16,
        identities: Vec<Identity>,
        options: GroupOptions,
    ) -> Result<Self, ConfigError> {
        let name = name.into();

        for (i, identity) in identities.iter().enumerate() {
            let public_key = identity.key.public_key();
            if let Some(first) = identities[..i]
                .iter()
                .find(|earlier| earlier.key.public_key() == public_key)
            {
                return Err(ConfigError::DuplicateKey {
                    group: name,
                    first: first.name.clone(),
                    second: identity.name.clone(),
                });
            }
        }

        let cache = StickyCache::new(options.sticky_ttl, options.sticky_key);
        Ok(Self {
            name,
            port,
            identities,
            options,
            cache,
        })
    }

    /// Validate a group from the config file and build it.
    pub fn from_config(config: &GroupConfig) -> Result<Self, ConfigError> {
        if config.port == 0 {
            return Err(ConfigError::MissingPort {
                group: config.name.clone(),
            });
        }

        let identities = config
            .servers
            .iter()
            .map(Identity::from_config)
            .collect::<Result<Vec<_>, _>>()?;

        let options = GroupOptions {
            fallback: config
                .fallback
                .as_deref()
                .map(str::trim)
                .filter(|target| !target.is_empty())
                .map(str::to_string),
            auth_timeout: seconds(config.auth_timeout_sec),
            dial_timeout: seconds(config.dial_timeout_sec),
            drain_on_auth_fail: config.drain_on_auth_fail,
            listener_fast_open: config.listener_tcp_fast_open,
            accept_proxy_protocol: config.accept_proxy_protocol,
            sticky_ttl: Duration::from_secs(config.sticky_ttl_sec),
            sticky_key: config.sticky_key,
        };

        Self::new(config.name.clone(), config.port, identities, options)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Identities in trial order.
    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    pub fn options(&self) -> &GroupOptions {
        &self.options
    }

    pub fn cache(&self) -> &StickyCache {
        &self.cache
    }

    /// Wrap into a swappable handle.
    pub fn into_shared(self) -> SharedGroup {
        Arc::new(ArcSwap::from_pointee(self))
    }
}

/// Zero means "no timeout".
fn seconds(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn identity(name: &str, seed: u8) -> Identity {
        Identity::new(name, "127.0.0.1:9000", PrivateKey::from_bytes([seed; 32]))
    }

    fn group_config(json: &str) -> GroupConfig {
        serde_json::from_str(json).unwrap()
    }

    #[rstest]
    #[case(0, Ok(ProxyProtocol::Off))]
    #[case(1, Ok(ProxyProtocol::V1))]
    #[case(2, Ok(ProxyProtocol::V2))]
    #[case(3, Err(3))]
    #[case(255, Err(255))]
    fn test_proxy_protocol_from_xver(
        #[case] xver: u8,
        #[case] expected: Result<ProxyProtocol, u8>,
    ) {
        assert_eq!(ProxyProtocol::try_from(xver), expected);
    }

    #[test]
    fn test_new_keeps_order() {
        let group = Group::new(
            "main",
            443,
            vec![identity("a", 1), identity("b", 2), identity("c", 3)],
            GroupOptions::default(),
        )
        .unwrap();

        let names: Vec<_> = group.identities().iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
        assert!(group.cache().is_empty());
    }

    #[test]
    fn test_new_rejects_shared_key() {
        let err = Group::new(
            "main",
            443,
            vec![identity("a", 1), identity("b", 2), identity("c", 1)],
            GroupOptions::default(),
        )
        .unwrap_err();

        assert!(matches!(
            err,
            ConfigError::DuplicateKey { ref first, ref second, .. } if first == "a" && second == "c"
        ));
    }

    #[test]
    fn test_empty_group_is_valid() {
        let group = Group::new("empty", 443, Vec::new(), GroupOptions::default()).unwrap();
        assert!(group.identities().is_empty());
    }

    #[test]
    fn test_from_config_options() {
        let group = Group::from_config(&group_config(
            r#"{
                "name": "edge",
                "port": 8443,
                "fallback": "  ",
                "authTimeoutSec": 0,
                "dialTimeoutSec": 4,
                "drainOnAuthFail": true,
                "acceptProxyProtocol": true,
                "stickyTtlSec": 90
            }"#,
        ))
        .unwrap();

        let options = group.options();
        assert_eq!(group.name(), "edge");
        assert_eq!(group.port(), 8443);
        assert_eq!(options.fallback, None);
        assert_eq!(options.auth_timeout, None);
        assert_eq!(options.dial_timeout, Some(Duration::from_secs(4)));
        assert!(options.drain_on_auth_fail);
        assert!(options.accept_proxy_protocol);
        assert_eq!(group.cache().ttl(), Duration::from_secs(90));
    }

    #[test]
    fn test_from_config_rejects_port_zero() {
        let err = Group::from_config(&group_config(r#"{"name": "x", "port": 0}"#)).unwrap_err();
        assert!(matches!(err, ConfigError::MissingPort { .. }));
    }

    #[test]
    fn test_from_config_rejects_empty_target() {
        let err = Group::from_config(&group_config(
            r#"{"port": 1, "servers": [{"name": "a", "target": "", "privKey": "MGVgZtEO6Rzrjelc-gwC7oSGsA9hYO3KcWnIu3wCYm4"}]}"#,
        ))
        .unwrap_err();
        assert!(matches!(err, ConfigError::EmptyTarget { .. }));
    }
}
