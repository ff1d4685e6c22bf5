//! rnm dispatcher.
//!
//! A TCP front-end that reads each client's TLS ClientHello, checks it for a
//! REALITY session-id tag against every identity configured on the port,
//! and forwards the untouched byte stream to the matching backend. Clients
//! that do not authenticate go to the port's fallback target or are
//! drained, so the port looks like an ordinary TLS server.

pub mod cache;
pub mod config;
pub mod group;
pub mod proxy;
pub mod registry;
pub mod reload;
pub mod resolver;

pub use cache::{CachedIdentity, StickyCache, StickyKey};
pub use config::{Config, ConfigError, GroupConfig, ServerConfig};
pub use group::{Group, GroupOptions, Identity, ProxyProtocol, SharedGroup};
pub use proxy::{Listener, ListenerConfig, ListenerStats, ProxyHeader};
pub use registry::{ApplyError, PortDispatcher, Registry, Transport};
pub use resolver::{AuthOutcome, RealityVerifier, Resolver, Verifier};
