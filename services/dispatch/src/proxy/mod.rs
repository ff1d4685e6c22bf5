//! L4 front-end: accept, authenticate, route, relay.
//!
//! This module provides:
//! - TCP listener management with an optional TCP Fast Open socket
//! - ClientHello buffering under the authentication deadline
//! - Fallback and drain handling for unauthenticated clients
//! - PROXY protocol v1/v2 on both sides
//! - Connection proxying
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> [PROXY header] -> ClientHello -> Resolver -> identity target
//!                                                           |
//!                                                           +----> fallback / drain
//! ```

mod listener;
mod proxy_protocol;
mod socket;

pub use listener::{
    Listener, ListenerConfig, ListenerStats, DEFAULT_MAX_CONNECTIONS, MIN_AUTH_LEN,
};
pub use proxy_protocol::{
    decode as decode_proxy_header, read_header as read_proxy_header, ProxyHeader,
};
pub use socket::{bind_listener, connect};
