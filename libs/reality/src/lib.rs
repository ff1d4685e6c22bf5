//! REALITY detection primitives.
//!
//! This library provides:
//! - A bounds-checked parser for the TLS ClientHello fields REALITY needs
//! - Verification of the REALITY session id tag against an X25519 key
//! - Client-side ClientHello construction and sealing for tests and tooling
//!
//! Nothing here performs I/O or holds shared state; every function is safe
//! to call concurrently from any number of connection tasks.

pub mod client;
pub mod client_hello;
pub mod error;
pub mod keys;
pub mod verify;

pub use client::{seal, ClientHelloBuilder};
pub use client_hello::{
    declared_record_len, parse, ClientHello, KeyShare, GROUP_X25519, MAX_CLIENT_HELLO_LEN,
    RECORD_HEADER_LEN, RECORD_TYPE_HANDSHAKE,
};
pub use error::{KeyError, ParseError, SealError};
pub use keys::{PrivateKey, KEY_LEN};
pub use verify::{open, verify, AeadKind, SessionPlaintext};
