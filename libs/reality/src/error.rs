//! Error types for ClientHello parsing, key handling and sealing.

use thiserror::Error;

/// Reasons a buffer could not be read as a TLS ClientHello.
///
/// None of these are fatal: callers treat every variant as "not a match"
/// and route the connection to fallback or drain.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Fewer bytes than the record header, or than the record it declares.
    #[error("incomplete TLS record")]
    Incomplete,

    /// Wrong record type, record version or handshake message type.
    #[error("not a TLS ClientHello")]
    NotClientHello,

    /// Declared record exceeds the inspection cap.
    #[error("ClientHello too large: {len} bytes (max {max})", max = crate::MAX_CLIENT_HELLO_LEN)]
    TooLarge { len: usize },

    /// A length prefix or field is inconsistent with the buffer.
    #[error("malformed ClientHello: {0}")]
    Malformed(&'static str),
}

impl ParseError {
    /// Returns true if more bytes could have turned this into a parse.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, ParseError::Incomplete)
    }
}

/// Errors decoding an X25519 private key from configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// The key is not valid base64.
    #[error("invalid key encoding: {0}")]
    Encoding(String),

    /// The decoded key is not 32 bytes.
    #[error("invalid key length: expected 32 bytes, got {0}")]
    Length(usize),
}

/// Errors producing a client-side REALITY tag.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SealError {
    /// The record could not be parsed.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// The session id is not the 32-byte slot the tag is written into.
    #[error("session id must be 32 bytes, got {0}")]
    SessionIdLength(usize),

    /// The X25519 exchange produced a non-contributory secret.
    #[error("server public key is a low-order point")]
    LowOrderPoint,

    /// Key derivation or encryption failed.
    #[error("crypto failure: {0}")]
    Crypto(&'static str),
}
