//! Client side of the REALITY tag: ClientHello construction and sealing.
//!
//! Used by tests and tooling to produce ClientHellos that a compliant
//! REALITY client would send.

use x25519_dalek::{PublicKey, StaticSecret};

use crate::client_hello::{
    parse, EXTENSION_KEY_SHARE, EXTENSION_SERVER_NAME, GROUP_X25519, HANDSHAKE_TYPE_CLIENT_HELLO,
    RECORD_HEADER_LEN, RECORD_TYPE_HANDSHAKE, SESSION_ID_OFFSET, VERSION_TLS10,
};
use crate::error::SealError;
use crate::verify::{derive_auth_key, AeadKind, PLAINTEXT_LEN, SALT_LEN, SEALED_LEN};

const EXTENSION_SUPPORTED_VERSIONS: u16 = 0x002b;
const EXTENSION_PADDING: u16 = 0x0015;
const TLS13: u16 = 0x0304;

/// Builds a ClientHello TLS record.
#[derive(Debug, Clone)]
pub struct ClientHelloBuilder {
    random: [u8; 32],
    session_id: Vec<u8>,
    cipher_suites: Vec<u16>,
    key_shares: Vec<(u16, Vec<u8>)>,
    server_name: Option<String>,
    extra_extensions: Vec<(u16, Vec<u8>)>,
    min_record_len: usize,
}

impl ClientHelloBuilder {
    /// Start a TLS 1.3 ClientHello with a zeroed 32-byte session id.
    pub fn new(random: [u8; 32]) -> Self {
        Self {
            random,
            session_id: vec![0u8; SEALED_LEN],
            cipher_suites: vec![0x1301, 0x1302, 0x1303],
            key_shares: Vec::new(),
            server_name: None,
            extra_extensions: Vec::new(),
            min_record_len: 0,
        }
    }

    pub fn session_id(mut self, session_id: &[u8]) -> Self {
        self.session_id = session_id.to_vec();
        self
    }

    pub fn cipher_suites(mut self, suites: &[u16]) -> Self {
        self.cipher_suites = suites.to_vec();
        self
    }

    pub fn key_share(mut self, group: u16, data: &[u8]) -> Self {
        self.key_shares.push((group, data.to_vec()));
        self
    }

    pub fn x25519_key_share(self, public_key: [u8; 32]) -> Self {
        self.key_share(GROUP_X25519, &public_key)
    }

    pub fn server_name(mut self, name: &str) -> Self {
        self.server_name = Some(name.to_string());
        self
    }

    /// Append an arbitrary extension after the standard ones.
    pub fn raw_extension(mut self, ext_type: u16, data: &[u8]) -> Self {
        self.extra_extensions.push((ext_type, data.to_vec()));
        self
    }

    /// Pad with a padding extension until the record is at least `len` bytes.
    pub fn pad_to(mut self, len: usize) -> Self {
        self.min_record_len = len;
        self
    }

    /// Encode the full TLS record (header included).
    pub fn build(&self) -> Vec<u8> {
        let mut extensions = Vec::new();

        if let Some(name) = &self.server_name {
            let mut entry = vec![0u8];
            push_u16_prefixed(&mut entry, name.as_bytes());
            let mut list = Vec::new();
            push_u16_prefixed(&mut list, &entry);
            push_extension(&mut extensions, EXTENSION_SERVER_NAME, &list);
        }

        let mut versions = vec![2u8];
        versions.extend_from_slice(&TLS13.to_be_bytes());
        push_extension(&mut extensions, EXTENSION_SUPPORTED_VERSIONS, &versions);

        if !self.key_shares.is_empty() {
            let mut shares = Vec::new();
            for (group, data) in &self.key_shares {
                shares.extend_from_slice(&group.to_be_bytes());
                push_u16_prefixed(&mut shares, data);
            }
            let mut list = Vec::new();
            push_u16_prefixed(&mut list, &shares);
            push_extension(&mut extensions, EXTENSION_KEY_SHARE, &list);
        }

        for (ext_type, data) in &self.extra_extensions {
            push_extension(&mut extensions, *ext_type, data);
        }

        let mut body = Vec::new();
        body.extend_from_slice(&0x0303u16.to_be_bytes());
        body.extend_from_slice(&self.random);
        body.push(self.session_id.len() as u8);
        body.extend_from_slice(&self.session_id);
        let suites: Vec<u8> = self
            .cipher_suites
            .iter()
            .flat_map(|s| s.to_be_bytes())
            .collect();
        push_u16_prefixed(&mut body, &suites);
        body.extend_from_slice(&[1, 0]); // null compression

        // record header + handshake header + body + extensions length + extensions
        let unpadded = RECORD_HEADER_LEN + 4 + body.len() + 2 + extensions.len();
        if unpadded + 4 <= self.min_record_len {
            let padding = vec![0u8; self.min_record_len - unpadded - 4];
            push_extension(&mut extensions, EXTENSION_PADDING, &padding);
        }
        push_u16_prefixed(&mut body, &extensions);

        let mut record = Vec::with_capacity(RECORD_HEADER_LEN + 4 + body.len());
        record.push(RECORD_TYPE_HANDSHAKE);
        record.extend_from_slice(&VERSION_TLS10.to_be_bytes());
        record.extend_from_slice(&((body.len() + 4) as u16).to_be_bytes());
        record.push(HANDSHAKE_TYPE_CLIENT_HELLO);
        record.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        record.extend_from_slice(&body);
        record
    }
}

/// Seal `plaintext` into the session id of a ClientHello record.
///
/// `client_secret` must be the private half of the record's x25519 key
/// share; `server_public` is the public key of the target identity.
pub fn seal(
    record: &mut [u8],
    client_secret: &[u8; 32],
    server_public: &[u8; 32],
    plaintext: &[u8; PLAINTEXT_LEN],
) -> Result<(), SealError> {
    let (random, kind, raw_len) = {
        let hello = parse(record)?;
        if hello.session_id().len() != SEALED_LEN {
            return Err(SealError::SessionIdLength(hello.session_id().len()));
        }
        (
            *hello.random(),
            AeadKind::for_cipher_suites(hello.cipher_suites()),
            hello.raw().len(),
        )
    };

    let shared = StaticSecret::from(*client_secret).diffie_hellman(&PublicKey::from(*server_public));
    let auth_key = derive_auth_key(&shared, &random).ok_or(SealError::LowOrderPoint)?;

    let start = RECORD_HEADER_LEN + SESSION_ID_OFFSET;
    record[start..start + SEALED_LEN].fill(0);

    let raw = &record[RECORD_HEADER_LEN..RECORD_HEADER_LEN + raw_len];
    let sealed = kind
        .seal(&auth_key, &random[SALT_LEN..], plaintext, raw)
        .ok_or(SealError::Crypto("aead seal"))?;

    record[start..start + SEALED_LEN].copy_from_slice(&sealed);
    Ok(())
}

fn push_u16_prefixed(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
    buf.extend_from_slice(data);
}

fn push_extension(buf: &mut Vec<u8>, ext_type: u16, data: &[u8]) {
    buf.extend_from_slice(&ext_type.to_be_bytes());
    push_u16_prefixed(buf, data);
}
