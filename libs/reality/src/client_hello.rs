//! TLS ClientHello parsing.
//!
//! Decodes the subset of a TLS 1.3 ClientHello needed for REALITY
//! detection. The parsed view borrows the input buffer, so the handshake
//! bytes used later as associated data cannot change between parsing and
//! verification.
//!
//! TLS Record structure:
//! - byte 0: record type (0x16 = Handshake)
//! - bytes 1-2: legacy record version (0x0301)
//! - bytes 3-4: record length
//! - bytes 5+: handshake message
//!
//! Handshake ClientHello:
//! - byte 0: handshake type (0x01 = ClientHello)
//! - bytes 1-3: length
//! - bytes 4-5: legacy client version
//! - bytes 6-37: random (32 bytes)
//! - byte 38: session ID length
//! - variable: session ID
//! - 2 bytes: cipher suites length
//! - variable: cipher suites
//! - 1 byte: compression methods length
//! - variable: compression methods
//! - 2 bytes: extensions length
//! - variable: extensions

use crate::error::ParseError;

/// TLS record header length.
pub const RECORD_HEADER_LEN: usize = 5;

/// Hard cap on record header + ClientHello record body.
pub const MAX_CLIENT_HELLO_LEN: usize = 8192;

/// Record content type: handshake.
pub const RECORD_TYPE_HANDSHAKE: u8 = 0x16;

/// Legacy record version carried by every ClientHello record.
pub const VERSION_TLS10: u16 = 0x0301;

/// Handshake message type: ClientHello.
pub const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;

/// Extension type: server_name.
pub const EXTENSION_SERVER_NAME: u16 = 0x0000;

/// Extension type: key_share.
pub const EXTENSION_KEY_SHARE: u16 = 0x0033;

/// Named group: x25519.
pub const GROUP_X25519: u16 = 0x001d;

/// Longest legal session id.
pub const MAX_SESSION_ID_LEN: usize = 32;

/// Offset of the session id inside the handshake message
/// (4 header + 2 version + 32 random + 1 length byte).
pub const SESSION_ID_OFFSET: usize = 39;

/// One entry of the key_share extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyShare<'a> {
    /// Named group.
    pub group: u16,
    /// Key exchange data.
    pub data: &'a [u8],
}

/// Parsed view of a ClientHello.
#[derive(Debug, Clone)]
pub struct ClientHello<'a> {
    raw: &'a [u8],
    random: [u8; 32],
    session_id: &'a [u8],
    cipher_suites: Vec<u16>,
    key_shares: Vec<KeyShare<'a>>,
    server_name: Option<String>,
}

impl<'a> ClientHello<'a> {
    /// The full handshake message exactly as received (handshake header included).
    pub fn raw(&self) -> &'a [u8] {
        self.raw
    }

    pub fn random(&self) -> &[u8; 32] {
        &self.random
    }

    pub fn session_id(&self) -> &'a [u8] {
        self.session_id
    }

    /// Offered cipher suites in client preference order.
    pub fn cipher_suites(&self) -> &[u16] {
        &self.cipher_suites
    }

    pub fn key_shares(&self) -> &[KeyShare<'a>] {
        &self.key_shares
    }

    /// SNI hostname, lowercased with the trailing dot trimmed.
    ///
    /// Only used for diagnostics; a malformed server_name extension leaves
    /// this empty instead of failing the parse.
    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    /// First x25519 key share carrying exactly 32 bytes of key data.
    pub fn x25519_key_share(&self) -> Option<&'a [u8; 32]> {
        self.key_shares
            .iter()
            .filter(|share| share.group == GROUP_X25519)
            .find_map(|share| share.data.try_into().ok())
    }

    /// Copy of the handshake message with the session id zeroed.
    ///
    /// This is the associated data a REALITY client seals over before it
    /// writes the ciphertext into the session id.
    pub fn sealing_aad(&self) -> Vec<u8> {
        let mut aad = self.raw.to_vec();
        let end = SESSION_ID_OFFSET + self.session_id.len();
        aad[SESSION_ID_OFFSET..end].fill(0);
        aad
    }
}

/// Total record length (header included) declared by a record header.
///
/// Returns `None` until the 5 header bytes are available.
pub fn declared_record_len(data: &[u8]) -> Option<usize> {
    if data.len() < RECORD_HEADER_LEN {
        return None;
    }
    Some(RECORD_HEADER_LEN + u16::from_be_bytes([data[3], data[4]]) as usize)
}

/// Parse a TLS record containing a ClientHello.
///
/// Bytes past the declared record are ignored; they belong to whatever
/// the client sent next and are forwarded untouched by the caller.
pub fn parse(data: &[u8]) -> Result<ClientHello<'_>, ParseError> {
    if data.len() < RECORD_HEADER_LEN {
        return Err(ParseError::Incomplete);
    }

    if data[0] != RECORD_TYPE_HANDSHAKE || u16::from_be_bytes([data[1], data[2]]) != VERSION_TLS10
    {
        return Err(ParseError::NotClientHello);
    }

    // The message type sits right after the record header
    match data.get(RECORD_HEADER_LEN) {
        None => return Err(ParseError::Incomplete),
        Some(&HANDSHAKE_TYPE_CLIENT_HELLO) => {}
        Some(_) => return Err(ParseError::NotClientHello),
    }

    let total_len = declared_record_len(data).ok_or(ParseError::Incomplete)?;
    if total_len > MAX_CLIENT_HELLO_LEN {
        return Err(ParseError::TooLarge { len: total_len });
    }
    if data.len() < total_len {
        return Err(ParseError::Incomplete);
    }

    let raw = &data[RECORD_HEADER_LEN..total_len];
    let mut handshake = Reader::new(raw);
    handshake.u8("handshake type")?;
    let body_len = handshake.u24("handshake length")?;
    if body_len != handshake.remaining() {
        return Err(ParseError::Malformed(
            "handshake length does not match record length",
        ));
    }

    parse_body(raw, handshake)
}

fn parse_body<'a>(raw: &'a [u8], mut body: Reader<'a>) -> Result<ClientHello<'a>, ParseError> {
    body.u16("legacy version")?;

    let mut random = [0u8; 32];
    random.copy_from_slice(body.take(32, "random")?);

    let session_id = body.u8_prefixed("session id")?;
    if session_id.len() > MAX_SESSION_ID_LEN {
        return Err(ParseError::Malformed("session id longer than 32 bytes"));
    }

    let suites = body.u16_prefixed("cipher suites")?;
    if suites.len() % 2 != 0 {
        return Err(ParseError::Malformed("odd cipher suites length"));
    }
    let cipher_suites = suites
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();

    body.u8_prefixed("compression methods")?;

    let mut hello = ClientHello {
        raw,
        random,
        session_id,
        cipher_suites,
        key_shares: Vec::new(),
        server_name: None,
    };

    // A ClientHello may legally end without an extensions block
    if body.is_empty() {
        return Ok(hello);
    }

    let mut extensions = Reader::new(body.u16_prefixed("extensions")?);
    if !body.is_empty() {
        return Err(ParseError::Malformed("trailing bytes after extensions"));
    }

    let mut seen = Vec::new();
    while !extensions.is_empty() {
        let ext_type = extensions.u16("extension type")?;
        let ext_data = extensions.u16_prefixed("extension data")?;

        if seen.contains(&ext_type) {
            return Err(ParseError::Malformed("duplicate extension"));
        }
        seen.push(ext_type);

        match ext_type {
            EXTENSION_KEY_SHARE => hello.key_shares = parse_key_shares(ext_data)?,
            EXTENSION_SERVER_NAME => {
                hello.server_name = parse_server_name(ext_data).ok().flatten();
            }
            _ => {}
        }
    }

    Ok(hello)
}

/// Parse the client_shares list of a key_share extension.
fn parse_key_shares(data: &[u8]) -> Result<Vec<KeyShare<'_>>, ParseError> {
    let mut outer = Reader::new(data);
    let mut list = Reader::new(outer.u16_prefixed("key share list")?);
    if !outer.is_empty() {
        return Err(ParseError::Malformed("trailing bytes after key share list"));
    }

    let mut shares = Vec::new();
    while !list.is_empty() {
        let group = list.u16("key share group")?;
        let data = list.u16_prefixed("key share data")?;
        if data.is_empty() {
            return Err(ParseError::Malformed("empty key share"));
        }
        shares.push(KeyShare { group, data });
    }
    Ok(shares)
}

/// Parse the server_name extension.
///
/// SNI extension structure:
/// - 2 bytes: list length
/// - for each entry:
///   - 1 byte: name type (0 = hostname)
///   - 2 bytes: name length
///   - variable: name
fn parse_server_name(data: &[u8]) -> Result<Option<String>, ParseError> {
    let mut outer = Reader::new(data);
    let mut list = Reader::new(outer.u16_prefixed("server name list")?);
    if !outer.is_empty() {
        return Err(ParseError::Malformed("trailing bytes after server name list"));
    }

    let mut hostname = None;
    while !list.is_empty() {
        let name_type = list.u8("server name type")?;
        let name = list.u16_prefixed("server name")?;
        if name_type != 0 || hostname.is_some() {
            continue;
        }
        // Non-UTF-8 names are kept out of logs but are not a framing error
        hostname = std::str::from_utf8(name)
            .ok()
            .map(|h| h.to_lowercase().trim_end_matches('.').to_string());
    }
    Ok(hostname)
}

/// Bounds-checked big-endian cursor.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], ParseError> {
        if self.buf.len() < n {
            return Err(ParseError::Malformed(what));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, ParseError> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, ParseError> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self, what: &'static str) -> Result<usize, ParseError> {
        let b = self.take(3, what)?;
        Ok(((b[0] as usize) << 16) | ((b[1] as usize) << 8) | (b[2] as usize))
    }

    fn u8_prefixed(&mut self, what: &'static str) -> Result<&'a [u8], ParseError> {
        let len = self.u8(what)? as usize;
        self.take(len, what)
    }

    fn u16_prefixed(&mut self, what: &'static str) -> Result<&'a [u8], ParseError> {
        let len = self.u16(what)? as usize;
        self.take(len, what)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientHelloBuilder;
    use proptest::prelude::*;
    use rstest::rstest;

    fn sample() -> Vec<u8> {
        ClientHelloBuilder::new([7u8; 32])
            .session_id(&[0xAA; 32])
            .cipher_suites(&[0x1301, 0x1302, 0x1303])
            .key_share(0x0017, &[4u8; 65])
            .x25519_key_share([9u8; 32])
            .server_name("Example.COM.")
            .build()
    }

    #[test]
    fn test_parse_fields() {
        let record = sample();
        let hello = parse(&record).unwrap();

        assert_eq!(hello.random(), &[7u8; 32]);
        assert_eq!(hello.session_id(), &[0xAA; 32]);
        assert_eq!(hello.cipher_suites(), &[0x1301, 0x1302, 0x1303]);
        assert_eq!(hello.key_shares().len(), 2);
        assert_eq!(hello.x25519_key_share(), Some(&[9u8; 32]));
        assert_eq!(hello.server_name(), Some("example.com"));
        assert_eq!(hello.raw(), &record[RECORD_HEADER_LEN..]);
        assert_eq!(&hello.raw()[SESSION_ID_OFFSET..SESSION_ID_OFFSET + 32], &[0xAA; 32]);
    }

    #[test]
    fn test_sealing_aad_zeroes_session_id_only() {
        let record = sample();
        let hello = parse(&record).unwrap();
        let aad = hello.sealing_aad();

        assert_eq!(aad.len(), hello.raw().len());
        assert!(aad[SESSION_ID_OFFSET..SESSION_ID_OFFSET + 32].iter().all(|&b| b == 0));
        assert_eq!(&aad[..SESSION_ID_OFFSET], &hello.raw()[..SESSION_ID_OFFSET]);
        assert_eq!(&aad[SESSION_ID_OFFSET + 32..], &hello.raw()[SESSION_ID_OFFSET + 32..]);
    }

    #[test]
    fn test_short_buffers_are_incomplete() {
        let record = sample();
        for len in 0..RECORD_HEADER_LEN {
            let err = parse(&record[..len]).unwrap_err();
            assert_eq!(err, ParseError::Incomplete);
            assert!(err.is_incomplete());
        }
        // Header present but the message type byte is not
        assert_eq!(parse(&record[..5]).unwrap_err(), ParseError::Incomplete);
        // Truncated record body
        assert_eq!(
            parse(&record[..record.len() - 1]).unwrap_err(),
            ParseError::Incomplete
        );
    }

    #[rstest]
    #[case::http(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n".to_vec())]
    #[case::tls12_record_version(vec![0x16, 0x03, 0x03, 0x00, 0x10, 0x01])]
    #[case::server_hello(vec![0x16, 0x03, 0x01, 0x00, 0x10, 0x02])]
    #[case::application_data(vec![0x17, 0x03, 0x01, 0x00, 0x10, 0x01])]
    fn test_not_client_hello(#[case] data: Vec<u8>) {
        assert_eq!(parse(&data).unwrap_err(), ParseError::NotClientHello);
    }

    #[test]
    fn test_too_large() {
        let mut data = vec![0x16, 0x03, 0x01, 0x20, 0x00, 0x01];
        data.resize(MAX_CLIENT_HELLO_LEN + 16, 0);
        assert_eq!(
            parse(&data).unwrap_err(),
            ParseError::TooLarge {
                len: RECORD_HEADER_LEN + 0x2000
            }
        );
    }

    #[test]
    fn test_handshake_length_mismatch() {
        let mut record = sample();
        // Shrink the handshake length by one byte
        record[8] = record[8].wrapping_sub(1);
        assert!(matches!(parse(&record), Err(ParseError::Malformed(_))));
    }

    #[test]
    fn test_session_id_too_long() {
        let record = ClientHelloBuilder::new([0u8; 32])
            .session_id(&[1u8; 33])
            .build();
        assert_eq!(
            parse(&record).unwrap_err(),
            ParseError::Malformed("session id longer than 32 bytes")
        );
    }

    #[test]
    fn test_duplicate_extension_rejected() {
        let record = ClientHelloBuilder::new([0u8; 32])
            .raw_extension(0x0017, &[])
            .raw_extension(0x0017, &[])
            .build();
        assert_eq!(
            parse(&record).unwrap_err(),
            ParseError::Malformed("duplicate extension")
        );
    }

    #[test]
    fn test_empty_key_share_rejected() {
        let record = ClientHelloBuilder::new([0u8; 32])
            .key_share(GROUP_X25519, &[])
            .build();
        assert_eq!(
            parse(&record).unwrap_err(),
            ParseError::Malformed("empty key share")
        );
    }

    #[test]
    fn test_malformed_server_name_is_ignored() {
        let record = ClientHelloBuilder::new([0u8; 32])
            .x25519_key_share([9u8; 32])
            .raw_extension(EXTENSION_SERVER_NAME, &[0xff])
            .build();
        let hello = parse(&record).unwrap();
        assert_eq!(hello.server_name(), None);
        assert_eq!(hello.x25519_key_share(), Some(&[9u8; 32]));
    }

    #[test]
    fn test_x25519_share_must_be_32_bytes() {
        let record = ClientHelloBuilder::new([0u8; 32])
            .key_share(GROUP_X25519, &[1u8; 31])
            .build();
        let hello = parse(&record).unwrap();
        assert_eq!(hello.key_shares().len(), 1);
        assert!(hello.x25519_key_share().is_none());
    }

    #[test]
    fn test_trailing_bytes_after_record_ignored() {
        let mut data = sample();
        let record_len = data.len();
        data.extend_from_slice(b"early data");
        let hello = parse(&data).unwrap();
        assert_eq!(hello.raw().len(), record_len - RECORD_HEADER_LEN);
    }

    #[test]
    fn test_declared_record_len() {
        assert_eq!(declared_record_len(&[0x16, 0x03]), None);
        assert_eq!(declared_record_len(&[0x16, 0x03, 0x01, 0x02, 0x00]), Some(517));
    }

    proptest! {
        #[test]
        fn parse_never_panics(data in proptest::collection::vec(any::<u8>(), 0..1024)) {
            let _ = parse(&data);
        }

        #[test]
        fn parse_never_panics_on_valid_prefix(
            cut in 0usize..600,
            noise in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            let mut data = sample();
            data.truncate(cut.min(data.len()));
            data.extend_from_slice(&noise);
            let _ = parse(&data);
        }
    }
}
