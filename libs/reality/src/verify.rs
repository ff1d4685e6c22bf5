//! REALITY tag verification.
//!
//! A REALITY client hides a 16-byte payload plus a 16-byte AEAD tag in
//! the ClientHello session id. The key is derived from an X25519 exchange
//! between the client's key share and the server's static key:
//!
//! ```text
//! shared   = X25519(server_private, client_key_share)
//! auth_key = HKDF-SHA256(ikm = shared, salt = random[0..20], info = "REALITY")
//! payload  = AEAD-Open(auth_key, nonce = random[20..32],
//!                      ciphertext = session_id, aad = hello with session id zeroed)
//! ```
//!
//! Every failure along the way means "this key did not sign this hello".

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey, SharedSecret};

use crate::client_hello::ClientHello;
use crate::keys::PrivateKey;

/// HKDF info label.
pub const REALITY_INFO: &[u8] = b"REALITY";

/// Bytes of the ClientHello random used as HKDF salt; the rest is the nonce.
pub const SALT_LEN: usize = 20;

/// Session id length carrying the sealed payload.
pub const SEALED_LEN: usize = 32;

/// Plaintext length hidden in the session id.
pub const PLAINTEXT_LEN: usize = 16;

/// Recognised cipher suites. The first of these in the client's list
/// decides the AEAD.
const KNOWN_SUITES: &[u16] = &[
    0x1301, 0x1302, 0x1303, // TLS 1.3
    0xcca8, 0xcca9, // ECDHE_{RSA,ECDSA}_WITH_CHACHA20_POLY1305
    0xc02b, 0xc02c, 0xc02f, 0xc030, // ECDHE_{ECDSA,RSA}_WITH_AES_*_GCM
    0xc009, 0xc00a, 0xc013, 0xc014, 0xc023, 0xc027, // ECDHE_*_WITH_AES_*_CBC
    0x009c, 0x009d, // RSA_WITH_AES_*_GCM
    0x002f, 0x0035, 0x003c, // RSA_WITH_AES_*_CBC
    0x000a, 0xc012, // *_WITH_3DES_EDE_CBC_SHA
    0x0005, 0xc007, 0xc011, // *_WITH_RC4_128_SHA
];

/// Known suites that count as AES-GCM. RSA key-exchange GCM suites do not.
const AES_GCM_SUITES: &[u16] = &[0x1301, 0x1302, 0xc02b, 0xc02c, 0xc02f, 0xc030];

/// AEAD used for the session id tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AeadKind {
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl AeadKind {
    /// Pick the AEAD the client's TLS stack would prefer.
    ///
    /// The first known suite in the client's list decides: AES-GCM if it is
    /// an ECDHE or TLS 1.3 AES-GCM suite, ChaCha20-Poly1305 otherwise.
    /// Unknown suites (GREASE included) are skipped.
    pub fn for_cipher_suites(suites: &[u16]) -> Self {
        match suites.iter().copied().find(|suite| KNOWN_SUITES.contains(suite)) {
            Some(suite) if AES_GCM_SUITES.contains(&suite) => AeadKind::Aes256Gcm,
            _ => AeadKind::ChaCha20Poly1305,
        }
    }

    pub(crate) fn open(
        &self,
        key: &[u8; 32],
        nonce: &[u8],
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Option<Vec<u8>> {
        let payload = Payload {
            msg: ciphertext,
            aad,
        };
        match self {
            AeadKind::Aes256Gcm => Aes256Gcm::new_from_slice(key)
                .ok()?
                .decrypt(nonce.into(), payload)
                .ok(),
            AeadKind::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(key)
                .ok()?
                .decrypt(nonce.into(), payload)
                .ok(),
        }
    }

    pub(crate) fn seal(
        &self,
        key: &[u8; 32],
        nonce: &[u8],
        plaintext: &[u8],
        aad: &[u8],
    ) -> Option<Vec<u8>> {
        let payload = Payload {
            msg: plaintext,
            aad,
        };
        match self {
            AeadKind::Aes256Gcm => Aes256Gcm::new_from_slice(key)
                .ok()?
                .encrypt(nonce.into(), payload)
                .ok(),
            AeadKind::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(key)
                .ok()?
                .encrypt(nonce.into(), payload)
                .ok(),
        }
    }
}

/// Decrypted session id payload.
///
/// Layout: `version[3] | reserved[1] | unix_time[4] | short_id[8]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPlaintext(pub [u8; PLAINTEXT_LEN]);

impl SessionPlaintext {
    /// Client version triple (major, minor, patch).
    pub fn version(&self) -> [u8; 3] {
        [self.0[0], self.0[1], self.0[2]]
    }

    pub fn unix_time(&self) -> u32 {
        u32::from_be_bytes([self.0[4], self.0[5], self.0[6], self.0[7]])
    }

    pub fn short_id(&self) -> [u8; 8] {
        let mut id = [0u8; 8];
        id.copy_from_slice(&self.0[8..]);
        id
    }
}

/// Check whether `hello` carries a REALITY tag sealed for `key`.
pub fn verify(hello: &ClientHello<'_>, key: &PrivateKey) -> bool {
    open(hello, key).is_some()
}

/// Like [`verify`], returning the decrypted payload on success.
pub fn open(hello: &ClientHello<'_>, key: &PrivateKey) -> Option<SessionPlaintext> {
    let peer = hello.x25519_key_share()?;

    let shared = key.secret().diffie_hellman(&PublicKey::from(*peer));
    let auth_key = derive_auth_key(&shared, hello.random())?;

    let ciphertext = hello.session_id();
    if ciphertext.len() != SEALED_LEN {
        return None;
    }

    let nonce = &hello.random()[SALT_LEN..];
    let aad = hello.sealing_aad();
    let plaintext = AeadKind::for_cipher_suites(hello.cipher_suites())
        .open(&auth_key, nonce, ciphertext, &aad)?;

    let mut out = [0u8; PLAINTEXT_LEN];
    out.copy_from_slice(&plaintext);
    Some(SessionPlaintext(out))
}

/// HKDF the shared secret into the AEAD key.
///
/// Returns `None` for a non-contributory (low-order) exchange.
pub(crate) fn derive_auth_key(shared: &SharedSecret, random: &[u8; 32]) -> Option<[u8; 32]> {
    if !shared.was_contributory() {
        return None;
    }
    let hk = Hkdf::<Sha256>::new(Some(&random[..SALT_LEN]), shared.as_bytes());
    let mut key = [0u8; 32];
    hk.expand(REALITY_INFO, &mut key).ok()?;
    Some(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{seal, ClientHelloBuilder};
    use crate::client_hello::{parse, GROUP_X25519, RECORD_HEADER_LEN};

    const PAYLOAD: [u8; 16] = [1, 8, 4, 0, 0x65, 0x00, 0x00, 0x01, 1, 2, 3, 4, 5, 6, 7, 8];

    fn server_key(seed: u8) -> PrivateKey {
        PrivateKey::from_bytes([seed; 32])
    }

    /// A sealed ClientHello record addressed to `server`.
    fn sealed_hello(server: &PrivateKey, suites: &[u16]) -> Vec<u8> {
        let client_secret = [0x42u8; 32];
        let client_public = PrivateKey::from_bytes(client_secret).public_key();
        let mut record = ClientHelloBuilder::new(rand::random())
            .cipher_suites(suites)
            .x25519_key_share(client_public)
            .server_name("www.example.com")
            .pad_to(517)
            .build();
        seal(&mut record, &client_secret, &server.public_key(), &PAYLOAD).unwrap();
        record
    }

    #[test]
    fn test_verify_matching_key() {
        let server = server_key(1);
        let record = sealed_hello(&server, &[0x1301, 0x1302, 0x1303]);
        let hello = parse(&record).unwrap();

        assert!(verify(&hello, &server));
        let plaintext = open(&hello, &server).unwrap();
        assert_eq!(plaintext, SessionPlaintext(PAYLOAD));
        assert_eq!(plaintext.version(), [1, 8, 4]);
        assert_eq!(plaintext.unix_time(), 0x6500_0001);
        assert_eq!(plaintext.short_id(), [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_verify_chacha_preference() {
        let server = server_key(2);
        let suites = [0x1303, 0x1301];
        assert_eq!(AeadKind::for_cipher_suites(&suites), AeadKind::ChaCha20Poly1305);

        let record = sealed_hello(&server, &suites);
        assert!(verify(&parse(&record).unwrap(), &server));
    }

    #[test]
    fn test_verify_rejects_other_keys() {
        let server = server_key(3);
        let record = sealed_hello(&server, &[0x1301]);
        let hello = parse(&record).unwrap();

        for seed in [4u8, 5, 6, 0x80, 0xfe] {
            assert!(!verify(&hello, &server_key(seed)));
        }
        for _ in 0..16 {
            assert!(!verify(&hello, &PrivateKey::from_bytes(rand::random())));
        }
    }

    #[test]
    fn test_tampering_any_byte_fails() {
        let server = server_key(7);
        let record = sealed_hello(&server, &[0x1301, 0x1303]);
        assert!(verify(&parse(&record).unwrap(), &server));

        for i in RECORD_HEADER_LEN..record.len() {
            let mut tampered = record.clone();
            tampered[i] ^= 0x01;
            if let Ok(hello) = parse(&tampered) {
                assert!(!verify(&hello, &server), "byte {} not bound", i);
            }
        }
    }

    #[test]
    fn test_no_key_share() {
        let server = server_key(8);
        let record = ClientHelloBuilder::new([3u8; 32])
            .session_id(&[0u8; 32])
            .key_share(0x0017, &[4u8; 65])
            .build();
        assert!(!verify(&parse(&record).unwrap(), &server));
    }

    #[test]
    fn test_low_order_key_share() {
        let server = server_key(9);
        let record = ClientHelloBuilder::new([3u8; 32])
            .session_id(&[0u8; 32])
            .x25519_key_share([0u8; 32])
            .build();
        assert!(!verify(&parse(&record).unwrap(), &server));
    }

    #[test]
    fn test_short_session_id() {
        let server = server_key(10);
        let record = ClientHelloBuilder::new([3u8; 32])
            .session_id(&[0u8; 16])
            .key_share(GROUP_X25519, &server_key(11).public_key())
            .build();
        assert!(!verify(&parse(&record).unwrap(), &server));
    }

    #[test]
    fn test_aead_selection() {
        assert_eq!(AeadKind::for_cipher_suites(&[]), AeadKind::ChaCha20Poly1305);
        assert_eq!(
            AeadKind::for_cipher_suites(&[0x0a0a, 0x1301, 0x1303]),
            AeadKind::Aes256Gcm
        );
        assert_eq!(
            AeadKind::for_cipher_suites(&[0x002f, 0xcca9, 0xc02b]),
            AeadKind::ChaCha20Poly1305
        );
        assert_eq!(
            AeadKind::for_cipher_suites(&[0xc02f, 0x1303]),
            AeadKind::Aes256Gcm
        );
    }

    #[test]
    fn test_first_known_suite_decides() {
        // a CBC suite ahead of AES-GCM still selects ChaCha20-Poly1305
        assert_eq!(
            AeadKind::for_cipher_suites(&[0xc013, 0x1301]),
            AeadKind::ChaCha20Poly1305
        );
        // RSA key-exchange GCM does not count as AES-GCM
        assert_eq!(
            AeadKind::for_cipher_suites(&[0x009c, 0x1301]),
            AeadKind::ChaCha20Poly1305
        );
        // unknown suites are skipped
        assert_eq!(
            AeadKind::for_cipher_suites(&[0x1a1a, 0xff01, 0x1302]),
            AeadKind::Aes256Gcm
        );
    }
}
