//! Identity resolution.
//!
//! Given a parsed ClientHello, find which identity in a group the client
//! sealed it for. The sticky cache is consulted first so a returning client
//! costs one verification; otherwise identities are tried in order.

use std::net::SocketAddr;

use rnm_reality::{ClientHello, PrivateKey};
use tracing::debug;

use crate::cache::CachedIdentity;
use crate::group::{Group, Identity};

/// Checks a ClientHello against one private key.
pub trait Verifier: Send + Sync {
    fn verify(&self, hello: &ClientHello<'_>, key: &PrivateKey) -> bool;
}

/// The REALITY session-id verifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealityVerifier;

impl Verifier for RealityVerifier {
    fn verify(&self, hello: &ClientHello<'_>, key: &PrivateKey) -> bool {
        rnm_reality::verify(hello, key)
    }
}

/// Result of resolving a connection.
#[derive(Debug, Clone, Copy)]
pub enum AuthOutcome<'g> {
    /// The client authenticated as this identity.
    Matched(&'g Identity),
    /// No identity in the group matched.
    NoMatch,
}

impl AuthOutcome<'_> {
    pub fn is_match(&self) -> bool {
        matches!(self, AuthOutcome::Matched(_))
    }
}

/// Resolves clients to identities using a group's sticky cache.
#[derive(Debug, Default)]
pub struct Resolver<V = RealityVerifier> {
    verifier: V,
}

impl Resolver<RealityVerifier> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<V: Verifier> Resolver<V> {
    pub fn with_verifier(verifier: V) -> Self {
        Self { verifier }
    }

    pub fn verifier(&self) -> &V {
        &self.verifier
    }

    /// Find the identity `hello` authenticates against.
    ///
    /// Only successful matches touch the cache. A hello without a usable
    /// X25519 key share is rejected before any verification.
    pub fn resolve<'g>(
        &self,
        client: SocketAddr,
        hello: &ClientHello<'_>,
        group: &'g Group,
    ) -> AuthOutcome<'g> {
        let identities = group.identities();
        if identities.is_empty() {
            return AuthOutcome::NoMatch;
        }

        if hello.x25519_key_share().is_none() {
            debug!(client = %client, "no x25519 key share");
            return AuthOutcome::NoMatch;
        }

        let cache = group.cache();
        let mut tried = None;

        if let Some(cached) = cache.get(client) {
            // Reload may have shrunk or reordered the identity list
            match identities.get(cached.index) {
                Some(identity) if identity.key.public_key() == cached.public_key => {
                    if self.verifier.verify(hello, &identity.key) {
                        cache.put(client, cached);
                        debug!(
                            client = %client,
                            identity = %identity.name,
                            sni = hello.server_name().unwrap_or(""),
                            "sticky hit"
                        );
                        return AuthOutcome::Matched(identity);
                    }
                    tried = Some(cached.index);
                }
                _ => {
                    cache.remove(client);
                    debug!(client = %client, index = cached.index, "stale sticky entry dropped");
                }
            }
        }

        for (index, identity) in identities.iter().enumerate() {
            if tried == Some(index) {
                continue;
            }
            if self.verifier.verify(hello, &identity.key) {
                cache.put(
                    client,
                    CachedIdentity {
                        index,
                        public_key: identity.key.public_key(),
                    },
                );
                debug!(
                    client = %client,
                    identity = %identity.name,
                    sni = hello.server_name().unwrap_or(""),
                    sticky_entries = cache.len(),
                    "resolved"
                );
                return AuthOutcome::Matched(identity);
            }
        }

        debug!(
            client = %client,
            sni = hello.server_name().unwrap_or(""),
            candidates = identities.len(),
            "no identity matched"
        );
        AuthOutcome::NoMatch
    }
}
