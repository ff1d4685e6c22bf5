//! Sticky routing cache.
//!
//! Remembers which identity a client last authenticated as, so the next
//! connection from that client can be verified against a single key
//! instead of probing the whole group.
//!
//! - Entries expire `ttl` after they were last touched; expiry is checked
//!   on read, there is no background sweep
//! - Only successful resolutions are stored
//! - The cache belongs to one [`Group`](crate::group::Group) and is dropped
//!   with it on reload

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;
use tracing::debug;

/// Above this many entries, inserting a new client first purges expired ones.
const SWEEP_THRESHOLD: usize = 4096;

/// What identifies a client in the sticky cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StickyKey {
    /// Client IP address only; survives reconnects from new source ports.
    #[default]
    Ip,
    /// Full socket address including the ephemeral source port.
    Socket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ClientKey {
    Ip(IpAddr),
    Socket(SocketAddr),
}

/// A cached reference into the owning group's identity list.
///
/// The public key is kept alongside the index so a reader can check the
/// slot still holds the same identity before trusting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedIdentity {
    pub index: usize,
    pub public_key: [u8; 32],
}

#[derive(Debug)]
struct Entry {
    identity: CachedIdentity,
    last_touched: Instant,
}

/// Client address -> identity map with lazy TTL expiry.
#[derive(Debug)]
pub struct StickyCache {
    ttl: Duration,
    key: StickyKey,
    entries: Mutex<HashMap<ClientKey, Entry>>,
}

impl StickyCache {
    pub fn new(ttl: Duration, key: StickyKey) -> Self {
        Self {
            ttl,
            key,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Look up a client. Expired entries are removed and reported as absent.
    pub fn get(&self, client: SocketAddr) -> Option<CachedIdentity> {
        let key = self.client_key(client);
        let now = Instant::now();
        let mut entries = self.lock();

        match entries.get(&key) {
            Some(entry) if now.duration_since(entry.last_touched) <= self.ttl => {
                Some(entry.identity)
            }
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    /// Insert or overwrite a client's entry, stamping it with the current time.
    pub fn put(&self, client: SocketAddr, identity: CachedIdentity) {
        let key = self.client_key(client);
        let now = Instant::now();
        let mut entries = self.lock();

        if entries.len() >= SWEEP_THRESHOLD && !entries.contains_key(&key) {
            let ttl = self.ttl;
            entries.retain(|_, entry| now.duration_since(entry.last_touched) <= ttl);
            debug!(remaining = entries.len(), "sticky cache swept");
        }

        entries.insert(
            key,
            Entry {
                identity,
                last_touched: now,
            },
        );
    }

    pub fn remove(&self, client: SocketAddr) {
        let key = self.client_key(client);
        self.lock().remove(&key);
    }

    /// Number of stored entries, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn client_key(&self, client: SocketAddr) -> ClientKey {
        match self.key {
            StickyKey::Ip => ClientKey::Ip(client.ip().to_canonical()),
            StickyKey::Socket => ClientKey::Socket(client),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ClientKey, Entry>> {
        // Entries are independent; a panic mid-update cannot break the map
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
