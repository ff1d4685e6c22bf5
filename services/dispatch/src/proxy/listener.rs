//! TCP listener and connection handling.
//!
//! Each accepted connection runs in its own task:
//! 1. strip an inbound PROXY header if the group expects one
//! 2. buffer the ClientHello under the authentication deadline
//! 3. resolve it against one snapshot of the port's group
//! 4. dial the matched identity, the fallback, or drain and close
//! 5. send the buffered bytes unmodified, then relay both directions

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rnm_reality::{
    declared_record_len, MAX_CLIENT_HELLO_LEN, RECORD_HEADER_LEN, RECORD_TYPE_HANDSHAKE,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

use super::proxy_protocol::{self, ProxyHeader};
use super::socket;
use crate::group::{ProxyProtocol, SharedGroup};
use crate::resolver::{AuthOutcome, Resolver};

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Bytes read before attempting authentication. Real ClientHellos are
/// padded to at least this size.
pub const MIN_AUTH_LEN: usize = 517;

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind; `None` binds dual-stack on all interfaces.
    pub bind_ip: Option<IpAddr>,
    pub port: u16,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Enable TCP Fast Open on the listening socket.
    pub fast_open: bool,
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Total connections currently active.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// First bytes were not a parseable ClientHello.
    pub parse_failed: AtomicU64,
    /// Clients that authenticated as an identity.
    pub auth_matched: AtomicU64,
    /// Clients that matched no identity (parse failures included).
    pub auth_failed: AtomicU64,
    /// Unauthenticated clients sent to the fallback.
    pub fallbacks: AtomicU64,
    /// Unauthenticated clients drained and closed.
    pub drains: AtomicU64,
    /// Backend connection successes.
    pub backend_connected: AtomicU64,
    /// Backend connection failures.
    pub backend_failed: AtomicU64,
    /// Bytes proxied to backend.
    pub bytes_to_backend: AtomicU64,
    /// Bytes proxied from backend.
    pub bytes_from_backend: AtomicU64,
}

impl ListenerStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Where a connection is sent after authentication.
struct Route<'a> {
    target: &'a str,
    proxy_protocol: ProxyProtocol,
    fast_open: bool,
    /// Identity name, or `None` for the fallback.
    identity: Option<&'a str>,
}

/// A TCP listener serving one group.
pub struct Listener {
    config: ListenerConfig,
    listener: TcpListener,
    /// Connection semaphore for limiting concurrent connections.
    conn_semaphore: Arc<Semaphore>,
    /// Shared with connection tasks, which must not keep the socket open.
    handler: Arc<ConnectionHandler>,
}

/// Per-connection logic and the state it reads.
struct ConnectionHandler {
    /// Current group; swapped on reload.
    group: SharedGroup,
    resolver: Arc<Resolver>,
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Bind the listening socket.
    pub fn bind(
        config: ListenerConfig,
        group: SharedGroup,
        resolver: Arc<Resolver>,
    ) -> io::Result<Self> {
        let listener = socket::bind_listener(config.bind_ip, config.port, config.fast_open)?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            fast_open = config.fast_open,
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            listener,
            config,
            handler: Arc::new(ConnectionHandler {
                group,
                resolver,
                stats: Arc::new(ListenerStats::default()),
            }),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.handler.stats)
    }

    /// Accept connections until `shutdown` fires or its sender is dropped.
    ///
    /// The socket is closed on return; connections already accepted keep
    /// running to completion.
    pub async fn run(self, mut shutdown: oneshot::Receiver<()>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        let stats = &self.handler.stats;
        info!(bind_addr = %local_addr, "Listener started");

        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = &mut shutdown => break,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            ListenerStats::bump(&stats.connections_rejected);
                            warn!(
                                peer_addr = %peer_addr,
                                "Connection rejected: max connections reached"
                            );
                            continue;
                        }
                    };

                    ListenerStats::bump(&stats.connections_accepted);
                    ListenerStats::bump(&stats.connections_active);

                    let handler = Arc::clone(&self.handler);

                    tokio::spawn(
                        async move {
                            if let Err(e) = handler.handle_connection(stream, peer_addr).await {
                                debug!(peer_addr = %peer_addr, error = %e, "Connection error");
                            }

                            handler.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            ListenerStats::bump(&handler.stats.connections_closed);
                            drop(permit);
                        }
                        .instrument(tracing::info_span!(
                            "connection",
                            peer = %peer_addr,
                            port = self.config.port
                        )),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        info!(
            bind_addr = %local_addr,
            accepted = stats.connections_accepted.load(Ordering::Relaxed),
            active = stats.connections_active.load(Ordering::Relaxed),
            "Listener stopped"
        );
        Ok(())
    }
}

impl ConnectionHandler {
    async fn handle_connection(
        &self,
        mut client: TcpStream,
        peer_addr: SocketAddr,
    ) -> io::Result<()> {
        let local_addr = client.local_addr()?;

        // One snapshot for the whole connection; reloads do not affect it
        let group = self.group.load_full();
        let options = group.options();
        let deadline = options.auth_timeout.map(|timeout| Instant::now() + timeout);

        let mut buf = Vec::with_capacity(MAX_CLIENT_HELLO_LEN);
        let mut client_addr = peer_addr;

        if options.accept_proxy_protocol {
            let header =
                with_deadline(deadline, proxy_protocol::read_header(&mut client, &mut buf)).await?;
            if let Some(header) = header {
                client_addr = header.src_addr;
                debug!(client_addr = %client_addr, "PROXY header accepted");
            }
        }

        if let Err(e) = with_deadline(deadline, read_client_hello(&mut client, &mut buf)).await {
            debug!(client_addr = %client_addr, error = %e, "Failed to read ClientHello");
            return Ok(());
        }

        let outcome = match rnm_reality::parse(&buf) {
            Ok(hello) => self.resolver.resolve(client_addr, &hello, &group),
            Err(e) => {
                ListenerStats::bump(&self.stats.parse_failed);
                debug!(
                    client_addr = %client_addr,
                    error = %e,
                    truncated = e.is_incomplete(),
                    "Not a ClientHello"
                );
                AuthOutcome::NoMatch
            }
        };

        let route = match outcome {
            AuthOutcome::Matched(identity) => {
                ListenerStats::bump(&self.stats.auth_matched);
                Route {
                    target: identity.target.as_str(),
                    proxy_protocol: identity.proxy_protocol,
                    fast_open: identity.fast_open,
                    identity: Some(identity.name.as_str()),
                }
            }
            AuthOutcome::NoMatch => {
                ListenerStats::bump(&self.stats.auth_failed);

                if options.drain_on_auth_fail {
                    ListenerStats::bump(&self.stats.drains);
                    let drained = with_deadline(deadline, drain(&mut client)).await;
                    debug!(
                        client_addr = %client_addr,
                        drained = ?drained.ok(),
                        "Drained unauthenticated client"
                    );
                    return Ok(());
                }
                if group.identities().is_empty() {
                    debug!(client_addr = %client_addr, "Group has no identities, closing");
                    return Ok(());
                }
                let Some(fallback) = options.fallback.as_deref() else {
                    debug!(client_addr = %client_addr, "No fallback, closing");
                    return Ok(());
                };

                ListenerStats::bump(&self.stats.fallbacks);
                Route {
                    target: fallback,
                    proxy_protocol: ProxyProtocol::Off,
                    fast_open: false,
                    identity: None,
                }
            }
        };

        // Deadline no longer applies from here on
        let connected = socket::connect(route.target, route.fast_open, options.dial_timeout).await;
        let mut backend = match connected {
            Ok(stream) => {
                ListenerStats::bump(&self.stats.backend_connected);
                stream
            }
            Err(e) => {
                ListenerStats::bump(&self.stats.backend_failed);
                warn!(
                    target_addr = %route.target,
                    identity = route.identity.unwrap_or("fallback"),
                    error = %e,
                    "Failed to connect to backend"
                );
                return Ok(());
            }
        };

        debug!(
            client_addr = %client_addr,
            target_addr = %route.target,
            identity = route.identity.unwrap_or("fallback"),
            "Connected to backend"
        );

        let header = ProxyHeader::new(client_addr, local_addr).encode(route.proxy_protocol);
        if !header.is_empty() {
            backend.write_all(&header).await?;
        }
        backend.write_all(&buf).await?;

        let (bytes_to_backend, bytes_from_backend) =
            proxy_bidirectional(&mut client, &mut backend).await?;

        self.stats
            .bytes_to_backend
            .fetch_add(bytes_to_backend + buf.len() as u64, Ordering::Relaxed);
        self.stats
            .bytes_from_backend
            .fetch_add(bytes_from_backend, Ordering::Relaxed);

        debug!(
            bytes_to_backend = bytes_to_backend + buf.len() as u64,
            bytes_from_backend = bytes_from_backend,
            "Connection closed"
        );

        Ok(())
    }
}

/// Buffer at least [`MIN_AUTH_LEN`] bytes, then the rest of the first TLS
/// record if its header declares one that fits in [`MAX_CLIENT_HELLO_LEN`].
async fn read_client_hello<R>(stream: &mut R, buf: &mut Vec<u8>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    fill_to(stream, buf, MIN_AUTH_LEN).await?;
    if buf[0] != RECORD_TYPE_HANDSHAKE {
        return Ok(());
    }

    if let Some(total) = declared_record_len(buf) {
        if total > buf.len() && total <= MAX_CLIENT_HELLO_LEN && total > RECORD_HEADER_LEN {
            fill_to(stream, buf, total).await?;
        }
    }
    Ok(())
}

/// Read until `buf` holds at least `want` bytes. Never reads past `want`.
async fn fill_to<R>(stream: &mut R, buf: &mut Vec<u8>, want: usize) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 2048];
    while buf.len() < want {
        let limit = (want - buf.len()).min(chunk.len());
        let n = stream.read(&mut chunk[..limit]).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("connection closed after {} bytes", buf.len()),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok(())
}

/// Discard everything the client sends until it closes.
async fn drain(client: &mut TcpStream) -> io::Result<u64> {
    tokio::io::copy(client, &mut tokio::io::sink()).await
}

async fn with_deadline<F, T>(deadline: Option<Instant>, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "authentication deadline"))?,
        None => fut.await,
    }
}

/// Proxy data bidirectionally between two streams, half-closing each side
/// when the other reaches EOF.
///
/// Returns (bytes_to_b, bytes_from_b).
async fn proxy_bidirectional(a: &mut TcpStream, b: &mut TcpStream) -> io::Result<(u64, u64)> {
    let (mut a_read, mut a_write) = a.split();
    let (mut b_read, mut b_write) = b.split();

    let a_to_b = async {
        let copied = tokio::io::copy(&mut a_read, &mut b_write).await;
        let _ = b_write.shutdown().await;
        copied
    };

    let b_to_a = async {
        let copied = tokio::io::copy(&mut b_read, &mut a_write).await;
        let _ = a_write.shutdown().await;
        copied
    };

    let (a_result, b_result) = tokio::join!(a_to_b, b_to_a);

    // Return bytes transferred even if one direction errored
    Ok((a_result.unwrap_or(0), b_result.unwrap_or(0)))
}
