//! Listening and dialing sockets, with optional TCP Fast Open.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tracing::{debug, warn};

/// Listen backlog, also used as the TFO pending-connection queue length.
const BACKLOG: u32 = 1024;

/// Bind a listener on `port`.
///
/// Without an explicit address this binds dual-stack `[::]:port`, falling
/// back to `0.0.0.0:port` on hosts without IPv6.
pub fn bind_listener(ip: Option<IpAddr>, port: u16, fast_open: bool) -> io::Result<TcpListener> {
    if let Some(ip) = ip {
        return bind(SocketAddr::new(ip, port), fast_open);
    }

    match bind(SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), port), fast_open) {
        Ok(listener) => Ok(listener),
        Err(e) => {
            debug!(port, error = %e, "IPv6 bind failed, falling back to IPv4");
            bind(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port), fast_open)
        }
    }
}

fn bind(addr: SocketAddr, fast_open: bool) -> io::Result<TcpListener> {
    let socket = new_socket(addr)?;
    socket.set_reuseaddr(true)?;
    if fast_open {
        if let Err(e) = tfo::enable_listener(&socket) {
            warn!(bind_addr = %addr, error = %e, "TCP Fast Open unavailable on listener");
        }
    }
    socket.bind(addr)?;
    socket.listen(BACKLOG)
}

/// Connect to `target` (`host:port`), trying each resolved address in order.
pub async fn connect(
    target: &str,
    fast_open: bool,
    timeout: Option<Duration>,
) -> io::Result<TcpStream> {
    let dial = async {
        let mut last_err = None;
        for addr in lookup_host(target).await? {
            let socket = new_socket(addr)?;
            if fast_open {
                if let Err(e) = tfo::enable_connect(&socket) {
                    debug!(target_addr = %addr, error = %e, "TCP Fast Open unavailable");
                }
            }
            match socket.connect(addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Err(e) => {
                    debug!(target_addr = %addr, error = %e, "connect failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} resolved to no addresses", target),
            )
        }))
    };

    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, dial)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dial timeout"))?,
        None => dial.await,
    }
}

fn new_socket(addr: SocketAddr) -> io::Result<TcpSocket> {
    if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
}

#[cfg(target_os = "linux")]
mod tfo {
    use std::io;
    use std::os::unix::io::AsRawFd;

    use tokio::net::TcpSocket;

    pub fn enable_listener(socket: &TcpSocket) -> io::Result<()> {
        set_tcp_option(socket, libc::TCP_FASTOPEN, super::BACKLOG as libc::c_int)
    }

    pub fn enable_connect(socket: &TcpSocket) -> io::Result<()> {
        set_tcp_option(socket, libc::TCP_FASTOPEN_CONNECT, 1)
    }

    fn set_tcp_option(
        socket: &TcpSocket,
        option: libc::c_int,
        value: libc::c_int,
    ) -> io::Result<()> {
        // Plain int option on a socket we own
        let result = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::IPPROTO_TCP,
                option,
                &value as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
mod tfo {
    use std::io;

    use tokio::net::TcpSocket;

    pub fn enable_listener(_socket: &TcpSocket) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "TCP Fast Open is only supported on Linux",
        ))
    }

    pub fn enable_connect(socket: &TcpSocket) -> io::Result<()> {
        enable_listener(socket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_connect_and_exchange() {
        let listener = bind_listener(Some(Ipv4Addr::LOCALHOST.into()), 0, true).unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            stream.write_all(b"pong").await.unwrap();
        });

        // client speaks first, as a deferred TFO connect needs data to send
        let mut client = connect(&addr.to_string(), true, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = bind_listener(Some(Ipv4Addr::LOCALHOST.into()), 0, false).unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert!(connect(&addr.to_string(), false, None).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_bad_target() {
        assert!(connect("not a target", false, None).await.is_err());
    }
}
