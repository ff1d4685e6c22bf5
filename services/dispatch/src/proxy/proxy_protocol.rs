//! PROXY protocol headers.
//!
//! Outbound: a v1 (text) or v2 (binary) header is written to a backend
//! before any client bytes when the identity asks for one.
//! Inbound: when a group sits behind another proxy, the header that proxy
//! sends is read and stripped so the real client address drives routing.
//! Connections that start with anything else pass through untouched.
//!
//! v2 wire format:
//! - 12 bytes signature
//! - 1 byte version and command
//! - 1 byte address family and transport protocol
//! - 2 bytes address length
//! - variable: addresses and ports, then optional TLVs

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::group::ProxyProtocol;

/// PROXY protocol v2 signature (12 bytes).
const V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

const V1_PREFIX: &[u8] = b"PROXY ";

/// Longest legal v1 line, CRLF included.
const V1_MAX_LEN: usize = 107;

/// Fixed part of a v2 header.
const V2_HEADER_LEN: usize = 16;

/// Version 2 with LOCAL command (health checks from the upstream proxy).
const VERSION_COMMAND_LOCAL: u8 = 0x20;

/// Version 2 with PROXY command.
const VERSION_COMMAND_PROXY: u8 = 0x21;

const AF_INET: u8 = 0x10;
const AF_INET6: u8 = 0x20;
const TRANSPORT_STREAM: u8 = 0x01;

/// 4 + 4 + 2 + 2
const IPV4_ADDR_LEN: u16 = 12;

/// 16 + 16 + 2 + 2
const IPV6_ADDR_LEN: u16 = 36;

/// Connection endpoints carried by a PROXY header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyHeader {
    /// Original client address.
    pub src_addr: SocketAddr,
    /// Address the client connected to.
    pub dst_addr: SocketAddr,
}

impl ProxyHeader {
    pub fn new(src_addr: SocketAddr, dst_addr: SocketAddr) -> Self {
        Self { src_addr, dst_addr }
    }

    /// Encode for the given version; `Off` yields an empty header.
    pub fn encode(&self, version: ProxyProtocol) -> Vec<u8> {
        match version {
            ProxyProtocol::Off => Vec::new(),
            ProxyProtocol::V1 => self.encode_v1(),
            ProxyProtocol::V2 => self.encode_v2(),
        }
    }

    /// `PROXY TCP4|TCP6 <src> <dst> <sport> <dport>\r\n`
    pub fn encode_v1(&self) -> Vec<u8> {
        let line = match self.families() {
            Families::V4(src, dst) => format!(
                "PROXY TCP4 {} {} {} {}\r\n",
                src,
                dst,
                self.src_addr.port(),
                self.dst_addr.port()
            ),
            Families::V6(src, dst) => format!(
                "PROXY TCP6 {} {} {} {}\r\n",
                src,
                dst,
                self.src_addr.port(),
                self.dst_addr.port()
            ),
        };
        line.into_bytes()
    }

    pub fn encode_v2(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(V2_HEADER_LEN + IPV6_ADDR_LEN as usize);
        buf.extend_from_slice(&V2_SIGNATURE);
        buf.push(VERSION_COMMAND_PROXY);

        match self.families() {
            Families::V4(src, dst) => {
                buf.push(AF_INET | TRANSPORT_STREAM);
                buf.extend_from_slice(&IPV4_ADDR_LEN.to_be_bytes());
                buf.extend_from_slice(&src.octets());
                buf.extend_from_slice(&dst.octets());
            }
            Families::V6(src, dst) => {
                buf.push(AF_INET6 | TRANSPORT_STREAM);
                buf.extend_from_slice(&IPV6_ADDR_LEN.to_be_bytes());
                buf.extend_from_slice(&src.octets());
                buf.extend_from_slice(&dst.octets());
            }
        }

        buf.extend_from_slice(&self.src_addr.port().to_be_bytes());
        buf.extend_from_slice(&self.dst_addr.port().to_be_bytes());
        buf
    }

    /// Both addresses in one family. IPv4-mapped addresses count as IPv4;
    /// a genuine IPv4/IPv6 mix is sent as IPv6.
    fn families(&self) -> Families {
        match (self.src_addr.ip().to_canonical(), self.dst_addr.ip().to_canonical()) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => Families::V4(src, dst),
            (src, dst) => Families::V6(to_v6(src), to_v6(dst)),
        }
    }
}

enum Families {
    V4(Ipv4Addr, Ipv4Addr),
    V6(Ipv6Addr, Ipv6Addr),
}

fn to_v6(ip: IpAddr) -> Ipv6Addr {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

/// Try to decode a PROXY header at the start of `data`.
///
/// - `Ok(None)`: not enough bytes yet
/// - `Ok(Some((header, consumed)))`: a complete header of `consumed` bytes;
///   `header` is `None` for v2 `LOCAL`, v1 `UNKNOWN` and non-IP families
/// - `Err(_)`: `data` does not start with a valid PROXY header
pub fn decode(data: &[u8]) -> io::Result<Option<(Option<ProxyHeader>, usize)>> {
    if data.is_empty() {
        return Ok(None);
    }
    if data[0] == V2_SIGNATURE[0] {
        decode_v2(data)
    } else {
        decode_v1(data)
    }
}

fn decode_v1(data: &[u8]) -> io::Result<Option<(Option<ProxyHeader>, usize)>> {
    let prefix_len = data.len().min(V1_PREFIX.len());
    if data[..prefix_len] != V1_PREFIX[..prefix_len] {
        return Err(invalid("missing PROXY header"));
    }

    let window = &data[..data.len().min(V1_MAX_LEN)];
    let Some(end) = window.windows(2).position(|w| w == b"\r\n") else {
        if data.len() >= V1_MAX_LEN {
            return Err(invalid("PROXY v1 line too long"));
        }
        return Ok(None);
    };

    let line = std::str::from_utf8(&data[V1_PREFIX.len()..end])
        .map_err(|_| invalid("PROXY v1 line is not ASCII"))?;
    let fields: Vec<&str> = line.split(' ').collect();

    let header = match fields.as_slice() {
        ["UNKNOWN", ..] => None,
        [proto @ ("TCP4" | "TCP6"), src, dst, sport, dport] => {
            let src: IpAddr = src.parse().map_err(|_| invalid("bad PROXY v1 source"))?;
            let dst: IpAddr = dst.parse().map_err(|_| invalid("bad PROXY v1 destination"))?;
            if (*proto == "TCP4") != src.is_ipv4() || src.is_ipv4() != dst.is_ipv4() {
                return Err(invalid("PROXY v1 address family mismatch"));
            }
            let sport: u16 = sport.parse().map_err(|_| invalid("bad PROXY v1 port"))?;
            let dport: u16 = dport.parse().map_err(|_| invalid("bad PROXY v1 port"))?;
            Some(ProxyHeader::new(
                SocketAddr::new(src, sport),
                SocketAddr::new(dst, dport),
            ))
        }
        _ => return Err(invalid("malformed PROXY v1 line")),
    };

    Ok(Some((header, end + 2)))
}

fn decode_v2(data: &[u8]) -> io::Result<Option<(Option<ProxyHeader>, usize)>> {
    let sig_len = data.len().min(V2_SIGNATURE.len());
    if data[..sig_len] != V2_SIGNATURE[..sig_len] {
        return Err(invalid("bad PROXY v2 signature"));
    }
    if data.len() < V2_HEADER_LEN {
        return Ok(None);
    }

    let version_command = data[12];
    let family = data[13] & 0xF0;
    let addr_len = u16::from_be_bytes([data[14], data[15]]) as usize;
    let total = V2_HEADER_LEN + addr_len;

    if version_command & 0xF0 != 0x20 {
        return Err(invalid("unsupported PROXY version"));
    }
    if data.len() < total {
        return Ok(None);
    }

    let addrs = &data[V2_HEADER_LEN..total];
    let header = match version_command {
        VERSION_COMMAND_LOCAL => None,
        VERSION_COMMAND_PROXY => match family {
            AF_INET if addr_len >= IPV4_ADDR_LEN as usize => {
                let src = Ipv4Addr::new(addrs[0], addrs[1], addrs[2], addrs[3]);
                let dst = Ipv4Addr::new(addrs[4], addrs[5], addrs[6], addrs[7]);
                Some(ProxyHeader::new(
                    SocketAddr::new(src.into(), u16::from_be_bytes([addrs[8], addrs[9]])),
                    SocketAddr::new(dst.into(), u16::from_be_bytes([addrs[10], addrs[11]])),
                ))
            }
            AF_INET6 if addr_len >= IPV6_ADDR_LEN as usize => {
                let mut src = [0u8; 16];
                let mut dst = [0u8; 16];
                src.copy_from_slice(&addrs[..16]);
                dst.copy_from_slice(&addrs[16..32]);
                Some(ProxyHeader::new(
                    SocketAddr::new(
                        Ipv6Addr::from(src).into(),
                        u16::from_be_bytes([addrs[32], addrs[33]]),
                    ),
                    SocketAddr::new(
                        Ipv6Addr::from(dst).into(),
                        u16::from_be_bytes([addrs[34], addrs[35]]),
                    ),
                ))
            }
            AF_INET | AF_INET6 => return Err(invalid("PROXY v2 address block too short")),
            // AF_UNSPEC and AF_UNIX carry nothing routable
            _ => None,
        },
        _ => return Err(invalid("unsupported PROXY v2 command")),
    };

    Ok(Some((header, total)))
}

/// Read a PROXY header from `stream`.
///
/// Bytes received after the header are left in `buf` as the start of the
/// client payload. Returns `None` when the header carries no address, or
/// when the stream does not open with a PROXY signature at all; in that
/// case every byte read so far stays in `buf`.
pub async fn read_header<R>(
    stream: &mut R,
    buf: &mut Vec<u8>,
) -> io::Result<Option<ProxyHeader>>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 512];
    loop {
        if !buf.is_empty() && !has_signature_prefix(buf) {
            return Ok(None);
        }
        if let Some((header, consumed)) = decode(buf)? {
            buf.drain(..consumed);
            return Ok(header);
        }

        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside PROXY header",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// True while `data` is consistent with the start of a v1 or v2 header.
fn has_signature_prefix(data: &[u8]) -> bool {
    let v1_len = data.len().min(V1_PREFIX.len());
    let v2_len = data.len().min(V2_SIGNATURE.len());
    data[..v1_len] == V1_PREFIX[..v1_len] || data[..v2_len] == V2_SIGNATURE[..v2_len]
}

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(src: &str, dst: &str) -> ProxyHeader {
        ProxyHeader::new(src.parse().unwrap(), dst.parse().unwrap())
    }

    #[test]
    fn test_encode_v2_ipv4() {
        let h = header("192.168.1.1:12345", "10.0.0.1:443");
        let encoded = h.encode_v2();

        // 12 signature + 4 header + 12 addresses
        assert_eq!(encoded.len(), 28);
        assert_eq!(&encoded[..12], &V2_SIGNATURE);
        assert_eq!(encoded[12], VERSION_COMMAND_PROXY);
        assert_eq!(encoded[13], AF_INET | TRANSPORT_STREAM);
        assert_eq!(u16::from_be_bytes([encoded[14], encoded[15]]), 12);

        let (parsed, consumed) = decode(&encoded).unwrap().unwrap();
        assert_eq!(consumed, 28);
        assert_eq!(parsed, Some(h));
    }

    #[test]
    fn test_encode_v2_ipv6() {
        let h = header("[2001:db8::1]:12345", "[2001:db8::2]:443");
        let encoded = h.encode_v2();

        assert_eq!(encoded.len(), 52);
        assert_eq!(encoded[13], AF_INET6 | TRANSPORT_STREAM);

        let (parsed, consumed) = decode(&encoded).unwrap().unwrap();
        assert_eq!(consumed, 52);
        assert_eq!(parsed, Some(h));
    }

    #[test]
    fn test_mapped_addresses_encode_as_ipv4() {
        let h = header("[::ffff:192.0.2.1]:5000", "[::ffff:192.0.2.2]:443");
        assert_eq!(h.encode_v1(), b"PROXY TCP4 192.0.2.1 192.0.2.2 5000 443\r\n");
        assert_eq!(h.encode_v2()[13], AF_INET | TRANSPORT_STREAM);
    }

    #[test]
    fn test_mixed_families_encode_as_ipv6() {
        let h = header("192.0.2.1:5000", "[2001:db8::2]:443");
        assert_eq!(
            h.encode_v1(),
            b"PROXY TCP6 ::ffff:192.0.2.1 2001:db8::2 5000 443\r\n"
        );
    }

    #[test]
    fn test_encode_off_is_empty() {
        assert!(header("1.2.3.4:1", "5.6.7.8:2")
            .encode(ProxyProtocol::Off)
            .is_empty());
    }

    #[test]
    fn test_decode_v1_with_trailing_payload() {
        let mut data = b"PROXY TCP6 2001:db8::1 2001:db8::2 40000 443\r\n".to_vec();
        let line_len = data.len();
        data.extend_from_slice(&[0x16, 0x03, 0x01]);

        let (parsed, consumed) = decode(&data).unwrap().unwrap();
        assert_eq!(consumed, line_len);
        assert_eq!(parsed, Some(header("[2001:db8::1]:40000", "[2001:db8::2]:443")));
    }

    #[test]
    fn test_decode_v1_unknown() {
        let (parsed, consumed) = decode(b"PROXY UNKNOWN\r\n").unwrap().unwrap();
        assert_eq!(parsed, None);
        assert_eq!(consumed, 15);
    }

    #[test]
    fn test_decode_partial() {
        let v1 = header("1.2.3.4:1000", "5.6.7.8:443").encode_v1();
        let v2 = header("1.2.3.4:1000", "5.6.7.8:443").encode_v2();
        for len in 1..v1.len() {
            assert!(decode(&v1[..len]).unwrap().is_none(), "v1 prefix {}", len);
        }
        for len in 1..v2.len() {
            assert!(decode(&v2[..len]).unwrap().is_none(), "v2 prefix {}", len);
        }
    }

    #[test]
    fn test_decode_v2_local() {
        let mut data = V2_SIGNATURE.to_vec();
        data.extend_from_slice(&[VERSION_COMMAND_LOCAL, 0x00, 0x00, 0x00]);
        let (parsed, consumed) = decode(&data).unwrap().unwrap();
        assert_eq!(parsed, None);
        assert_eq!(consumed, 16);
    }

    #[test]
    fn test_decode_v2_skips_tlvs() {
        let mut data = V2_SIGNATURE.to_vec();
        data.extend_from_slice(&[VERSION_COMMAND_PROXY, AF_INET | TRANSPORT_STREAM, 0, 16]);
        data.extend_from_slice(&[10, 0, 0, 1, 10, 0, 0, 2, 0x13, 0x88, 0x01, 0xbb]);
        data.extend_from_slice(&[0x04, 0x00, 0x01, 0xff]); // NOOP TLV
        let (parsed, consumed) = decode(&data).unwrap().unwrap();
        assert_eq!(consumed, 32);
        assert_eq!(parsed, Some(header("10.0.0.1:5000", "10.0.0.2:443")));
    }

    #[test]
    fn test_decode_invalid() {
        assert!(decode(b"GET / HTTP/1.1\r\n").is_err());
        assert!(decode(&[0x16, 0x03, 0x01, 0x02, 0x00]).is_err());
        assert!(decode(b"PROXY TCP4 1.2.3.4 ::1 1 2\r\n").is_err());
        assert!(decode(b"PROXY TCP4 1.2.3.4 5.6.7.8 99999 2\r\n").is_err());
        assert!(decode(&[b'P'; 200]).is_err());

        let mut too_long = b"PROXY ".to_vec();
        too_long.extend_from_slice(&[b'1'; 150]);
        assert!(decode(&too_long).is_err());

        let mut bad_version = V2_SIGNATURE.to_vec();
        bad_version.extend_from_slice(&[0x11, 0x11, 0x00, 0x0c]);
        assert!(decode(&bad_version).is_err());
    }

    #[tokio::test]
    async fn test_read_header_keeps_payload() {
        let mut wire = header("203.0.113.9:51000", "192.0.2.1:443").encode_v2();
        wire.extend_from_slice(b"hello");

        let mut reader = &wire[..];
        let mut buf = Vec::new();
        let parsed = read_header(&mut reader, &mut buf).await.unwrap();

        assert_eq!(parsed, Some(header("203.0.113.9:51000", "192.0.2.1:443")));
        assert_eq!(buf, b"hello");
    }

    #[tokio::test]
    async fn test_read_header_passes_through_tls() {
        let wire = [0x16, 0x03, 0x01, 0x02, 0x00, 0x01, 0x00];
        let mut reader = &wire[..];
        let mut buf = Vec::new();

        let parsed = read_header(&mut reader, &mut buf).await.unwrap();
        assert_eq!(parsed, None);
        assert_eq!(buf, wire);
    }

    #[tokio::test]
    async fn test_read_header_passes_through_after_partial_match() {
        use tokio::io::AsyncWriteExt;

        // "PRO" could still be a v1 header, "PROT" cannot
        let (mut client, mut server) = tokio::io::duplex(64);
        let reader = tokio::spawn(async move {
            let mut buf = Vec::new();
            let parsed = read_header(&mut server, &mut buf).await;
            (parsed.map_err(|e| e.kind()), buf)
        });

        client.write_all(b"PRO").await.unwrap();
        tokio::task::yield_now().await;
        client.write_all(b"TOCOL").await.unwrap();

        let (parsed, buf) = reader.await.unwrap();
        assert_eq!(parsed, Ok(None));
        assert_eq!(buf, b"PROTOCOL");
    }

    #[tokio::test]
    async fn test_read_header_eof() {
        let wire = b"PROXY TCP4 1.2.3.4".to_vec();
        let mut reader = &wire[..];
        let err = read_header(&mut reader, &mut Vec::new()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
