//! PROXY protocol v2 preamble.
//!
//! Layout of the binary header:
//! - 12 byte signature
//! - version (high nibble) and command (low nibble)
//! - address family (high nibble) and transport (low nibble)
//! - 2 byte big-endian length of the address block
//! - source address, destination address, source port, destination port

use crate::connection::Connection;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncWrite};

pub const SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

const VERSION_2_PROXY: u8 = 0x21;
const AF_INET_STREAM: u8 = 0x11;
const AF_INET6_STREAM: u8 = 0x21;
const PREFIX_LEN: usize = 16;
const IPV4_BLOCK_LEN: u16 = 4 + 4 + 2 + 2;
const IPV6_BLOCK_LEN: u16 = 16 + 16 + 2 + 2;

/// Endpoints announced to the backend: the client that connected and the
/// local address it connected to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyHeader {
    pub source: SocketAddr,
    pub destination: SocketAddr,
}

enum Family {
    V4(Ipv4Addr, Ipv4Addr),
    V6(Ipv6Addr, Ipv6Addr),
}

impl ProxyHeader {
    pub fn new(source: SocketAddr, destination: SocketAddr) -> Self {
        Self {
            source,
            destination,
        }
    }

    /// Both endpoints must share one address family on the wire. A mixed
    /// pair is sent as IPv4 when the IPv6 side is v4-mapped and as IPv6
    /// otherwise.
    fn family(&self) -> Family {
        match (self.source.ip(), self.destination.ip()) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => Family::V4(src, dst),
            (IpAddr::V6(src), IpAddr::V6(dst)) => Family::V6(src, dst),
            (IpAddr::V4(src), IpAddr::V6(dst)) => match dst.to_ipv4_mapped() {
                Some(dst) => Family::V4(src, dst),
                None => Family::V6(src.to_ipv6_mapped(), dst),
            },
            (IpAddr::V6(src), IpAddr::V4(dst)) => match src.to_ipv4_mapped() {
                Some(src) => Family::V4(src, dst),
                None => Family::V6(src, dst.to_ipv6_mapped()),
            },
        }
    }

    /// Serializes the header with the PROXY command over TCP.
    pub fn encode(&self) -> Vec<u8> {
        let (family, block_len) = match self.family() {
            Family::V4(..) => (AF_INET_STREAM, IPV4_BLOCK_LEN),
            Family::V6(..) => (AF_INET6_STREAM, IPV6_BLOCK_LEN),
        };

        let mut buf = Vec::with_capacity(PREFIX_LEN + block_len as usize);
        buf.extend_from_slice(&SIGNATURE);
        buf.push(VERSION_2_PROXY);
        buf.push(family);
        buf.extend_from_slice(&block_len.to_be_bytes());
        match self.family() {
            Family::V4(src, dst) => {
                buf.extend_from_slice(&src.octets());
                buf.extend_from_slice(&dst.octets());
            }
            Family::V6(src, dst) => {
                buf.extend_from_slice(&src.octets());
                buf.extend_from_slice(&dst.octets());
            }
        }
        buf.extend_from_slice(&self.source.port().to_be_bytes());
        buf.extend_from_slice(&self.destination.port().to_be_bytes());
        buf
    }

    /// Parses a header produced by [`encode`](Self::encode).
    ///
    /// Returns the header and the number of bytes it occupies, or `None` for
    /// anything other than a complete v2 PROXY/TCP header.
    pub fn decode(data: &[u8]) -> Option<(Self, usize)> {
        if data.len() < PREFIX_LEN || data[..12] != SIGNATURE || data[12] != VERSION_2_PROXY {
            return None;
        }
        let block_len = u16::from_be_bytes([data[14], data[15]]) as usize;
        let block = data.get(PREFIX_LEN..PREFIX_LEN + block_len)?;

        let (src, dst, ports) = match data[13] {
            AF_INET_STREAM if block_len >= IPV4_BLOCK_LEN as usize => {
                let src: [u8; 4] = block[0..4].try_into().ok()?;
                let dst: [u8; 4] = block[4..8].try_into().ok()?;
                (IpAddr::from(src), IpAddr::from(dst), &block[8..12])
            }
            AF_INET6_STREAM if block_len >= IPV6_BLOCK_LEN as usize => {
                let src: [u8; 16] = block[0..16].try_into().ok()?;
                let dst: [u8; 16] = block[16..32].try_into().ok()?;
                (IpAddr::from(src), IpAddr::from(dst), &block[32..36])
            }
            _ => return None,
        };

        let header = Self {
            source: SocketAddr::new(src, u16::from_be_bytes([ports[0], ports[1]])),
            destination: SocketAddr::new(dst, u16::from_be_bytes([ports[2], ports[3]])),
        };
        Some((header, PREFIX_LEN + block_len))
    }
}

/// Writes the header to the backend ahead of any relayed bytes.
///
/// The write goes through the connection's write lock and counts towards
/// its outbound byte total.
pub async fn write_header<S>(outbound: &Connection<S>, header: &ProxyHeader) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite,
{
    outbound.write(&header.encode()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::IDLE_TIMEOUT;
    use crate::test_util::RecordingMetrics;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;

    fn header(src: &str, dst: &str) -> ProxyHeader {
        ProxyHeader::new(src.parse().unwrap(), dst.parse().unwrap())
    }

    #[test]
    fn test_ipv4_layout() {
        let encoded = header("192.0.2.10:51000", "198.51.100.1:443").encode();

        assert_eq!(encoded.len(), 28);
        assert_eq!(&encoded[..12], &SIGNATURE);
        assert_eq!(encoded[12], 0x21);
        assert_eq!(encoded[13], 0x11);
        assert_eq!(&encoded[14..16], &[0x00, 0x0C]);
        assert_eq!(&encoded[16..20], &[192, 0, 2, 10]);
        assert_eq!(&encoded[20..24], &[198, 51, 100, 1]);
        assert_eq!(&encoded[24..26], &51000u16.to_be_bytes());
        assert_eq!(&encoded[26..28], &443u16.to_be_bytes());
    }

    #[test]
    fn test_ipv6_layout() {
        let original = header("[2001:db8::1]:40000", "[2001:db8::2]:443");
        let encoded = original.encode();

        assert_eq!(encoded.len(), 52);
        assert_eq!(encoded[13], 0x21);
        assert_eq!(&encoded[14..16], &[0x00, 0x24]);

        let (decoded, used) = ProxyHeader::decode(&encoded).unwrap();
        assert_eq!(used, 52);
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_mixed_family_with_mapped_address() {
        let encoded = header("192.0.2.10:51000", "[::ffff:198.51.100.1]:443").encode();
        assert_eq!(encoded[13], 0x11);

        let (decoded, _) = ProxyHeader::decode(&encoded).unwrap();
        assert_eq!(decoded.destination, "198.51.100.1:443".parse().unwrap());
    }

    #[test]
    fn test_mixed_family_falls_back_to_ipv6() {
        let encoded = header("192.0.2.10:51000", "[2001:db8::2]:443").encode();
        assert_eq!(encoded[13], 0x21);

        let (decoded, _) = ProxyHeader::decode(&encoded).unwrap();
        assert_eq!(
            decoded.source,
            "[::ffff:192.0.2.10]:51000".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(ProxyHeader::decode(&[0; 10]).is_none());
        assert!(ProxyHeader::decode(&[0; 28]).is_none());

        let encoded = header("192.0.2.10:1", "198.51.100.1:2").encode();
        assert!(ProxyHeader::decode(&encoded[..27]).is_none());

        let mut unknown_family = encoded.clone();
        unknown_family[13] = 0x31;
        assert!(ProxyHeader::decode(&unknown_family).is_none());
    }

    #[tokio::test]
    async fn test_write_header_counts_outbound_bytes() {
        let metrics = Arc::new(RecordingMetrics::default());
        let (ours, mut backend) = tokio::io::duplex(256);
        let outbound = Connection::outbound(
            ours,
            "127.0.0.1:9000",
            "svc.internal",
            metrics.clone(),
            IDLE_TIMEOUT,
        );

        let proxy = header("192.0.2.10:51000", "198.51.100.1:443");
        write_header(&outbound, &proxy).await.unwrap();

        let mut received = [0u8; 28];
        backend.read_exact(&mut received).await.unwrap();
        assert_eq!(ProxyHeader::decode(&received).unwrap().0, proxy);
        assert_eq!(metrics.totals().outbound_bytes_out, 28);
    }
}
