//! ClientHello inspection.
//!
//! The parser walks the TLS record, handshake and extension framing of the
//! first bytes a client sends and pulls out the `server_name` extension.
//! Every length is attacker controlled, so every offset is checked against
//! the bytes actually peeked before it is used.

use crate::peek::PeekableStream;
use std::io;
use tokio::io::AsyncRead;

pub const TLS_HANDSHAKE: u8 = 0x16;
pub const RECORD_HEADER_LEN: usize = 5;
const CLIENT_HELLO: u8 = 0x01;
const SNI_EXTENSION: u16 = 0x0000;
// handshake length (3) + client version (2) + random (32)
const HELLO_FIXED_PREFIX: usize = 3 + 2 + 32;

/// What the first bytes of a connection turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedHello {
    /// TLS ClientHello carrying a server name.
    Sni(String),
    /// TLS ClientHello without a `server_name` extension.
    NoSni,
    /// First byte is not a TLS handshake record.
    NonTls,
}

impl ParsedHello {
    pub fn is_tls(&self) -> bool {
        !matches!(self, ParsedHello::NonTls)
    }

    pub fn sni(&self) -> Option<&str> {
        match self {
            ParsedHello::Sni(host) => Some(host),
            _ => None,
        }
    }

    /// Label used for metrics and logs.
    pub fn label(&self) -> &str {
        match self {
            ParsedHello::Sni(host) => host,
            ParsedHello::NoSni => "no-sni",
            ParsedHello::NonTls => "non-tls",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SniError {
    #[error("incomplete TLS record: need {needed} bytes, got {available}")]
    Incomplete { needed: usize, available: usize },
    #[error("handshake type {0:#04x} is not a ClientHello")]
    NotClientHello(u8),
    #[error("ClientHello truncated before the extensions block")]
    ClientHelloTruncated,
    #[error("ClientHello has no extensions")]
    NoExtensions,
    #[error("extensions block truncated")]
    ExtensionsTruncated,
    #[error("malformed server_name extension")]
    MalformedSni,
    #[error("ClientHello has no server_name extension")]
    SniNotFound,
    #[error("timed out waiting for ClientHello")]
    Timeout,
    #[error("failed to read ClientHello: {0}")]
    Io(#[from] io::Error),
}

/// Reads just enough of the stream to classify it, without consuming
/// anything.
///
/// A single byte is enough to recognise non-TLS traffic, so clients of
/// other protocols are classified even if they send fewer than five bytes.
pub async fn read_client_hello<R>(stream: &mut PeekableStream<R>) -> Result<ParsedHello, SniError>
where
    R: AsyncRead + Unpin,
{
    match stream.peek(1).await?.first() {
        None => {
            return Err(SniError::Incomplete {
                needed: RECORD_HEADER_LEN,
                available: 0,
            });
        }
        Some(&b) if b != TLS_HANDSHAKE => return Ok(ParsedHello::NonTls),
        Some(_) => {}
    }

    let header = stream.peek(RECORD_HEADER_LEN).await?;
    if header.len() < RECORD_HEADER_LEN {
        return Err(SniError::Incomplete {
            needed: RECORD_HEADER_LEN,
            available: header.len(),
        });
    }
    let record_len = u16::from_be_bytes([header[3], header[4]]) as usize;

    let data = stream.peek(RECORD_HEADER_LEN + record_len).await?;
    parse_client_hello(data)
}

/// Parses a buffered TLS record.
///
/// Only the first `5 + record length` bytes are examined; anything after the
/// first record is ignored.
///
/// # Examples
///
/// ```
/// use sni_router_core::sni::{parse_client_hello, ParsedHello};
///
/// assert_eq!(parse_client_hello(b"SSH-2.0-OpenSSH").unwrap(), ParsedHello::NonTls);
/// ```
pub fn parse_client_hello(data: &[u8]) -> Result<ParsedHello, SniError> {
    let Some(&content_type) = data.first() else {
        return Err(SniError::Incomplete {
            needed: RECORD_HEADER_LEN,
            available: 0,
        });
    };
    if content_type != TLS_HANDSHAKE {
        tracing::trace!("Not a TLS handshake record: {:02x}", content_type);
        return Ok(ParsedHello::NonTls);
    }
    if data.len() < RECORD_HEADER_LEN {
        return Err(SniError::Incomplete {
            needed: RECORD_HEADER_LEN,
            available: data.len(),
        });
    }

    let record_len = u16::from_be_bytes([data[3], data[4]]) as usize;
    let record_end = RECORD_HEADER_LEN + record_len;
    if data.len() < record_end {
        return Err(SniError::Incomplete {
            needed: record_end,
            available: data.len(),
        });
    }

    let mut cursor = Cursor::new(&data[..record_end], RECORD_HEADER_LEN);

    let handshake_type = cursor.u8().ok_or(SniError::ClientHelloTruncated)?;
    if handshake_type != CLIENT_HELLO {
        return Err(SniError::NotClientHello(handshake_type));
    }
    cursor
        .skip(HELLO_FIXED_PREFIX)
        .ok_or(SniError::ClientHelloTruncated)?;

    let session_id_len = cursor.u8().ok_or(SniError::ClientHelloTruncated)?;
    cursor
        .skip(session_id_len as usize)
        .ok_or(SniError::ClientHelloTruncated)?;

    let cipher_suites_len = cursor.u16().ok_or(SniError::ClientHelloTruncated)?;
    cursor
        .skip(cipher_suites_len as usize)
        .ok_or(SniError::ClientHelloTruncated)?;

    let compression_len = cursor.u8().ok_or(SniError::ClientHelloTruncated)?;
    cursor
        .skip(compression_len as usize)
        .ok_or(SniError::NoExtensions)?;

    let extensions_len = cursor.u16().ok_or(SniError::NoExtensions)? as usize;
    let extensions_end = cursor.pos + extensions_len;
    if extensions_end > cursor.data.len() {
        return Err(SniError::ExtensionsTruncated);
    }

    let record = cursor.data;
    let mut pos = cursor.pos;
    while pos + 4 <= extensions_end {
        let extension_type = u16::from_be_bytes([record[pos], record[pos + 1]]);
        let extension_len = u16::from_be_bytes([record[pos + 2], record[pos + 3]]) as usize;
        pos += 4;

        if extension_type == SNI_EXTENSION {
            if pos + extension_len > extensions_end {
                return Err(SniError::MalformedSni);
            }
            return parse_server_name(&record[pos..pos + extension_len]);
        }
        pos += extension_len;
    }

    Ok(ParsedHello::NoSni)
}

/// Decodes a `server_name` extension payload (RFC 6066 §3).
fn parse_server_name(payload: &[u8]) -> Result<ParsedHello, SniError> {
    if payload.len() < 5 {
        return Err(SniError::MalformedSni);
    }
    let list_len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    let list_end = 2 + list_len;
    if list_end > payload.len() {
        return Err(SniError::MalformedSni);
    }
    // payload[2] is the name type; only host_name (0) is defined
    let name_len = u16::from_be_bytes([payload[3], payload[4]]) as usize;
    if name_len == 0 || 5 + name_len > list_end {
        return Err(SniError::MalformedSni);
    }

    match std::str::from_utf8(&payload[5..5 + name_len]) {
        Ok(host) => Ok(ParsedHello::Sni(host.to_string())),
        Err(_) => Err(SniError::MalformedSni),
    }
}

/// Bounds-checked big-endian reader over a single TLS record.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    fn u8(&mut self) -> Option<u8> {
        let b = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn u16(&mut self) -> Option<u16> {
        let bytes = self.data.get(self.pos..self.pos + 2)?;
        self.pos += 2;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        if self.pos + n > self.data.len() {
            return None;
        }
        self.pos += n;
        Some(())
    }
}
