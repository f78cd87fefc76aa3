// src/sni.rs

//! TLS ClientHello inspection.

use log::{debug, trace};

const RECORD_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST: u8 = 0x00;

/// Whether the buffer starts like a TLS handshake record.
pub fn looks_like_tls_handshake(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == RECORD_HANDSHAKE && data[1] == 0x03
}

/// Bounds-checked cursor over a byte slice.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    fn u8(&mut self) -> Option<u8> {
        let value = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(value)
    }

    fn u16(&mut self) -> Option<u16> {
        let bytes = self.take(2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u24(&mut self) -> Option<usize> {
        let bytes = self.take(3)?;
        Some(((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | bytes[2] as usize)
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let slice = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn skip(&mut self, len: usize) -> Option<()> {
        self.take(len).map(|_| ())
    }
}

/// Extracts the host name from the server-name extension of a ClientHello.
///
/// Returns `None` for anything that is not a well-formed ClientHello carrying
/// a host-name entry. Only the first record is examined, and it may be
/// truncated as long as the extension itself is present.
///
/// # Examples
///
/// ```
/// use packet_forge::sni::extract_sni;
///
/// assert_eq!(extract_sni(b"GET / HTTP/1.1\r\n"), None);
/// ```
pub fn extract_sni(data: &[u8]) -> Option<String> {
    if !looks_like_tls_handshake(data) {
        return None;
    }
    trace!("Attempting to extract SNI from {} bytes", data.len());

    let mut record = Reader::new(data);
    record.skip(3)?; // content type, version
    let record_len = record.u16()? as usize;
    let available = data.len().saturating_sub(5).min(record_len);
    let mut hello = Reader::new(record.take(available)?);

    if hello.u8()? != HANDSHAKE_CLIENT_HELLO {
        return None;
    }
    let _handshake_len = hello.u24()?;
    hello.skip(2 + 32)?; // client version, random

    let session_id_len = hello.u8()? as usize;
    hello.skip(session_id_len)?;
    let cipher_suites_len = hello.u16()? as usize;
    hello.skip(cipher_suites_len)?;
    let compression_len = hello.u8()? as usize;
    hello.skip(compression_len)?;

    let extensions_len = hello.u16()? as usize;
    let remaining = hello.data.len() - hello.pos;
    let mut extensions = Reader::new(hello.take(extensions_len.min(remaining))?);

    while let (Some(kind), Some(len)) = (extensions.u16(), extensions.u16()) {
        let body = extensions.take(len as usize)?;
        if kind != EXTENSION_SERVER_NAME {
            continue;
        }

        let mut names = Reader::new(body);
        let list_len = names.u16()? as usize;
        let mut list = Reader::new(names.take(list_len)?);
        while let Some(name_type) = list.u8() {
            let name_len = list.u16()? as usize;
            let name = list.take(name_len)?;
            if name_type == NAME_TYPE_HOST {
                let host = std::str::from_utf8(name).ok()?;
                if host.is_empty() {
                    return None;
                }
                debug!("Found SNI: {}", host);
                return Some(host.to_string());
            }
        }
        return None;
    }

    None
}

/// Builds a minimal ClientHello record naming `host`.
#[cfg(test)]
pub(crate) fn client_hello(host: &str) -> Vec<u8> {
    let name = host.as_bytes();

    let mut sni = Vec::new();
    sni.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
    sni.push(NAME_TYPE_HOST);
    sni.extend_from_slice(&(name.len() as u16).to_be_bytes());
    sni.extend_from_slice(name);

    let mut extensions = Vec::new();
    // An unrelated extension first (supported_groups) to exercise the walk.
    extensions.extend_from_slice(&[0x00, 0x0a, 0x00, 0x04, 0x00, 0x02, 0x00, 0x1d]);
    extensions.extend_from_slice(&EXTENSION_SERVER_NAME.to_be_bytes());
    extensions.extend_from_slice(&(sni.len() as u16).to_be_bytes());
    extensions.extend_from_slice(&sni);

    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]);
    body.extend_from_slice(&[0xab; 32]);
    body.push(32);
    body.extend_from_slice(&[0xcd; 32]);
    body.extend_from_slice(&[0x00, 0x04, 0x13, 0x01, 0x13, 0x02]);
    body.extend_from_slice(&[0x01, 0x00]);
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut handshake = vec![HANDSHAKE_CLIENT_HELLO];
    handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&body);

    let mut record = vec![RECORD_HANDSHAKE, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_sni() {
        let hello = client_hello("www.example.com");
        assert_eq!(extract_sni(&hello).as_deref(), Some("www.example.com"));
    }

    #[test]
    fn test_non_tls() {
        assert_eq!(extract_sni(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n"), None);
        assert_eq!(extract_sni(&[]), None);
    }

    #[test]
    fn test_truncated_hello() {
        let hello = client_hello("www.example.com");
        for cut in [3, 10, 44, 80, hello.len() - 4] {
            assert_eq!(extract_sni(&hello[..cut]), None, "cut at {}", cut);
        }
    }

    #[test]
    fn test_bogus_lengths() {
        let mut hello = client_hello("a.example");
        // session id length pointing past the end
        hello[5 + 4 + 2 + 32] = 0xff;
        assert_eq!(extract_sni(&hello), None);
    }

    #[test]
    fn test_not_client_hello() {
        let mut hello = client_hello("a.example");
        hello[5] = 0x02;
        assert_eq!(extract_sni(&hello), None);
    }

    #[test]
    fn test_looks_like_tls() {
        assert!(looks_like_tls_handshake(&[0x16, 0x03, 0x01]));
        assert!(!looks_like_tls_handshake(b"GET"));
        assert!(!looks_like_tls_handshake(&[0x16]));
    }
}
