// src/proxy/http.rs

//! HTTP/1.x message heads and body framing on top of `httparse`.

use std::collections::BTreeMap;

use bytes::Bytes;
use http::header::{
    HeaderName, CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HOST,
    TRANSFER_ENCODING,
};
use http::{HeaderMap, HeaderValue, StatusCode, Uri};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

pub const MAX_HEAD_SIZE: usize = 64 * 1024;
pub const MAX_HEADERS: usize = 128;
const MAX_CHUNK_LINE: usize = 4096;

/// Hop-by-hop headers never forwarded in either direction.
const HOP_BY_HOP: [&str; 5] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authorization",
    "upgrade",
];

#[derive(Debug, Clone, PartialEq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    /// Minor version: 1 for HTTP/1.1, 0 for HTTP/1.0
    pub version: u8,
    pub headers: HeaderMap,
}

impl RequestHead {
    /// Whether the client expects the connection to stay open.
    pub fn keep_alive(&self) -> bool {
        let connection = header_str(&self.headers, CONNECTION).to_ascii_lowercase();
        if self.version == 0 {
            connection.contains("keep-alive")
        } else {
            !connection.contains("close")
        }
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: HeaderMap,
}

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Empty,
    Length(u64),
    Chunked,
    /// Runs until the peer closes; responses only
    UntilClose,
}

impl BodyKind {
    /// Whether the connection can carry another message afterwards.
    pub fn is_framed(&self) -> bool {
        !matches!(self, BodyKind::UntilClose)
    }
}

/// A resolved request target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub scheme: &'static str,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub url: String,
}

impl Target {
    pub fn is_tls(&self) -> bool {
        self.scheme == "https"
    }

    /// `host[:port]`, omitting the scheme's default port.
    pub fn authority(&self) -> String {
        let default = if self.is_tls() { 443 } else { 80 };
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == default {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }
}

fn find_terminator(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Reads bytes up to and including the blank line ending a message head.
///
/// Returns `None` when the peer closed before sending anything.
pub async fn read_head_bytes<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::new();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if head.is_empty() {
                return Ok(None);
            }
            return Err(Error::http("Connection closed inside message head"));
        }
        let n = available.len();
        let start = head.len().saturating_sub(3);
        head.extend_from_slice(available);

        if let Some(pos) = find_terminator(&head[start..]) {
            let end = start + pos + 4;
            let extra = head.len() - end;
            head.truncate(end);
            reader.consume(n - extra);
            return Ok(Some(head));
        }
        reader.consume(n);
        if head.len() > MAX_HEAD_SIZE {
            return Err(Error::http("Message head too large"));
        }
    }
}

fn collect_headers(parsed: &[httparse::Header<'_>]) -> Result<HeaderMap> {
    let mut headers = HeaderMap::with_capacity(parsed.len());
    for header in parsed {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|e| Error::http(format!("Invalid header name {}: {}", header.name, e)))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|e| Error::http(format!("Invalid value for {}: {}", header.name, e)))?;
        headers.append(name, value);
    }
    Ok(headers)
}

pub fn parse_request_head(data: &[u8]) -> Result<RequestHead> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut slots);
    match request.parse(data)? {
        httparse::Status::Complete(_) => {}
        httparse::Status::Partial => return Err(Error::http("Incomplete request head")),
    }
    Ok(RequestHead {
        method: request.method.unwrap_or_default().to_string(),
        target: request.path.unwrap_or_default().to_string(),
        version: request.version.unwrap_or(1),
        headers: collect_headers(request.headers)?,
    })
}

pub fn parse_response_head(data: &[u8]) -> Result<ResponseHead> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut slots);
    match response.parse(data)? {
        httparse::Status::Complete(_) => {}
        httparse::Status::Partial => return Err(Error::http("Incomplete response head")),
    }
    Ok(ResponseHead {
        status: response.code.unwrap_or(0),
        reason: response.reason.unwrap_or_default().to_string(),
        headers: collect_headers(response.headers)?,
    })
}

pub async fn read_request_head<R>(reader: &mut R) -> Result<Option<RequestHead>>
where
    R: AsyncBufRead + Unpin,
{
    match read_head_bytes(reader).await? {
        Some(data) => parse_request_head(&data).map(Some),
        None => Ok(None),
    }
}

pub async fn read_response_head<R>(reader: &mut R) -> Result<ResponseHead>
where
    R: AsyncBufRead + Unpin,
{
    match read_head_bytes(reader).await? {
        Some(data) => parse_response_head(&data),
        None => Err(Error::upstream("Upstream closed without a response")),
    }
}

pub fn header_str(headers: &HeaderMap, name: HeaderName) -> &str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("chunked"))
}

/// Declared `Content-Length`, if present and well formed.
pub fn content_length(headers: &HeaderMap) -> Result<Option<u64>> {
    match headers.get(CONTENT_LENGTH) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Some)
            .ok_or_else(|| Error::http("Invalid Content-Length")),
    }
}

pub fn request_body_kind(headers: &HeaderMap) -> Result<BodyKind> {
    if is_chunked(headers) {
        return Ok(BodyKind::Chunked);
    }
    Ok(match content_length(headers)? {
        Some(0) | None => BodyKind::Empty,
        Some(len) => BodyKind::Length(len),
    })
}

/// Body framing of a response to `method`.
///
/// # Examples
///
/// ```
/// use http::HeaderMap;
/// use packet_forge::proxy::http::{response_body_kind, BodyKind};
///
/// let headers = HeaderMap::new();
/// assert_eq!(response_body_kind("HEAD", 200, &headers).unwrap(), BodyKind::Empty);
/// assert_eq!(response_body_kind("GET", 304, &headers).unwrap(), BodyKind::Empty);
/// assert_eq!(response_body_kind("GET", 200, &headers).unwrap(), BodyKind::UntilClose);
/// ```
pub fn response_body_kind(method: &str, status: u16, headers: &HeaderMap) -> Result<BodyKind> {
    if method.eq_ignore_ascii_case("HEAD") || (100..200).contains(&status) || status == 204 || status == 304 {
        return Ok(BodyKind::Empty);
    }
    if is_chunked(headers) {
        return Ok(BodyKind::Chunked);
    }
    Ok(match content_length(headers)? {
        Some(0) => BodyKind::Empty,
        Some(len) => BodyKind::Length(len),
        None => BodyKind::UntilClose,
    })
}

/// Resolves the request target against the connection it arrived on.
///
/// Absolute-form targets stand on their own. Origin-form targets take their
/// authority from the `Host` header, falling back to `default_host`; the
/// scheme is https when the connection is TLS or landed on a TLS port.
pub fn resolve_target(
    head: &RequestHead,
    tls: bool,
    local_port: u16,
    default_host: Option<&str>,
) -> Result<Target> {
    let lowered = head.target.to_ascii_lowercase();
    let url = if lowered.starts_with("http://") || lowered.starts_with("https://") {
        head.target.clone()
    } else {
        let host = match header_str(&head.headers, HOST) {
            "" => default_host.unwrap_or(""),
            value => value,
        };
        if host.is_empty() || !head.target.starts_with('/') {
            return Err(Error::http(format!("Invalid target URL: {}", head.target)));
        }
        let scheme = if tls || local_port == 443 || local_port == 8443 {
            "https"
        } else {
            "http"
        };
        format!("{}://{}{}", scheme, host, head.target)
    };

    let uri: Uri = url
        .parse()
        .map_err(|_| Error::http(format!("Invalid target URL: {}", url)))?;
    let scheme = match uri.scheme_str() {
        Some(s) if s.eq_ignore_ascii_case("https") => "https",
        Some(s) if s.eq_ignore_ascii_case("http") => "http",
        _ => return Err(Error::http(format!("Unsupported scheme in {}", url))),
    };
    let host = uri
        .host()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
        .filter(|h| !h.is_empty())
        .ok_or_else(|| Error::http(format!("Missing host in {}", url)))?;
    let port = uri
        .port_u16()
        .unwrap_or(if scheme == "https" { 443 } else { 80 });
    let path = uri
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| "/".to_string());

    Ok(Target {
        scheme,
        host,
        port,
        path,
        url,
    })
}

/// Splits a CONNECT authority into host and port, defaulting to 443.
pub fn parse_authority(authority: &str) -> Result<(String, u16)> {
    let authority = authority.trim();
    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| Error::http(format!("Invalid authority: {}", authority)))?;
        (host, tail.strip_prefix(':'))
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };
    if host.is_empty() {
        return Err(Error::http(format!("Invalid authority: {}", authority)));
    }
    let port = match port {
        Some(p) => p
            .parse::<u16>()
            .map_err(|_| Error::http(format!("Invalid port in {}", authority)))?,
        None => 443,
    };
    Ok((host.to_string(), port))
}

/// Drops hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .collect();
    for name in HOP_BY_HOP.iter().copied().chain(listed.iter().map(String::as_str)) {
        if name == "transfer-encoding" {
            continue;
        }
        headers.remove(name);
    }
}

/// Request headers as sent to the origin.
///
/// Compression is refused so bodies stay inspectable.
pub fn upstream_request_headers(head: &RequestHead, target: &Target) -> Result<HeaderMap> {
    let mut headers = head.headers.clone();
    strip_hop_by_hop(&mut headers);
    let host = HeaderValue::from_str(&target.authority())
        .map_err(|_| Error::http(format!("Invalid host {}", target.host)))?;
    headers.insert(HOST, host);
    headers.insert(http::header::ACCEPT_ENCODING, HeaderValue::from_static("identity"));
    headers.insert(CONNECTION, HeaderValue::from_static("close"));
    Ok(headers)
}

/// Rewrites framing headers for a replaced body.
pub fn set_body_headers(headers: &mut HeaderMap, content_type: &str, len: usize) {
    if let Ok(value) = HeaderValue::from_str(content_type) {
        if !content_type.is_empty() {
            headers.insert(CONTENT_TYPE, value);
        }
    }
    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
    headers.remove(CONTENT_ENCODING);
    headers.remove(TRANSFER_ENCODING);
}

pub fn headers_to_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        map.entry(name.as_str().to_string())
            .and_modify(|existing: &mut String| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    map
}

fn encode_headers(out: &mut Vec<u8>, headers: &HeaderMap) {
    for (name, value) in headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
}

pub fn encode_request_head(method: &str, path: &str, headers: &HeaderMap) -> Vec<u8> {
    let mut out = format!("{} {} HTTP/1.1\r\n", method, path).into_bytes();
    encode_headers(&mut out, headers);
    out
}

pub fn encode_response_head(status: u16, reason: &str, headers: &HeaderMap) -> Vec<u8> {
    let reason = if reason.is_empty() {
        StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("")
    } else {
        reason
    };
    let mut out = format!("HTTP/1.1 {} {}\r\n", status, reason).into_bytes();
    encode_headers(&mut out, headers);
    out
}

/// Writes a small self-contained response.
pub async fn write_simple_response<W>(writer: &mut W, status: u16, body: &str, close: bool) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(crate::actions::TEXT_PLAIN_UTF8),
    );
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    if close {
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
    }
    let mut out = encode_response_head(status, "", &headers);
    out.extend_from_slice(body.as_bytes());
    writer.write_all(&out).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_chunk_line<R>(reader: &mut R, line: &mut String) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    let n = (&mut *reader)
        .take(MAX_CHUNK_LINE as u64)
        .read_line(line)
        .await?;
    if n == 0 || !line.ends_with('\n') {
        return Err(Error::http("Malformed chunked body"));
    }
    Ok(())
}

fn chunk_size(line: &str) -> Result<u64> {
    let size = line.split(';').next().unwrap_or("").trim();
    u64::from_str_radix(size, 16).map_err(|_| Error::http(format!("Invalid chunk size: {}", size)))
}

/// Forwards a body verbatim, returning the payload bytes it carried.
pub async fn copy_body<R, W>(reader: &mut R, writer: &mut W, kind: BodyKind) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = match kind {
        BodyKind::Empty => 0,
        BodyKind::Length(len) => {
            let copied = tokio::io::copy(&mut (&mut *reader).take(len), writer).await?;
            if copied != len {
                return Err(Error::http(format!("Body truncated at {} of {} bytes", copied, len)));
            }
            copied
        }
        BodyKind::UntilClose => tokio::io::copy(reader, writer).await?,
        BodyKind::Chunked => {
            let mut total = 0;
            let mut line = String::new();
            loop {
                read_chunk_line(reader, &mut line).await?;
                writer.write_all(line.as_bytes()).await?;
                let size = chunk_size(&line)?;
                if size == 0 {
                    // trailers up to the blank line
                    loop {
                        read_chunk_line(reader, &mut line).await?;
                        writer.write_all(line.as_bytes()).await?;
                        if line.trim().is_empty() {
                            break;
                        }
                    }
                    break;
                }
                let copied = tokio::io::copy(&mut (&mut *reader).take(size + 2), writer).await?;
                if copied != size + 2 {
                    return Err(Error::http("Chunk truncated"));
                }
                total += size;
            }
            total
        }
    };
    writer.flush().await?;
    Ok(copied)
}

/// Reads a length-delimited body into memory.
pub async fn read_body<R>(reader: &mut R, len: u64) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let len = usize::try_from(len).map_err(|_| Error::http("Body too large"))?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Bytes::from(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    fn request(raw: &str) -> RequestHead {
        parse_request_head(raw.as_bytes()).unwrap()
    }

    #[tokio::test]
    async fn test_read_head_leaves_body_buffered() {
        let raw = b"POST /x HTTP/1.1\r\nHost: a\r\nContent-Length: 4\r\n\r\nbody";
        let mut reader = BufReader::with_capacity(8, &raw[..]);
        let head = read_request_head(&mut reader).await.unwrap().unwrap();
        assert_eq!(head.method, "POST");
        assert_eq!(request_body_kind(&head.headers).unwrap(), BodyKind::Length(4));

        let body = read_body(&mut reader, 4).await.unwrap();
        assert_eq!(&body[..], b"body");
        assert!(read_request_head(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_head_is_error() {
        let raw = b"GET / HTTP/1.1\r\nHost: a\r\n";
        let mut reader = BufReader::new(&raw[..]);
        assert!(read_request_head(&mut reader).await.is_err());
    }

    #[test]
    fn test_keep_alive() {
        assert!(request("GET / HTTP/1.1\r\nHost: a\r\n\r\n").keep_alive());
        assert!(!request("GET / HTTP/1.1\r\nConnection: close\r\n\r\n").keep_alive());
        assert!(!request("GET / HTTP/1.0\r\n\r\n").keep_alive());
        assert!(request("GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n").keep_alive());
    }

    #[test]
    fn test_resolve_absolute_target() {
        let head = request("GET http://example.com:8080/a?b=1 HTTP/1.1\r\n\r\n");
        let target = resolve_target(&head, false, 8888, None).unwrap();
        assert_eq!(target.scheme, "http");
        assert_eq!(target.host, "example.com");
        assert_eq!(target.port, 8080);
        assert_eq!(target.path, "/a?b=1");
        assert_eq!(target.authority(), "example.com:8080");
    }

    #[test]
    fn test_resolve_origin_form_target() {
        let head = request("GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n");
        let plain = resolve_target(&head, false, 8888, None).unwrap();
        assert_eq!(plain.url, "http://example.com/index.html");

        let tls = resolve_target(&head, true, 8888, None).unwrap();
        assert_eq!(tls.url, "https://example.com/index.html");
        assert_eq!(tls.port, 443);

        let by_port = resolve_target(&head, false, 8443, None).unwrap();
        assert_eq!(by_port.scheme, "https");
    }

    #[test]
    fn test_resolve_uses_default_host() {
        let head = request("GET / HTTP/1.1\r\n\r\n");
        assert!(resolve_target(&head, true, 8888, None).is_err());
        let target = resolve_target(&head, true, 8888, Some("sni.example")).unwrap();
        assert_eq!(target.url, "https://sni.example/");
    }

    #[test]
    fn test_parse_authority() {
        assert_eq!(parse_authority("example.com:8443").unwrap(), ("example.com".to_string(), 8443));
        assert_eq!(parse_authority("example.com").unwrap(), ("example.com".to_string(), 443));
        assert_eq!(parse_authority("[::1]:443").unwrap(), ("::1".to_string(), 443));
        assert!(parse_authority(":443").is_err());
        assert!(parse_authority("host:port").is_err());
    }

    #[test]
    fn test_upstream_headers() {
        let head = request(
            "GET / HTTP/1.1\r\nHost: old\r\nProxy-Connection: keep-alive\r\nProxy-Authorization: x\r\nAccept-Encoding: gzip\r\nX-Keep: 1\r\n\r\n",
        );
        let target = resolve_target(&head, false, 80, None).unwrap();
        let headers = upstream_request_headers(&head, &target).unwrap();
        assert_eq!(header_str(&headers, HOST), "old");
        assert_eq!(header_str(&headers, http::header::ACCEPT_ENCODING), "identity");
        assert!(headers.get("proxy-connection").is_none());
        assert!(headers.get("proxy-authorization").is_none());
        assert_eq!(headers.get("x-keep").unwrap(), "1");
    }

    #[test]
    fn test_strip_connection_listed_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("close, X-Private"));
        headers.insert("x-private", HeaderValue::from_static("1"));
        headers.insert("x-public", HeaderValue::from_static("1"));
        strip_hop_by_hop(&mut headers);
        assert!(headers.get(CONNECTION).is_none());
        assert!(headers.get("x-private").is_none());
        assert!(headers.get("x-public").is_some());
    }

    #[test]
    fn test_set_body_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        set_body_headers(&mut headers, "text/plain", 7);
        assert_eq!(headers.get(CONTENT_LENGTH).unwrap(), "7");
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "text/plain");
        assert!(headers.get(CONTENT_ENCODING).is_none());
        assert!(headers.get(TRANSFER_ENCODING).is_none());
    }

    #[tokio::test]
    async fn test_copy_chunked_body() {
        let raw = b"4;ext=1\r\nWiki\r\n5\r\npedia\r\n0\r\nX-Trailer: t\r\n\r\nNEXT";
        let mut reader = BufReader::new(&raw[..]);
        let mut out = Vec::new();
        let copied = copy_body(&mut reader, &mut out, BodyKind::Chunked).await.unwrap();
        assert_eq!(copied, 9);
        assert_eq!(out, &raw[..raw.len() - 4]);

        let mut rest = String::new();
        reader.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "NEXT");
    }

    #[tokio::test]
    async fn test_copy_short_body_fails() {
        let raw = b"abc";
        let mut reader = BufReader::new(&raw[..]);
        let mut out = Vec::new();
        assert!(copy_body(&mut reader, &mut out, BodyKind::Length(10)).await.is_err());
    }

    #[test]
    fn test_encode_response_head() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from(0));
        let head = encode_response_head(404, "", &headers);
        assert_eq!(head, b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\n\r\n");
    }

    #[test]
    fn test_headers_to_map_joins_repeats() {
        let mut headers = HeaderMap::new();
        headers.append("set-cookie", HeaderValue::from_static("a=1"));
        headers.append("set-cookie", HeaderValue::from_static("b=2"));
        let map = headers_to_map(&headers);
        assert_eq!(map["set-cookie"], "a=1, b=2");
    }
}
