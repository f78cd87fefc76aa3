// src/proxy/tls.rs

//! Client-facing TLS termination with certificates minted per host.

use std::io::BufReader as StdBufReader;
use std::sync::Arc;

use log::debug;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::server::Acceptor;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;

use super::upstream::provider;
use crate::certs::{CertEntry, CertificateAuthority};
use crate::error::{Error, Result};
use crate::sni;

/// Upper bound on the bytes peeked to classify a transparent connection
pub const PEEK_LIMIT: usize = 16 * 1024;
const PEEK_ATTEMPTS: usize = 50;
const PEEK_RETRY: std::time::Duration = std::time::Duration::from_millis(10);

/// Builds a server configuration presenting `entry`'s chain.
pub fn server_config(entry: &CertEntry) -> Result<Arc<ServerConfig>> {
    let certs = rustls_pemfile::certs(&mut StdBufReader::new(entry.chain_pem.as_bytes()))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::tls(format!("Unreadable certificate chain: {}", e)))?;
    if certs.is_empty() {
        return Err(Error::tls("Empty certificate chain"));
    }
    let key = rustls_pemfile::private_key(&mut StdBufReader::new(entry.key_pem.as_bytes()))
        .map_err(|e| Error::tls(format!("Unreadable private key: {}", e)))?
        .ok_or_else(|| Error::tls("No private key in PEM"))?;

    let mut config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Completes a TLS handshake as whichever host the client asks for.
///
/// The SNI picks the certificate; clients that send none get one for
/// `fallback_host`. Returns the stream and the impersonated host.
pub async fn accept<IO>(
    io: IO,
    ca: &CertificateAuthority,
    fallback_host: &str,
) -> Result<(TlsStream<IO>, String)>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let start = LazyConfigAcceptor::new(Acceptor::default(), io)
        .await
        .map_err(|e| Error::tls(format!("Reading ClientHello: {}", e)))?;
    let host = start
        .client_hello()
        .server_name()
        .map(str::to_string)
        .unwrap_or_else(|| fallback_host.to_string());

    let entry = ca.get_certificate(&host).await?;
    let config = server_config(&entry)?;
    let stream = start
        .into_stream(config)
        .await
        .map_err(|e| Error::tls(format!("Handshake as {}: {}", host, e)))?;
    debug!("TLS established as {}", host);
    Ok((stream, host))
}

/// What the first bytes of a transparent connection look like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Peeked {
    Plain,
    Tls { server_name: Option<String> },
    Closed,
}

fn record_complete(data: &[u8]) -> bool {
    if data.len() < 5 {
        return false;
    }
    let len = u16::from_be_bytes([data[3], data[4]]) as usize;
    data.len() >= (5 + len).min(PEEK_LIMIT)
}

/// Classifies a connection without consuming any of its bytes.
pub async fn peek_protocol(stream: &TcpStream) -> Result<Peeked> {
    let mut buf = vec![0u8; PEEK_LIMIT];
    let mut n = 0;
    for _ in 0..PEEK_ATTEMPTS {
        n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Ok(Peeked::Closed);
        }
        if n >= 2 && !sni::looks_like_tls_handshake(&buf[..n]) {
            return Ok(Peeked::Plain);
        }
        if record_complete(&buf[..n]) {
            break;
        }
        tokio::time::sleep(PEEK_RETRY).await;
    }

    if sni::looks_like_tls_handshake(&buf[..n]) {
        Ok(Peeked::Tls {
            server_name: sni::extract_sni(&buf[..n]),
        })
    } else {
        Ok(Peeked::Plain)
    }
}
