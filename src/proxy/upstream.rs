// src/proxy/upstream.rs

//! Connections from the proxy to origin servers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{self, CryptoProvider};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;

use crate::error::{Error, Result};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedIo = Box<dyn AsyncStream>;

/// Opens byte streams to origins.
#[async_trait]
pub trait OriginConnector: Send + Sync {
    /// Connects to `host:port`, wrapping the stream in TLS when `tls` is set.
    async fn connect(&self, host: &str, port: u16, tls: bool) -> Result<BoxedIo>;
}

pub(crate) fn provider() -> Arc<CryptoProvider> {
    Arc::new(crypto::ring::default_provider())
}

/// Plain TCP with an optional rustls client on top.
pub struct TcpConnector {
    tls: TlsConnector,
    timeout: Duration,
}

impl TcpConnector {
    /// Connector trusting the platform's root store.
    ///
    /// With `insecure` set, origin certificates are not verified at all.
    pub fn new(insecure: bool) -> Result<Self> {
        if insecure {
            warn!("Upstream certificate verification is disabled");
            let config = ClientConfig::builder_with_provider(provider())
                .with_safe_default_protocol_versions()?
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider())))
                .with_no_client_auth();
            return Ok(Self::from_config(config));
        }
        Self::with_roots(native_roots())
    }

    pub fn with_roots(roots: RootCertStore) -> Result<Self> {
        let config = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Self::from_config(config))
    }

    fn from_config(mut config: ClientConfig) -> Self {
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        TcpConnector {
            tls: TlsConnector::from(Arc::new(config)),
            timeout: CONNECT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

fn native_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    let loaded = rustls_native_certs::load_native_certs();
    for err in &loaded.errors {
        warn!("Failed to load a platform root certificate: {}", err);
    }
    let (added, ignored) = roots.add_parsable_certificates(loaded.certs);
    debug!("Loaded {} platform root certificates ({} ignored)", added, ignored);
    roots
}

#[async_trait]
impl OriginConnector for TcpConnector {
    async fn connect(&self, host: &str, port: u16, tls: bool) -> Result<BoxedIo> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| Error::Timeout(format!("connecting to {}:{}", host, port)))?
            .map_err(|e| Error::upstream(format!("{}:{}: {}", host, port, e)))?;
        stream.set_nodelay(true)?;
        if !tls {
            return Ok(Box::new(stream));
        }

        let name = ServerName::try_from(host.to_string())
            .map_err(|e| Error::upstream(format!("Invalid server name {}: {}", host, e)))?;
        let stream = tokio::time::timeout(self.timeout, self.tls.connect(name, stream))
            .await
            .map_err(|_| Error::Timeout(format!("TLS handshake with {}", host)))?
            .map_err(|e| Error::upstream(format!("TLS handshake with {}: {}", host, e)))?;
        Ok(Box::new(stream))
    }
}

#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_plain_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"hello").await.unwrap();
        });

        let connector = TcpConnector::with_roots(RootCertStore::empty()).unwrap();
        let mut stream = connector.connect("127.0.0.1", port, false).await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_refused_connect_is_upstream_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = TcpConnector::with_roots(RootCertStore::empty()).unwrap();
        let err = match connector.connect("127.0.0.1", port, false).await {
            Ok(_) => panic!("connect should fail"),
            Err(e) => e,
        };
        assert!(err.is_upstream());
    }
}
