// src/certs.rs

//! Local certificate authority.
//!
//! The root key and certificate live under `<base>/ca/`, per-host leaves under
//! `<base>/hosts/`. Leaves found on disk are reused only when their signature
//! verifies against the current root, so regenerating the CA silently
//! invalidates every stale leaf.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use rand::Rng;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio::sync::OnceCell;
use x509_parser::pem::parse_x509_pem;

use crate::error::{Error, Result};

const RSA_BITS: usize = 2048;
/// Backdating of `notBefore` to tolerate clock skew on the victim
const NOT_BEFORE_SKEW_SECS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CaOptions {
    pub base_dir: PathBuf,
    pub common_name: String,
    pub organization: String,
    pub ca_validity_days: i64,
    pub leaf_validity_days: i64,
}

impl Default for CaOptions {
    fn default() -> Self {
        CaOptions {
            base_dir: PathBuf::from(".packet_forge"),
            common_name: "PacketForge Local CA".to_string(),
            organization: "PacketForge".to_string(),
            ca_validity_days: 3650,
            leaf_validity_days: 825,
        }
    }
}

/// PEM material for one impersonated host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertEntry {
    pub key_pem: String,
    pub cert_pem: String,
    /// Leaf followed by the root
    pub chain_pem: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaStatus {
    pub ready: bool,
    pub ca_cert_path: PathBuf,
    pub cached_hosts: usize,
}

struct CaMaterial {
    issuer: Issuer<'static, KeyPair>,
    cert_pem: String,
}

/// Strips IPv6 brackets and a trailing dot, lowercases.
pub fn normalize_host(host: &str) -> String {
    host.trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

/// Filesystem-safe token for a host name.
///
/// # Examples
///
/// ```
/// use packet_forge::certs::sanitize_host;
///
/// assert_eq!(sanitize_host("[fe80::1]"), "fe80__1");
/// assert_eq!(sanitize_host("www.example.com"), "www.example.com");
/// assert_eq!(sanitize_host(""), "unknown");
/// ```
pub fn sanitize_host(host: &str) -> String {
    let normalized = host.trim_start_matches('[').trim_end_matches(']');
    if normalized.is_empty() {
        return "unknown".to_string();
    }
    normalized
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn generate_rsa_key() -> Result<KeyPair> {
    let mut rng = rand::thread_rng();
    let key = RsaPrivateKey::new(&mut rng, RSA_BITS)
        .map_err(|e| Error::certificate(format!("Failed to generate RSA key: {}", e)))?;
    let pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| Error::certificate(format!("Failed to encode RSA key: {}", e)))?;
    Ok(KeyPair::from_pem(&pem)?)
}

fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes);
    // keep the serial positive
    bytes[0] &= 0x7f;
    SerialNumber::from_slice(&bytes)
}

fn generate_ca(options: &CaOptions) -> Result<(String, String)> {
    let key_pair = generate_rsa_key()?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, options.common_name.as_str());
    dn.push(DnType::OrganizationName, options.organization.as_str());
    params.distinguished_name = dn;
    params.serial_number = Some(random_serial());
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::CrlSign,
    ];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_SKEW_SECS);
    params.not_after = now + Duration::days(options.ca_validity_days);

    let cert = params.self_signed(&key_pair)?;
    Ok((key_pair.serialize_pem(), cert.pem()))
}

fn generate_leaf(host: &str, ca: &CaMaterial, options: &CaOptions) -> Result<CertEntry> {
    let key_pair = generate_rsa_key()?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    dn.push(DnType::OrganizationName, options.organization.as_str());
    params.distinguished_name = dn;
    params.serial_number = Some(random_serial());
    params.subject_alt_names = match host.parse::<IpAddr>() {
        Ok(ip) => vec![SanType::IpAddress(ip)],
        Err(_) => vec![SanType::DnsName(host.try_into().map_err(|_| {
            Error::certificate(format!("Invalid host name: {}", host))
        })?)],
    };
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.use_authority_key_identifier_extension = true;

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_SKEW_SECS);
    params.not_after = now + Duration::days(options.leaf_validity_days);

    let cert = params.signed_by(&key_pair, &ca.issuer)?;
    let cert_pem = cert.pem();
    Ok(CertEntry {
        key_pem: key_pair.serialize_pem(),
        chain_pem: format!("{}\n{}", cert_pem, ca.cert_pem),
        cert_pem,
    })
}

/// Whether `cert_pem` is currently valid and signed by the root in `ca_pem`.
pub fn verify_leaf(cert_pem: &str, ca_pem: &str) -> bool {
    let Ok((_, leaf_pem)) = parse_x509_pem(cert_pem.as_bytes()) else {
        return false;
    };
    let Ok((_, ca_pem)) = parse_x509_pem(ca_pem.as_bytes()) else {
        return false;
    };
    let (Ok(leaf), Ok(ca)) = (leaf_pem.parse_x509(), ca_pem.parse_x509()) else {
        return false;
    };
    leaf.validity().is_valid() && leaf.verify_signature(Some(ca.public_key())).is_ok()
}

async fn read_if_exists(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path).await {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_pem(path: &Path, data: &str, private: bool) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(path, data).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = if private { 0o600 } else { 0o644 };
        fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    }
    #[cfg(not(unix))]
    let _ = private;

    Ok(())
}

/// Mints and caches the root and per-host certificates.
///
/// Concurrent callers share one in-flight generation, both for the root and
/// for each host.
pub struct CertificateAuthority {
    options: CaOptions,
    ca: OnceCell<Arc<CaMaterial>>,
    hosts: Mutex<HashMap<String, Arc<OnceCell<Arc<CertEntry>>>>>,
}

impl CertificateAuthority {
    pub fn new(options: CaOptions) -> Self {
        CertificateAuthority {
            options,
            ca: OnceCell::new(),
            hosts: Mutex::new(HashMap::new()),
        }
    }

    pub fn options(&self) -> &CaOptions {
        &self.options
    }

    pub fn ca_key_path(&self) -> PathBuf {
        self.options.base_dir.join("ca").join("ca.key")
    }

    pub fn ca_cert_path(&self) -> PathBuf {
        self.options.base_dir.join("ca").join("ca.crt")
    }

    fn host_paths(&self, host: &str) -> (PathBuf, PathBuf) {
        let dir = self.options.base_dir.join("hosts");
        let token = sanitize_host(host);
        (
            dir.join(format!("{}.key", token)),
            dir.join(format!("{}.crt", token)),
        )
    }

    async fn load_ca(&self) -> Result<Option<CaMaterial>> {
        let key_pem = read_if_exists(&self.ca_key_path()).await?;
        let cert_pem = read_if_exists(&self.ca_cert_path()).await?;
        let (Some(key_pem), Some(cert_pem)) = (key_pem, cert_pem) else {
            return Ok(None);
        };

        let material = KeyPair::from_pem(&key_pem)
            .and_then(|key| Issuer::from_ca_cert_pem(&cert_pem, key));
        match material {
            Ok(issuer) => Ok(Some(CaMaterial { issuer, cert_pem })),
            Err(e) => {
                warn!("Stored CA is unusable ({}), generating a new one", e);
                Ok(None)
            }
        }
    }

    async fn create_ca(&self) -> Result<CaMaterial> {
        if let Some(existing) = self.load_ca().await? {
            debug!("Loaded CA from {}", self.ca_cert_path().display());
            return Ok(existing);
        }

        let options = self.options.clone();
        let (key_pem, cert_pem) = tokio::task::spawn_blocking(move || generate_ca(&options))
            .await
            .map_err(|e| Error::certificate(format!("CA generation task failed: {}", e)))??;

        write_pem(&self.ca_key_path(), &key_pem, true).await?;
        write_pem(&self.ca_cert_path(), &cert_pem, false).await?;
        info!("Generated new CA at {}", self.ca_cert_path().display());

        let key = KeyPair::from_pem(&key_pem)?;
        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key)?;
        Ok(CaMaterial { issuer, cert_pem })
    }

    async fn material(&self) -> Result<Arc<CaMaterial>> {
        let ca = self
            .ca
            .get_or_try_init(|| async { self.create_ca().await.map(Arc::new) })
            .await?;
        Ok(Arc::clone(ca))
    }

    /// Loads the root from disk or generates it, returning its PEM certificate.
    pub async fn ensure_ca(&self) -> Result<String> {
        Ok(self.material().await?.cert_pem.clone())
    }

    pub async fn status(&self) -> CaStatus {
        let ready = self.ca.initialized() || fs::metadata(self.ca_cert_path()).await.is_ok();
        CaStatus {
            ready,
            ca_cert_path: self.ca_cert_path(),
            cached_hosts: self.cached_hosts(),
        }
    }

    pub fn cached_hosts(&self) -> usize {
        self.hosts
            .lock()
            .map(|hosts| hosts.values().filter(|cell| cell.initialized()).count())
            .unwrap_or(0)
    }

    /// Certificate impersonating `host`, from memory, disk or freshly minted.
    pub async fn get_certificate(&self, host: &str) -> Result<Arc<CertEntry>> {
        let host = normalize_host(host);
        if host.is_empty() {
            return Err(Error::certificate("Invalid host for certificate"));
        }

        let cell = {
            let mut hosts = self
                .hosts
                .lock()
                .map_err(|_| Error::certificate("host cache poisoned"))?;
            Arc::clone(hosts.entry(host.clone()).or_default())
        };

        let entry = cell
            .get_or_try_init(|| async { self.create_leaf(&host).await.map(Arc::new) })
            .await?;
        Ok(Arc::clone(entry))
    }

    async fn create_leaf(&self, host: &str) -> Result<CertEntry> {
        let ca = self.material().await?;
        let (key_path, cert_path) = self.host_paths(host);

        let key_pem = read_if_exists(&key_path).await?;
        let cert_pem = read_if_exists(&cert_path).await?;
        if let (Some(key_pem), Some(cert_pem)) = (key_pem, cert_pem) {
            if verify_leaf(&cert_pem, &ca.cert_pem) {
                debug!("Reusing stored certificate for {}", host);
                return Ok(CertEntry {
                    key_pem,
                    chain_pem: format!("{}\n{}", cert_pem, ca.cert_pem),
                    cert_pem,
                });
            }
            debug!("Stored certificate for {} does not match the CA", host);
        }

        let options = self.options.clone();
        let owned_host = host.to_string();
        let signer = Arc::clone(&ca);
        let entry = tokio::task::spawn_blocking(move || generate_leaf(&owned_host, &signer, &options))
            .await
            .map_err(|e| Error::certificate(format!("Leaf generation task failed: {}", e)))??;

        write_pem(&key_path, &entry.key_pem, true).await?;
        write_pem(&cert_path, &entry.cert_pem, false).await?;
        info!("Minted certificate for {}", host);
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_host() {
        assert_eq!(sanitize_host("a b/c"), "a_b_c");
        assert_eq!(sanitize_host("[::1]"), "__1");
        assert_eq!(sanitize_host("EXAMPLE.com"), "EXAMPLE.com");
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host(" Example.COM. "), "example.com");
        assert_eq!(normalize_host("[::1]"), "::1");
    }

    #[test]
    fn test_leaf_signed_by_ca() {
        let options = CaOptions::default();
        let (key_pem, cert_pem) = generate_ca(&options).unwrap();
        let key = KeyPair::from_pem(&key_pem).unwrap();
        let ca = CaMaterial {
            issuer: Issuer::from_ca_cert_pem(&cert_pem, key).unwrap(),
            cert_pem: cert_pem.clone(),
        };

        let leaf = generate_leaf("example.com", &ca, &options).unwrap();
        assert!(verify_leaf(&leaf.cert_pem, &cert_pem));
        assert!(leaf.chain_pem.starts_with(&leaf.cert_pem));
        assert!(leaf.chain_pem.ends_with(&cert_pem));

        let (_, other_ca) = generate_ca(&options).unwrap();
        assert!(!verify_leaf(&leaf.cert_pem, &other_ca));
        assert!(!verify_leaf("garbage", &cert_pem));
    }

    #[test]
    fn test_ip_leaf() {
        let options = CaOptions::default();
        let (key_pem, cert_pem) = generate_ca(&options).unwrap();
        let ca = CaMaterial {
            issuer: Issuer::from_ca_cert_pem(&cert_pem, KeyPair::from_pem(&key_pem).unwrap())
                .unwrap(),
            cert_pem: cert_pem.clone(),
        };
        let leaf = generate_leaf("192.168.1.10", &ca, &options).unwrap();
        assert!(verify_leaf(&leaf.cert_pem, &cert_pem));
    }
}
