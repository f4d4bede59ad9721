//! Local certificate authority for TLS interception.
//!
//! Issues a self-signed identity and persists it as a PEM pair. Each PEM
//! is serialized in memory first and written through a temp file in the
//! destination directory, so a crash mid-issue never leaves a cert
//! without its key on disk.

use chrono::{DateTime, Utc};
use rcgen::{
    Certificate, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    KeyUsagePurpose, SanType,
};
use rustls::{Certificate as RustlsCertificate, PrivateKey};
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use tracing::info;

use crate::config::{SubjectSettings, TlsSettings};
use crate::error::CertificateError;

/// An issued identity: leaf certificate plus private key, PEM-encoded.
#[derive(Debug, Clone)]
pub struct TlsIdentity {
    pub cert_pem: String,
    pub key_pem: String,
}

impl TlsIdentity {
    /// The certificate chain in the form rustls wants.
    pub fn cert_chain(&self) -> Result<Vec<RustlsCertificate>, CertificateError> {
        let mut reader = std::io::Cursor::new(self.cert_pem.as_bytes());
        let certs = rustls_pemfile::certs(&mut reader)
            .map_err(|err| CertificateError::Parse(err.to_string()))?;
        if certs.is_empty() {
            return Err(CertificateError::Parse(
                "no certificate found in PEM".to_string(),
            ));
        }
        Ok(certs.into_iter().map(RustlsCertificate).collect())
    }

    /// The private key in the form rustls wants.
    pub fn private_key(&self) -> Result<PrivateKey, CertificateError> {
        let mut reader = std::io::Cursor::new(self.key_pem.as_bytes());
        let mut keys = rustls_pemfile::pkcs8_private_keys(&mut reader)
            .map_err(|err| CertificateError::Parse(err.to_string()))?;
        let key = keys
            .pop()
            .ok_or_else(|| CertificateError::Parse("no private key found in PEM".to_string()))?;
        Ok(PrivateKey(key))
    }
}

/// Presence report for the on-disk identity.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityStatus {
    pub present: bool,
    pub created_at: Option<DateTime<Utc>>,
    /// Rendered subject DN of the persisted certificate.
    pub subject: Option<String>,
}

/// Issues and persists the proxy's TLS identity.
#[derive(Debug)]
pub struct CertificateAuthority {
    cert_path: PathBuf,
    key_path: PathBuf,
    subject: SubjectSettings,
    validity_days: u32,
    // Serializes concurrent issue() calls against the same pair of paths.
    write_lock: Mutex<()>,
}

impl CertificateAuthority {
    pub fn new(
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
        subject: SubjectSettings,
        validity_days: u32,
    ) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            subject,
            validity_days,
            write_lock: Mutex::new(()),
        }
    }

    pub fn from_settings(settings: &TlsSettings) -> Self {
        Self::new(
            &settings.cert_path,
            &settings.key_path,
            settings.subject.clone(),
            settings.validity_days,
        )
    }

    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    /// Issues a fresh identity and persists it, replacing any previous pair.
    pub async fn issue(&self) -> Result<TlsIdentity, CertificateError> {
        let _guard = self.write_lock.lock().await;
        let subject = self.subject.clone();
        let validity_days = self.validity_days;
        let cert_path = self.cert_path.clone();
        let key_path = self.key_path.clone();

        // Key generation is CPU-bound, keep it off the runtime workers.
        let identity = tokio::task::spawn_blocking(move || {
            let identity = generate_identity(&subject, validity_days)?;
            persist_pair(&identity, &cert_path, &key_path)?;
            Ok::<_, CertificateError>(identity)
        })
        .await??;

        info!(
            "📜 Issued TLS identity: CN={} ({} days)",
            self.subject.common_name, self.validity_days
        );
        Ok(identity)
    }

    /// Loads the persisted identity from disk.
    pub async fn load(&self) -> Result<TlsIdentity, CertificateError> {
        let cert_path = self.cert_path.clone();
        let key_path = self.key_path.clone();
        tokio::task::spawn_blocking(move || {
            if !cert_path.exists() || !key_path.exists() {
                return Err(CertificateError::NotFound {
                    cert_path,
                    key_path,
                });
            }
            let cert_pem = std::fs::read_to_string(&cert_path).map_err(|source| {
                CertificateError::Read {
                    path: cert_path.clone(),
                    source,
                }
            })?;
            let key_pem = std::fs::read_to_string(&key_path).map_err(|source| {
                CertificateError::Read {
                    path: key_path.clone(),
                    source,
                }
            })?;
            Ok(TlsIdentity { cert_pem, key_pem })
        })
        .await?
    }

    /// Loads the identity, issuing a fresh one when none is on disk.
    pub async fn load_or_issue(&self) -> Result<TlsIdentity, CertificateError> {
        match self.load().await {
            Ok(identity) => Ok(identity),
            Err(CertificateError::NotFound { .. }) => self.issue().await,
            Err(err) => Err(err),
        }
    }

    /// Reports whether a complete identity exists, when it was issued, and
    /// with what subject.
    ///
    /// A pair with only one file on disk counts as absent.
    pub async fn status(&self) -> Result<IdentityStatus, CertificateError> {
        let cert_path = self.cert_path.clone();
        let key_path = self.key_path.clone();
        tokio::task::spawn_blocking(move || {
            if !cert_path.exists() || !key_path.exists() {
                return Ok(IdentityStatus {
                    present: false,
                    created_at: None,
                    subject: None,
                });
            }
            let pem = std::fs::read(&cert_path).map_err(|source| CertificateError::Read {
                path: cert_path.clone(),
                source,
            })?;
            let (created_at, subject) = parse_certificate_metadata(&pem)?;
            Ok(IdentityStatus {
                present: true,
                created_at: Some(created_at),
                subject: Some(subject),
            })
        })
        .await?
    }
}

fn generate_identity(
    subject: &SubjectSettings,
    validity_days: u32,
) -> Result<TlsIdentity, CertificateError> {
    let mut params = CertificateParams::new(vec![subject.common_name.clone()]);

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, subject.common_name.as_str());
    dn.push(DnType::OrganizationName, subject.organization.as_str());
    dn.push(
        DnType::OrganizationalUnitName,
        subject.organizational_unit.as_str(),
    );
    dn.push(DnType::CountryName, subject.country.as_str());
    dn.push(DnType::StateOrProvinceName, subject.state_province.as_str());
    dn.push(DnType::LocalityName, subject.locality.as_str());
    params.distinguished_name = dn;

    let now = SystemTime::now();
    params.not_before = now.into();
    params.not_after =
        (now + Duration::from_secs(u64::from(validity_days) * 24 * 60 * 60)).into();

    // Cover the loopback names clients actually dial the listener with.
    params.subject_alt_names = vec![
        SanType::DnsName(subject.common_name.clone()),
        SanType::DnsName("localhost".to_string()),
        SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        SanType::IpAddress(IpAddr::V6(Ipv6Addr::LOCALHOST)),
    ];

    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let cert = Certificate::from_params(params)?;
    let cert_pem = cert.serialize_pem().map_err(CertificateError::Serialization)?;
    let key_pem = cert.serialize_private_key_pem();

    Ok(TlsIdentity { cert_pem, key_pem })
}

fn persist_pair(
    identity: &TlsIdentity,
    cert_path: &Path,
    key_path: &Path,
) -> Result<(), CertificateError> {
    for path in [cert_path, key_path] {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| CertificateError::Persist {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
    }

    write_atomically(cert_path, identity.cert_pem.as_bytes())?;
    write_atomically(key_path, identity.key_pem.as_bytes())?;
    Ok(())
}

fn write_atomically(path: &Path, contents: &[u8]) -> Result<(), CertificateError> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let persist_err = |source| CertificateError::Persist {
        path: path.to_path_buf(),
        source,
    };

    let mut file = tempfile::NamedTempFile::new_in(dir).map_err(persist_err)?;
    file.write_all(contents).map_err(persist_err)?;
    file.persist(path).map_err(|err| CertificateError::Persist {
        path: path.to_path_buf(),
        source: err.error,
    })?;
    Ok(())
}

fn parse_certificate_metadata(pem: &[u8]) -> Result<(DateTime<Utc>, String), CertificateError> {
    let (_, parsed) = x509_parser::pem::parse_x509_pem(pem)
        .map_err(|err| CertificateError::Parse(err.to_string()))?;
    let cert = parsed
        .parse_x509()
        .map_err(|err| CertificateError::Parse(err.to_string()))?;
    let seconds = cert.validity().not_before.timestamp();
    let created_at = DateTime::<Utc>::from_timestamp(seconds, 0)
        .ok_or_else(|| CertificateError::Parse(format!("timestamp out of range: {seconds}")))?;
    Ok((created_at, cert.subject().to_string()))
}
