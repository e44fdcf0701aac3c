//! Certificate Authority (CA) material for forging host certificates
//!
//! The CA pair is loaded once at TLS-mode configuration time. Every host
//! certificate the proxy presents to a client is signed by it.
//!

use crate::error::{Error, Result};
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::net::IpAddr;
use std::path::Path;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Host certificate validity period in seconds (1 year)
const TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Offset for not_before timestamp to handle clock skew (60 seconds)
const NOT_BEFORE_OFFSET: i64 = 60;
/// Common name used for generated CA certificates
const CA_COMMON_NAME: &str = "Intercept Proxy CA";

/// Metadata of a forged leaf certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafInfo {
  /// Subject common name (the impersonated hostname)
  pub common_name: String,
  /// Random serial number
  pub serial: u64,
  /// Start of validity
  pub not_before: OffsetDateTime,
  /// End of validity
  pub not_after: OffsetDateTime,
}

/// A freshly signed leaf: chain `[leaf, ca]`, its private key and metadata
pub struct SignedLeaf {
  /// Certificate chain presented to clients
  pub cert_chain: Vec<CertificateDer<'static>>,
  /// Private key of the leaf
  pub key: PrivateKeyDer<'static>,
  /// Parsed leaf metadata
  pub leaf: LeafInfo,
}

/// Certificate Authority used to sign host certificates
pub struct CertificateAuthority {
  /// Root CA issuer
  issuer: Issuer<'static, KeyPair>,
  /// Root CA certificate in DER format
  ca_cert_der: CertificateDer<'static>,
  /// Root CA certificate in PEM format
  ca_cert_pem: String,
}

impl CertificateAuthority {
  /// Build a CA from PEM encoded certificate and private key blobs
  pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
    let cert_pem = std::str::from_utf8(cert_pem)
      .map_err(|e| Error::certificate_error(format!("CA certificate is not PEM: {}", e)))?;
    let key_pem = std::str::from_utf8(key_pem)
      .map_err(|e| Error::certificate_error(format!("CA key is not PEM: {}", e)))?;

    let key_pair = KeyPair::from_pem(key_pem)
      .map_err(|e| Error::certificate_error(format!("Failed to parse CA key: {}", e)))?;

    let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair).map_err(|e| {
      Error::certificate_error(format!("Failed to create issuer from CA cert: {}", e))
    })?;

    // Parse PEM to DER for rustls
    let ca_cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::certificate_error("No certificate found in PEM"))?
      .map_err(|e| Error::certificate_error(format!("Failed to parse PEM: {}", e)))?;

    Ok(Self {
      issuer,
      ca_cert_der,
      ca_cert_pem: cert_pem.to_string(),
    })
  }

  /// Load the CA pair from two PEM files
  pub async fn load(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
    let cert_path = cert_path.as_ref();
    let key_path = key_path.as_ref();
    let cert_pem = fs::read(cert_path).await.map_err(|e| {
      Error::certificate_error(format!(
        "Failed to read CA certificate {}: {}",
        cert_path.display(),
        e
      ))
    })?;
    let key_pem = fs::read(key_path).await.map_err(|e| {
      Error::certificate_error(format!("Failed to read CA key {}: {}", key_path.display(), e))
    })?;
    Self::from_pem(&cert_pem, &key_pem)
  }

  /// Load the CA pair, generating and saving a new one when either file is missing
  pub async fn load_or_generate(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
  ) -> Result<Self> {
    let cert_path = cert_path.as_ref();
    let key_path = key_path.as_ref();
    if cert_path.exists() && key_path.exists() {
      return Self::load(cert_path, key_path).await;
    }

    tracing::info!(
      "Generating proxy certification authority in {} and {}",
      cert_path.display(),
      key_path.display()
    );
    let (cert_pem, key_pem) = Self::generate_pem()?;
    for (path, pem) in [(cert_path, &cert_pem), (key_path, &key_pem)] {
      if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
          fs::create_dir_all(parent).await?;
        }
      }
      let mut file = fs::File::create(path).await?;
      file.write_all(pem.as_bytes()).await?;
    }
    Self::from_pem(cert_pem.as_bytes(), key_pem.as_bytes())
  }

  /// Generate an in-memory CA that is never written to disk
  pub fn generate() -> Result<Self> {
    let (cert_pem, key_pem) = Self::generate_pem()?;
    Self::from_pem(cert_pem.as_bytes(), key_pem.as_bytes())
  }

  /// Generate a self-signed CA, returning `(cert_pem, key_pem)`
  fn generate_pem() -> Result<(String, String)> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, CA_COMMON_NAME);
    dn.push(DnType::OrganizationName, "Intercept Proxy");
    dn.push(DnType::CountryName, "CN");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    // Set validity period (10 years)
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::days(3650);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate_error(format!("Failed to generate key pair: {}", e)))?;

    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::certificate_error(format!("Failed to generate CA: {}", e)))?;

    Ok((cert.pem(), key_pair.serialize_pem()))
  }

  /// Sign a server certificate for `hostname` with this CA
  ///
  /// Failures surface as [`Error::CertificateSigningFailed`].
  pub fn sign_host(&self, hostname: &str) -> Result<SignedLeaf> {
    let mut params = CertificateParams::default();

    let serial = rand::thread_rng().gen::<u64>();
    params.serial_number = Some(serial.into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname);
    params.distinguished_name = dn;
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    // IP literals get an IP SAN plus the textual DNS SAN; some clients check
    // iPAddress while others only look at dNSName.
    params.subject_alt_names = if let Ok(ip) = hostname.parse::<IpAddr>() {
      let mut sans = vec![SanType::IpAddress(ip)];
      if let Ok(dns_name) = hostname.try_into() {
        sans.push(SanType::DnsName(dns_name));
      }
      sans
    } else {
      vec![SanType::DnsName(hostname.try_into().map_err(|_| {
        Error::signing_failed(format!("Invalid domain name: {}", hostname))
      })?)]
    };

    let now = OffsetDateTime::now_utc();
    let not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    let not_after = now + Duration::seconds(TTL_SECS);
    params.not_before = not_before;
    params.not_after = not_after;

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::signing_failed(format!("Failed to generate key pair: {}", e)))?;

    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::signing_failed(format!("Failed to sign {}: {}", hostname, e)))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::signing_failed("Failed to serialize host key"))?;

    Ok(SignedLeaf {
      cert_chain: vec![cert_der, self.ca_cert_der.clone()],
      key,
      leaf: LeafInfo {
        common_name: hostname.to_string(),
        serial,
        not_before,
        not_after,
      },
    })
  }

  /// CA certificate in PEM format, for installation in client trust stores
  pub fn ca_cert_pem(&self) -> &str {
    &self.ca_cert_pem
  }

  /// CA certificate in DER format
  pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
    &self.ca_cert_der
  }
}
