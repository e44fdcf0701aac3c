//! Cache of forged host certificates
//!
//! Certificates are keyed by `(hostname, port)`, forged on first use and kept
//! for the lifetime of the proxy. The cache is unbounded and never expires
//! entries.
//!

use crate::ca::{CertificateAuthority, LeafInfo};
use crate::error::{Error, Result};
use moka::future::Cache;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_rustls::rustls::ServerConfig;

/// ALPN protocols offered to intercepted clients; decrypted traffic is served as HTTP/1.1
const ALPN_HTTP11: &[u8] = b"http/1.1";

/// A host certificate signed by the proxy CA, ready for TLS termination
pub struct ForgedCertificate {
  host: String,
  port: u16,
  cert_chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
  leaf: LeafInfo,
  server_config: Arc<ServerConfig>,
}

impl ForgedCertificate {
  /// Impersonated hostname
  pub fn host(&self) -> &str {
    &self.host
  }

  /// Port this identity was forged for
  pub fn port(&self) -> u16 {
    self.port
  }

  /// Certificate chain `[leaf, ca]`
  pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
    &self.cert_chain
  }

  /// Leaf certificate in DER format
  pub fn leaf_der(&self) -> &CertificateDer<'static> {
    &self.cert_chain[0]
  }

  /// A copy of the leaf private key
  pub fn key(&self) -> PrivateKeyDer<'static> {
    self.key.clone_key()
  }

  /// Parsed leaf metadata
  pub fn leaf(&self) -> &LeafInfo {
    &self.leaf
  }

  /// TLS server configuration presenting this certificate
  pub fn server_config(&self) -> Arc<ServerConfig> {
    self.server_config.clone()
  }
}

impl fmt::Debug for ForgedCertificate {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ForgedCertificate")
      .field("host", &self.host)
      .field("port", &self.port)
      .field("leaf", &self.leaf)
      .finish()
  }
}

/// Forges and caches host certificates signed by one CA
pub struct CertificateCache {
  ca: Arc<CertificateAuthority>,
  certs: Cache<(String, u16), Arc<ForgedCertificate>>,
  signed: AtomicUsize,
}

impl CertificateCache {
  /// Create an empty cache around a CA
  pub fn new(ca: CertificateAuthority) -> Self {
    Self {
      ca: Arc::new(ca),
      certs: Cache::builder().build(),
      signed: AtomicUsize::new(0),
    }
  }

  /// The CA signing every forged certificate
  pub fn authority(&self) -> &CertificateAuthority {
    &self.ca
  }

  /// Return the cached certificate for `(hostname, port)`, forging it on first use
  ///
  /// Concurrent first calls for the same key share a single signing
  /// operation. Failed signings are not cached, so a later call retries.
  pub async fn get_or_create(&self, hostname: &str, port: u16) -> Result<Arc<ForgedCertificate>> {
    let key = (hostname.to_string(), port);
    self
      .certs
      .try_get_with(key, async {
        tracing::info!("Creating spoofed certificate for {}:{}", hostname, port);
        self.signed.fetch_add(1, Ordering::SeqCst);
        // Key generation and signing are CPU bound
        let ca = self.ca.clone();
        let host = hostname.to_string();
        tokio::task::spawn_blocking(move || forge(&ca, &host, port))
          .await
          .map_err(|e| Error::signing_failed(format!("Signing task failed: {}", e)))?
          .map(Arc::new)
      })
      .await
      .map_err(|e: Arc<Error>| match e.as_ref() {
        Error::CertificateSigningFailed(msg) => Error::CertificateSigningFailed(msg.clone()),
        other => Error::CertificateSigningFailed(other.to_string()),
      })
  }

  /// Number of signing operations performed so far
  pub fn signed_count(&self) -> usize {
    self.signed.load(Ordering::SeqCst)
  }

  /// Number of cached identities
  pub async fn len(&self) -> u64 {
    self.certs.run_pending_tasks().await;
    self.certs.entry_count()
  }

  /// Whether nothing has been forged yet
  pub async fn is_empty(&self) -> bool {
    self.len().await == 0
  }
}

fn forge(ca: &CertificateAuthority, hostname: &str, port: u16) -> Result<ForgedCertificate> {
  let signed = ca.sign_host(hostname)?;
  let mut server_config = ServerConfig::builder()
    .with_no_client_auth()
    .with_single_cert(signed.cert_chain.clone(), signed.key.clone_key())
    .map_err(|e| Error::signing_failed(format!("Failed to create TLS config: {}", e)))?;
  server_config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];

  Ok(ForgedCertificate {
    host: hostname.to_string(),
    port,
    cert_chain: signed.cert_chain,
    key: signed.key,
    leaf: signed.leaf,
    server_config: Arc::new(server_config),
  })
}
