//! Relay of intercepted requests to the real destination
//!
//! Upstream certificates are deliberately not verified: the proxy
//! impersonates whatever host the client asked for and forwards to it as-is.
//! Anyone able to intercept the proxy's own outbound traffic can therefore
//! impersonate upstreams to the proxy as well.
//!

use crate::error::{Error, Result};
use bytes::Bytes;
use http::header::{HeaderName, CONNECTION, CONTENT_LENGTH, HOST};
use http::uri::Scheme;
use http::{HeaderMap, HeaderValue, Request, Response, Uri, Version};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::rustls::{
  self,
  client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
  pki_types::{CertificateDer, ServerName, UnixTime},
  ClientConfig, DigitallySignedStruct, SignatureScheme,
};
use tokio_rustls::TlsConnector;

/// Headers that describe one hop and are never relayed
const HOP_BY_HOP: [&str; 8] = [
  "connection",
  "proxy-connection",
  "keep-alive",
  "proxy-authenticate",
  "proxy-authorization",
  "te",
  "trailer",
  "upgrade",
];

#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, rustls::Error> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    vec![
      SignatureScheme::RSA_PKCS1_SHA256,
      SignatureScheme::ECDSA_NISTP256_SHA256,
      SignatureScheme::RSA_PKCS1_SHA384,
      SignatureScheme::ECDSA_NISTP384_SHA384,
      SignatureScheme::RSA_PKCS1_SHA512,
      SignatureScheme::ECDSA_NISTP521_SHA512,
      SignatureScheme::RSA_PSS_SHA256,
      SignatureScheme::RSA_PSS_SHA384,
      SignatureScheme::RSA_PSS_SHA512,
      SignatureScheme::ED25519,
    ]
  }
}

/// Remove hop-by-hop headers, including those listed in `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
  let listed: Vec<HeaderName> = headers
    .get_all(CONNECTION)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
    .collect();
  for name in listed {
    headers.remove(name);
  }
  for name in HOP_BY_HOP {
    headers.remove(name);
  }
  headers.remove(http::header::TRANSFER_ENCODING);
}

/// One-shot HTTP/1.1 client used for every forwarded request
#[derive(Clone)]
pub struct Upstream {
  connector: TlsConnector,
  timeout: Duration,
  overrides: Arc<HashMap<String, SocketAddr>>,
}

impl Upstream {
  /// Create a client whose connect, handshake and response head each time out after `timeout`
  pub fn new(timeout: Duration) -> Self {
    let mut config = ClientConfig::builder()
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(NoVerifier))
      .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Self {
      connector: TlsConnector::from(Arc::new(config)),
      timeout,
      overrides: Arc::new(HashMap::new()),
    }
  }

  /// Connect to fixed addresses for some hosts instead of resolving them
  pub fn with_overrides(mut self, overrides: HashMap<String, SocketAddr>) -> Self {
    self.overrides = Arc::new(overrides);
    self
  }

  /// Send an absolute-form request and buffer the whole response
  pub async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>> {
    let (mut parts, body) = request.into_parts();
    let uri = parts.uri.clone();
    let host = uri
      .host()
      .ok_or_else(|| Error::invalid_request(format!("No host in {}", uri)))?;
    let https = uri.scheme() == Some(&Scheme::HTTPS);
    let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });

    strip_hop_by_hop(&mut parts.headers);
    parts.headers.remove(CONTENT_LENGTH);
    if !parts.headers.contains_key(HOST) {
      if let Some(authority) = uri.authority() {
        parts
          .headers
          .insert(HOST, HeaderValue::from_str(authority.as_str()).map_err(http::Error::from)?);
      }
    }
    parts.uri = uri
      .path_and_query()
      .map(|pq| pq.as_str())
      .unwrap_or("/")
      .parse::<Uri>()
      .map_err(http::Error::from)?;
    parts.version = Version::HTTP_11;
    let request = Request::from_parts(parts, Full::new(body));

    let tcp = self.connect(host, port).await?;
    if https {
      let name = ServerName::try_from(host.trim_matches(|c| c == '[' || c == ']').to_string())
        .map_err(|e| Error::invalid_request(format!("Invalid server name {}: {}", host, e)))?;
      let tls = tokio::time::timeout(self.timeout, self.connector.connect(name, tcp))
        .await
        .map_err(|_| Error::connection_error(format!("TLS handshake with {} timed out", host)))?
        .map_err(|e| Error::tls_error(format!("TLS handshake with {} failed: {}", host, e)))?;
      self.exchange(TokioIo::new(tls), request).await
    } else {
      self.exchange(TokioIo::new(tcp), request).await
    }
  }

  async fn connect(&self, host: &str, port: u16) -> Result<TcpStream> {
    let target = self.overrides.get(host).copied();
    let connect = async {
      match target {
        Some(addr) => TcpStream::connect(addr).await,
        None => TcpStream::connect((host.trim_matches(|c| c == '[' || c == ']'), port)).await,
      }
    };
    let stream = tokio::time::timeout(self.timeout, connect)
      .await
      .map_err(|_| Error::connection_error(format!("Connecting to {}:{} timed out", host, port)))?
      .map_err(|e| Error::connection_error(format!("Failed to connect to {}:{}: {}", host, port, e)))?;
    stream.set_nodelay(true)?;
    Ok(stream)
  }

  async fn exchange<T>(&self, io: T, request: Request<Full<Bytes>>) -> Result<Response<Bytes>>
  where
    T: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
  {
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
    tokio::spawn(async move {
      if let Err(e) = conn.await {
        tracing::debug!("Upstream connection closed: {}", e);
      }
    });

    let response = tokio::time::timeout(self.timeout, sender.send_request(request))
      .await
      .map_err(|_| Error::connection_error("Upstream response timed out".to_string()))??;
    let (mut parts, body) = response.into_parts();
    let body = body.collect().await?.to_bytes();
    strip_hop_by_hop(&mut parts.headers);
    Ok(Response::from_parts(parts, body))
  }
}
