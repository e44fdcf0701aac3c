//! MITM proxy core
//!
//! Serves forward-proxy traffic over any duplex stream:
//!
//! - plain requests are filtered, run through the hooks and relayed upstream;
//! - `CONNECT` is always accepted and intercepted: TLS is terminated with a
//!   forged certificate chosen from the ClientHello at handshake time, and
//!   every decrypted request goes through the same pipeline as plain ones.
//!

use crate::cache::CertificateCache;
use crate::error::{Error, Result};
use crate::filter::is_eligible;
use crate::interceptor::{Decision, HookDispatcher, MitmRequest, MitmResponse};
use crate::rewind::Rewind;
use crate::upstream::Upstream;
use bytes::{Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, HOST};
use http::{Method, Request, Response, StatusCode, Version};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio_rustls::rustls::server::Acceptor;
use tokio_rustls::LazyConfigAcceptor;

/// Reply sent to a client whose `CONNECT` was accepted
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Largest request head read before handing a connection to the HTTP engine
const MAX_HEAD_LEN: usize = 64 * 1024;

type HandlerFuture =
  Pin<Box<dyn Future<Output = std::result::Result<Response<Full<Bytes>>, Infallible>> + Send>>;

/// Host and port a tunnel was opened to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
  /// Target hostname, without brackets for IPv6 literals
  pub host: String,
  /// Target port
  pub port: u16,
}

impl ConnectTarget {
  /// Create a target
  pub fn new(host: impl Into<String>, port: u16) -> Self {
    Self {
      host: host.into(),
      port,
    }
  }

  /// Parse an authority-form target such as `example.com:443`; the port defaults to 443
  pub fn parse(authority: &str) -> Result<Self> {
    let parsed: http::uri::Authority = authority
      .parse()
      .map_err(|_| Error::invalid_request(format!("Invalid CONNECT target: {}", authority)))?;
    let host = parsed.host().trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
      return Err(Error::invalid_request(format!(
        "Invalid CONNECT target: {}",
        authority
      )));
    }
    Ok(Self::new(host, parsed.port_u16().unwrap_or(443)))
  }

  fn from_request<B>(request: &Request<B>) -> Result<Self> {
    let authority = request
      .uri()
      .authority()
      .ok_or_else(|| Error::invalid_request(format!("CONNECT without authority: {}", request.uri())))?;
    Self::parse(authority.as_str())
  }
}

impl fmt::Display for ConnectTarget {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.host.contains(':') {
      write!(f, "[{}]:{}", self.host, self.port)
    } else {
      write!(f, "{}:{}", self.host, self.port)
    }
  }
}

/// The interception engine shared by every connection of one proxy
pub struct MitmProxy {
  certificates: Arc<CertificateCache>,
  dispatcher: HookDispatcher,
  upstream: Upstream,
}

impl MitmProxy {
  /// Create a proxy forging certificates from `certificates`
  pub fn new(
    certificates: Arc<CertificateCache>,
    dispatcher: HookDispatcher,
    upstream: Upstream,
  ) -> Self {
    Self {
      certificates,
      dispatcher,
      upstream,
    }
  }

  /// Proxy name used in logs
  pub fn name(&self) -> &str {
    self.dispatcher.name()
  }

  /// Certificate cache used for intercepted tunnels
  pub fn certificates(&self) -> &Arc<CertificateCache> {
    &self.certificates
  }

  /// Serve one client connection until it closes
  ///
  /// A leading `CONNECT` is answered with [`CONNECT_ESTABLISHED`] and
  /// intercepted. Anything else is served by the HTTP engine, which drains
  /// in-flight requests once `shutdown` turns `true`.
  pub async fn serve_connection<S>(
    self: Arc<Self>,
    mut stream: S,
    peer: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
  ) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
  {
    let mut head = tokio::select! {
      head = read_head(&mut stream) => head?,
      true = stopping(&mut shutdown) => return Ok(()),
    };
    if head.is_empty() {
      return Ok(());
    }

    if head.starts_with(b"CONNECT ") {
      let end = find_head_end(&head)
        .ok_or_else(|| Error::invalid_request("Truncated CONNECT request".to_string()))?;
      let rest = head.split_off(end).freeze();
      let request = parse_connect(&head)?;
      tracing::debug!("({}) < {} CONNECT {}", self.name(), peer, request.uri());
      return self
        .serve_connect(Rewind::new_buffered(stream, rest), request, peer)
        .await;
    }

    let io = TokioIo::new(Rewind::new_buffered(stream, head.freeze()));
    let proxy = self.clone();
    let service = service_fn(move |req| proxy.clone().handle_request(req, peer, None));
    let conn = http1::Builder::new()
      .timer(TokioTimer::new())
      .serve_connection(io, service)
      .with_upgrades();
    tokio::pin!(conn);

    tokio::select! {
      result = conn.as_mut() => result?,
      true = stopping(&mut shutdown) => {
        conn.as_mut().graceful_shutdown();
        conn.await?;
      }
    }
    Ok(())
  }

  /// Accept a `CONNECT` and intercept the tunnel behind it
  ///
  /// Writes [`CONNECT_ESTABLISHED`] to `conn`, then terminates TLS with a
  /// forged certificate and serves the decrypted requests.
  pub async fn serve_connect<S>(
    self: Arc<Self>,
    mut conn: S,
    request: Request<()>,
    peer: SocketAddr,
  ) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
  {
    let target = ConnectTarget::from_request(&request)?;
    conn.write_all(CONNECT_ESTABLISHED).await?;
    conn.flush().await?;
    self.intercept_tls(conn, target, peer).await
  }

  async fn intercept_tls<S>(self: Arc<Self>, stream: S, target: ConnectTarget, peer: SocketAddr) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
  {
    let start = LazyConfigAcceptor::new(Acceptor::default(), stream)
      .await
      .map_err(|e| Error::tls_error(format!("Failed to read ClientHello from {}: {}", peer, e)))?;

    let host = start
      .client_hello()
      .server_name()
      .map(str::to_string)
      .unwrap_or_else(|| target.host.clone());

    let forged = match self.certificates.get_or_create(&host, target.port).await {
      Ok(forged) => forged,
      Err(e) => {
        tracing::warn!("({}) Dropping tunnel of {} to {}: {}", self.name(), peer, host, e);
        return Err(e);
      }
    };

    let tls = start
      .into_stream(forged.server_config())
      .await
      .map_err(|e| Error::tls_error(format!("TLS handshake with {} failed: {}", peer, e)))?;

    let tunnel = ConnectTarget::new(host, target.port);
    let proxy = self.clone();
    let service = service_fn(move |req| proxy.clone().handle_request(req, peer, Some(tunnel.clone())));
    http1::Builder::new()
      .timer(TokioTimer::new())
      .serve_connection(TokioIo::new(tls), service)
      .with_upgrades()
      .await?;
    Ok(())
  }

  fn handle_request(
    self: Arc<Self>,
    request: Request<Incoming>,
    peer: SocketAddr,
    tunnel: Option<ConnectTarget>,
  ) -> HandlerFuture {
    Box::pin(async move {
      if request.method() == Method::CONNECT {
        return Ok(self.upgrade_connect(request, peer));
      }
      Ok(self.intercept(request, peer, tunnel).await)
    })
  }

  /// `CONNECT` received on a connection already served by the HTTP engine
  fn upgrade_connect(self: Arc<Self>, request: Request<Incoming>, peer: SocketAddr) -> Response<Full<Bytes>> {
    let target = match ConnectTarget::from_request(&request) {
      Ok(target) => target,
      Err(_) => return status_response(StatusCode::BAD_REQUEST),
    };
    tracing::debug!("({}) < {} CONNECT {}", self.name(), peer, target);

    tokio::spawn(async move {
      match hyper::upgrade::on(request).await {
        Ok(upgraded) => {
          let name = self.name().to_string();
          if let Err(e) = self.intercept_tls(TokioIo::new(upgraded), target, peer).await {
            tracing::debug!("({}) Tunnel of {} ended: {}", name, peer, e);
          }
        }
        Err(e) => tracing::warn!("({}) CONNECT upgrade for {} failed: {}", self.name(), peer, e),
      }
    });
    status_response(StatusCode::OK)
  }

  async fn intercept(
    &self,
    request: Request<Incoming>,
    peer: SocketAddr,
    tunnel: Option<ConnectTarget>,
  ) -> Response<Full<Bytes>> {
    let (parts, body) = request.into_parts();
    let host = effective_host(&parts, tunnel.as_ref());
    if !is_eligible(&host) {
      return status_response(StatusCode::FORBIDDEN);
    }

    let body = match body.collect().await {
      Ok(collected) => collected.to_bytes(),
      Err(e) => {
        tracing::debug!("({}) Failed to read request body from {}: {}", self.name(), peer, e);
        return status_response(StatusCode::BAD_REQUEST);
      }
    };

    let scheme = if tunnel.is_some() { "https" } else { "http" };
    let path = parts
      .uri
      .path_and_query()
      .map(|pq| pq.as_str())
      .unwrap_or("/");
    let uri = match format!("{}://{}{}", scheme, host, path).parse::<http::Uri>() {
      Ok(uri) => uri,
      Err(_) => return status_response(StatusCode::BAD_REQUEST),
    };
    let mut request = Request::from_parts(parts, body);
    *request.uri_mut() = uri;
    let is_head = request.method() == Method::HEAD;

    let mut request = MitmRequest::new(peer, host, request);
    if let Decision::Replace(response) = self.dispatcher.on_outbound_request(&mut request).await {
      return finish(response, is_head);
    }

    let (exchange, request) = request.into_parts();
    let response = match self.upstream.send(request).await {
      Ok(response) => response,
      Err(e) => {
        tracing::warn!(
          "({}) Upstream {}{} failed: {}",
          self.name(),
          exchange.host,
          exchange.path,
          e
        );
        return status_response(StatusCode::BAD_GATEWAY);
      }
    };

    let mut response = MitmResponse::new(exchange, response);
    match self.dispatcher.on_inbound_response(&mut response).await {
      Decision::Replace(replaced) => finish(replaced, is_head),
      Decision::PassThrough => finish(response.into_response(), is_head),
    }
  }
}

/// Host the client declared: `Host` header, then request authority, then tunnel target
fn effective_host(parts: &http::request::Parts, tunnel: Option<&ConnectTarget>) -> String {
  parts
    .headers
    .get(HOST)
    .and_then(|v| v.to_str().ok())
    .map(str::to_string)
    .or_else(|| parts.uri.authority().map(|a| a.to_string()))
    .or_else(|| tunnel.map(|t| t.to_string()))
    .unwrap_or_default()
}

/// Resolves once shutdown is requested; `false` if the sender is gone
pub(crate) async fn stopping(shutdown: &mut watch::Receiver<bool>) -> bool {
  shutdown.wait_for(|stopping| *stopping).await.is_ok()
}

fn status_response(status: StatusCode) -> Response<Full<Bytes>> {
  let mut response = Response::new(Full::new(Bytes::new()));
  *response.status_mut() = status;
  response
}

/// Prepare a buffered response for the client; framing is recomputed from the body
fn finish(response: Response<Bytes>, is_head: bool) -> Response<Full<Bytes>> {
  let (mut parts, body) = response.into_parts();
  parts.version = Version::HTTP_11;
  if !is_head && parts.status != StatusCode::NOT_MODIFIED {
    parts.headers.remove(CONTENT_LENGTH);
  }
  Response::from_parts(parts, Full::new(body))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
  buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Read until the end of the request head, EOF, or the size limit
async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> Result<BytesMut> {
  let mut buf = BytesMut::with_capacity(4096);
  loop {
    if find_head_end(&buf).is_some() {
      return Ok(buf);
    }
    if buf.len() > MAX_HEAD_LEN {
      return Err(Error::invalid_request(
        "Request head exceeds maximum allowed size".to_string(),
      ));
    }
    if stream.read_buf(&mut buf).await? == 0 {
      return Ok(buf);
    }
  }
}

/// Parse a raw `CONNECT` head into a request
fn parse_connect(head: &[u8]) -> Result<Request<()>> {
  let head = std::str::from_utf8(head)
    .map_err(|_| Error::invalid_request("CONNECT head is not valid UTF-8".to_string()))?;
  let mut lines = head.lines();
  let request_line = lines
    .next()
    .ok_or_else(|| Error::invalid_request("Empty request".to_string()))?;
  let parts: Vec<&str> = request_line.split_whitespace().collect();
  if parts.len() < 3 || parts[0] != "CONNECT" {
    return Err(Error::invalid_request(format!(
      "Invalid request line: {}",
      request_line
    )));
  }

  let mut builder = Request::builder().method(Method::CONNECT).uri(parts[1]);
  for line in lines {
    if line.is_empty() {
      break;
    }
    if let Some((name, value)) = line.split_once(':') {
      builder = builder.header(name.trim(), value.trim());
    }
  }
  Ok(builder.body(())?)
}
