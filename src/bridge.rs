//! CONNECT bridge for transparently redirected TLS connections
//!
//! Connections redirected to the TLS listener never send a `CONNECT`. The
//! bridge sniffs the SNI hostname out of the ClientHello, makes up the
//! `CONNECT host:443` the client would have sent to an explicit proxy, and
//! hands it to [`MitmProxy::serve_connect`] over a [`ConnectShim`] so the
//! regular interception path runs unchanged.
//!

use crate::error::{Error, Result};
use crate::proxy::{ConnectTarget, MitmProxy, CONNECT_ESTABLISHED};
use crate::rewind::Rewind;
use crate::sni::sniff_client_hello;
use http::{HeaderMap, Method, Request, StatusCode};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Port assumed for every sniffed connection
pub const HTTPS_PORT: u16 = 443;

/// Duplex stream standing in for the client side of a synthetic CONNECT
///
/// Writes of exactly [`CONNECT_ESTABLISHED`] are swallowed, since the client
/// never sent a `CONNECT` and would choke on the reply. Everything else
/// passes through untouched.
#[derive(Debug)]
pub struct ConnectShim<S> {
  inner: S,
}

impl<S> ConnectShim<S> {
  /// Wrap a raw connection
  pub fn new(inner: S) -> Self {
    Self { inner }
  }

  /// The wrapped connection
  pub fn get_ref(&self) -> &S {
    &self.inner
  }

  /// Unwrap the raw connection
  pub fn into_inner(self) -> S {
    self.inner
  }

  /// No HTTP request ever arrived on this stream, so there are no headers to read.
  ///
  /// # Panics
  ///
  /// Always.
  pub fn headers(&self) -> &HeaderMap {
    panic!("ConnectShim has no request headers: the CONNECT was synthesized from SNI")
  }

  /// Responses on this stream are raw TLS records, never HTTP heads.
  ///
  /// # Panics
  ///
  /// Always.
  pub fn write_header(&mut self, status: StatusCode) {
    panic!(
      "ConnectShim cannot write an HTTP {} head: the CONNECT was synthesized from SNI",
      status
    )
  }
}

impl<S: AsyncRead + Unpin> AsyncRead for ConnectShim<S> {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    Pin::new(&mut self.inner).poll_read(cx, buf)
  }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ConnectShim<S> {
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<io::Result<usize>> {
    if buf == CONNECT_ESTABLISHED {
      return Poll::Ready(Ok(buf.len()));
    }
    Pin::new(&mut self.inner).poll_write(cx, buf)
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.inner).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.inner).poll_shutdown(cx)
  }
}

/// Sniff `stream` and build the synthetic `CONNECT` for it
///
/// On success the returned shim replays the sniffed ClientHello, so the TLS
/// handshake can start on it as if nothing had been read.
pub async fn bridge<S>(mut stream: S) -> Result<(Request<()>, ConnectShim<Rewind<S>>)>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let peek = sniff_client_hello(&mut stream).await?;
  let host = peek.server_name.ok_or(Error::MissingSni)?;
  let target = ConnectTarget::new(host, HTTPS_PORT);

  let request = Request::builder()
    .method(Method::CONNECT)
    .uri(target.to_string())
    .body(())?;

  Ok((
    request,
    ConnectShim::new(Rewind::new_buffered(stream, peek.buffered)),
  ))
}

/// Accept-loop handler of the TLS listener
#[derive(Clone)]
pub struct SniBridge {
  proxy: Arc<MitmProxy>,
}

impl SniBridge {
  /// Bridge sniffed connections into `proxy`
  pub fn new(proxy: Arc<MitmProxy>) -> Self {
    Self { proxy }
  }

  /// Handle one redirected connection until it closes
  ///
  /// Sniffing failures abandon the connection with a warning; nothing is
  /// propagated to the accept loop.
  pub async fn handle<S>(&self, stream: S, peer: SocketAddr)
  where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
  {
    let name = self.proxy.name().to_string();
    let (request, shim) = match bridge(stream).await {
      Ok(bridged) => bridged,
      Err(e) => {
        tracing::warn!("({}) Error while sniffing SNI from {}: {}", name, peer, e);
        return;
      }
    };

    tracing::debug!("({}) < {} CONNECT {} (sniffed)", name, peer, request.uri());
    if let Err(e) = self.proxy.clone().serve_connect(shim, request, peer).await {
      tracing::debug!("({}) Bridged connection from {} ended: {}", name, peer, e);
    }
  }
}
