//! Stream wrapper replaying bytes that were read ahead of time

use bytes::{Buf, Bytes};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Serves `pre` before reading from the inner stream; writes go straight through
#[derive(Debug)]
pub struct Rewind<T> {
  pre: Option<Bytes>,
  inner: T,
}

impl<T> Rewind<T> {
  /// Wrap `inner` with nothing to replay
  pub fn new(inner: T) -> Self {
    Self { pre: None, inner }
  }

  /// Wrap `inner`, replaying `buf` first
  pub fn new_buffered(inner: T, buf: Bytes) -> Self {
    Self {
      pre: (!buf.is_empty()).then_some(buf),
      inner,
    }
  }

  /// Bytes still waiting to be replayed
  pub fn buffered(&self) -> &[u8] {
    self.pre.as_deref().unwrap_or_default()
  }

  /// The wrapped stream
  pub fn get_ref(&self) -> &T {
    &self.inner
  }

  /// Unwrap, returning the inner stream and any unread prefix
  pub fn into_inner(self) -> (T, Bytes) {
    (self.inner, self.pre.unwrap_or_default())
  }
}

impl<T: AsyncRead + Unpin> AsyncRead for Rewind<T> {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    if let Some(mut prefix) = self.pre.take() {
      if !prefix.is_empty() {
        let n = std::cmp::min(prefix.len(), buf.remaining());
        buf.put_slice(&prefix[..n]);
        prefix.advance(n);
        if !prefix.is_empty() {
          self.pre = Some(prefix);
        }
        return Poll::Ready(Ok(()));
      }
    }
    Pin::new(&mut self.inner).poll_read(cx, buf)
  }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Rewind<T> {
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<io::Result<usize>> {
    Pin::new(&mut self.inner).poll_write(cx, buf)
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.inner).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.inner).poll_shutdown(cx)
  }

  fn poll_write_vectored(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    bufs: &[io::IoSlice<'_>],
  ) -> Poll<io::Result<usize>> {
    Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
  }

  fn is_write_vectored(&self) -> bool {
    self.inner.is_write_vectored()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  #[tokio::test]
  async fn test_prefix_is_replayed_before_inner() {
    let (client, mut server) = tokio::io::duplex(64);
    let mut rewind = Rewind::new_buffered(client, Bytes::from_static(b"hello "));
    assert_eq!(rewind.buffered(), b"hello ");

    server.write_all(b"world").await.unwrap();
    drop(server);

    let mut out = String::new();
    rewind.read_to_string(&mut out).await.unwrap();
    assert_eq!(out, "hello world");
  }

  #[tokio::test]
  async fn test_small_reads_drain_prefix() {
    let (client, _server) = tokio::io::duplex(64);
    let mut rewind = Rewind::new_buffered(client, Bytes::from_static(b"abc"));
    let mut byte = [0u8; 1];
    rewind.read_exact(&mut byte).await.unwrap();
    assert_eq!(&byte, b"a");
    let (_, rest) = rewind.into_inner();
    assert_eq!(rest.as_ref(), b"bc");
  }
}
