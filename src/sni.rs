//! TLS ClientHello sniffing
//!
//! Reads the ClientHello of a connection and extracts the SNI hostname
//! without taking part in the handshake. The hello may span several
//! handshake records. The bytes read are handed back so the real handshake
//! can replay them.
//!

use crate::error::{Error, Result};
use bytes::{Bytes, BytesMut};
use tls_parser::{
  parse_tls_extensions, parse_tls_message_handshake, SNIType, TlsExtension, TlsMessage,
  TlsMessageHandshake,
};
use tokio::io::{AsyncRead, AsyncReadExt};

/// TLS record header: content type, version, length
const RECORD_HEADER_LEN: usize = 5;
/// Handshake message header: type, 24-bit length
const HANDSHAKE_HEADER_LEN: usize = 4;
/// Handshake content type
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
/// Largest plaintext record plus the expansion allowed by RFC 8446
const MAX_RECORD_LEN: usize = 16384 + 2048;
/// Largest ClientHello accepted, summed over all of its records
const MAX_HELLO_LEN: usize = 64 * 1024;

/// Result of sniffing a ClientHello
#[derive(Debug, Clone)]
pub struct ClientHelloPeek {
  /// Every byte consumed from the stream, to be replayed
  pub buffered: Bytes,
  /// Hostname from the server_name extension
  pub server_name: Option<String>,
}

/// Read the ClientHello records from `stream` and extract the SNI hostname
///
/// Fails with [`Error::SniffError`] when the bytes are not TLS handshake
/// records carrying a ClientHello.
pub async fn sniff_client_hello<S>(stream: &mut S) -> Result<ClientHelloPeek>
where
  S: AsyncRead + Unpin,
{
  let mut buffered = BytesMut::new();
  let mut handshake = BytesMut::new();
  loop {
    let mut header = [0u8; RECORD_HEADER_LEN];
    stream
      .read_exact(&mut header)
      .await
      .map_err(|e| Error::SniffError(format!("Failed to read TLS record header: {}", e)))?;
    let len = record_len(&header)?;

    let start = buffered.len() + RECORD_HEADER_LEN;
    buffered.extend_from_slice(&header);
    buffered.resize(start + len, 0);
    stream
      .read_exact(&mut buffered[start..])
      .await
      .map_err(|e| Error::SniffError(format!("Truncated ClientHello: {}", e)))?;
    handshake.extend_from_slice(&buffered[start..]);

    if is_complete(&handshake)? {
      break;
    }
  }

  let server_name = server_name_from_handshake(&handshake)?;
  Ok(ClientHelloPeek {
    buffered: buffered.freeze(),
    server_name,
  })
}

/// Extract the host_name entry of the SNI extension from ClientHello records
pub fn parse_server_name(records: &[u8]) -> Result<Option<String>> {
  let mut handshake = Vec::new();
  let mut rest = records;
  loop {
    let Some(header) = rest.get(..RECORD_HEADER_LEN) else {
      return Err(Error::SniffError("Truncated ClientHello".to_string()));
    };
    let end = RECORD_HEADER_LEN + record_len(header)?;
    let Some(fragment) = rest.get(RECORD_HEADER_LEN..end) else {
      return Err(Error::SniffError("Truncated ClientHello".to_string()));
    };
    handshake.extend_from_slice(fragment);
    rest = &rest[end..];

    if is_complete(&handshake)? {
      break;
    }
  }
  server_name_from_handshake(&handshake)
}

/// Validate a record header and return its fragment length
fn record_len(header: &[u8]) -> Result<usize> {
  if header[0] != CONTENT_TYPE_HANDSHAKE || header[1] != 0x03 {
    return Err(Error::SniffError(format!(
      "Not a TLS handshake record (0x{:02x} 0x{:02x})",
      header[0], header[1]
    )));
  }
  let len = u16::from_be_bytes([header[3], header[4]]) as usize;
  if len == 0 || len > MAX_RECORD_LEN {
    return Err(Error::SniffError(format!("Invalid TLS record length {}", len)));
  }
  Ok(len)
}

/// Whether the reassembled handshake bytes hold the whole first message
fn is_complete(handshake: &[u8]) -> Result<bool> {
  if handshake.len() < HANDSHAKE_HEADER_LEN {
    return Ok(false);
  }
  let len = HANDSHAKE_HEADER_LEN
    + u32::from_be_bytes([0, handshake[1], handshake[2], handshake[3]]) as usize;
  if len > MAX_HELLO_LEN {
    return Err(Error::SniffError(format!("ClientHello too large ({} bytes)", len)));
  }
  Ok(handshake.len() >= len)
}

fn server_name_from_handshake(handshake: &[u8]) -> Result<Option<String>> {
  let (_, message) = parse_tls_message_handshake(handshake)
    .map_err(|e| Error::SniffError(format!("Failed to parse TLS handshake: {:?}", e)))?;

  let TlsMessage::Handshake(TlsMessageHandshake::ClientHello(hello)) = message else {
    return Err(Error::SniffError(
      "First handshake message is not a ClientHello".to_string(),
    ));
  };

  let Some(ext) = hello.ext else {
    return Ok(None);
  };
  let (_, extensions) = parse_tls_extensions(ext)
    .map_err(|e| Error::SniffError(format!("Failed to parse TLS extensions: {:?}", e)))?;

  for extension in extensions {
    if let TlsExtension::SNI(names) = extension {
      for (kind, name) in names.iter() {
        if *kind != SNIType::HostName {
          continue;
        }
        match std::str::from_utf8(name) {
          Ok(host) if !host.is_empty() => return Ok(Some(host.to_string())),
          _ => continue,
        }
      }
    }
  }
  Ok(None)
}
