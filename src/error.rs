//! Error types for the interception proxy

use std::io;
use thiserror::Error;

/// Result type for interception operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for interception proxy operations
#[derive(Error, Debug)]
pub enum Error {
  /// IO error
  #[error("IO error: {0}")]
  Io(io::Error),

  /// CA material could not be read or parsed
  #[error("Certificate error: {0}")]
  CertificateError(String),

  /// Forging a host certificate failed; never cached
  #[error("Certificate signing failed: {0}")]
  CertificateSigningFailed(String),

  /// TLS error
  #[error("TLS error: {0}")]
  TlsError(String),

  /// HTTP building error
  #[error("HTTP error: {0}")]
  HttpError(http::Error),

  /// HTTP engine error
  #[error("Hyper error: {0}")]
  HyperError(hyper::Error),

  /// Bytes at the start of a sniffed connection are not a TLS ClientHello
  #[error("Sniff error: {0}")]
  SniffError(String),

  /// ClientHello carries no server_name extension
  #[error("Client does not support SNI")]
  MissingSni,

  /// Configuration error
  #[error("Configuration error: {0}")]
  ConfigError(String),

  /// Firewall redirection could not be installed or removed
  #[error("Redirection error: {0}")]
  RedirectionError(String),

  /// Proxy script could not be loaded or failed while running
  #[error("Script error: {0}")]
  ScriptError(String),

  /// Invalid request
  #[error("Invalid request: {0}")]
  InvalidRequest(String),

  /// Connection error
  #[error("Connection error: {0}")]
  ConnectionError(String),

  /// Other errors
  #[error("{0}")]
  Other(String),
}

impl Error {
  /// Create a certificate error and log it
  pub fn certificate_error(msg: impl Into<String>) -> Self {
    let error = Error::CertificateError(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a signing error and log it
  pub fn signing_failed(msg: impl Into<String>) -> Self {
    let error = Error::CertificateSigningFailed(msg.into());
    tracing::warn!("{}", error);
    error
  }

  /// Create a TLS error and log it
  pub fn tls_error(msg: impl Into<String>) -> Self {
    let error = Error::TlsError(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create a configuration error and log it
  pub fn config_error(msg: impl Into<String>) -> Self {
    let error = Error::ConfigError(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a redirection error and log it
  pub fn redirection_error(msg: impl Into<String>) -> Self {
    let error = Error::RedirectionError(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a script error and log it
  pub fn script_error(msg: impl Into<String>) -> Self {
    let error = Error::ScriptError(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create an invalid request error and log it
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create a connection error and log it
  pub fn connection_error(msg: impl Into<String>) -> Self {
    let error = Error::ConnectionError(msg.into());
    tracing::warn!("{}", error);
    error
  }

  /// Create an other error and log it
  pub fn other(msg: impl Into<String>) -> Self {
    let error = Error::Other(msg.into());
    tracing::error!("{}", error);
    error
  }
}

impl From<io::Error> for Error {
  fn from(value: io::Error) -> Self {
    let error = Error::Io(value);
    tracing::debug!("{}", error);
    error
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    let error = Error::HttpError(value);
    tracing::error!("{}", error);
    error
  }
}

impl From<hyper::Error> for Error {
  fn from(value: hyper::Error) -> Self {
    let error = Error::HyperError(value);
    tracing::debug!("{}", error);
    error
  }
}
