//! Error types for the proxy backend

use std::io;
use thiserror::Error;

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for proxy operations
#[derive(Error, Debug)]
pub enum Error {
  /// IO error
  #[error("IO error: {0}")]
  Io(io::Error),

  /// Certificate error
  #[error("Certificate error: {0}")]
  Certificate(String),

  /// TLS error
  #[error("TLS error: {0}")]
  Tls(String),

  /// HTTP parsing error
  #[error("HTTP error: {0}")]
  Http(http::Error),

  /// JSON error
  #[error("JSON error: {0}")]
  Json(serde_json::Error),

  /// Proxy lifecycle error; the message is surfaced verbatim on the control plane
  #[error("{0}")]
  Proxy(String),

  /// Invalid request
  #[error("Invalid request: {0}")]
  InvalidRequest(String),

  /// Connection error
  #[error("Connection error: {0}")]
  Connection(String),
}

impl Error {
  /// Create a certificate error and log it
  pub fn certificate_error(msg: impl Into<String>) -> Self {
    let error = Error::Certificate(msg.into());
    tracing::error!("Certificate error: {}", error);
    error
  }

  /// Create a TLS error and log it
  pub fn tls_error(msg: impl Into<String>) -> Self {
    let error = Error::Tls(msg.into());
    tracing::error!("TLS error: {}", error);
    error
  }

  /// Create a proxy error and log it
  pub fn proxy_error(msg: impl Into<String>) -> Self {
    let error = Error::Proxy(msg.into());
    tracing::error!("Proxy error: {}", error);
    error
  }

  /// Create an invalid request error and log it
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::error!("Invalid request: {}", error);
    error
  }

  /// Create a connection error and log it
  pub fn connection_error(msg: impl Into<String>) -> Self {
    let error = Error::Connection(msg.into());
    tracing::error!("Connection error: {}", error);
    error
  }
}

impl From<io::Error> for Error {
  fn from(value: io::Error) -> Self {
    Error::Io(value)
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<serde_json::Error> for Error {
  fn from(value: serde_json::Error) -> Self {
    Error::Json(value)
  }
}
