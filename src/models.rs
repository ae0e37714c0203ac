//! Wire types shared between the capture pipeline and the control plane
//!
//! The JSON shape of these types is the contract consumed by observer
//! clients; field names are fixed by the `rename_all` attributes and must
//! not drift.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Multi-valued header mapping with lower-cased names
pub type Headers = BTreeMap<String, Vec<String>>;

/// Convert an [`http::HeaderMap`] into its wire representation
pub fn headers_to_map(headers: &http::HeaderMap) -> Headers {
  let mut map = Headers::new();
  for name in headers.keys() {
    let values = headers
      .get_all(name)
      .iter()
      .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
      .collect();
    map.insert(name.as_str().to_string(), values);
  }
  map
}

/// A captured HTTP request/response exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestDetails {
  pub id: i64,
  pub host: String,
  pub method: String,
  pub path: String,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub query: String,
  pub headers: Headers,
  pub timestamp: DateTime<Utc>,
  pub response_length: usize,
  /// HTTP status of the upstream response; 0 until a response or a
  /// terminal error arrives
  pub status: u16,
  /// Elapsed milliseconds between request capture and response capture
  pub response_time: i64,
  /// "http" or "https"
  pub protocol: String,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub body: String,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub response_body: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub response_headers: Option<Headers>,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub error: String,
}

impl RequestDetails {
  /// Create a request-side record; response fields stay at their zero values
  pub fn new(
    id: i64,
    host: impl Into<String>,
    method: impl Into<String>,
    path: impl Into<String>,
    query: impl Into<String>,
    headers: Headers,
    timestamp: DateTime<Utc>,
    protocol: impl Into<String>,
    body: String,
  ) -> Self {
    Self {
      id,
      host: host.into(),
      method: method.into(),
      path: path.into(),
      query: query.into(),
      headers,
      timestamp,
      response_length: 0,
      status: 0,
      response_time: 0,
      protocol: protocol.into(),
      body,
      response_body: String::new(),
      response_headers: None,
      error: String::new(),
    }
  }
}

/// Proxy server configuration, mutated only via the control plane
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
  pub port: u16,
  pub ssl_interception: bool,
  pub custom_headers: BTreeMap<String, String>,
  pub save_only_in_scope: bool,
  pub in_scope: Vec<String>,
  pub out_of_scope: Vec<String>,
  /// Derived path of the CA certificate, read-only in practice
  #[serde(default)]
  pub cert_path: String,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      port: 8080,
      ssl_interception: true,
      custom_headers: BTreeMap::new(),
      save_only_in_scope: false,
      in_scope: Vec::new(),
      out_of_scope: Vec::new(),
      cert_path: String::new(),
    }
  }
}

/// Partial configuration update; absent fields keep their current value,
/// unknown fields are ignored
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfigPatch {
  pub port: Option<u16>,
  pub ssl_interception: Option<bool>,
  pub custom_headers: Option<BTreeMap<String, String>>,
  pub save_only_in_scope: Option<bool>,
  pub in_scope: Option<Vec<String>>,
  pub out_of_scope: Option<Vec<String>>,
}

impl ProxyConfigPatch {
  /// Validate the patch without touching any state
  pub fn validate(&self) -> Result<()> {
    if let Some(port) = self.port {
      if port == 0 {
        return Err(Error::invalid_request("invalid proxy port"));
      }
    }
    for patterns in [&self.in_scope, &self.out_of_scope].into_iter().flatten() {
      if patterns.iter().any(|p| p.trim().is_empty()) {
        return Err(Error::invalid_request("scope patterns must not be empty"));
      }
    }
    if let Some(headers) = &self.custom_headers {
      for (name, value) in headers {
        if http::HeaderName::from_bytes(name.as_bytes()).is_err() {
          return Err(Error::invalid_request(format!(
            "invalid header name: {}",
            name
          )));
        }
        if http::HeaderValue::from_str(value).is_err() {
          return Err(Error::invalid_request(format!(
            "invalid header value for {}",
            name
          )));
        }
      }
    }
    Ok(())
  }

  /// Apply the patch onto an existing configuration
  pub fn apply(&self, config: &mut ProxyConfig) {
    if let Some(port) = self.port {
      config.port = port;
    }
    if let Some(ssl) = self.ssl_interception {
      config.ssl_interception = ssl;
    }
    if let Some(headers) = &self.custom_headers {
      config.custom_headers = headers.clone();
    }
    if let Some(save) = self.save_only_in_scope {
      config.save_only_in_scope = save;
    }
    if let Some(scope) = &self.in_scope {
      config.in_scope = scope.clone();
    }
    if let Some(scope) = &self.out_of_scope {
      config.out_of_scope = scope.clone();
    }
  }
}

/// Read-only projection of the proxy lifecycle state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyStatus {
  pub is_running: bool,
  pub port: u16,
  pub certificate_path: String,
}

/// Event type for coalesced request records
pub const REQUEST_BATCH: &str = "proxy-request-batch";
/// Event type for coalesced response records
pub const RESPONSE_BATCH: &str = "proxy-response-batch";

/// Envelope broadcast to observers over the event stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyEvent {
  #[serde(rename = "type")]
  pub kind: String,
  pub data: Vec<RequestDetails>,
}

impl ProxyEvent {
  pub fn request_batch(data: Vec<RequestDetails>) -> Self {
    Self {
      kind: REQUEST_BATCH.to_string(),
      data,
    }
  }

  pub fn response_batch(data: Vec<RequestDetails>) -> Self {
    Self {
      kind: RESPONSE_BATCH.to_string(),
      data,
    }
  }
}

/// Envelope for every non-stream control-plane response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
  pub success: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub data: Option<T>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl<T> ApiResponse<T> {
  pub fn ok(data: T) -> Self {
    Self {
      success: true,
      data: Some(data),
      error: None,
    }
  }

  pub fn err(message: impl Into<String>) -> Self {
    Self {
      success: false,
      data: None,
      error: Some(message.into()),
    }
  }
}
