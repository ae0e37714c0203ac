//! Request sanitization and response capture policy
//!
//! Outbound requests lose every proxy-revealing header, gain a realistic
//! browser identity when the client sent none, and finally receive the
//! configured custom headers. Response bodies are captured decompressed when
//! the content type looks textual; the raw bytes always flow to the client
//! untouched.

use flate2::read::MultiGzDecoder;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::BTreeMap;
use std::io::Read;

/// Cap on buffered request and response bodies (10 MiB)
pub const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Headers deleted from every outbound request before forwarding
const SANITIZED_HEADERS: [&str; 8] = [
  "x-forwarded-for",
  "x-forwarded-host",
  "x-forwarded-proto",
  "x-real-ip",
  "via",
  "forwarded",
  "proxy-connection",
  "proxy-authorization",
];

const DEFAULT_USER_AGENT: &str =
  "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";
const DEFAULT_ACCEPT: &str =
  "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8";
const DEFAULT_ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";
const DEFAULT_ACCEPT_ENCODING: &str = "gzip, deflate, br";

/// Remove proxy-revealing headers from an outbound request
pub fn sanitize_headers(headers: &mut HeaderMap) {
  for name in SANITIZED_HEADERS {
    headers.remove(name);
  }
}

/// Add realistic browser headers for any identity header the client omitted
pub fn apply_browser_defaults(headers: &mut HeaderMap) {
  let defaults = [
    (http::header::USER_AGENT, DEFAULT_USER_AGENT),
    (http::header::ACCEPT, DEFAULT_ACCEPT),
    (http::header::ACCEPT_LANGUAGE, DEFAULT_ACCEPT_LANGUAGE),
    (http::header::ACCEPT_ENCODING, DEFAULT_ACCEPT_ENCODING),
  ];
  for (name, value) in defaults {
    if !headers.contains_key(&name) {
      headers.insert(name, HeaderValue::from_static(value));
    }
  }
}

/// Set every configured custom header, replacing existing values.
/// Runs after sanitization so a user-provided header always wins.
pub fn apply_custom_headers(headers: &mut HeaderMap, custom: &BTreeMap<String, String>) {
  for (name, value) in custom {
    if let (Ok(name), Ok(value)) = (
      HeaderName::from_bytes(name.as_bytes()),
      HeaderValue::from_str(value),
    ) {
      headers.insert(name, value);
    }
  }
}

/// Content-type heuristic deciding whether a response body is captured
pub fn is_textual_content_type(content_type: &str) -> bool {
  if content_type.is_empty() {
    return true;
  }
  let content_type = content_type.to_ascii_lowercase();
  [
    "text/",
    "application/json",
    "application/xml",
    "application/javascript",
    "application/x-www-form-urlencoded",
    "application/graphql",
  ]
  .iter()
  .any(|t| content_type.contains(t))
}

/// Decode a captured response body for storage.
///
/// `gzip` and `br` are decompressed; `deflate` and anything unrecognized is
/// stored raw. A failed decompression yields an empty capture, the exchange
/// itself is unaffected.
pub fn capture_body(raw: &[u8], content_encoding: &str) -> String {
  let encoding = content_encoding.to_ascii_lowercase();

  if encoding.contains("gzip") {
    let mut decoded = Vec::new();
    match MultiGzDecoder::new(raw).read_to_end(&mut decoded) {
      Ok(_) => String::from_utf8_lossy(&decoded).into_owned(),
      Err(e) => {
        tracing::debug!("gzip decode failed, dropping captured body: {}", e);
        String::new()
      }
    }
  } else if encoding.contains("br") {
    let mut decoded = Vec::new();
    match brotli::Decompressor::new(raw, 4096).read_to_end(&mut decoded) {
      Ok(_) => String::from_utf8_lossy(&decoded).into_owned(),
      Err(e) => {
        tracing::debug!("brotli decode failed, dropping captured body: {}", e);
        String::new()
      }
    }
  } else {
    // deflate stays raw: the zlib-vs-raw ambiguity is not worth sniffing
    String::from_utf8_lossy(raw).into_owned()
  }
}
