//! Minimal HTTP/1.1 reader/writer over buffered tokio streams
//!
//! The proxy needs byte-level control over both legs of every exchange (raw
//! body sizes before decompression, header rewriting, truncation at the
//! capture cap), so requests and responses are framed by hand instead of
//! going through a client library.

use crate::error::{Error, Result};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Upper bound for a request line
const MAX_REQUEST_LINE: usize = 8 * 1024;
/// Upper bound for a header block
const MAX_HEADERS_SIZE: usize = 64 * 1024;

/// Parsed request line plus headers
#[derive(Debug)]
pub struct RequestHead {
  pub method: String,
  pub target: String,
  pub version: Version,
  pub headers: HeaderMap,
}

/// Parsed status line plus headers
#[derive(Debug)]
pub struct ResponseHead {
  pub status: StatusCode,
  pub version: Version,
  pub headers: HeaderMap,
}

fn parse_version(token: &[u8]) -> Result<Version> {
  match token {
    b"HTTP/1.0" => Ok(Version::HTTP_10),
    b"HTTP/1.1" => Ok(Version::HTTP_11),
    _ => Err(Error::invalid_request("unsupported http version")),
  }
}

fn trim_crlf(line: &[u8]) -> &[u8] {
  let line = line.strip_suffix(b"\n").unwrap_or(line);
  line.strip_suffix(b"\r").unwrap_or(line)
}

/// Read a request head; `Ok(None)` signals a clean EOF before any byte
pub async fn read_request_head<R: AsyncBufRead + Unpin>(
  reader: &mut R,
) -> Result<Option<RequestHead>> {
  let mut line = Vec::new();
  loop {
    line.clear();
    let n = reader.read_until(b'\n', &mut line).await?;
    if n == 0 {
      return Ok(None);
    }
    if line.len() > MAX_REQUEST_LINE {
      return Err(Error::invalid_request("request line too long"));
    }
    // tolerate a stray blank line between keep-alive requests
    if !trim_crlf(&line).is_empty() {
      break;
    }
  }

  let line = trim_crlf(&line).to_vec();
  let text = String::from_utf8_lossy(&line);
  let mut parts = text.split_whitespace();
  let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
    (Some(m), Some(t), Some(v)) => (m.to_string(), t.to_string(), parse_version(v.as_bytes())?),
    _ => return Err(Error::invalid_request("invalid request line")),
  };

  let headers = read_headers(reader).await?;
  Ok(Some(RequestHead {
    method,
    target,
    version,
    headers,
  }))
}

/// Read a response head
pub async fn read_response_head<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<ResponseHead> {
  let mut line = Vec::new();
  let n = reader.read_until(b'\n', &mut line).await?;
  if n == 0 {
    return Err(Error::invalid_request("unexpected eof reading status line"));
  }
  let line = trim_crlf(&line).to_vec();
  let mut parts = line.splitn(3, |b| *b == b' ');
  let version = parse_version(parts.next().unwrap_or_default())?;
  let status = parts
    .next()
    .and_then(|code| StatusCode::from_bytes(code).ok())
    .ok_or_else(|| Error::invalid_request("invalid status line"))?;

  let headers = read_headers(reader).await?;
  Ok(ResponseHead {
    status,
    version,
    headers,
  })
}

/// Read a CRLF-terminated header block, appending repeated names
pub async fn read_headers<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<HeaderMap> {
  let mut headers = HeaderMap::new();
  let mut total = 0usize;
  let mut line = Vec::new();
  loop {
    line.clear();
    let n = reader.read_until(b'\n', &mut line).await?;
    if n == 0 || trim_crlf(&line).is_empty() {
      break;
    }
    total += n;
    if total > MAX_HEADERS_SIZE {
      return Err(Error::invalid_request("headers size exceeds maximum"));
    }
    let trimmed = trim_crlf(&line);
    let Some(idx) = trimmed.iter().position(|b| *b == b':') else {
      continue;
    };
    let (name, value) = trimmed.split_at(idx);
    let value = value[1..].strip_prefix(b" ").unwrap_or(&value[1..]);
    if let (Ok(name), Ok(value)) = (
      HeaderName::from_bytes(name),
      HeaderValue::from_bytes(value),
    ) {
      headers.append(name, value);
    }
  }
  Ok(headers)
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
  headers
    .get(http::header::CONTENT_LENGTH)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.trim().parse().ok())
}

fn is_chunked(headers: &HeaderMap) -> bool {
  headers
    .get(http::header::TRANSFER_ENCODING)
    .and_then(|v| v.to_str().ok())
    .map(|v| v.to_ascii_lowercase().contains("chunked"))
    .unwrap_or(false)
}

/// Read a message body according to its framing headers, capped at `cap`
/// bytes. A truncated read leaves the connection unusable; callers close it.
///
/// `read_to_eof` enables the response-side fallback of consuming until the
/// peer closes; requests without explicit framing have no body.
pub async fn read_body<R: AsyncBufRead + Unpin>(
  reader: &mut R,
  headers: &HeaderMap,
  no_body: bool,
  read_to_eof: bool,
  cap: usize,
) -> Result<Vec<u8>> {
  if no_body {
    return Ok(Vec::new());
  }

  if is_chunked(headers) {
    return read_chunked_body(reader, cap).await;
  }

  if let Some(length) = content_length(headers) {
    let to_read = length.min(cap as u64) as usize;
    let mut body = vec![0u8; to_read];
    reader.read_exact(&mut body).await?;
    return Ok(body);
  }

  if !read_to_eof {
    return Ok(Vec::new());
  }

  let mut body = Vec::new();
  let mut buffer = [0u8; 8192];
  loop {
    let n = reader.read(&mut buffer).await?;
    if n == 0 {
      break;
    }
    body.extend_from_slice(&buffer[..n]);
    if body.len() >= cap {
      body.truncate(cap);
      break;
    }
  }
  Ok(body)
}

async fn read_chunked_body<R: AsyncBufRead + Unpin>(
  reader: &mut R,
  cap: usize,
) -> Result<Vec<u8>> {
  let mut body = Vec::new();
  let mut line = Vec::new();
  loop {
    line.clear();
    let n = reader.read_until(b'\n', &mut line).await?;
    if n == 0 {
      return Err(Error::invalid_request("unexpected eof in chunked body"));
    }
    let size_token = trim_crlf(&line);
    let size_token = size_token
      .split(|b| *b == b';')
      .next()
      .unwrap_or_default();
    let size_str = std::str::from_utf8(size_token)
      .map_err(|_| Error::invalid_request("invalid chunk size"))?;
    let size = usize::from_str_radix(size_str.trim(), 16)
      .map_err(|_| Error::invalid_request("invalid chunk size"))?;

    if size == 0 {
      // drain optional trailers up to the terminating blank line
      loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).await?;
        if n == 0 || trim_crlf(&line).is_empty() {
          break;
        }
      }
      break;
    }

    if body.len() + size > cap {
      let fit = cap - body.len();
      let mut chunk = vec![0u8; fit];
      reader.read_exact(&mut chunk).await?;
      body.extend_from_slice(&chunk);
      return Ok(body);
    }

    let mut chunk = vec![0u8; size];
    reader.read_exact(&mut chunk).await?;
    body.extend_from_slice(&chunk);

    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf).await?;
  }
  Ok(body)
}

/// Serialize an outbound request
pub fn write_request_bytes(
  method: &str,
  target: &str,
  headers: &HeaderMap,
  body: &[u8],
) -> Vec<u8> {
  let mut buf = Vec::with_capacity(256 + body.len());
  buf.extend_from_slice(method.as_bytes());
  buf.push(b' ');
  buf.extend_from_slice(target.as_bytes());
  buf.extend_from_slice(b" HTTP/1.1\r\n");
  write_headers(&mut buf, headers);
  buf.extend_from_slice(b"\r\n");
  buf.extend_from_slice(body);
  buf
}

/// Serialize a response toward the client
pub fn write_response_bytes(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> Vec<u8> {
  let mut buf = Vec::with_capacity(256 + body.len());
  let status_line = format!(
    "HTTP/1.1 {} {}\r\n",
    status.as_u16(),
    status.canonical_reason().unwrap_or("Unknown")
  );
  buf.extend_from_slice(status_line.as_bytes());
  write_headers(&mut buf, headers);
  buf.extend_from_slice(b"\r\n");
  buf.extend_from_slice(body);
  buf
}

fn write_headers(buf: &mut Vec<u8>, headers: &HeaderMap) {
  for (name, value) in headers {
    buf.extend_from_slice(name.as_str().as_bytes());
    buf.extend_from_slice(b": ");
    buf.extend_from_slice(value.as_bytes());
    buf.extend_from_slice(b"\r\n");
  }
}
