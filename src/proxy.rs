//! Proxy server: lifecycle, TLS interception and the capture pipeline
//!
//! Each accepted client connection runs in its own task. Plain HTTP requests
//! are forwarded and captured directly; `CONNECT` tunnels are either hijacked
//! with a locally issued leaf certificate (interception on) or relayed as an
//! opaque byte stream (interception off). Captured exchanges feed the bounded
//! store and the batching event bus.

use crate::ca::CertificateManager;
use crate::capture::{self, MAX_BODY_SIZE};
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::http1::{self, RequestHead};
use crate::models::{
  headers_to_map, ProxyConfig, ProxyConfigPatch, ProxyStatus, RequestDetails,
};
use crate::scope;
use crate::store::RequestStore;
use crate::tls;
use chrono::Utc;
use http::{HeaderMap, HeaderValue, StatusCode};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;

/// Timeout for upstream connects, TLS handshakes and response heads
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

struct Lifecycle {
  running: bool,
  shutdown: Option<CancellationToken>,
  task: Option<JoinHandle<()>>,
}

struct UpstreamResponse {
  status: StatusCode,
  headers: HeaderMap,
  body: Vec<u8>,
}

/// Category string recorded on a synthesized failure record, plus the cause
type ForwardError = (&'static str, Error);

/// The intercepting proxy with its capture store and event bus
pub struct ProxyServer {
  cert_manager: Arc<CertificateManager>,
  config: RwLock<ProxyConfig>,
  store: RequestStore,
  events: Arc<EventBus>,
  upstream_tls: TlsConnector,
  next_id: AtomicI64,
  lifecycle: tokio::sync::Mutex<Lifecycle>,
}

impl ProxyServer {
  /// Create a proxy bound to a data directory. CA material is loaded or
  /// generated here; failures are fatal to startup.
  pub async fn new(data_dir: impl AsRef<Path>, mut config: ProxyConfig) -> Result<Arc<Self>> {
    let cert_manager = Arc::new(CertificateManager::new(data_dir).await?);
    config.cert_path = cert_manager.ca_cert_path().display().to_string();
    let upstream_tls = TlsConnector::from(Arc::new(tls::client_config()?));

    Ok(Arc::new(Self {
      cert_manager,
      config: RwLock::new(config),
      store: RequestStore::new(),
      events: EventBus::new(),
      upstream_tls,
      next_id: AtomicI64::new(0),
      lifecycle: tokio::sync::Mutex::new(Lifecycle {
        running: false,
        shutdown: None,
        task: None,
      }),
    }))
  }

  pub fn store(&self) -> &RequestStore {
    &self.store
  }

  pub fn events(&self) -> Arc<EventBus> {
    self.events.clone()
  }

  pub fn config(&self) -> ProxyConfig {
    self
      .config
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  pub fn certificate_path(&self) -> String {
    self.cert_manager.ca_cert_path().display().to_string()
  }

  /// Apply a validated partial configuration update.
  /// Serialized against start/stop; a changed port applies on next start.
  pub async fn update_config(&self, patch: ProxyConfigPatch) -> Result<ProxyConfig> {
    patch.validate()?;
    let _lifecycle = self.lifecycle.lock().await;
    let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
    patch.apply(&mut config);
    Ok(config.clone())
  }

  pub async fn status(&self) -> ProxyStatus {
    let lifecycle = self.lifecycle.lock().await;
    self.status_with(lifecycle.running)
  }

  pub async fn is_running(&self) -> bool {
    self.lifecycle.lock().await.running
  }

  fn status_with(&self, running: bool) -> ProxyStatus {
    let config = self.config.read().unwrap_or_else(PoisonError::into_inner);
    ProxyStatus {
      is_running: running,
      port: config.port,
      certificate_path: config.cert_path.clone(),
    }
  }

  /// Start listening on `port`
  pub async fn start(self: Arc<Self>, port: u16) -> Result<ProxyStatus> {
    if port == 0 {
      return Err(Error::invalid_request("invalid proxy port"));
    }
    let mut lifecycle = self.lifecycle.lock().await;
    if lifecycle.running {
      return Err(Error::proxy_error("proxy server already running"));
    }

    {
      let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
      config.port = port;
    }

    let listener = TcpListener::bind(("0.0.0.0", port))
      .await
      .map_err(|e| Error::proxy_error(format!("failed to start proxy server: {}", e)))?;

    let token = CancellationToken::new();
    let server = self.clone();
    let accept_token = token.clone();
    let task = tokio::spawn(async move {
      Self::accept_loop(server, listener, accept_token).await;
    });

    lifecycle.running = true;
    lifecycle.shutdown = Some(token);
    lifecycle.task = Some(task);
    tracing::info!(port, "proxy server listening");
    Ok(self.status_with(true))
  }

  /// Stop listening, cancel in-flight exchanges and flush pending batches
  pub async fn stop(&self) -> Result<ProxyStatus> {
    let mut lifecycle = self.lifecycle.lock().await;
    if !lifecycle.running {
      return Err(Error::proxy_error("proxy server not running"));
    }

    if let Some(token) = lifecycle.shutdown.take() {
      token.cancel();
    }
    if let Some(task) = lifecycle.task.take() {
      let _ = task.await;
    }
    self.events.flush();
    lifecycle.running = false;
    tracing::info!("proxy server stopped");
    Ok(self.status_with(false))
  }

  async fn accept_loop(server: Arc<Self>, listener: TcpListener, token: CancellationToken) {
    loop {
      tokio::select! {
        _ = token.cancelled() => break,
        accepted = listener.accept() => match accepted {
          Ok((stream, peer_addr)) => {
            let server = server.clone();
            let token = token.clone();
            tokio::spawn(async move {
              tokio::select! {
                _ = token.cancelled() => {}
                result = server.handle_connection(stream) => {
                  if let Err(e) = result {
                    tracing::debug!(peer = %peer_addr, "connection ended with error: {}", e);
                  }
                }
              }
            });
          }
          Err(e) => tracing::error!("failed to accept connection: {}", e),
        }
      }
    }
  }

  async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let Some(head) = http1::read_request_head(&mut reader).await? else {
      return Ok(());
    };

    if head.method == "CONNECT" {
      // the CONNECT exchange itself is never captured
      let stream = reader.into_inner();
      self.handle_connect(stream, &head.target).await
    } else {
      self.serve_exchanges(reader, Some(head), None, "http").await
    }
  }

  async fn handle_connect(&self, stream: TcpStream, target: &str) -> Result<()> {
    let (host, port) = parse_host_port(target, 443)?;
    let intercept = {
      self
        .config
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .ssl_interception
    };

    if intercept {
      self.intercept_tls(stream, host, port).await
    } else {
      Self::tunnel(stream, &format!("{}:{}", host, port)).await
    }
  }

  /// Hijack a CONNECT tunnel: acknowledge, present a leaf for the requested
  /// host, then treat the decrypted stream as ordinary HTTP
  async fn intercept_tls(&self, mut stream: TcpStream, host: String, port: u16) -> Result<()> {
    stream
      .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
      .await?;
    stream.flush().await?;

    let leaf = self.cert_manager.get_server_cert(&host)?;
    let tls_config = tls::server_config(leaf.chain(), leaf.key()?)?;
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));
    let tls_stream = acceptor
      .accept(stream)
      .await
      .map_err(|e| Error::tls_error(format!("TLS handshake failed: {}", e)))?;

    let reader = BufReader::new(tls_stream);
    self
      .serve_exchanges(reader, None, Some((host, port)), "https")
      .await
  }

  /// Transparent CONNECT relay with no capture
  async fn tunnel(mut client: TcpStream, addr: &str) -> Result<()> {
    let mut upstream = timeout(UPSTREAM_TIMEOUT, TcpStream::connect(addr))
      .await
      .map_err(|_| Error::connection_error(format!("connect to {} timed out", addr)))?
      .map_err(|e| Error::connection_error(format!("failed to connect to {}: {}", addr, e)))?;

    client
      .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
      .await?;

    let (mut client_read, mut client_write) = client.split();
    let (mut upstream_read, mut upstream_write) = upstream.split();
    tokio::select! {
      _ = tokio::io::copy(&mut client_read, &mut upstream_write) => {}
      _ = tokio::io::copy(&mut upstream_read, &mut client_write) => {}
    }
    Ok(())
  }

  /// Serve sequential HTTP exchanges on one client connection
  async fn serve_exchanges<S>(
    &self,
    mut reader: BufReader<S>,
    mut pending: Option<RequestHead>,
    origin: Option<(String, u16)>,
    protocol: &'static str,
  ) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    loop {
      let head = match pending.take() {
        Some(head) => head,
        None => match http1::read_request_head(&mut reader).await? {
          Some(head) => head,
          None => break,
        },
      };
      let keep_alive = self
        .handle_exchange(&mut reader, head, origin.as_ref(), protocol)
        .await?;
      if !keep_alive {
        break;
      }
    }
    Ok(())
  }

  /// One request/response exchange through the capture pipeline.
  /// Returns whether the client connection survives for the next request.
  async fn handle_exchange<S>(
    &self,
    reader: &mut BufReader<S>,
    head: RequestHead,
    origin: Option<&(String, u16)>,
    protocol: &'static str,
  ) -> Result<bool>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let mut headers = head.headers;
    let (host, port, path, query) = resolve_target(&head.target, &headers, origin, protocol)?;
    let body = http1::read_body(reader, &headers, false, false, MAX_BODY_SIZE).await?;

    let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
    let started = Instant::now();
    let timestamp = Utc::now();
    // a body truncated at the cap leaves unread bytes on the wire
    let keep_alive = head.version == http::Version::HTTP_11
      && !wants_close(&headers)
      && body.len() < MAX_BODY_SIZE;

    let custom_headers = {
      self
        .config
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .custom_headers
        .clone()
    };
    capture::sanitize_headers(&mut headers);
    capture::apply_browser_defaults(&mut headers);
    capture::apply_custom_headers(&mut headers, &custom_headers);

    let authority = display_authority(&host, port, protocol);
    let record = RequestDetails::new(
      id,
      authority.clone(),
      head.method.clone(),
      path,
      query.clone(),
      headers_to_map(&headers),
      timestamp,
      protocol,
      String::from_utf8_lossy(&body).into_owned(),
    );

    if self.should_save(&host) {
      self.store.append(record.clone());
      self.events.push_request(record.clone());
    }

    let target_path = if query.is_empty() {
      record.path.clone()
    } else {
      format!("{}?{}", record.path, query)
    };

    match self
      .forward(
        &head.method,
        &target_path,
        &host,
        port,
        &authority,
        protocol == "https",
        &headers,
        &body,
      )
      .await
    {
      Ok(upstream) => {
        let mut completed = record;
        completed.status = upstream.status.as_u16();
        completed.response_time = started.elapsed().as_millis() as i64;
        completed.response_length = upstream.body.len();
        completed.response_headers = Some(headers_to_map(&upstream.headers));

        let content_type = header_str(&upstream.headers, http::header::CONTENT_TYPE);
        if capture::is_textual_content_type(&content_type) {
          let encoding = header_str(&upstream.headers, http::header::CONTENT_ENCODING);
          completed.response_body = capture::capture_body(&upstream.body, &encoding);
        }

        if self.should_save(&host) {
          self.store.update_by_id(completed.clone());
          self.events.push_response(completed);
        }

        // relay with explicit framing; the raw bytes stay encoded
        let mut client_headers = upstream.headers;
        client_headers.remove(http::header::TRANSFER_ENCODING);
        client_headers.remove(http::header::CONNECTION);
        client_headers.insert(
          http::header::CONTENT_LENGTH,
          HeaderValue::from(upstream.body.len()),
        );
        client_headers.insert(
          http::header::CONNECTION,
          HeaderValue::from_static(if keep_alive { "keep-alive" } else { "close" }),
        );

        let bytes = http1::write_response_bytes(upstream.status, &client_headers, &upstream.body);
        let stream = reader.get_mut();
        stream.write_all(&bytes).await?;
        stream.flush().await?;
        Ok(keep_alive)
      }
      Err((category, error)) => {
        tracing::debug!(host = %authority, "upstream failure ({}): {}", category, error);
        let mut completed = record;
        completed.status = 0;
        completed.response_time = started.elapsed().as_millis() as i64;
        completed.error = category.to_string();

        if self.should_save(&host) {
          self.store.update_by_id(completed.clone());
          self.events.push_response(completed);
        }

        let stream = reader.get_mut();
        let _ = stream
          .write_all(b"HTTP/1.1 502 Bad Gateway\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
          .await;
        Ok(false)
      }
    }
  }

  fn should_save(&self, host: &str) -> bool {
    let config = self.config.read().unwrap_or_else(PoisonError::into_inner);
    scope::should_save(&config, host)
  }

  /// Forward one request over a fresh upstream connection
  #[allow(clippy::too_many_arguments)]
  async fn forward(
    &self,
    method: &str,
    target: &str,
    host: &str,
    port: u16,
    authority: &str,
    https: bool,
    headers: &HeaderMap,
    body: &[u8],
  ) -> std::result::Result<UpstreamResponse, ForwardError> {
    let addr = format!("{}:{}", host, port);
    let tcp = timeout(UPSTREAM_TIMEOUT, TcpStream::connect(&addr))
      .await
      .map_err(|_| {
        (
          "timeout",
          Error::connection_error(format!("connect to {} timed out", addr)),
        )
      })?
      .map_err(|e| {
        (
          "connect error",
          Error::connection_error(format!("failed to connect to {}: {}", addr, e)),
        )
      })?;

    let mut out_headers = headers.clone();
    out_headers.remove(http::header::CONNECTION);
    out_headers.remove("keep-alive");
    out_headers.remove(http::header::TRANSFER_ENCODING);
    if !out_headers.contains_key(http::header::HOST) {
      if let Ok(value) = HeaderValue::from_str(authority) {
        out_headers.insert(http::header::HOST, value);
      }
    }
    // the body was buffered (and possibly truncated); reframe it
    if !body.is_empty() || out_headers.contains_key(http::header::CONTENT_LENGTH) {
      out_headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from(body.len()));
    }
    out_headers.insert(http::header::CONNECTION, HeaderValue::from_static("close"));

    let request_bytes = http1::write_request_bytes(method, target, &out_headers, body);
    let expect_body = !method.eq_ignore_ascii_case("HEAD");

    if https {
      let server_name = ServerName::try_from(host.to_string()).map_err(|e| {
        (
          "tls error",
          Error::tls_error(format!("invalid server name {}: {}", host, e)),
        )
      })?;
      let tls = timeout(UPSTREAM_TIMEOUT, self.upstream_tls.connect(server_name, tcp))
        .await
        .map_err(|_| {
          (
            "timeout",
            Error::tls_error(format!("TLS handshake with {} timed out", addr)),
          )
        })?
        .map_err(|e| {
          (
            "tls error",
            Error::tls_error(format!("TLS handshake with {} failed: {}", addr, e)),
          )
        })?;
      roundtrip(tls, request_bytes, expect_body).await
    } else {
      roundtrip(tcp, request_bytes, expect_body).await
    }
  }
}

async fn roundtrip<S>(
  mut stream: S,
  request: Vec<u8>,
  expect_body: bool,
) -> std::result::Result<UpstreamResponse, ForwardError>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  stream
    .write_all(&request)
    .await
    .map_err(|e| ("read error", Error::Io(e)))?;
  stream
    .flush()
    .await
    .map_err(|e| ("read error", Error::Io(e)))?;

  let mut reader = BufReader::new(stream);
  let head = timeout(UPSTREAM_TIMEOUT, http1::read_response_head(&mut reader))
    .await
    .map_err(|_| {
      (
        "timeout",
        Error::connection_error("upstream response timed out"),
      )
    })?
    .map_err(|e| ("read error", e))?;

  let no_body = !expect_body
    || head.status == StatusCode::NO_CONTENT
    || head.status == StatusCode::NOT_MODIFIED
    || head.status.is_informational();
  let body = http1::read_body(&mut reader, &head.headers, no_body, true, MAX_BODY_SIZE)
    .await
    .map_err(|e| ("read error", e))?;

  Ok(UpstreamResponse {
    status: head.status,
    headers: head.headers,
    body,
  })
}

fn header_str(headers: &HeaderMap, name: http::header::HeaderName) -> String {
  headers
    .get(&name)
    .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
    .unwrap_or_default()
}

fn wants_close(headers: &HeaderMap) -> bool {
  headers
    .get(http::header::CONNECTION)
    .and_then(|v| v.to_str().ok())
    .map(|v| v.to_ascii_lowercase().contains("close"))
    .unwrap_or(false)
}

fn display_authority(host: &str, port: u16, protocol: &str) -> String {
  let default_port = if protocol == "https" { 443 } else { 80 };
  if port == default_port {
    host.to_string()
  } else {
    format!("{}:{}", host, port)
  }
}

/// Split an authority into host and port, defaulting the port
fn parse_host_port(target: &str, default_port: u16) -> Result<(String, u16)> {
  if let Some(rest) = target.strip_prefix('[') {
    if let Some((host, rest)) = rest.split_once(']') {
      let port = match rest.strip_prefix(':') {
        Some(p) => p
          .parse()
          .map_err(|_| Error::invalid_request(format!("invalid port in {}", target)))?,
        None => default_port,
      };
      return Ok((host.to_string(), port));
    }
    return Err(Error::invalid_request(format!(
      "invalid authority: {}",
      target
    )));
  }
  match target.rsplit_once(':') {
    Some((host, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => {
      let port = port
        .parse()
        .map_err(|_| Error::invalid_request(format!("invalid port in {}", target)))?;
      Ok((host.to_string(), port))
    }
    _ => Ok((target.to_string(), default_port)),
  }
}

/// Resolve a request target into host, port, path and query
fn resolve_target(
  target: &str,
  headers: &HeaderMap,
  origin: Option<&(String, u16)>,
  protocol: &str,
) -> Result<(String, u16, String, String)> {
  if target.starts_with("http://") || target.starts_with("https://") {
    let uri: http::Uri = target
      .parse()
      .map_err(|_| Error::invalid_request(format!("invalid request target: {}", target)))?;
    let host = uri
      .host()
      .ok_or_else(|| Error::invalid_request("request target missing host"))?
      .to_string();
    let port = uri
      .port_u16()
      .unwrap_or(if target.starts_with("https://") { 443 } else { 80 });
    let path = if uri.path().is_empty() {
      "/".to_string()
    } else {
      uri.path().to_string()
    };
    let query = uri.query().unwrap_or_default().to_string();
    return Ok((host, port, path, query));
  }

  // origin-form: the authority comes from the CONNECT tunnel or Host header
  let (host, port) = if let Some((host, port)) = origin {
    (host.clone(), *port)
  } else {
    let host_header = headers
      .get(http::header::HOST)
      .and_then(|v| v.to_str().ok())
      .ok_or_else(|| Error::invalid_request("missing host header"))?;
    let default_port = if protocol == "https" { 443 } else { 80 };
    parse_host_port(host_header, default_port)?
  };

  let (path, query) = match target.split_once('?') {
    Some((path, query)) => (path.to_string(), query.to_string()),
    None => (target.to_string(), String::new()),
  };
  Ok((host, port, path, query))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_authorities() {
    assert_eq!(
      parse_host_port("secure.test:443", 443).unwrap(),
      ("secure.test".to_string(), 443)
    );
    assert_eq!(
      parse_host_port("secure.test", 443).unwrap(),
      ("secure.test".to_string(), 443)
    );
    assert_eq!(
      parse_host_port("[::1]:8443", 443).unwrap(),
      ("::1".to_string(), 8443)
    );
    assert!(parse_host_port("host:notaport", 443).is_ok());
    assert_eq!(
      parse_host_port("host:notaport", 443).unwrap().1,
      443
    );
  }

  #[test]
  fn resolves_absolute_form_targets() {
    let headers = HeaderMap::new();
    let (host, port, path, query) =
      resolve_target("http://plain.test/hello?x=1", &headers, None, "http").unwrap();
    assert_eq!(host, "plain.test");
    assert_eq!(port, 80);
    assert_eq!(path, "/hello");
    assert_eq!(query, "x=1");
  }

  #[test]
  fn resolves_origin_form_against_connect_authority() {
    let headers = HeaderMap::new();
    let origin = ("secure.test".to_string(), 443);
    let (host, port, path, query) =
      resolve_target("/", &headers, Some(&origin), "https").unwrap();
    assert_eq!(host, "secure.test");
    assert_eq!(port, 443);
    assert_eq!(path, "/");
    assert!(query.is_empty());
  }

  #[test]
  fn resolves_origin_form_against_host_header() {
    let mut headers = HeaderMap::new();
    headers.insert("host", HeaderValue::from_static("plain.test:8080"));
    let (host, port, _, _) = resolve_target("/x", &headers, None, "http").unwrap();
    assert_eq!(host, "plain.test");
    assert_eq!(port, 8080);
  }

  #[test]
  fn authority_elides_default_ports() {
    assert_eq!(display_authority("a.test", 80, "http"), "a.test");
    assert_eq!(display_authority("a.test", 443, "https"), "a.test");
    assert_eq!(display_authority("a.test", 8443, "https"), "a.test:8443");
  }
}
