//! Integration tests for the kanti proxy backend

use kanti::ca::CertificateManager;
use kanti::models::{ProxyConfig, ProxyConfigPatch, REQUEST_BATCH, RESPONSE_BATCH};
use kanti::proxy::ProxyServer;
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::client::{
  verify_server_cert_signed_by_trust_anchor, verify_server_name,
};
use tokio_rustls::rustls::crypto::ring::default_provider;
use tokio_rustls::rustls::pki_types::{ServerName, UnixTime};
use tokio_rustls::rustls::server::ParsedCertificate;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

fn test_dir(name: &str) -> PathBuf {
  let dir = std::env::temp_dir().join(format!("kanti-test-{}", name));
  if dir.exists() {
    std::fs::remove_dir_all(&dir).ok();
  }
  dir
}

/// Serve one canned response per accepted connection
async fn spawn_upstream(response: Vec<u8>) -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    while let Ok((mut stream, _)) = listener.accept().await {
      let response = response.clone();
      tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        let mut data = Vec::new();
        loop {
          match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
              data.extend_from_slice(&buf[..n]);
              if data.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
              }
            }
          }
        }
        let _ = stream.write_all(&response).await;
        let _ = stream.shutdown().await;
      });
    }
  });
  addr
}

async fn proxy_get(proxy_port: u16, url: &str) -> String {
  let mut client = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
  client
    .write_all(format!("GET {} HTTP/1.1\r\nConnection: close\r\n\r\n", url).as_bytes())
    .await
    .unwrap();
  let mut response = Vec::new();
  client.read_to_end(&mut response).await.unwrap();
  String::from_utf8_lossy(&response).into_owned()
}

#[tokio::test]
async fn ca_generation_and_reload() {
  let dir = test_dir("ca-gen");

  let manager = CertificateManager::new(&dir).await.unwrap();
  let cert_path = manager.ca_cert_path();
  let key_path = cert_path.with_file_name("ca.key");
  assert!(cert_path.exists(), "CA certificate file not created");
  assert!(key_path.exists(), "CA key file not created");

  let cert_pem = std::fs::read_to_string(&cert_path).unwrap();
  assert!(cert_pem.contains("BEGIN CERTIFICATE"));
  let key_pem = std::fs::read_to_string(&key_path).unwrap();
  assert!(key_pem.contains("BEGIN RSA PRIVATE KEY"));

  #[cfg(unix)]
  {
    use std::os::unix::fs::PermissionsExt;
    let mode = std::fs::metadata(&key_path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600, "CA key file mode is not restrictive");
  }

  // a second manager loads the persisted root instead of re-keying
  let reloaded = CertificateManager::new(&dir).await.unwrap();
  let reloaded_pem = std::fs::read_to_string(reloaded.ca_cert_path()).unwrap();
  assert_eq!(cert_pem, reloaded_pem);
  // the reloaded issuer must still be able to sign
  reloaded.get_server_cert("reload.test").unwrap();

  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn leaf_chain_validates_against_root() {
  let dir = test_dir("leaf-chain");
  let manager = CertificateManager::new(&dir).await.unwrap();

  let leaf = manager.get_server_cert("secure.test").unwrap();
  let chain = leaf.chain();
  assert_eq!(chain.len(), 2, "expected [leaf, ca] chain");

  let mut roots = RootCertStore::empty();
  roots.add(chain[1].clone()).unwrap();

  let parsed = ParsedCertificate::try_from(&chain[0]).unwrap();
  let algorithms = default_provider().signature_verification_algorithms;
  verify_server_cert_signed_by_trust_anchor(
    &parsed,
    &roots,
    &[],
    UnixTime::now(),
    algorithms.all,
  )
  .expect("leaf does not chain to the root");

  let name = ServerName::try_from("secure.test").unwrap();
  verify_server_name(&parsed, &name).expect("leaf SAN does not cover the domain");

  // the same material terminates a TLS handshake
  ServerConfig::builder()
    .with_no_client_auth()
    .with_single_cert(leaf.chain(), leaf.key().unwrap())
    .expect("leaf material rejected by rustls");

  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn ip_literal_leaves_carry_ip_sans() {
  let dir = test_dir("leaf-ip");
  let manager = CertificateManager::new(&dir).await.unwrap();

  let leaf = manager.get_server_cert("127.0.0.1").unwrap();
  let chain = leaf.chain();
  let parsed = ParsedCertificate::try_from(&chain[0]).unwrap();
  let name = ServerName::try_from("127.0.0.1").unwrap();
  verify_server_name(&parsed, &name).expect("IP leaf SAN does not cover the address");

  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn leaf_cache_returns_identical_material_and_bulk_evicts() {
  let dir = test_dir("leaf-cache");
  let manager = CertificateManager::with_capacity(&dir, 2).await.unwrap();

  let first = manager.get_server_cert("a.test").unwrap();
  let again = manager.get_server_cert("a.test").unwrap();
  assert!(Arc::ptr_eq(&first, &again), "cache must return the same material");
  assert_eq!(manager.cached_leaves(), 1);

  manager.get_server_cert("b.test").unwrap();
  assert_eq!(manager.cached_leaves(), 2);

  // at capacity: the insert evicts down below half before caching the leaf
  manager.get_server_cert("c.test").unwrap();
  assert_eq!(manager.cached_leaves(), 1);

  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn proxy_lifecycle_errors_and_restart() {
  let dir = test_dir("lifecycle");
  let server = ProxyServer::new(&dir, ProxyConfig::default()).await.unwrap();

  let status = server.clone().start(38491).await.unwrap();
  assert!(status.is_running);
  assert_eq!(status.port, 38491);

  let err = server.clone().start(38491).await.unwrap_err();
  assert_eq!(err.to_string(), "proxy server already running");

  let stopped = server.stop().await.unwrap();
  assert!(!stopped.is_running);
  assert_eq!(stopped.port, status.port);
  assert_eq!(stopped.certificate_path, status.certificate_path);

  let err = server.stop().await.unwrap_err();
  assert_eq!(err.to_string(), "proxy server not running");

  // the port is free again after a clean stop
  let restarted = server.clone().start(38491).await.unwrap();
  assert!(restarted.is_running);
  server.stop().await.unwrap();

  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn plain_http_exchange_is_captured_and_streamed() {
  let dir = test_dir("plain-e2e");
  let server = ProxyServer::new(&dir, ProxyConfig::default()).await.unwrap();
  let (_guard, mut rx) = server.events().subscribe();

  let upstream = spawn_upstream(
    b"HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: 2\r\nconnection: close\r\n\r\nhi".to_vec(),
  )
  .await;

  server.clone().start(38492).await.unwrap();
  let response = proxy_get(38492, &format!("http://{}/hello?x=1", upstream)).await;
  assert!(response.starts_with("HTTP/1.1 200"));
  assert!(response.ends_with("hi"));

  let snapshot = server.store().snapshot();
  assert_eq!(snapshot.len(), 1);
  let record = &snapshot[0];
  assert_eq!(record.method, "GET");
  assert_eq!(record.path, "/hello");
  assert_eq!(record.query, "x=1");
  assert_eq!(record.protocol, "http");
  assert_eq!(record.status, 200);
  assert_eq!(record.response_body, "hi");
  assert_eq!(record.response_length, 2);
  assert!(record.response_time >= 0);
  assert!(record.error.is_empty());
  // the outbound request gained a browser identity
  assert!(record.headers.contains_key("user-agent"));

  // one request batch, then one response batch, within a flush cycle
  let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
    .await
    .unwrap()
    .unwrap();
  assert_eq!(first.kind, REQUEST_BATCH);
  assert_eq!(first.data[0].id, record.id);
  assert_eq!(first.data[0].status, 0);
  let second = tokio::time::timeout(Duration::from_secs(1), rx.recv())
    .await
    .unwrap()
    .unwrap();
  assert_eq!(second.kind, RESPONSE_BATCH);
  assert_eq!(second.data[0].status, 200);

  server.stop().await.unwrap();
  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn gzipped_json_is_captured_decompressed() {
  let dir = test_dir("gzip-e2e");
  let server = ProxyServer::new(&dir, ProxyConfig::default()).await.unwrap();

  let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
  encoder.write_all(b"{\"a\":1}").unwrap();
  let compressed = encoder.finish().unwrap();

  let mut response = format!(
    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-encoding: gzip\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
    compressed.len()
  )
  .into_bytes();
  response.extend_from_slice(&compressed);
  let upstream = spawn_upstream(response).await;

  server.clone().start(38493).await.unwrap();
  let _ = proxy_get(38493, &format!("http://{}/data", upstream)).await;

  let snapshot = server.store().snapshot();
  assert_eq!(snapshot.len(), 1);
  let record = &snapshot[0];
  assert_eq!(record.status, 200);
  // length counts the raw bytes, the body is captured decoded
  assert_eq!(record.response_length, compressed.len());
  assert_eq!(record.response_body, "{\"a\":1}");

  server.stop().await.unwrap();
  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn out_of_scope_exchanges_are_dropped() {
  let dir = test_dir("scope-e2e");
  let server = ProxyServer::new(&dir, ProxyConfig::default()).await.unwrap();
  let upstream = spawn_upstream(
    b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok".to_vec(),
  )
  .await;

  let patch: ProxyConfigPatch =
    serde_json::from_str(r#"{"saveOnlyInScope":true,"inScope":["in.test"]}"#).unwrap();
  server.update_config(patch).await.unwrap();

  server.clone().start(38495).await.unwrap();

  let _ = proxy_get(38495, &format!("http://{}/dropped", upstream)).await;
  assert!(server.store().snapshot().is_empty(), "out-of-scope exchange was stored");

  let patch: ProxyConfigPatch =
    serde_json::from_str(r#"{"inScope":["in.test","127.0.0.1"]}"#).unwrap();
  server.update_config(patch).await.unwrap();

  let _ = proxy_get(38495, &format!("http://{}/kept", upstream)).await;
  let snapshot = server.store().snapshot();
  assert_eq!(snapshot.len(), 1);
  assert_eq!(snapshot[0].path, "/kept");

  server.stop().await.unwrap();
  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn unreachable_upstream_synthesizes_an_error_record() {
  let dir = test_dir("error-e2e");
  let server = ProxyServer::new(&dir, ProxyConfig::default()).await.unwrap();

  server.clone().start(38496).await.unwrap();
  // port 9 (discard) is not listening in the test environment
  let response = proxy_get(38496, "http://127.0.0.1:9/").await;
  assert!(response.starts_with("HTTP/1.1 502"));

  let snapshot = server.store().snapshot();
  assert_eq!(snapshot.len(), 1);
  let record = &snapshot[0];
  assert_eq!(record.status, 0);
  assert_eq!(record.error, "connect error");
  assert_eq!(record.response_length, 0);
  assert!(record.response_body.is_empty());

  server.stop().await.unwrap();
  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn ids_increase_across_exchanges() {
  let dir = test_dir("ids-e2e");
  let server = ProxyServer::new(&dir, ProxyConfig::default()).await.unwrap();
  let upstream = spawn_upstream(
    b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok".to_vec(),
  )
  .await;

  server.clone().start(38497).await.unwrap();
  let _ = proxy_get(38497, &format!("http://{}/one", upstream)).await;
  let _ = proxy_get(38497, &format!("http://{}/two", upstream)).await;

  let snapshot = server.store().snapshot();
  assert_eq!(snapshot.len(), 2);
  // newest first, strictly increasing ids in arrival order
  assert!(snapshot[0].id > snapshot[1].id);
  assert_eq!(snapshot[0].path, "/two");

  server.stop().await.unwrap();
  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn https_interception_end_to_end() {
  let dir = test_dir("mitm-e2e");
  let server = ProxyServer::new(&dir, ProxyConfig::default()).await.unwrap();

  // TLS upstream presenting a leaf from the same root; the proxy's
  // upstream leg does not verify, the leaf just has to exist
  let manager = CertificateManager::new(&dir).await.unwrap();
  let upstream_leaf = manager.get_server_cert("127.0.0.1").unwrap();
  let upstream_config = ServerConfig::builder()
    .with_no_client_auth()
    .with_single_cert(upstream_leaf.chain(), upstream_leaf.key().unwrap())
    .unwrap();
  let upstream_acceptor = TlsAcceptor::from(Arc::new(upstream_config));
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let upstream_addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      let acceptor = upstream_acceptor.clone();
      tokio::spawn(async move {
        let Ok(mut tls) = acceptor.accept(stream).await else {
          return;
        };
        let mut buf = [0u8; 2048];
        let mut data = Vec::new();
        loop {
          match tls.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
              data.extend_from_slice(&buf[..n]);
              if data.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
              }
            }
          }
        }
        let _ = tls
          .write_all(b"HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: 6\r\nconnection: close\r\n\r\nsecure")
          .await;
        let _ = tls.shutdown().await;
      });
    }
  });

  server.clone().start(38498).await.unwrap();

  // a client trusting the proxy root
  let ca_pem = std::fs::read(server.certificate_path()).unwrap();
  let ca_der = rustls_pemfile::certs(&mut &ca_pem[..])
    .next()
    .unwrap()
    .unwrap();
  let mut roots = RootCertStore::empty();
  roots.add(ca_der).unwrap();
  let client_config = ClientConfig::builder()
    .with_root_certificates(roots)
    .with_no_client_auth();
  let connector = TlsConnector::from(Arc::new(client_config));

  let mut tcp = TcpStream::connect(("127.0.0.1", 38498)).await.unwrap();
  tcp
    .write_all(
      format!(
        "CONNECT 127.0.0.1:{} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        upstream_addr.port(),
        upstream_addr.port()
      )
      .as_bytes(),
    )
    .await
    .unwrap();

  let mut reader = BufReader::new(tcp);
  let mut line = String::new();
  reader.read_line(&mut line).await.unwrap();
  assert!(line.starts_with("HTTP/1.1 200"), "tunnel not established: {}", line);
  let mut blank = String::new();
  reader.read_line(&mut blank).await.unwrap();
  let tcp = reader.into_inner();

  let name = ServerName::try_from("127.0.0.1").unwrap();
  let mut tls = connector.connect(name, tcp).await.unwrap();
  tls
    .write_all(b"GET / HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\r\n")
    .await
    .unwrap();
  let mut response = Vec::new();
  let _ = tls.read_to_end(&mut response).await;
  assert!(String::from_utf8_lossy(&response).contains("secure"));

  // no CONNECT record; one https exchange
  let snapshot = server.store().snapshot();
  assert_eq!(snapshot.len(), 1);
  let record = &snapshot[0];
  assert_eq!(record.protocol, "https");
  assert!(record.host.starts_with("127.0.0.1"));
  assert_eq!(record.method, "GET");
  assert_eq!(record.status, 200);
  assert_eq!(record.response_body, "secure");

  server.stop().await.unwrap();
  std::fs::remove_dir_all(&dir).ok();
}
