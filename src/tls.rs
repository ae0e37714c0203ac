//! TLS configuration for both legs of an intercepted exchange
//!
//! Both the client-facing acceptor and the upstream connector allow TLS 1.2
//! and 1.3 only. Upstream certificates are not verified: the proxy must
//! still reach hosts with private, pinned or expired certificates, and the
//! client-side trust decision already happened when the user installed the
//! root certificate.

use crate::error::{Error, Result};
use std::sync::Arc;
use tokio_rustls::rustls::{
  self,
  client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
  crypto::CryptoProvider,
  pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
  ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme,
};

fn provider() -> Arc<CryptoProvider> {
  CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

static PROTOCOL_VERSIONS: &[&rustls::SupportedProtocolVersion] =
  &[&rustls::version::TLS13, &rustls::version::TLS12];

/// Server configuration presenting a freshly issued leaf chain
pub fn server_config(
  cert_chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
) -> Result<ServerConfig> {
  let config = ServerConfig::builder_with_provider(provider())
    .with_protocol_versions(PROTOCOL_VERSIONS)
    .map_err(|e| Error::tls_error(format!("invalid TLS versions: {}", e)))?
    .with_no_client_auth()
    .with_single_cert(cert_chain, key)
    .map_err(|e| Error::tls_error(format!("failed to create TLS config: {}", e)))?;
  Ok(config)
}

/// Client configuration for the upstream leg
pub fn client_config() -> Result<ClientConfig> {
  let config = ClientConfig::builder_with_provider(provider())
    .with_protocol_versions(PROTOCOL_VERSIONS)
    .map_err(|e| Error::tls_error(format!("invalid TLS versions: {}", e)))?
    .dangerous()
    .with_custom_certificate_verifier(Arc::new(NoVerifier))
    .with_no_client_auth();
  Ok(config)
}

#[derive(Debug)]
pub(crate) struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, rustls::Error> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    vec![
      SignatureScheme::RSA_PKCS1_SHA1,
      SignatureScheme::ECDSA_SHA1_Legacy,
      SignatureScheme::RSA_PKCS1_SHA256,
      SignatureScheme::ECDSA_NISTP256_SHA256,
      SignatureScheme::RSA_PKCS1_SHA384,
      SignatureScheme::ECDSA_NISTP384_SHA384,
      SignatureScheme::RSA_PKCS1_SHA512,
      SignatureScheme::ECDSA_NISTP521_SHA512,
      SignatureScheme::RSA_PSS_SHA256,
      SignatureScheme::RSA_PSS_SHA384,
      SignatureScheme::RSA_PSS_SHA512,
      SignatureScheme::ED25519,
      SignatureScheme::ED448,
    ]
  }
}
