//! Certificate authority for TLS interception
//!
//! A self-signed root is generated once per data directory and persisted as
//! `certificates/ca.crt` + `certificates/ca.key`; the public certificate is
//! what users install into their trust store. Leaf certificates are issued
//! on demand per intercepted hostname and cached in memory.

use crate::error::{Error, Result};
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey, LineEnding};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

/// Leaf validity in seconds (1 year)
const LEAF_TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Root validity in days (10 years)
const CA_VALIDITY_DAYS: i64 = 3650;
/// Offset for not_before timestamps to absorb clock skew
const NOT_BEFORE_OFFSET: i64 = 60;
/// RSA modulus size for the root and every leaf
const RSA_KEY_BITS: usize = 2048;
/// Default leaf cache capacity
pub const LEAF_CACHE_CAPACITY: usize = 100;

/// Material backing one intercepted hostname
pub struct LeafMaterial {
  chain: Vec<CertificateDer<'static>>,
  key_der: Vec<u8>,
}

impl LeafMaterial {
  /// Certificate chain `[leaf, ca]` for the TLS acceptor
  pub fn chain(&self) -> Vec<CertificateDer<'static>> {
    self.chain.clone()
  }

  /// Private key in PKCS#8 DER form
  pub fn key(&self) -> Result<PrivateKeyDer<'static>> {
    PrivateKeyDer::try_from(self.key_der.clone())
      .map_err(|e| Error::certificate_error(format!("invalid leaf key: {}", e)))
  }
}

/// Root certificate authority bound to a data directory
pub struct CertificateAuthority {
  issuer: Issuer<'static, KeyPair>,
  ca_cert_der: CertificateDer<'static>,
  cert_path: PathBuf,
}

impl CertificateAuthority {
  /// Load the root from `<dataDir>/certificates/` or generate a fresh one.
  ///
  /// A present-but-unparsable root is fatal: the error propagates out and
  /// startup aborts rather than silently re-keying every client.
  pub async fn new(data_dir: impl AsRef<Path>) -> Result<Self> {
    let cert_dir = data_dir.as_ref().join("certificates");
    fs::create_dir_all(&cert_dir).await?;

    let cert_path = cert_dir.join("ca.crt");
    let key_path = cert_dir.join("ca.key");

    let (issuer, ca_cert_der) = if cert_path.exists() && key_path.exists() {
      Self::load_ca(&cert_path, &key_path).await?
    } else {
      Self::generate_ca(&cert_path, &key_path).await?
    };

    Ok(Self {
      issuer,
      ca_cert_der,
      cert_path,
    })
  }

  async fn load_ca(
    cert_path: &Path,
    key_path: &Path,
  ) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>)> {
    let cert_pem = fs::read_to_string(cert_path).await?;
    let key_pem = fs::read_to_string(key_path).await?;

    let rsa_key = RsaPrivateKey::from_pkcs1_pem(&key_pem)
      .map_err(|e| Error::certificate_error(format!("failed to parse CA key: {}", e)))?;
    let key_pair = rsa_to_key_pair(&rsa_key)?;

    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair).map_err(|e| {
      Error::certificate_error(format!("failed to create issuer from CA cert: {}", e))
    })?;

    let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::certificate_error("no certificate found in CA PEM"))?
      .map_err(|e| Error::certificate_error(format!("failed to parse CA PEM: {}", e)))?;

    tracing::info!(path = %cert_path.display(), "loaded existing CA certificate");
    Ok((issuer, cert_der))
  }

  async fn generate_ca(
    cert_path: &Path,
    key_path: &Path,
  ) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>)> {
    let (rsa_key, key_pair) = generate_rsa_key()?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Kanti CA");
    dn.push(DnType::OrganizationName, "Kanti");
    dn.push(DnType::OrganizationalUnitName, "Kanti Certificate Authority");
    dn.push(DnType::CountryName, "US");
    params.distinguished_name = dn;
    params.serial_number = Some(random_serial());
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
      KeyUsagePurpose::KeyCertSign,
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(CA_VALIDITY_DAYS);

    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::certificate_error(format!("failed to generate CA: {}", e)))?;

    let cert_pem = cert.pem();
    fs::write(cert_path, cert_pem.as_bytes()).await?;

    let key_pem = rsa_key
      .to_pkcs1_pem(LineEnding::LF)
      .map_err(|e| Error::certificate_error(format!("failed to encode CA key: {}", e)))?;
    fs::write(key_path, key_pem.as_bytes()).await?;
    restrict_key_file(key_path).await?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::certificate_error(format!("failed to create issuer: {}", e)))?;

    tracing::info!(path = %cert_path.display(), "generated new CA certificate");
    Ok((issuer, cert_der))
  }

  /// Issue a leaf certificate authenticating `domain` (DNS name or IP literal)
  pub fn issue_leaf(&self, domain: &str) -> Result<LeafMaterial> {
    let (_, key_pair) = generate_rsa_key()?;

    let mut params = CertificateParams::default();
    params.serial_number = Some(random_serial());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, domain);
    params.distinguished_name = dn;

    params.subject_alt_names = if let Ok(ip) = domain.parse::<IpAddr>() {
      vec![SanType::IpAddress(ip)]
    } else {
      vec![SanType::DnsName(domain.try_into().map_err(|_| {
        Error::certificate_error(format!("invalid domain name: {}", domain))
      })?)]
    };

    params.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::seconds(LEAF_TTL_SECS);

    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::certificate_error(format!("failed to sign leaf cert: {}", e)))?;

    Ok(LeafMaterial {
      chain: vec![
        CertificateDer::from(cert.der().to_vec()),
        self.ca_cert_der.clone(),
      ],
      key_der: key_pair.serialize_der(),
    })
  }

  /// Path of the public CA certificate for trust installation
  pub fn ca_cert_path(&self) -> PathBuf {
    self.cert_path.clone()
  }
}

fn generate_rsa_key() -> Result<(RsaPrivateKey, KeyPair)> {
  let mut rng = rand::thread_rng();
  let rsa_key = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
    .map_err(|e| Error::certificate_error(format!("failed to generate RSA key: {}", e)))?;
  let key_pair = rsa_to_key_pair(&rsa_key)?;
  Ok((rsa_key, key_pair))
}

fn rsa_to_key_pair(rsa_key: &RsaPrivateKey) -> Result<KeyPair> {
  let pkcs8 = rsa_key
    .to_pkcs8_pem(LineEnding::LF)
    .map_err(|e| Error::certificate_error(format!("failed to encode RSA key: {}", e)))?;
  KeyPair::from_pkcs8_pem_and_sign_algo(&pkcs8, &rcgen::PKCS_RSA_SHA256)
    .map_err(|e| Error::certificate_error(format!("failed to build key pair: {}", e)))
}

fn random_serial() -> SerialNumber {
  let mut bytes = [0u8; 16];
  rand::thread_rng().fill(&mut bytes[..]);
  SerialNumber::from(bytes.to_vec())
}

#[cfg(unix)]
async fn restrict_key_file(path: &Path) -> Result<()> {
  use std::os::unix::fs::PermissionsExt;
  fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
  Ok(())
}

#[cfg(not(unix))]
async fn restrict_key_file(_path: &Path) -> Result<()> {
  Ok(())
}

/// Caching leaf issuer shared by all proxy connections
pub struct CertificateManager {
  ca: CertificateAuthority,
  cache: RwLock<HashMap<String, Arc<LeafMaterial>>>,
  capacity: usize,
}

impl CertificateManager {
  pub async fn new(data_dir: impl AsRef<Path>) -> Result<Self> {
    Self::with_capacity(data_dir, LEAF_CACHE_CAPACITY).await
  }

  pub async fn with_capacity(data_dir: impl AsRef<Path>, capacity: usize) -> Result<Self> {
    let ca = CertificateAuthority::new(data_dir).await?;
    Ok(Self {
      ca,
      cache: RwLock::new(HashMap::new()),
      capacity,
    })
  }

  /// Return cached material for `domain`, issuing and caching on miss.
  ///
  /// Safe under concurrent callers: a read fast path, then a double-checked
  /// write path. When the cache is at capacity, entries are bulk-evicted
  /// until it is below half capacity.
  pub fn get_server_cert(&self, domain: &str) -> Result<Arc<LeafMaterial>> {
    {
      let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
      if let Some(material) = cache.get(domain) {
        return Ok(material.clone());
      }
    }

    let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
    if let Some(material) = cache.get(domain) {
      return Ok(material.clone());
    }

    let material = Arc::new(self.ca.issue_leaf(domain)?);

    if cache.len() >= self.capacity {
      let target = self.capacity / 2;
      let victims: Vec<String> = cache.keys().cloned().collect();
      for victim in victims {
        cache.remove(&victim);
        if cache.len() < target {
          break;
        }
      }
    }

    cache.insert(domain.to_string(), material.clone());
    Ok(material)
  }

  /// Number of cached leaves
  pub fn cached_leaves(&self) -> usize {
    self
      .cache
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .len()
  }

  pub fn ca_cert_path(&self) -> PathBuf {
    self.ca.ca_cert_path()
  }
}
