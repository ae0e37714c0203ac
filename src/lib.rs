//! Intercepting HTTP/HTTPS proxy with transparent traffic capture
//!
//! This crate implements a man-in-the-middle proxy in the spirit of Burp
//! Suite: TLS sessions are terminated with leaf certificates issued under a
//! locally generated root, every request/response pair is captured with
//! headers, bodies and timings, and captured exchanges stream to observer
//! clients over a loopback control plane.
//!
//! # Features
//!
//! - Automatic CA generation with persistent RSA root material
//! - Transparent HTTPS interception using the rustls backend
//! - Scope filtering, header sanitization and custom header injection
//! - Bounded capture store with newest-first readout
//! - Batched server-sent event fan-out to any number of observers
//!
//! # Example
//!
//! ```no_run
//! use kanti::models::ProxyConfig;
//! use kanti::proxy::ProxyServer;
//!
//! #[tokio::main]
//! async fn main() -> kanti::Result<()> {
//!     let server = ProxyServer::new(".kanti", ProxyConfig::default()).await?;
//!     server.clone().start(8080).await?;
//!     kanti::api::serve(server, 9090, std::future::pending()).await
//! }
//! ```

pub mod api;
pub mod ca;
pub mod capture;
pub mod error;
pub mod events;
pub mod http1;
pub mod models;
pub mod proxy;
pub mod scope;
pub mod store;
mod tls;

pub use ca::{CertificateAuthority, CertificateManager};
pub use error::{Error, Result};
pub use models::{ProxyConfig, ProxyEvent, ProxyStatus, RequestDetails};
pub use proxy::ProxyServer;
pub use store::RequestStore;
