//! ssl-proxy: local TLS-terminating reverse proxy
//!
//! Accepts HTTPS connections and forwards the decrypted requests to a plain
//! HTTP (or HTTPS) origin.
//!
//! # Certificates
//!
//! - Let's Encrypt (ACME, TLS-ALPN-01) when a public domain is configured
//! - An explicit certificate/key pair
//! - A self-signed certificate generated once into `~/.ssl-proxy/` and
//!   reused on later runs
//!
//! An optional plaintext listener redirects `http://` requests to the
//! HTTPS listener.
//!
//! # Example Configuration
//!
//! ```toml
//! to = "http://127.0.0.1:8080"
//! from = "0.0.0.0:443"
//! domain = "example.com"
//! redirect_http = 80
//! acme_email = "admin@example.com"
//! acme_cache_dir = "/var/lib/ssl-proxy/certs"
//! ```

pub mod acme;
pub mod config;
pub mod error;
pub mod forward;
pub mod keygen;
pub mod proxy;
pub mod redirect;
pub mod tls;

pub use config::{CertPaths, ProxyConfig, Settings};
pub use error::{ProxyError, Result};
pub use proxy::{BoundServer, ProxyServer};
pub use tls::{CertificateProvisioner, TlsSource};
