//! TLS configuration and certificate management
//!
//! [`CertificateProvisioner`] decides once, at startup, where certificates
//! come from. The result is a [`TlsSource`], which turns into a
//! [`HandshakeAcceptor`] used by the HTTPS listener for every connection.

use rustls::server::{Acceptor, ResolvesServerCert};
use rustls::ServerConfig;
use rustls_acme::is_tls_alpn_challenge;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::{LazyConfigAcceptor, TlsAcceptor};
use tracing::{debug, info};

use crate::acme::{AcmeManager, AcmeSettings};
use crate::config::{CertPaths, ProxyConfig};
use crate::error::{ProxyError, Result};
use crate::keygen::{self, SELF_SIGNED_VALIDITY};

/// Where the HTTPS listener gets its certificate from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsSource {
    /// Operator supplied files, used as-is
    ExplicitFiles(CertPaths),
    /// Generated files at the default location
    SelfSigned {
        paths: CertPaths,
        /// Set when the files were generated by this resolution
        fingerprint: Option<[u8; 32]>,
    },
    /// Certificates issued and renewed by ACME
    AcmeManaged(AcmeSettings),
}

impl TlsSource {
    /// Files backing a static source
    pub fn files(&self) -> Option<&CertPaths> {
        match self {
            TlsSource::ExplicitFiles(paths) | TlsSource::SelfSigned { paths, .. } => Some(paths),
            TlsSource::AcmeManaged(_) => None,
        }
    }

    /// Build the acceptor for this source.
    ///
    /// For ACME this starts the background certificate manager, so it has
    /// to run inside a tokio runtime.
    pub fn into_acceptor(self) -> Result<HandshakeAcceptor> {
        match self {
            TlsSource::ExplicitFiles(paths) | TlsSource::SelfSigned { paths, .. } => {
                info!(
                    "Loading TLS certificate from {} and {}",
                    paths.cert.display(),
                    paths.key.display()
                );
                HandshakeAcceptor::from_files(&paths)
            }
            TlsSource::AcmeManaged(settings) => AcmeManager::new(settings).start(),
        }
    }
}

/// Chooses the certificate strategy for a configuration
pub struct CertificateProvisioner<'a> {
    config: &'a ProxyConfig,
}

impl<'a> CertificateProvisioner<'a> {
    pub fn new(config: &'a ProxyConfig) -> Self {
        Self { config }
    }

    /// Resolve the certificate source.
    ///
    /// A domain always selects ACME, even when cert/key files are given.
    /// Otherwise a complete cert/key pair is used as-is. Failing both, the
    /// default files are reused when both exist and regenerated together
    /// when either is missing.
    pub fn resolve(&self) -> Result<TlsSource> {
        let config = self.config;

        if let Some(ref domain) = config.domain {
            info!(
                "Domain specified, using LetsEncrypt to autogenerate and serve certs for {}",
                domain
            );
            return Ok(TlsSource::AcmeManaged(AcmeSettings {
                domain: domain.clone(),
                email: config.acme_email.clone(),
                cache_dir: config.acme_cache_dir.clone(),
                staging: config.acme_staging,
            }));
        }

        if let Some(paths) = config.explicit_files() {
            return Ok(TlsSource::ExplicitFiles(paths));
        }

        let paths = config.default_paths.clone();
        if paths.exist() {
            info!("Found default cert/key files: using...");
            return Ok(TlsSource::SelfSigned {
                paths,
                fingerprint: None,
            });
        }

        info!(
            "No existing cert or key specified, generating some self-signed certs for use ({}, {})",
            paths.cert.display(),
            paths.key.display()
        );
        let material = keygen::generate(SELF_SIGNED_VALIDITY, &config.alt_names)?;
        let fingerprint = material.persist(&paths)?;
        info!("SHA256 Fingerprint: {}", keygen::format_fingerprint(&fingerprint));

        Ok(TlsSource::SelfSigned {
            paths,
            fingerprint: Some(fingerprint),
        })
    }
}

/// Performs the TLS handshake for accepted connections
#[derive(Clone)]
pub enum HandshakeAcceptor {
    /// One fixed certificate
    Static(TlsAcceptor),
    /// Certificates resolved per handshake by the ACME manager
    Acme {
        config: Arc<ServerConfig>,
        challenge: Arc<ServerConfig>,
    },
}

impl HandshakeAcceptor {
    /// Acceptor serving a PEM certificate chain and private key
    pub fn from_files(paths: &CertPaths) -> Result<Self> {
        let certs = load_certs(&paths.cert)?;
        let key = load_private_key(&paths.key)?;

        install_crypto_provider();
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| ProxyError::Tls(format!("TLS config error: {}", e)))?;
        config.alpn_protocols = alpn_protocols();

        Ok(Self::Static(TlsAcceptor::from(Arc::new(config))))
    }

    pub(crate) fn acme(
        resolver: Arc<dyn ResolvesServerCert>,
        challenge: Arc<ServerConfig>,
    ) -> Self {
        install_crypto_provider();
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(resolver);
        config.alpn_protocols = alpn_protocols();

        Self::Acme {
            config: Arc::new(config),
            challenge,
        }
    }

    /// Complete the handshake on `stream`.
    ///
    /// Returns `None` for ACME validation handshakes, which are closed once
    /// the challenge certificate has been presented.
    pub async fn accept(&self, stream: TcpStream) -> std::io::Result<Option<TlsStream<TcpStream>>> {
        match self {
            HandshakeAcceptor::Static(acceptor) => acceptor.accept(stream).await.map(Some),
            HandshakeAcceptor::Acme { config, challenge } => {
                let start = LazyConfigAcceptor::new(Acceptor::default(), stream).await?;

                if is_tls_alpn_challenge(&start.client_hello()) {
                    debug!("Answering TLS-ALPN-01 challenge");
                    let mut tls = start.into_stream(challenge.clone()).await?;
                    tls.shutdown().await?;
                    return Ok(None);
                }

                start.into_stream(config.clone()).await.map(Some)
            }
        }
    }
}

/// Install the process-wide rustls crypto provider. Safe to call repeatedly.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn alpn_protocols() -> Vec<Vec<u8>> {
    vec![b"h2".to_vec(), b"http/1.1".to_vec()]
}

fn load_certs(path: &Path) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        ProxyError::Tls(format!("Failed to open certificate file {}: {}", path.display(), e))
    })?;

    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Tls(format!("Failed to read certificates: {}", e)))?;

    if certs.is_empty() {
        return Err(ProxyError::Tls(format!(
            "No certificates found in {}",
            path.display()
        )));
    }

    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| {
        ProxyError::Tls(format!("Failed to open key file {}: {}", path.display(), e))
    })?;

    // PKCS#8, PKCS#1 (RSA) and SEC1 keys are all accepted
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| ProxyError::Tls(format!("Failed to read private key: {}", e)))?
        .ok_or_else(|| ProxyError::Tls(format!("No private key found in {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn config(settings: Settings, dir: &Path) -> ProxyConfig {
        ProxyConfig::from_settings(settings, CertPaths::in_dir(&dir.join("default"))).unwrap()
    }

    fn cert_fingerprint(path: &Path) -> [u8; 32] {
        let pem = fs::read(path).unwrap();
        let der = rustls_pemfile::certs(&mut pem.as_slice())
            .next()
            .unwrap()
            .unwrap();
        keygen::fingerprint(&der)
    }

    #[test]
    fn test_domain_wins_over_explicit_files() {
        let dir = tempdir().unwrap();
        let settings = Settings {
            domain: Some("example.com".to_string()),
            cert: Some(PathBuf::from("/etc/ssl/cert.pem")),
            key: Some(PathBuf::from("/etc/ssl/key.pem")),
            ..Default::default()
        };
        let config = config(settings, dir.path());

        let source = CertificateProvisioner::new(&config).resolve().unwrap();
        match source {
            TlsSource::AcmeManaged(acme) => {
                assert_eq!(acme.domain, "example.com");
                assert_eq!(acme.allowed_hosts(), vec!["example.com".to_string()]);
            }
            other => panic!("expected ACME, got {:?}", other),
        }

        // nothing written locally
        assert!(!dir.path().join("default").exists());
    }

    #[test]
    fn test_explicit_files_used_unmodified() {
        let dir = tempdir().unwrap();
        let cert = dir.path().join("my-cert.pem");
        let key = dir.path().join("my-key.pem");
        fs::write(&cert, b"not really a certificate").unwrap();
        fs::write(&key, b"not really a key").unwrap();

        let settings = Settings {
            cert: Some(cert.clone()),
            key: Some(key.clone()),
            ..Default::default()
        };
        let config = config(settings, dir.path());

        let source = CertificateProvisioner::new(&config).resolve().unwrap();
        assert_eq!(source, TlsSource::ExplicitFiles(CertPaths::new(&cert, &key)));
        assert_eq!(fs::read(&cert).unwrap(), b"not really a certificate");
        assert_eq!(fs::read(&key).unwrap(), b"not really a key");
        assert!(!dir.path().join("default").exists());
    }

    #[test]
    fn test_self_signed_generated_then_reused() {
        let dir = tempdir().unwrap();
        let config = config(Settings::default(), dir.path());
        let provisioner = CertificateProvisioner::new(&config);

        let first = provisioner.resolve().unwrap();
        let generated = match first {
            TlsSource::SelfSigned {
                fingerprint: Some(fp),
                ..
            } => fp,
            other => panic!("expected fresh self-signed, got {:?}", other),
        };
        let cert_before = fs::read(&config.default_paths.cert).unwrap();
        let key_before = fs::read(&config.default_paths.key).unwrap();
        assert_eq!(cert_fingerprint(&config.default_paths.cert), generated);

        let second = provisioner.resolve().unwrap();
        assert_eq!(
            second,
            TlsSource::SelfSigned {
                paths: config.default_paths.clone(),
                fingerprint: None,
            }
        );
        assert_eq!(fs::read(&config.default_paths.cert).unwrap(), cert_before);
        assert_eq!(fs::read(&config.default_paths.key).unwrap(), key_before);
        assert_eq!(cert_fingerprint(&config.default_paths.cert), generated);
    }

    #[test]
    fn test_missing_key_regenerates_both() {
        let dir = tempdir().unwrap();
        let config = config(Settings::default(), dir.path());
        let provisioner = CertificateProvisioner::new(&config);

        provisioner.resolve().unwrap();
        let old_cert = fs::read(&config.default_paths.cert).unwrap();
        fs::remove_file(&config.default_paths.key).unwrap();

        let source = provisioner.resolve().unwrap();
        let fingerprint = match source {
            TlsSource::SelfSigned {
                fingerprint: Some(fp),
                ..
            } => fp,
            other => panic!("expected regeneration, got {:?}", other),
        };

        assert!(config.default_paths.exist());
        assert_ne!(fs::read(&config.default_paths.cert).unwrap(), old_cert);
        assert_eq!(cert_fingerprint(&config.default_paths.cert), fingerprint);

        // the new pair must load together
        assert!(HandshakeAcceptor::from_files(&config.default_paths).is_ok());
    }

    #[test]
    fn test_missing_cert_regenerates_both() {
        let dir = tempdir().unwrap();
        let config = config(Settings::default(), dir.path());
        let provisioner = CertificateProvisioner::new(&config);

        provisioner.resolve().unwrap();
        let old_key = fs::read(&config.default_paths.key).unwrap();
        fs::remove_file(&config.default_paths.cert).unwrap();

        provisioner.resolve().unwrap();
        assert!(config.default_paths.exist());
        assert_ne!(fs::read(&config.default_paths.key).unwrap(), old_key);
    }

    #[test]
    fn test_lone_explicit_cert_falls_back_to_self_signed() {
        let dir = tempdir().unwrap();
        let settings = Settings {
            cert: Some(dir.path().join("only-cert.pem")),
            ..Default::default()
        };
        let config = config(settings, dir.path());

        let source = CertificateProvisioner::new(&config).resolve().unwrap();
        assert_eq!(source.files(), Some(&config.default_paths));
    }

    #[test]
    fn test_generated_source_builds_acceptor() {
        let dir = tempdir().unwrap();
        let config = config(Settings::default(), dir.path());

        let source = CertificateProvisioner::new(&config).resolve().unwrap();
        let acceptor = source.into_acceptor().unwrap();
        assert!(matches!(acceptor, HandshakeAcceptor::Static(_)));
    }

    #[test]
    fn test_missing_explicit_files_fail_at_load() {
        let dir = tempdir().unwrap();
        let source = TlsSource::ExplicitFiles(CertPaths::in_dir(dir.path()));
        assert!(matches!(source.into_acceptor(), Err(ProxyError::Tls(_))));
    }

    #[test]
    fn test_garbage_key_rejected() {
        let dir = tempdir().unwrap();
        let paths = CertPaths::in_dir(dir.path());
        keygen::generate(SELF_SIGNED_VALIDITY, &["localhost".to_string()])
            .unwrap()
            .persist(&paths)
            .unwrap();
        fs::write(&paths.key, b"garbage").unwrap();

        assert!(matches!(
            HandshakeAcceptor::from_files(&paths),
            Err(ProxyError::Tls(_))
        ));
    }
}
