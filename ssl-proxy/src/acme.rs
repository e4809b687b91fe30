//! ACME (Let's Encrypt) certificate management
//!
//! Issuance, caching and renewal are delegated to `rustls-acme`. This module
//! only configures it and keeps its event loop running; challenges are
//! answered with TLS-ALPN-01 on the HTTPS listener itself.

use futures_util::StreamExt;
use rustls_acme::caches::DirCache;
use rustls_acme::AcmeConfig;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

use crate::error::{ProxyError, Result};
use crate::tls::HandshakeAcceptor;

/// Let's Encrypt production directory
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
/// Let's Encrypt staging directory
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// What the ACME collaborator needs to know
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcmeSettings {
    /// The only host certificates are issued for
    pub domain: String,
    /// Optional account contact
    pub email: Option<String>,
    /// Account and certificate cache
    pub cache_dir: PathBuf,
    /// Use the staging directory
    pub staging: bool,
}

impl AcmeSettings {
    /// Directory URL matching `staging`
    pub fn directory_url(&self) -> &'static str {
        if self.staging {
            LETS_ENCRYPT_STAGING
        } else {
            LETS_ENCRYPT_PRODUCTION
        }
    }

    /// Hosts the manager will request certificates for
    pub fn allowed_hosts(&self) -> Vec<String> {
        vec![self.domain.clone()]
    }
}

/// Owns the running ACME state machine
pub struct AcmeManager {
    settings: AcmeSettings,
}

impl AcmeManager {
    pub fn new(settings: AcmeSettings) -> Self {
        Self { settings }
    }

    /// Start certificate management and return the handshake acceptor that
    /// serves its certificates.
    ///
    /// Must be called from within a tokio runtime: the ACME event loop is
    /// spawned as a background task and lives as long as the process.
    pub fn start(self) -> Result<HandshakeAcceptor> {
        let settings = self.settings;

        info!(
            domain = %settings.domain,
            directory = %settings.directory_url(),
            cache = %settings.cache_dir.display(),
            "Starting ACME certificate management"
        );
        if settings.staging {
            warn!("Using Let's Encrypt staging environment - certificates will NOT be trusted by browsers");
        }

        fs::create_dir_all(&settings.cache_dir)
            .map_err(|e| ProxyError::persistence(&settings.cache_dir, e))?;

        // rustls-acme builds its configs on the process-wide provider
        crate::tls::install_crypto_provider();

        // Account creation agrees to the directory's terms of service.
        let mut config =
            AcmeConfig::new(settings.allowed_hosts()).directory_lets_encrypt(!settings.staging);
        if let Some(ref email) = settings.email {
            config = config.contact_push(format!("mailto:{}", email));
        }
        let mut state = config.cache(DirCache::new(settings.cache_dir.clone())).state();

        let acceptor = HandshakeAcceptor::acme(state.resolver(), state.challenge_rustls_config());

        tokio::spawn(async move {
            loop {
                match state.next().await {
                    Some(Ok(event)) => {
                        info!(event = ?event, "ACME event");
                    }
                    Some(Err(err)) => {
                        error!(error = %err, "ACME error");
                    }
                    None => {
                        debug!("ACME state stream ended");
                        break;
                    }
                }
            }
        });

        Ok(acceptor)
    }
}
