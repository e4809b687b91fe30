//! Configuration for ssl-proxy
//!
//! Raw [`Settings`] come from an optional TOML file and the command line;
//! they are validated once into an immutable [`ProxyConfig`] that every
//! component borrows.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use url::Url;

use crate::error::{ProxyError, Result};

/// Origin used when `--to` is not given
pub const DEFAULT_TO: &str = "http://127.0.0.1:80";
/// TLS listen address used when `--from` is not given
pub const DEFAULT_FROM: &str = "127.0.0.1:4430";
/// SAN list for generated certificates
pub const DEFAULT_ALTNAMES: &str = "localhost";
/// Directory where ACME account keys and issued certificates are cached
pub const DEFAULT_ACME_CACHE_DIR: &str = "certs";
/// Log filter used when neither `--log-level` nor `RUST_LOG` is set
pub const DEFAULT_LOG_FILTER: &str = "ssl_proxy=info,tower_http=info";

const HTTP_PREFIX: &str = "http://";
const HTTPS_PREFIX: &str = "https://";

/// Unvalidated settings, as read from a TOML file or the command line
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Origin URL to forward to
    pub to: Option<String>,
    /// TLS listen address
    pub from: Option<String>,
    /// Explicit certificate file
    pub cert: Option<PathBuf>,
    /// Explicit private key file
    pub key: Option<PathBuf>,
    /// Public domain; enables ACME
    pub domain: Option<String>,
    /// Plaintext redirect port (0 disables)
    pub redirect_http: Option<u16>,
    /// SAN entries for a generated certificate
    pub altnames: Option<Vec<String>>,
    /// ACME contact e-mail
    pub acme_email: Option<String>,
    /// ACME cache directory
    pub acme_cache_dir: Option<PathBuf>,
    /// Use the Let's Encrypt staging directory
    pub acme_staging: Option<bool>,
    /// Log filter directive
    pub log_level: Option<String>,
}

impl Settings {
    /// Load settings from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ProxyError::Config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| ProxyError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Layer `other` on top of `self`; values set in `other` win.
    pub fn overlay(self, other: Settings) -> Settings {
        Settings {
            to: other.to.or(self.to),
            from: other.from.or(self.from),
            cert: other.cert.or(self.cert),
            key: other.key.or(self.key),
            domain: other.domain.or(self.domain),
            redirect_http: other.redirect_http.or(self.redirect_http),
            altnames: other.altnames.or(self.altnames),
            acme_email: other.acme_email.or(self.acme_email),
            acme_cache_dir: other.acme_cache_dir.or(self.acme_cache_dir),
            acme_staging: other.acme_staging.or(self.acme_staging),
            log_level: other.log_level.or(self.log_level),
        }
    }
}

/// A certificate/key file pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl CertPaths {
    pub fn new(cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        Self {
            cert: cert.into(),
            key: key.into(),
        }
    }

    /// `cert.pem` and `key.pem` inside `dir`
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join("cert.pem"), dir.join("key.pem"))
    }

    /// `~/.ssl-proxy/{cert,key}.pem`, or the working directory when there
    /// is no home directory.
    pub fn default_location() -> Self {
        match dirs::home_dir() {
            Some(home) => Self::in_dir(&home.join(".ssl-proxy")),
            None => Self::new("cert.pem", "key.pem"),
        }
    }

    /// True only when both files are present
    pub fn exist(&self) -> bool {
        self.cert.is_file() && self.key.is_file()
    }
}

/// Validated, immutable proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Origin requests are forwarded to
    pub origin: Url,
    /// host:port for the TLS listener
    pub listen_addr: String,
    /// Explicit certificate file
    pub cert_path: Option<PathBuf>,
    /// Explicit private key file
    pub key_path: Option<PathBuf>,
    /// Public domain; when set, ACME wins over every other strategy
    pub domain: Option<String>,
    /// Plaintext redirect port, 0 = disabled
    pub redirect_port: u16,
    /// Ordered SAN list for self-signed generation
    pub alt_names: Vec<String>,
    /// Where self-signed material lives
    pub default_paths: CertPaths,
    /// ACME contact e-mail
    pub acme_email: Option<String>,
    /// ACME cache directory
    pub acme_cache_dir: PathBuf,
    /// Use the Let's Encrypt staging directory
    pub acme_staging: bool,
}

impl ProxyConfig {
    /// Validate raw settings into a configuration
    pub fn from_settings(settings: Settings, default_paths: CertPaths) -> Result<Self> {
        let origin = parse_origin(settings.to.as_deref().unwrap_or(DEFAULT_TO))?;

        let listen_addr = non_empty(settings.from).unwrap_or_else(|| DEFAULT_FROM.to_string());
        if parse_port(&listen_addr).is_none() {
            return Err(ProxyError::Config(format!(
                "Listen address '{}' must be host:port",
                listen_addr
            )));
        }

        let alt_names: Vec<String> = settings
            .altnames
            .unwrap_or_else(|| split_alt_names(DEFAULT_ALTNAMES))
            .into_iter()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect();
        if alt_names.is_empty() {
            return Err(ProxyError::Config(
                "At least one alt name is required".to_string(),
            ));
        }

        let cert_path = settings.cert.filter(|p| !p.as_os_str().is_empty());
        let key_path = settings.key.filter(|p| !p.as_os_str().is_empty());
        let domain = non_empty(settings.domain);

        if domain.is_none() && cert_path.is_some() != key_path.is_some() {
            warn!("Only one of --cert/--key was given, falling back to self-signed certificates");
        }

        Ok(Self {
            origin,
            listen_addr,
            cert_path,
            key_path,
            domain,
            redirect_port: settings.redirect_http.unwrap_or(0),
            alt_names,
            default_paths,
            acme_email: non_empty(settings.acme_email),
            acme_cache_dir: settings
                .acme_cache_dir
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_ACME_CACHE_DIR)),
            acme_staging: settings.acme_staging.unwrap_or(false),
        })
    }

    /// Both explicit files, if both were given
    pub fn explicit_files(&self) -> Option<CertPaths> {
        match (&self.cert_path, &self.key_path) {
            (Some(cert), Some(key)) => Some(CertPaths::new(cert, key)),
            _ => None,
        }
    }

    /// Port of the TLS listener
    pub fn listen_port(&self) -> u16 {
        parse_port(&self.listen_addr).unwrap_or(443)
    }
}

/// Split a comma separated alt-name flag
pub fn split_alt_names(raw: &str) -> Vec<String> {
    raw.split(',').map(|s| s.trim().to_string()).collect()
}

fn parse_origin(raw: &str) -> Result<Url> {
    let raw = raw.trim();
    let normalized = if raw.starts_with(HTTP_PREFIX) || raw.starts_with(HTTPS_PREFIX) {
        raw.to_string()
    } else {
        info!("Assuming --to URL is using http://");
        format!("{}{}", HTTP_PREFIX, raw)
    };

    let url = Url::parse(&normalized)
        .map_err(|e| ProxyError::Config(format!("Unable to parse 'to' url '{}': {}", raw, e)))?;

    if url.host_str().map_or(true, str::is_empty) {
        return Err(ProxyError::Config(format!("Origin URL '{}' has no host", raw)));
    }

    Ok(url)
}

fn parse_port(addr: &str) -> Option<u16> {
    addr.rsplit_once(':').and_then(|(_, port)| port.parse().ok())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
