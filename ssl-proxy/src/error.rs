//! Error types for ssl-proxy

use thiserror::Error;

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Proxy error types
///
/// Everything except [`ProxyError::Forward`] is raised during startup and is
/// fatal. `Forward` is confined to a single request and turned into a
/// `502 Bad Gateway` by the forwarding handler.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Malformed origin URL, listen address or alt-name list
    #[error("Configuration error: {0}")]
    Config(String),

    /// Key pair or certificate generation failed
    #[error("Certificate generation error: {0}")]
    Generation(String),

    /// Certificate or key could not be written to disk
    #[error("Failed to persist {path}: {source}")]
    Persistence {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A listener could not be bound
    #[error("Failed to listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The origin could not be reached for one request
    #[error("Origin request failed: {0}")]
    Forward(String),

    /// Certificate or key material rejected while building the TLS config
    #[error("TLS error: {0}")]
    Tls(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    pub(crate) fn persistence(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Persistence {
            path: path.display().to_string(),
            source,
        }
    }
}
