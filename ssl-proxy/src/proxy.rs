//! TLS reverse proxy server

use axum::{body::Body, extract::ConnectInfo, http::Request, Router};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower::ServiceExt;
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::forward::{ForwardTarget, Forwarder};
use crate::redirect::{self, RedirectPolicy};
use crate::tls::{CertificateProvisioner, HandshakeAcceptor, TlsSource};

/// Back-off after a failed accept (e.g. out of file descriptors)
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

/// Proxy server
pub struct ProxyServer {
    config: ProxyConfig,
    tls_source: TlsSource,
    forwarder: Arc<Forwarder>,
}

impl ProxyServer {
    /// Resolve certificates and build the forwarder.
    ///
    /// Self-signed material is generated and written here when needed.
    pub fn new(config: ProxyConfig) -> Result<Self> {
        let tls_source = CertificateProvisioner::new(&config).resolve()?;
        let forwarder = Arc::new(Forwarder::new(ForwardTarget::from_url(&config.origin)?)?);

        Ok(Self {
            config,
            tls_source,
            forwarder,
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn tls_source(&self) -> &TlsSource {
        &self.tls_source
    }

    /// Build the Axum router
    pub fn router(&self) -> Router {
        self.forwarder.clone().router()
    }

    /// Start the redirect listener (if configured), then bind the HTTPS
    /// listener.
    pub async fn bind(self) -> Result<BoundServer> {
        let config = &self.config;

        if config.redirect_port > 0 {
            redirect::spawn(config.redirect_port, RedirectPolicy::from_config(config));
        }

        if config.domain.is_some() && config.listen_port() != 443 {
            warn!(
                "ACME validation only reaches port 443; serving on {} may NOT WORK",
                config.listen_addr
            );
        }

        let router = self.router();
        let acceptor = self.tls_source.into_acceptor()?;

        let listener = TcpListener::bind(&config.listen_addr)
            .await
            .map_err(|source| ProxyError::Listen {
                addr: config.listen_addr.clone(),
                source,
            })?;

        info!(
            "Proxying calls from https://{} (SSL/TLS) to {}",
            config.listen_addr, config.origin
        );

        Ok(BoundServer {
            listener,
            acceptor,
            router,
        })
    }

    /// Run the proxy until the process exits
    pub async fn run(self) -> Result<()> {
        self.bind().await?.serve().await
    }
}

/// HTTPS listener ready to accept connections
pub struct BoundServer {
    listener: TcpListener,
    acceptor: HandshakeAcceptor,
    router: Router,
}

impl BoundServer {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever, one task per connection
    pub async fn serve(self) -> Result<()> {
        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
                    continue;
                }
            };

            let acceptor = self.acceptor.clone();
            let router = self.router.clone();

            tokio::spawn(async move {
                let tls_stream = match acceptor.accept(stream).await {
                    Ok(Some(tls_stream)) => tls_stream,
                    Ok(None) => return,
                    Err(e) => {
                        debug!("TLS handshake failed from {}: {}", addr, e);
                        return;
                    }
                };

                let io = TokioIo::new(tls_stream);

                // Create a service from the router
                let service = service_fn(move |mut req: Request<Incoming>| {
                    let router = router.clone();
                    req.extensions_mut().insert(ConnectInfo(addr));
                    async move { router.oneshot(req.map(Body::new)).await }
                });

                if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                    .serve_connection(io, service)
                    .await
                {
                    debug!("Error serving connection from {}: {}", addr, e);
                }
            });
        }
    }
}
