//! ssl-proxy: TLS-terminating reverse proxy for local development
//! and small deployments.

use clap::Parser;
use ssl_proxy::config::{split_alt_names, DEFAULT_LOG_FILTER};
use ssl_proxy::{CertPaths, ProxyConfig, ProxyServer, Settings};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "ssl-proxy", version, about)]
struct Args {
    /// Origin URL to forward requests to (http:// assumed when no scheme)
    #[arg(long)]
    to: Option<String>,

    /// host:port the TLS listener binds
    #[arg(long)]
    from: Option<String>,

    /// PEM certificate chain
    #[arg(long)]
    cert: Option<PathBuf>,

    /// PEM private key
    #[arg(long)]
    key: Option<PathBuf>,

    /// Public domain; obtains a Let's Encrypt certificate
    #[arg(long)]
    domain: Option<String>,

    /// Also redirect plain http on this port to https (0 disables)
    #[arg(long = "redirectHTTP")]
    redirect_http: Option<u16>,

    /// Comma separated SANs for a generated certificate
    #[arg(long)]
    altnames: Option<String>,

    /// TOML configuration file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// ACME account contact e-mail
    #[arg(long)]
    acme_email: Option<String>,

    /// Directory caching the ACME account and certificates
    #[arg(long)]
    acme_cache_dir: Option<PathBuf>,

    /// Use the Let's Encrypt staging directory
    #[arg(long)]
    acme_staging: bool,

    /// Log filter, e.g. "ssl_proxy=debug"
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn settings(&self) -> Settings {
        Settings {
            to: self.to.clone(),
            from: self.from.clone(),
            cert: self.cert.clone(),
            key: self.key.clone(),
            domain: self.domain.clone(),
            redirect_http: self.redirect_http,
            altnames: self.altnames.as_deref().map(split_alt_names),
            acme_email: self.acme_email.clone(),
            acme_cache_dir: self.acme_cache_dir.clone(),
            acme_staging: self.acme_staging.then_some(true),
            log_level: self.log_level.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let file_settings = match args.config {
        Some(ref path) => Settings::from_file(path)?,
        None => Settings::default(),
    };
    let settings = file_settings.overlay(args.settings());

    // --log-level, then RUST_LOG, then the built-in default
    let filter = match settings.log_level {
        Some(ref directive) => EnvFilter::try_new(directive)?,
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting ssl-proxy v{}", env!("CARGO_PKG_VERSION"));
    if let Some(ref path) = args.config {
        info!("Loaded configuration from {}", path.display());
    }

    ssl_proxy::tls::install_crypto_provider();

    let result = async {
        let config = ProxyConfig::from_settings(settings, CertPaths::default_location())?;
        ProxyServer::new(config)?.run().await
    }
    .await;

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
    Ok(())
}
