//! HTTP to HTTPS redirect server.
//!
//! Runs next to the HTTPS listener. Its failure is logged and never takes
//! the HTTPS listener down.

use axum::{
    extract::State,
    http::{header, uri::Authority, HeaderMap, Uri},
    response::Redirect,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};

/// Decides which host a plaintext request is sent to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectPolicy {
    domain: Option<String>,
    listen_addr: String,
}

impl RedirectPolicy {
    pub fn new(domain: Option<String>, listen_addr: impl Into<String>) -> Self {
        Self {
            domain,
            listen_addr: listen_addr.into(),
        }
    }

    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::new(config.domain.clone(), config.listen_addr.clone())
    }

    /// Authority of the HTTPS URL.
    ///
    /// The configured domain wins; otherwise the host of the request, and
    /// the listen address when the request carries no usable host. Ports
    /// from the request are dropped.
    pub fn target_authority(&self, request_host: Option<&str>) -> String {
        if let Some(ref domain) = self.domain {
            return domain.clone();
        }

        request_host
            .and_then(|host| host.parse::<Authority>().ok())
            .map(|authority| authority.host().to_string())
            .filter(|host| !host.is_empty())
            .unwrap_or_else(|| self.listen_addr.clone())
    }

    /// Full `Location` for a plaintext request
    pub fn location(&self, request_host: Option<&str>, uri: &Uri) -> String {
        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        format!("https://{}{}", self.target_authority(request_host), path)
    }
}

/// Router answering every request with a redirect
pub fn router(policy: RedirectPolicy) -> Router {
    Router::new()
        .fallback(redirect_to_https)
        .with_state(Arc::new(policy))
}

async fn redirect_to_https(
    State(policy): State<Arc<RedirectPolicy>>,
    headers: HeaderMap,
    uri: Uri,
) -> Redirect {
    // absolute-form requests carry the host in the URI
    let host = uri
        .authority()
        .map(|a| a.as_str())
        .or_else(|| headers.get(header::HOST).and_then(|h| h.to_str().ok()));

    let location = policy.location(host, &uri);
    debug!(from = %uri, to = %location, "Redirecting HTTP to HTTPS");

    Redirect::temporary(&location)
}

/// Serve redirects on an already bound listener until it fails
pub async fn serve(listener: TcpListener, policy: RedirectPolicy) -> Result<()> {
    axum::serve(listener, router(policy)).await?;
    Ok(())
}

/// Bind `port` on all interfaces and serve redirects in the background.
///
/// Errors are logged; the task simply ends.
pub fn spawn(port: u16, policy: RedirectPolicy) -> JoinHandle<()> {
    tokio::spawn(async move {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));

        info!(
            "Also redirecting http requests on port {} to https requests on {}",
            port,
            policy.target_authority(None)
        );

        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(source) => {
                let e = ProxyError::Listen {
                    addr: addr.to_string(),
                    source,
                };
                error!("HTTP redirection server failure: {}", e);
                return;
            }
        };

        match serve(listener, policy).await {
            Ok(()) => debug!("HTTP redirect server stopped"),
            Err(e) => error!("HTTP redirection server failure: {}", e),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CertPaths, Settings};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn location_for(policy: RedirectPolicy, req: Request<Body>) -> String {
        let response = router(policy).oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        response
            .headers()
            .get(header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string()
    }

    fn get(uri: &str, host: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(host) = host {
            builder = builder.header(header::HOST, host);
        }
        builder.body(Body::empty()).unwrap()
    }

    /// Policy for the default listen address (127.0.0.1:4430)
    fn default_policy(domain: Option<&str>) -> RedirectPolicy {
        let settings = Settings {
            domain: domain.map(str::to_string),
            ..Default::default()
        };
        let config = ProxyConfig::from_settings(
            settings,
            CertPaths::new("/tmp/ssl-proxy-test/cert.pem", "/tmp/ssl-proxy-test/key.pem"),
        )
        .unwrap();
        RedirectPolicy::from_config(&config)
    }

    #[tokio::test]
    async fn test_redirects_to_request_host() {
        let location = location_for(default_policy(None), get("/bar", Some("foo.com"))).await;
        assert_eq!(location, "https://foo.com/bar");
    }

    #[tokio::test]
    async fn test_domain_overrides_request_host() {
        let location =
            location_for(default_policy(Some("example.com")), get("/bar", Some("foo.com"))).await;
        assert_eq!(location, "https://example.com/bar");
    }

    #[tokio::test]
    async fn test_request_port_dropped_and_query_kept() {
        let policy = RedirectPolicy::new(None, "0.0.0.0:443");
        let location = location_for(policy, get("/search?q=rust&page=2", Some("foo.com:8080"))).await;
        assert_eq!(location, "https://foo.com/search?q=rust&page=2");
    }

    #[tokio::test]
    async fn test_listen_port_not_added_to_request_host() {
        let location = location_for(default_policy(None), get("/", Some("localhost:8080"))).await;
        assert_eq!(location, "https://localhost/");
    }

    #[tokio::test]
    async fn test_missing_host_uses_listen_address() {
        let location = location_for(default_policy(None), get("/bar", None)).await;
        assert_eq!(location, "https://127.0.0.1:4430/bar");
    }

    #[tokio::test]
    async fn test_unparsable_host_uses_listen_address() {
        let location = location_for(default_policy(None), get("/bar", Some("bad host"))).await;
        assert_eq!(location, "https://127.0.0.1:4430/bar");
    }

    #[test]
    fn test_ipv6_host_keeps_brackets() {
        let policy = RedirectPolicy::new(None, "[::]:443");
        assert_eq!(policy.target_authority(Some("[::1]:8080")), "[::1]");
    }

    #[tokio::test]
    async fn test_spawn_on_busy_port_ends_quietly() {
        let busy = TcpListener::bind("0.0.0.0:0").await.unwrap();
        let port = busy.local_addr().unwrap().port();

        let handle = spawn(port, RedirectPolicy::new(None, "127.0.0.1:4430"));
        // the task finishes instead of panicking
        assert!(handle.await.is_ok());
    }
}
