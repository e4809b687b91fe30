//! Request forwarding to the origin
//!
//! Every inbound request is replayed against a single origin with the same
//! method, path, query and body. Bodies are streamed in both directions.

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{
        header,
        uri::{Authority, Scheme},
        HeaderMap, HeaderValue, Request, Response, StatusCode, Uri, Version,
    },
    response::IntoResponse,
    Router,
};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};
use url::Url;

use crate::error::{ProxyError, Result};
use crate::tls::install_crypto_provider;

/// HTTP client type for forwarding requests
type HttpClient = Client<HttpsConnector<HttpConnector>, Body>;

/// Headers that only describe one connection leg
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// The origin, parsed once
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    scheme: Scheme,
    authority: Authority,
    /// Origin path without trailing slash, empty for `/`
    base_path: String,
}

impl ForwardTarget {
    pub fn from_url(url: &Url) -> Result<Self> {
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ProxyError::Config(format!("Origin URL '{}' has no host", url)))?;

        let authority = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        let authority: Authority = authority
            .parse()
            .map_err(|e| ProxyError::Config(format!("Invalid origin authority: {}", e)))?;

        let scheme: Scheme = url
            .scheme()
            .parse()
            .map_err(|e| ProxyError::Config(format!("Invalid origin scheme: {}", e)))?;
        if scheme != Scheme::HTTP && scheme != Scheme::HTTPS {
            return Err(ProxyError::Config(format!(
                "Unsupported origin scheme '{}'",
                scheme
            )));
        }

        Ok(Self {
            scheme,
            authority,
            base_path: url.path().trim_end_matches('/').to_string(),
        })
    }

    /// host[:port] sent as the `Host` header
    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Origin URI for an inbound request URI
    pub fn uri_for(&self, inbound: &Uri) -> Result<Uri> {
        let path_and_query = inbound
            .path_and_query()
            .map(|pq| pq.as_str())
            .filter(|pq| pq.starts_with('/'))
            .unwrap_or("/");

        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(format!("{}{}", self.base_path, path_and_query))
            .build()
            .map_err(|e| ProxyError::Forward(format!("Invalid forward URI: {}", e)))
    }
}

/// Forwards requests to one origin
pub struct Forwarder {
    target: ForwardTarget,
    host: HeaderValue,
    client: HttpClient,
}

impl Forwarder {
    pub fn new(target: ForwardTarget) -> Result<Self> {
        let host = HeaderValue::from_str(target.authority.as_str())
            .map_err(|e| ProxyError::Config(format!("Invalid origin host: {}", e)))?;

        install_crypto_provider();
        let roots = rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .build();

        let client: HttpClient = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .build(connector);

        Ok(Self {
            target,
            host,
            client,
        })
    }

    /// Router sending every path to the origin
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .fallback(forward_handler)
            .layer(TraceLayer::new_for_http())
            .with_state(self)
    }

    /// Forward one request and return the origin's response unbuffered.
    pub async fn forward(&self, req: Request<Body>) -> Result<Response<Body>> {
        let client_ip = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());

        let (mut parts, body) = req.into_parts();
        parts.uri = self.target.uri_for(&parts.uri)?;
        // the origin connection is always HTTP/1.1, whatever the client spoke
        parts.version = Version::HTTP_11;

        strip_hop_by_hop(&mut parts.headers);
        parts.headers.insert(header::HOST, self.host.clone());
        if let Some(ip) = client_ip {
            append_forwarded_for(&mut parts.headers, &ip.to_string());
        }
        parts
            .headers
            .insert(X_FORWARDED_PROTO, HeaderValue::from_static("https"));

        debug!("Forwarding {} {}", parts.method, parts.uri);

        let response = self
            .client
            .request(Request::from_parts(parts, body))
            .await
            .map_err(|e| match std::error::Error::source(&e) {
                Some(source) => ProxyError::Forward(format!("{}: {}", e, source)),
                None => ProxyError::Forward(e.to_string()),
            })?;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, Body::new(body)))
    }
}

async fn forward_handler(
    State(forwarder): State<Arc<Forwarder>>,
    req: Request<Body>,
) -> Response<Body> {
    let method = req.method().clone();
    let uri = req.uri().clone();

    match forwarder.forward(req).await {
        Ok(response) => response,
        Err(e) => {
            warn!("Proxy error for {} {}: {}", method, uri, e);
            (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response()
        }
    }
}

/// Remove hop-by-hop headers, including any named in `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();

    for name in &listed {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, ip: &str) {
    let value = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) if !prior.is_empty() => format!("{}, {}", prior, ip),
        _ => ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}
