//! Connection pool for backend HTTP connections
//!
//! Forwarded requests and awake checks go through pooled `hyper-util`
//! clients built from one connector, with kept-alive connections reused per
//! backend.

use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderName, HOST};
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::engine::Forwarder;
use crate::resolver::ServiceRecord;

/// Body type used on both sides of the proxy
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Error type for connection pool operations
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    #[error("request build error: {0}")]
    RequestBuild(String),
}

/// Hop-by-hop headers, never relayed in either direction
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
];

/// Remove hop-by-hop headers, including any named by `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove(hyper::header::UPGRADE);
}

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Total number of forwarded requests
    pub total_requests: AtomicU64,
    /// Total number of awake checks
    pub awake_checks: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_awake_check(&self) {
        self.awake_checks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_awake_checks(&self) -> u64 {
        self.awake_checks.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// A connection pool for HTTP connections to backend services
pub struct ConnectionPool {
    /// Client for forwarded requests
    client: Client<HttpConnector, ProxyBody>,
    /// Dedicated client for awake checks (uses Empty body type)
    check_client: Client<HttpConnector, Empty<Bytes>>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector.clone());

        let check_client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            check_client,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Send a request to the service's base URL, keeping method, path, query, headers and body
    pub async fn send_request(
        &self,
        record: &ServiceRecord,
        req: Request<ProxyBody>,
    ) -> Result<Response<ProxyBody>, PoolError> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = record
            .forward_url(path_and_query)
            .parse::<Uri>()
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        let (mut parts, body) = req.into_parts();
        // The client derives Host from the backend URI
        parts.headers.remove(HOST);
        strip_hop_by_hop(&mut parts.headers);
        parts.uri = uri;
        // Inbound may be h2c; backends are spoken to over HTTP/1.1
        parts.version = Version::HTTP_11;
        let backend_req = Request::from_parts(parts, body);

        self.stats.record_request();

        let response = self.client.request(backend_req).await?;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, body.boxed()))
    }

    /// GET `url` and return the response status
    pub async fn check(&self, url: &str) -> Result<StatusCode, PoolError> {
        let req = Request::builder()
            .method("GET")
            .uri(url)
            .header("Connection", "keep-alive")
            .body(Empty::<Bytes>::new())
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        self.stats.record_awake_check();

        let response = self.check_client.request(req).await?;
        Ok(response.status())
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl Forwarder for ConnectionPool {
    fn forward<'a>(
        &'a self,
        record: &'a ServiceRecord,
        req: Request<ProxyBody>,
    ) -> impl Future<Output = Result<Response<ProxyBody>, PoolError>> + Send + 'a {
        self.send_request(record, req)
    }
}
