//! Integration tests for wakegate

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use wakegate::config::{
    env_service_overrides, load_service_file, parse_yaml_services, AwakePolicy, GlobalDefaults, ServiceMap,
};
use wakegate::engine::WakeEngine;
use wakegate::pool::ConnectionPool;
use wakegate::probe::{AwakeProbe, HttpProber, ProbeOutcome};
use wakegate::proxy::ProxyServer;
use wakegate::registry::{ServiceRegistry, SharedRegistry};
use wakegate::resolver::{resolve, ServiceRecord};
use wakegate::wol::{MacAddress, PacketSendError, PacketSender};

// ============================================================================
// Helpers
// ============================================================================

/// Backend that answers `/health` and echoes everything else
async fn spawn_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| async move {
                    Ok::<_, Infallible>(backend_response(req).await)
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    addr
}

async fn backend_response(req: Request<Incoming>) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_default();
    let host = req
        .headers()
        .get("host")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("")
        .to_string();
    let body = req.into_body().collect().await.map(|b| b.to_bytes()).unwrap_or_default();

    match path_and_query.as_str() {
        "/health" => Response::new(Full::new(Bytes::from_static(b"ok"))),
        "/missing" => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .header("X-Backend", "yes")
            .body(Full::new(Bytes::from_static(b"no such thing")))
            .unwrap(),
        _ => {
            let echo = format!(
                "{} {} host={} body={}",
                method,
                path_and_query,
                host,
                String::from_utf8_lossy(&body)
            );
            Response::builder()
                .status(StatusCode::OK)
                .header("X-Backend", "yes")
                .body(Full::new(Bytes::from(echo)))
                .unwrap()
        }
    }
}

/// An address nothing is listening on
fn closed_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

fn registry_from_yaml(yaml: &str) -> Arc<SharedRegistry> {
    let file = parse_yaml_services(yaml).unwrap().services;
    let resolution = resolve(&file, &ServiceMap::new(), &GlobalDefaults::default());
    assert!(resolution.issues.is_empty(), "unexpected issues: {:?}", resolution.issues);
    Arc::new(SharedRegistry::new(ServiceRegistry::from_resolution(resolution)))
}

/// Counts probes and always reports the configured outcome
struct FixedProber {
    outcome: ProbeOutcome,
    calls: AtomicU32,
}

impl FixedProber {
    fn new(outcome: ProbeOutcome) -> Self {
        Self {
            outcome,
            calls: AtomicU32::new(0),
        }
    }
}

impl AwakeProbe for FixedProber {
    fn probe<'a>(&'a self, _record: &'a ServiceRecord) -> impl Future<Output = ProbeOutcome> + Send + 'a {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self.outcome;
        async move { outcome }
    }
}

#[derive(Default)]
struct CountingSender {
    sent: AtomicU32,
}

impl PacketSender for CountingSender {
    fn send(&self, _mac: &MacAddress) -> Result<(), PacketSendError> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Start the proxy on an ephemeral port
async fn start_proxy<P>(
    registry: Arc<SharedRegistry>,
    engine: Arc<WakeEngine<P, CountingSender, Arc<ConnectionPool>>>,
) -> (SocketAddr, watch::Sender<bool>)
where
    P: AwakeProbe + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = ProxyServer::new(addr, registry, engine, shutdown_rx);
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    (addr, shutdown_tx)
}

fn http_engine() -> Arc<WakeEngine<HttpProber, CountingSender, Arc<ConnectionPool>>> {
    let pool = Arc::new(ConnectionPool::default());
    Arc::new(WakeEngine::new(
        HttpProber::new(Arc::clone(&pool), AwakePolicy::AnyResponse),
        CountingSender::default(),
        pool,
    ))
}

fn fixed_engine(outcome: ProbeOutcome) -> Arc<WakeEngine<FixedProber, CountingSender, Arc<ConnectionPool>>> {
    Arc::new(WakeEngine::new(
        FixedProber::new(outcome),
        CountingSender::default(),
        Arc::new(ConnectionPool::default()),
    ))
}

/// Send a raw HTTP/1.1 request and read the whole response
async fn http_request(addr: SocketAddr, raw: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();

    let mut response = String::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_string(&mut response))
        .await
        .expect("response within 10s")
        .unwrap();
    response
}

/// Send HTTP request with custom Host header
async fn http_get_with_host(addr: SocketAddr, path: &str, host: &str) -> String {
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, host
    );
    http_request(addr, &request).await
}

fn status_line(response: &str) -> &str {
    response.lines().next().unwrap_or("")
}

fn body(response: &str) -> &str {
    response.split_once("\r\n\r\n").map(|(_, body)| body).unwrap_or("")
}

// ============================================================================
// Forwarding
// ============================================================================

#[tokio::test]
async fn test_awake_service_is_proxied_with_path_and_query() {
    let backend = spawn_backend().await;
    let registry = registry_from_yaml(&format!(
        r#"
photos.wake.mydomain.com:
  base_url: http://{}
  awake_check_endpoint: /health
  mac_address: "AA:BB:CC:DD:EE:FF"
"#,
        backend
    ));
    let engine = http_engine();
    let (proxy, _shutdown) = start_proxy(registry, Arc::clone(&engine)).await;

    let response = http_get_with_host(proxy, "/api/albums?page=2", "Photos.Wake.MyDomain.com").await;

    assert!(status_line(&response).contains("200"), "got: {}", response);
    assert!(response.to_lowercase().contains("x-backend: yes"));
    let body = body(&response);
    assert!(body.contains("GET /api/albums?page=2"), "got: {}", body);
    // Host is rewritten to the backend's authority
    assert!(body.contains(&format!("host={}", backend)), "got: {}", body);
    assert_eq!(engine.sender().sent.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_post_body_is_forwarded() {
    let backend = spawn_backend().await;
    let registry = registry_from_yaml(&format!(
        "nas.lan:\n  base_url: http://{}/\n  awake_check_endpoint: health\n  mac_address: aa-bb-cc-dd-ee-ff\n",
        backend
    ));
    let (proxy, _shutdown) = start_proxy(registry, http_engine()).await;

    let payload = r#"{"name":"holiday"}"#;
    let request = format!(
        "POST /upload HTTP/1.1\r\nHost: nas.lan\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        payload.len(),
        payload
    );
    let response = http_request(proxy, &request).await;

    assert!(status_line(&response).contains("200"), "got: {}", response);
    assert!(body(&response).contains(&format!("POST /upload host={} body={}", backend, payload)));
}

#[tokio::test]
async fn test_backend_error_status_is_relayed() {
    let backend = spawn_backend().await;
    let registry = registry_from_yaml(&format!(
        "nas.lan:\n  base_url: http://{}\n  awake_check_endpoint: /health\n  mac_address: AA:BB:CC:DD:EE:FF\n",
        backend
    ));
    let (proxy, _shutdown) = start_proxy(registry, http_engine()).await;

    let response = http_get_with_host(proxy, "/missing", "nas.lan").await;

    assert!(status_line(&response).contains("404"), "got: {}", response);
    assert!(response.to_lowercase().contains("x-backend: yes"));
    assert!(!response.to_lowercase().contains("x-proxy-error"));
    assert_eq!(body(&response), "no such thing");
}

#[tokio::test]
async fn test_host_with_port_matches_bare_host() {
    let backend = spawn_backend().await;
    let registry = registry_from_yaml(&format!(
        "nas.lan:\n  base_url: http://{}\n  awake_check_endpoint: /health\n  mac_address: AA:BB:CC:DD:EE:FF\n",
        backend
    ));
    let (proxy, _shutdown) = start_proxy(registry, http_engine()).await;

    let response = http_get_with_host(proxy, "/", "nas.lan:3000").await;
    assert!(status_line(&response).contains("200"), "got: {}", response);
}

// ============================================================================
// Error responses
// ============================================================================

#[tokio::test]
async fn test_unknown_host_returns_404_without_probing() {
    let registry = registry_from_yaml(
        "nas.lan:\n  base_url: http://10.255.255.1\n  awake_check_endpoint: /health\n  mac_address: AA:BB:CC:DD:EE:FF\n",
    );
    let engine = fixed_engine(ProbeOutcome::Awake);
    let (proxy, _shutdown) = start_proxy(registry, Arc::clone(&engine)).await;

    let response = http_get_with_host(proxy, "/", "other.lan").await;

    assert!(status_line(&response).contains("404"), "got: {}", response);
    assert!(response.to_lowercase().contains("x-proxy-error: unknown_host"));
    assert!(body(&response).contains("Unknown target service: other.lan."));
    assert_eq!(engine.prober().calls.load(Ordering::SeqCst), 0);
    assert_eq!(engine.sender().sent.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_missing_host_returns_400() {
    let registry = registry_from_yaml(
        "nas.lan:\n  base_url: http://10.255.255.1\n  awake_check_endpoint: /health\n  mac_address: AA:BB:CC:DD:EE:FF\n",
    );
    let engine = fixed_engine(ProbeOutcome::Awake);
    let (proxy, _shutdown) = start_proxy(registry, Arc::clone(&engine)).await;

    // HTTP/1.0 allows omitting Host
    let response = http_request(proxy, "GET / HTTP/1.0\r\n\r\n").await;

    assert!(status_line(&response).contains("400"), "got: {}", response);
    assert!(response.to_lowercase().contains("x-proxy-error: missing_host_header"));
    assert_eq!(engine.prober().calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unwakeable_service_returns_503() {
    let registry = registry_from_yaml(&format!(
        r#"
sleepy.lan:
  base_url: http://{}
  awake_check_endpoint: /health
  mac_address: "AA:BB:CC:DD:EE:FF"
  max_retries: 0
  awake_request_timeout: 1
"#,
        closed_addr()
    ));
    let engine = http_engine();
    let (proxy, _shutdown) = start_proxy(registry, Arc::clone(&engine)).await;

    let response = http_get_with_host(proxy, "/", "sleepy.lan").await;

    assert!(status_line(&response).contains("503"), "got: {}", response);
    assert!(response.to_lowercase().contains("x-proxy-error: wake_exhausted"));
    assert!(body(&response).contains("Failed to reach the server sleepy.lan after 0 attempts."));
    assert_eq!(engine.sender().sent.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_forward_failure_after_awake_returns_502() {
    let registry = registry_from_yaml(&format!(
        "flaky.lan:\n  base_url: http://{}\n  awake_check_endpoint: /health\n  mac_address: AA:BB:CC:DD:EE:FF\n",
        closed_addr()
    ));
    let engine = fixed_engine(ProbeOutcome::Awake);
    let (proxy, _shutdown) = start_proxy(registry, Arc::clone(&engine)).await;

    let response = http_get_with_host(proxy, "/", "flaky.lan").await;

    assert!(status_line(&response).contains("502"), "got: {}", response);
    assert!(response.to_lowercase().contains("x-proxy-error: forward_failed"));
    assert_eq!(engine.prober().calls.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Reload and configuration sources
// ============================================================================

#[tokio::test]
async fn test_reload_takes_effect_for_new_requests() {
    let backend = spawn_backend().await;
    let registry = registry_from_yaml(&format!(
        "old.lan:\n  base_url: http://{}\n  awake_check_endpoint: /health\n  mac_address: AA:BB:CC:DD:EE:FF\n",
        backend
    ));
    let (proxy, _shutdown) = start_proxy(Arc::clone(&registry), http_engine()).await;

    assert!(status_line(&http_get_with_host(proxy, "/", "old.lan").await).contains("200"));

    let file = parse_yaml_services(&format!(
        "new.lan:\n  base_url: http://{}\n  awake_check_endpoint: /health\n  mac_address: AA:BB:CC:DD:EE:FF\n",
        backend
    ))
    .unwrap()
    .services;
    let resolution = resolve(&file, &ServiceMap::new(), &GlobalDefaults::default());
    let result = registry.replace(ServiceRegistry::from_resolution(resolution));
    assert_eq!(result.added, vec!["new.lan"]);
    assert_eq!(result.removed, vec!["old.lan"]);

    assert!(status_line(&http_get_with_host(proxy, "/", "old.lan").await).contains("404"));
    assert!(status_line(&http_get_with_host(proxy, "/", "new.lan").await).contains("200"));
}

#[test]
fn test_file_and_env_sources_merge() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("services.yaml");
    std::fs::write(
        &path,
        r#"
photos.wake.mydomain.com:
  base_url: http://192.168.1.115:8080
  awake_check_endpoint: /api/version
  mac_address: "AA:BB:CC:DD:EE:FF"
  max_retries: 3
"#,
    )
    .unwrap();

    let file = load_service_file(&path).unwrap().services;
    let env = env_service_overrides(vec![
        ("SERVICE_PHOTOS.WAKE.MYDOMAIN.COM_MAX_RETRIES".to_string(), "7".to_string()),
        ("SERVICE_NAS.LAN_BASE_URL".to_string(), "http://10.0.0.5".to_string()),
        ("SERVICE_NAS.LAN_AWAKE_CHECK_ENDPOINT".to_string(), "/ping".to_string()),
        ("SERVICE_NAS.LAN_MAC_ADDRESS".to_string(), "11:22:33:44:55:66".to_string()),
        ("SERVICE_BROKEN.LAN_BASE_URL".to_string(), "http://10.0.0.6".to_string()),
    ]);

    let resolution = resolve(&file, &env, &GlobalDefaults::default());

    let photos = &resolution.services["photos.wake.mydomain.com"];
    assert_eq!(photos.max_retries, 7);
    assert_eq!(photos.awake_check_url(), "http://192.168.1.115:8080/api/version");
    assert_eq!(photos.poll_interval, Duration::from_secs(5));

    let nas = &resolution.services["nas.lan"];
    assert_eq!(nas.base_url, "http://10.0.0.5");
    assert_eq!(nas.max_retries, 10);

    assert_eq!(resolution.services.len(), 2);
    assert_eq!(resolution.issues.len(), 1);
    assert_eq!(resolution.issues[0].host, "broken.lan");
}

#[test]
fn test_missing_service_file_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let file = load_service_file(&dir.path().join("absent.yaml")).unwrap();
    assert!(file.is_empty());
}
