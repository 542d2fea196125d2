use crate::engine::{EngineError, Forwarder, WakeEngine};
use crate::error::{json_error_response, ProxyErrorCode};
use crate::pool::{PoolError, ProxyBody};
use crate::probe::AwakeProbe;
use crate::registry::SharedRegistry;
use crate::wol::PacketSender;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";

/// Maximum Host header length (hostname plus port)
const MAX_HOST_LEN: usize = 253 + 6;

/// The inbound HTTP server
pub struct ProxyServer<P, S, F> {
    bind_addr: SocketAddr,
    registry: Arc<SharedRegistry>,
    engine: Arc<WakeEngine<P, S, F>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<P, S, F> ProxyServer<P, S, F>
where
    P: AwakeProbe + 'static,
    S: PacketSender + 'static,
    F: Forwarder + 'static,
{
    pub fn new(
        bind_addr: SocketAddr,
        registry: Arc<SharedRegistry>,
        engine: Arc<WakeEngine<P, S, F>>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            registry,
            engine,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already-bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let registry = Arc::clone(&self.registry);
                            let engine = Arc::clone(&self.engine);

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, registry, engine).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<St, P, S, F>(
    stream: St,
    addr: SocketAddr,
    registry: Arc<SharedRegistry>,
    engine: Arc<WakeEngine<P, S, F>>,
) -> anyhow::Result<()>
where
    St: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    P: AwakeProbe + 'static,
    S: PacketSender + 'static,
    F: Forwarder + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let registry = Arc::clone(&registry);
        let engine = Arc::clone(&engine);
        async move { Ok::<_, hyper::Error>(handle_request(req, registry, engine, addr).await) }
    });

    // Dropping the connection drops in-flight request futures, which abandons
    // any wake loop they are running
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

/// Route one request: registry lookup, then wake and forward
pub async fn handle_request<P, S, F>(
    req: Request<Incoming>,
    registry: Arc<SharedRegistry>,
    engine: Arc<WakeEngine<P, S, F>>,
    client_addr: SocketAddr,
) -> Response<ProxyBody>
where
    P: AwakeProbe,
    S: PacketSender,
    F: Forwarder,
{
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let Some(host) = extract_host(&req) else {
        warn!(client = %client_addr, request_id, "Host header is missing or invalid");
        return json_error_response(ProxyErrorCode::MissingHostHeader, "Host header is missing.");
    };

    debug!(host, method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    let Some(record) = registry.snapshot().lookup(&host) else {
        warn!(host, request_id, "Unknown target service");
        return json_error_response(
            ProxyErrorCode::UnknownHost,
            format!("Unknown target service: {}.", host),
        );
    };

    let req = req.map(|body| body.boxed());

    match engine.handle(&record, req).await {
        Ok(response) => response,
        Err(e) => {
            error!(host = %record.host, request_id, error = %e, "Request failed");
            error_response(&e)
        }
    }
}

/// Map an engine failure to the caller-facing error response
pub fn error_response(err: &EngineError) -> Response<ProxyBody> {
    match err {
        EngineError::WakeExhausted { host, attempts } => json_error_response(
            ProxyErrorCode::WakeExhausted,
            format!("Failed to reach the server {} after {} attempts.", host, attempts),
        ),
        EngineError::ForwardFailed {
            host,
            source: PoolError::RequestBuild(reason),
        } => json_error_response(
            ProxyErrorCode::InternalError,
            format!("Could not build the request for {}: {}", host, reason),
        ),
        EngineError::ForwardFailed { host, .. } => json_error_response(
            ProxyErrorCode::ForwardFailed,
            format!("Failed to reach the server {} after it woke up.", host),
        ),
        EngineError::ForwardTimeout { host, timeout } => json_error_response(
            ProxyErrorCode::ForwardTimeout,
            format!(
                "The server {} woke up but did not respond within {} seconds.",
                host,
                timeout.as_secs()
            ),
        ),
    }
}

/// The request's target host, lower-cased. HTTP/2 requests carry it in the URI authority.
fn extract_host<B>(req: &Request<B>) -> Option<String> {
    let host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))?;

    let host = host.trim();
    if host.is_empty() || host.len() > MAX_HOST_LEN {
        return None;
    }

    // Keeps log fields and error bodies free of control characters
    if !host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | ':' | '[' | ']'))
    {
        return None;
    }

    Some(host.to_lowercase())
}
