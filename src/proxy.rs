use crate::error::{json_error_response, ProxyErrorCode};
use crate::pool::{ConnectionPool, PoolConfig, PoolError, PoolStats};
use crate::state::{SharedState, Snapshot};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

const DEFAULT_STATUS_PATH: &str = "/_tipstatus";

/// Per-request view of the server, shared by every connection
struct Router {
    state: SharedState,
    pool: ConnectionPool,
    status_path: String,
    request_timeout: Duration,
}

/// The front-end reverse proxy
pub struct ProxyServer {
    router: Arc<Router>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(state: SharedState, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self::with_pool_config(state, shutdown_rx, PoolConfig::default())
    }

    pub fn with_pool_config(
        state: SharedState,
        shutdown_rx: watch::Receiver<bool>,
        pool_config: PoolConfig,
    ) -> Self {
        Self {
            router: Arc::new(Router {
                state,
                pool: ConnectionPool::new(pool_config),
                status_path: DEFAULT_STATUS_PATH.to_string(),
                request_timeout: Duration::from_secs(30),
            }),
            shutdown_rx,
        }
    }

    /// Must be called before the server starts serving
    pub fn with_status_path(mut self, path: &str) -> Self {
        if let Some(router) = Arc::get_mut(&mut self.router) {
            router.status_path = path.to_string();
        }
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        if let Some(router) = Arc::get_mut(&mut self.router) {
            router.request_timeout = timeout;
        }
        self
    }

    /// Serve on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(
            addr = %local_addr,
            status_path = %self.router.status_path,
            "Proxy server listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let router = Arc::clone(&self.router);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, router).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                res = shutdown_rx.changed() => {
                    if res.is_err() || *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, addr: SocketAddr, router: Arc<Router>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let router = Arc::clone(&router);
        async move { handle_request(req, router, addr).await }
    });

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

async fn handle_request(
    mut req: Request<Incoming>,
    router: Arc<Router>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    if req.uri().path() == router.status_path {
        return Ok(status_response(
            req.method(),
            &router.state.snapshot(),
            &router.pool.stats(),
        ));
    }

    // One read per request: the target cannot change under us mid-request
    let Some(target) = router.state.target() else {
        debug!(method = %req.method(), uri = %req.uri(), "No environment ready");
        return Ok(json_error_response(ProxyErrorCode::NotReady, "not ready yet"));
    };

    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // X-Forwarded-* are overwritten, not appended: this proxy is the first hop
    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    debug!(%target, method = %req.method(), uri = %req.uri(), request_id, "Forwarding request");

    let timeout = router.request_timeout;
    match tokio::time::timeout(timeout, router.pool.send_request(req, target)).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(PoolError::RequestBuild(e))) => {
            error!(%target, request_id, error = %e, "Failed to build backend request");
            Ok(json_error_response(
                ProxyErrorCode::InternalError,
                "Failed to build backend request",
            ))
        }
        Ok(Err(e)) => {
            error!(%target, request_id, error = %e, "Failed to forward request");
            Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to connect to backend",
            ))
        }
        Err(_) => {
            router.pool.stats().record_failure();
            warn!(%target, request_id, timeout_secs = timeout.as_secs(), "Request timed out");
            Ok(json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!("Request timed out after {} seconds", timeout.as_secs()),
            ))
        }
    }
}

/// Body of the status endpoint
#[derive(Debug, Serialize)]
struct StatusBody<'a> {
    name: &'static str,
    version: &'static str,
    ready: bool,
    #[serde(flatten)]
    snapshot: &'a Snapshot,
    requests_forwarded: u64,
    requests_failed: u64,
}

impl<'a> StatusBody<'a> {
    fn new(snapshot: &'a Snapshot, stats: &PoolStats) -> Self {
        Self {
            name: PKG_NAME,
            version: VERSION,
            ready: snapshot.is_ready(),
            snapshot,
            requests_forwarded: stats.get_total_requests(),
            requests_failed: stats.get_failed_requests(),
        }
    }
}

fn status_response(
    method: &Method,
    snapshot: &Snapshot,
    stats: &PoolStats,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    if method != Method::GET && method != Method::HEAD {
        return Response::builder()
            .status(StatusCode::METHOD_NOT_ALLOWED)
            .header(hyper::header::ALLOW, "GET, HEAD")
            .body(Full::new(Bytes::new()).map_err(|never| match never {}).boxed())
            .expect("valid response builder");
    }

    let body = match serde_json::to_vec(&StatusBody::new(snapshot, stats)) {
        Ok(body) => body,
        Err(e) => {
            error!(error = %e, "Failed to serialize status");
            return json_error_response(ProxyErrorCode::InternalError, "Failed to serialize status");
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .header(hyper::header::CACHE_CONTROL, "no-store")
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}
