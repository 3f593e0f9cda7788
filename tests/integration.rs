//! Integration tests for Tipproxy

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tipproxy::builder::{BackendLauncher, BuildError, Checkout, EnvironmentBuilder, SideDirs};
use tipproxy::config::RepoConfig;
use tipproxy::controller::{PollOutcome, SideManager};
use tipproxy::metadata::HeadSource;
use tipproxy::proxy::ProxyServer;
use tipproxy::signature::Signature;
use tipproxy::state::{Environment, SharedState, Side};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Wait for a port to become available (server listening)
async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Send a simple HTTP request and get response
async fn http_get(port: u16, path: &str) -> Result<String, Box<dyn std::error::Error>> {
    http_get_with_host(port, path, &format!("127.0.0.1:{}", port)).await
}

/// Send HTTP request with custom Host header
async fn http_get_with_host(
    port: u16,
    path: &str,
    host: &str,
) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, host
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

fn response_body(response: &str) -> &str {
    response.split("\r\n\r\n").nth(1).unwrap_or("")
}

/// Read one request head and return (request line, lowercased headers)
async fn read_request_head(stream: &mut TcpStream) -> Option<(String, HashMap<String, String>)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let head = String::from_utf8_lossy(&buf).to_string();
    let mut lines = head.split("\r\n");
    let request_line = lines.next()?.to_string();
    let headers = lines
        .take_while(|l| !l.is_empty())
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_lowercase(), v.trim().to_string()))
        .collect();
    Some((request_line, headers))
}

/// Minimal HTTP backend that echoes who it is and what it received
async fn spawn_echo_backend(label: &str) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let label = label.to_string();

    let handle = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let label = label.clone();
            tokio::spawn(async move {
                let Some((request_line, headers)) = read_request_head(&mut stream).await else {
                    return;
                };
                let header = |name: &str| headers.get(name).cloned().unwrap_or_default();
                let body = format!(
                    "backend={}\nrequest={}\nhost={}\nforwarded-host={}\nforwarded-for={}\nforwarded-proto={}\nrequest-id={}\n",
                    label,
                    request_line,
                    header("host"),
                    header("x-forwarded-host"),
                    header("x-forwarded-for"),
                    header("x-forwarded-proto"),
                    header("x-request-id"),
                );
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    (addr, handle)
}

/// Backend that accepts connections and never answers
async fn spawn_silent_backend() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    (addr, handle)
}

/// Address with nothing listening on it
async fn closed_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Start the proxy on an ephemeral port
async fn start_proxy(
    state: SharedState,
    request_timeout: Duration,
) -> (u16, watch::Sender<bool>, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = ProxyServer::new(state, shutdown_rx).with_request_timeout(request_timeout);
    let handle = tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });

    assert!(wait_for_port(addr.port(), Duration::from_secs(5)).await);
    (addr.port(), shutdown_tx, handle)
}

fn environment(side: Side, address: SocketAddr, sig: &str) -> Environment {
    Environment {
        side,
        address,
        built_signature: Signature::from(sig),
        ready: true,
    }
}

// ============================================================================
// Request routing
// ============================================================================

#[tokio::test]
async fn test_not_ready_before_first_build() {
    let (port, shutdown_tx, _handle) = start_proxy(SharedState::new(), Duration::from_secs(5)).await;

    for path in ["/", "/pkg/net/http/", "/doc/?q=1"] {
        let response = http_get(port, path).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 500"), "got: {}", response);
        assert!(response.to_lowercase().contains("x-proxy-error: not_ready"));
        assert!(response_body(&response).contains("\"message\":\"not ready yet\""));
    }

    let _ = shutdown_tx.send(true);
}

#[tokio::test]
async fn test_status_endpoint_reports_state() {
    let state = SharedState::new();
    let (port, shutdown_tx, _handle) = start_proxy(state.clone(), Duration::from_secs(5)).await;

    let response = http_get(port, "/_tipstatus").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
    let json: serde_json::Value = serde_json::from_str(response_body(&response)).unwrap();
    assert_eq!(json["name"], "tipproxy");
    assert_eq!(json["ready"], false);
    assert_eq!(json["active_side"], "a");

    let (backend, _b) = spawn_echo_backend("b").await;
    state.swap_to(&environment(Side::B, backend, "s1"));

    let response = http_get(port, "/_tipstatus").await.unwrap();
    let json: serde_json::Value = serde_json::from_str(response_body(&response)).unwrap();
    assert_eq!(json["ready"], true);
    assert_eq!(json["active_side"], "b");
    assert_eq!(json["target"], backend.to_string());
    assert_eq!(json["last_applied_signature"], "s1");

    let _ = shutdown_tx.send(true);
}

#[tokio::test]
async fn test_forwards_to_active_backend_with_proxy_headers() {
    let state = SharedState::new();
    let (port, shutdown_tx, _handle) = start_proxy(state.clone(), Duration::from_secs(5)).await;
    let (backend, _b) = spawn_echo_backend("b").await;
    state.swap_to(&environment(Side::B, backend, "s1"));

    let response = http_get_with_host(port, "/pkg/fmt/?m=all", "tip.example.org")
        .await
        .unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);

    let body = response_body(&response);
    assert!(body.contains("backend=b\n"));
    assert!(body.contains("request=GET /pkg/fmt/?m=all HTTP/1.1\n"));
    assert!(body.contains(&format!("host={}\n", backend)));
    assert!(body.contains("forwarded-host=tip.example.org\n"));
    assert!(body.contains("forwarded-for=127.0.0.1\n"));
    assert!(body.contains("forwarded-proto=http\n"));
    assert!(!body.contains("request-id=\n"));

    let status = http_get(port, "/_tipstatus").await.unwrap();
    let json: serde_json::Value = serde_json::from_str(response_body(&status)).unwrap();
    assert_eq!(json["requests_forwarded"], 1);
    assert_eq!(json["requests_failed"], 0);

    let _ = shutdown_tx.send(true);
}

#[tokio::test]
async fn test_swap_redirects_new_requests() {
    let state = SharedState::new();
    let (port, shutdown_tx, _handle) = start_proxy(state.clone(), Duration::from_secs(5)).await;
    let (addr_b, _b) = spawn_echo_backend("b").await;
    let (addr_a, _a) = spawn_echo_backend("a").await;

    state.swap_to(&environment(Side::B, addr_b, "s1"));
    let response = http_get(port, "/").await.unwrap();
    assert!(response_body(&response).contains("backend=b\n"));

    state.swap_to(&environment(Side::A, addr_a, "s2"));
    let response = http_get(port, "/").await.unwrap();
    assert!(response_body(&response).contains("backend=a\n"));

    let _ = shutdown_tx.send(true);
}

#[tokio::test]
async fn test_unreachable_backend_is_bad_gateway() {
    let state = SharedState::new();
    let (port, shutdown_tx, _handle) = start_proxy(state.clone(), Duration::from_secs(5)).await;
    state.swap_to(&environment(Side::B, closed_addr().await, "s1"));

    let response = http_get(port, "/").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 502"), "got: {}", response);
    assert!(response.to_lowercase().contains("x-proxy-error: connection_failed"));

    let status = http_get(port, "/_tipstatus").await.unwrap();
    let json: serde_json::Value = serde_json::from_str(response_body(&status)).unwrap();
    assert_eq!(json["requests_failed"], 1);

    let _ = shutdown_tx.send(true);
}

#[tokio::test]
async fn test_slow_backend_is_gateway_timeout() {
    let state = SharedState::new();
    let (port, shutdown_tx, _handle) = start_proxy(state.clone(), Duration::from_millis(300)).await;
    let (backend, _b) = spawn_silent_backend().await;
    state.swap_to(&environment(Side::B, backend, "s1"));

    let response = http_get(port, "/").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 504"), "got: {}", response);
    assert!(response.to_lowercase().contains("x-proxy-error: request_timeout"));

    let _ = shutdown_tx.send(true);
}

#[tokio::test]
async fn test_proxy_stops_on_shutdown() {
    let (port, shutdown_tx, handle) = start_proxy(SharedState::new(), Duration::from_secs(5)).await;

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("proxy exits after shutdown")
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(TcpStream::connect(format!("127.0.0.1:{}", port)).await.is_err());
}

// ============================================================================
// Full cycle: side manager plus proxy
// ============================================================================

struct ScriptedSource {
    script: Mutex<VecDeque<HashMap<String, String>>>,
}

impl ScriptedSource {
    fn new(script: &[&[(&str, &str)]]) -> Self {
        let script = script
            .iter()
            .map(|pairs| {
                pairs
                    .iter()
                    .map(|(n, c)| (n.to_string(), c.to_string()))
                    .collect()
            })
            .collect();
        Self {
            script: Mutex::new(script),
        }
    }
}

#[async_trait]
impl HeadSource for ScriptedSource {
    async fn fetch(&self) -> Option<HashMap<String, String>> {
        self.script.lock().pop_front()
    }
}

struct NoopCheckout;

#[async_trait]
impl Checkout for NoopCheckout {
    async fn ensure_clone(&self, _remote: &str, path: &Path) -> Result<(), BuildError> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|source| BuildError::Io {
                path: path.to_path_buf(),
                source,
            })
    }
    async fn fetch_and_reset(&self, _path: &Path, _commit: &str) -> Result<(), BuildError> {
        Ok(())
    }
    async fn clean_working_tree(&self, _path: &Path) -> Result<(), BuildError> {
        Ok(())
    }
}

/// Starts an in-process echo backend labelled with the side
#[derive(Default)]
struct EchoLauncher {
    running: Mutex<HashMap<Side, JoinHandle<()>>>,
    fail_next: AtomicBool,
}

#[async_trait]
impl BackendLauncher for EchoLauncher {
    async fn start_backend(&self, dirs: &SideDirs) -> Result<SocketAddr, BuildError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(BuildError::Launch("build exited with status 2".to_string()));
        }
        let (addr, handle) = spawn_echo_backend(dirs.side.as_str()).await;
        self.running.lock().insert(dirs.side, handle);
        Ok(addr)
    }

    async fn stop_backend(&self, side: Side) {
        if let Some(handle) = self.running.lock().remove(&side) {
            handle.abort();
        }
    }

    async fn stop_all(&self) {
        for (_, handle) in self.running.lock().drain() {
            handle.abort();
        }
    }
}

#[tokio::test]
async fn test_blue_green_cycle_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let state = SharedState::new();
    let launcher = Arc::new(EchoLauncher::default());

    let builder = EnvironmentBuilder::new(
        dir.path(),
        vec![
            RepoConfig::new("core", "https://example.com/core"),
            RepoConfig::new("extensions", "https://example.com/ext"),
        ],
        Arc::new(NoopCheckout),
        launcher.clone(),
    );
    let source = ScriptedSource::new(&[
        &[("core", "c1"), ("extensions", "t1")],
        &[("core", "c1"), ("extensions", "t1")],
        &[("core", "c2"), ("extensions", "t1")],
        &[("core", "c2"), ("extensions", "t1")],
    ]);
    let manager = SideManager::new(
        Arc::new(source),
        vec!["core".to_string(), "extensions".to_string()],
        builder,
        state.clone(),
        Duration::from_millis(10),
    );

    let (port, shutdown_tx, _handle) = start_proxy(state.clone(), Duration::from_secs(5)).await;

    let response = http_get(port, "/").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 500"));

    // First build goes to B
    assert!(matches!(
        manager.poll_once().await,
        PollOutcome::Swapped { side: Side::B, .. }
    ));
    assert!(dir.path().join("b/core").is_dir());
    assert!(dir.path().join("b/extensions").is_dir());
    let response = http_get(port, "/").await.unwrap();
    assert!(response_body(&response).contains("backend=b\n"));

    assert!(matches!(manager.poll_once().await, PollOutcome::Unchanged));

    // Failed build on A: B keeps serving
    launcher.fail_next.store(true, Ordering::SeqCst);
    assert!(manager.poll_once().await.is_build_failure());
    let response = http_get(port, "/").await.unwrap();
    assert!(response_body(&response).contains("backend=b\n"));
    let status = http_get(port, "/_tipstatus").await.unwrap();
    assert!(response_body(&status).contains("build exited with status 2"));

    // Retry succeeds on A
    assert!(matches!(
        manager.poll_once().await,
        PollOutcome::Swapped { side: Side::A, .. }
    ));
    let response = http_get(port, "/").await.unwrap();
    assert!(response_body(&response).contains("backend=a\n"));

    // Metadata dried up: nothing changes
    assert!(matches!(manager.poll_once().await, PollOutcome::NoMetadata));
    let response = http_get(port, "/").await.unwrap();
    assert!(response_body(&response).contains("backend=a\n"));

    launcher.stop_all().await;
    let _ = shutdown_tx.send(true);
}
