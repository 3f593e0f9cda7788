//! Backend processes, one per side
//!
//! [`ProcessLauncher`] runs the optional build command in the side directory,
//! spawns the server command on the side's port and polls its health path until
//! it answers with a 2xx status.

use crate::builder::{BackendLauncher, BuildError, SideDirs};
use crate::config::BackendConfig;
use crate::state::Side;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Placeholder values available to args, env and the build command
#[derive(Debug, Clone)]
struct Placeholders {
    port: u16,
    side: Side,
    side_dir: PathBuf,
}

impl Placeholders {
    fn expand(&self, value: &str) -> String {
        value
            .replace("{port}", &self.port.to_string())
            .replace("{side}", self.side.as_str())
            .replace("{side_dir}", &self.side_dir.to_string_lossy())
    }
}

/// Launches backends as local child processes
pub struct ProcessLauncher {
    config: BackendConfig,
    running: DashMap<Side, Child>,
}

impl ProcessLauncher {
    pub fn new(config: BackendConfig) -> Self {
        Self {
            config,
            running: DashMap::new(),
        }
    }

    pub fn address(&self, side: Side) -> Result<SocketAddr, BuildError> {
        let addr = format!("{}:{}", self.config.host, self.config.port(side));
        addr.parse()
            .map_err(|e| BuildError::Launch(format!("invalid backend address {}: {}", addr, e)))
    }

    /// Environment passed to the build and server commands
    fn command_env(&self, dirs: &SideDirs, vars: &Placeholders) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = self
            .config
            .env
            .iter()
            .map(|(k, v)| (k.clone(), vars.expand(v)))
            .collect();

        env.insert("PORT".to_string(), vars.port.to_string());
        env.insert("TIPPROXY_SIDE".to_string(), dirs.side.to_string());
        for (name, path) in &dirs.repos {
            env.insert(repo_env_key(name), path.to_string_lossy().to_string());
        }
        env
    }

    fn working_dir(&self, dirs: &SideDirs) -> PathBuf {
        match self.config.working_dir {
            Some(ref dir) => dirs.root.join(dir),
            None => dirs.root.clone(),
        }
    }

    async fn run_build_command(
        &self,
        build: &str,
        dirs: &SideDirs,
        vars: &Placeholders,
        env: &HashMap<String, String>,
    ) -> Result<(), BuildError> {
        let expanded = vars.expand(build);
        let words = shell_words::split(&expanded).map_err(|e| BuildError::Command {
            command: expanded.clone(),
            message: e.to_string(),
        })?;
        let Some((program, args)) = words.split_first() else {
            return Ok(());
        };

        info!(side = %dirs.side, command = %expanded, "Running backend build command");
        let started = Instant::now();

        let output = Command::new(resolve_program(program, &dirs.root))
            .args(args)
            .current_dir(&dirs.root)
            .envs(env)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| BuildError::Command {
                command: expanded.clone(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(20).collect();
            let tail: Vec<&str> = tail.into_iter().rev().collect();
            return Err(BuildError::Command {
                command: expanded,
                message: format!("{}: {}", output.status, tail.join("\n")),
            });
        }

        info!(
            side = %dirs.side,
            elapsed_secs = started.elapsed().as_secs(),
            "Backend build command finished"
        );
        Ok(())
    }

    fn spawn_server(
        &self,
        dirs: &SideDirs,
        vars: &Placeholders,
        env: &HashMap<String, String>,
    ) -> Result<Child, BuildError> {
        let working_dir = self.working_dir(dirs);
        let program = resolve_program(&self.config.command, &working_dir);
        let args: Vec<String> = self.config.args.iter().map(|a| vars.expand(a)).collect();

        info!(
            side = %dirs.side,
            command = %program.display(),
            port = vars.port,
            "Starting backend"
        );

        let mut cmd = Command::new(&program);
        cmd.args(&args);
        cmd.current_dir(&working_dir);
        cmd.envs(env);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            BuildError::Launch(format!("failed to spawn {}: {}", program.display(), e))
        })?;

        let pid = child.id().unwrap_or(0);
        info!(side = %dirs.side, pid, "Backend process spawned");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, dirs.side, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, dirs.side, "stderr"));
        }

        Ok(child)
    }

    /// Poll the health endpoint until it answers 2xx, the process exits, or time runs out
    async fn wait_healthy(&self, side: Side, address: SocketAddr) -> Result<(), BuildError> {
        let timeout = self.config.startup_timeout();
        let interval = self.config.health_check_interval();
        let start = Instant::now();

        debug!(%side, %address, path = %self.config.health_path, "Waiting for backend health");

        loop {
            if let Some(mut child) = self.running.get_mut(&side) {
                if let Ok(Some(status)) = child.try_wait() {
                    drop(child);
                    self.running.remove(&side);
                    return Err(BuildError::Launch(format!("backend exited early with {}", status)));
                }
            } else {
                return Err(BuildError::Launch("backend process is gone".to_string()));
            }

            if check_health(address, &self.config.health_path).await {
                info!(%side, %address, elapsed_ms = start.elapsed().as_millis() as u64, "Backend is healthy");
                return Ok(());
            }

            if start.elapsed() > timeout {
                return Err(BuildError::Unhealthy {
                    address,
                    waited_secs: timeout.as_secs(),
                });
            }

            tokio::time::sleep(interval).await;
        }
    }

    async fn stop_child(&self, side: Side, mut child: Child) {
        let grace_period = self.config.shutdown_grace_period();

        if let Some(pid) = child.id() {
            info!(%side, pid, "Sending SIGTERM to backend");

            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            #[cfg(not(unix))]
            {
                let _ = child.start_kill();
            }
        }

        match tokio::time::timeout(grace_period, child.wait()).await {
            Ok(Ok(status)) => {
                info!(%side, ?status, "Backend process exited");
            }
            Ok(Err(e)) => {
                warn!(%side, error = %e, "Error waiting for backend to exit");
            }
            Err(_) => {
                warn!(
                    %side,
                    grace_period_secs = grace_period.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                let _ = child.kill().await;
            }
        }
    }
}

#[async_trait]
impl BackendLauncher for ProcessLauncher {
    async fn start_backend(&self, dirs: &SideDirs) -> Result<SocketAddr, BuildError> {
        let address = self.address(dirs.side)?;
        let vars = Placeholders {
            port: address.port(),
            side: dirs.side,
            side_dir: dirs.root.clone(),
        };
        let env = self.command_env(dirs, &vars);

        if let Some(ref build) = self.config.build_command {
            self.run_build_command(build, dirs, &vars, &env).await?;
        }

        let child = self.spawn_server(dirs, &vars, &env)?;
        self.running.insert(dirs.side, child);

        self.wait_healthy(dirs.side, address).await?;
        Ok(address)
    }

    async fn stop_backend(&self, side: Side) {
        if let Some((_, child)) = self.running.remove(&side) {
            self.stop_child(side, child).await;
        }
    }

    async fn stop_all(&self) {
        for side in [Side::A, Side::B] {
            self.stop_backend(side).await;
        }
    }
}

/// `TIPPROXY_REPO_<NAME>` with non-alphanumerics mapped to `_`
fn repo_env_key(name: &str) -> String {
    let upper: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("TIPPROXY_REPO_{}", upper)
}

/// Relative programs with a path component are resolved against `base`
fn resolve_program(program: &str, base: &Path) -> PathBuf {
    let path = Path::new(program);
    if path.is_relative() && path.components().count() > 1 {
        base.join(path)
    } else {
        path.to_path_buf()
    }
}

async fn forward_output<R>(stream: R, side: Side, which: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(%side, stream = which, "{}", line);
    }
}

/// GET `path` on `address`; true on a 2xx status line
async fn check_health(address: SocketAddr, path: &str) -> bool {
    let connect = tokio::time::timeout(
        Duration::from_secs(2),
        tokio::net::TcpStream::connect(address),
    )
    .await;

    let mut stream = match connect {
        Ok(Ok(s)) => s,
        Ok(Err(_)) | Err(_) => return false,
    };

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, address
    );
    if stream.write_all(request.as_bytes()).await.is_err() {
        return false;
    }

    let read = tokio::time::timeout(Duration::from_secs(2), async {
        let mut reader = BufReader::new(stream);
        let mut status_line = String::new();
        reader.read_line(&mut status_line).await?;
        Ok::<_, std::io::Error>(status_line)
    })
    .await;

    match read {
        // "HTTP/1.1 200 OK\r\n"
        Ok(Ok(status_line)) => status_line
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse::<u16>().ok())
            .map(|code| (200..300).contains(&code))
            .unwrap_or(false),
        _ => false,
    }
}
