use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tipproxy::builder::{BackendLauncher, EnvironmentBuilder};
use tipproxy::config::Config;
use tipproxy::controller::SideManager;
use tipproxy::git::GitCheckout;
use tipproxy::launcher::ProcessLauncher;
use tipproxy::metadata::MetadataFetcher;
use tipproxy::pool::PoolConfig;
use tipproxy::proxy::{ProxyServer, PKG_NAME, VERSION};
use tipproxy::state::SharedState;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tipproxy=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("tipproxy.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    let listen_addr = config.server.listen_addr()?;
    // Bind before anything is built so a taken port fails fast
    let listener = TcpListener::bind(listen_addr).await.map_err(|e| {
        error!(addr = %listen_addr, error = %e, "Failed to bind listener");
        anyhow::anyhow!("Failed to bind {}: {}", listen_addr, e)
    })?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let state = SharedState::new();

    let fetcher = MetadataFetcher::new(
        &config.poll.metadata_url,
        &config.poll.branch,
        config.poll.fetch_timeout(),
        config.poll.max_body_bytes,
    )?;
    let launcher = Arc::new(ProcessLauncher::new(config.backend.clone()));
    let builder = EnvironmentBuilder::new(
        config.workspace.dir.clone(),
        config.repos.clone(),
        Arc::new(GitCheckout::default()),
        launcher.clone(),
    );
    let manager = SideManager::new(
        Arc::new(fetcher),
        config.tracked_names(),
        builder,
        state.clone(),
        config.poll.interval(),
    )
    .with_retry_policy(config.poll.retry);

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    };

    let proxy = ProxyServer::with_pool_config(state, shutdown_rx.clone(), pool_config)
        .with_status_path(&config.server.status_path)
        .with_request_timeout(config.server.request_timeout());

    let controller_rx = shutdown_rx.clone();
    let controller_handle = tokio::spawn(async move {
        manager.run(controller_rx).await;
    });

    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.serve(listener).await {
            error!(error = %e, "Proxy server error");
        }
    });

    wait_for_signal().await?;

    let _ = shutdown_tx.send(true);

    info!("Stopping all backends...");
    launcher.stop_all().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = proxy_handle.await;
        let _ = controller_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT (Ctrl+C), shutting down...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting tip proxy");
    info!(
        listen = %config.server.listen,
        status_path = %config.server.status_path,
        request_timeout_secs = config.server.request_timeout_secs,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        metadata_url = %config.poll.metadata_url,
        branch = %config.poll.branch,
        interval_secs = config.poll.interval_secs,
        retry = ?config.poll.retry,
        "Polling settings"
    );
    info!(
        workspace = %config.workspace.dir.display(),
        repos = ?config.tracked_names(),
        "Tracked repositories"
    );
    info!(
        command = %config.backend.command,
        build_command = ?config.backend.build_command,
        port_a = config.backend.port_a,
        port_b = config.backend.port_b,
        health_path = %config.backend.health_path,
        startup_timeout_secs = config.backend.startup_timeout_secs,
        "Backend settings"
    );
}
