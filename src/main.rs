use previewgate::admin::{AdminServer, PKG_NAME, VERSION};
use previewgate::config::Config;
use previewgate::local::{InMemoryRegistry, LocalLauncher, LocalProjects};
use previewgate::pool::{ConnectionPool, PoolConfig};
use previewgate::preview::PreviewProxy;
use previewgate::project::{
    LaunchType, ProcessRegistry, ProcessState, ProjectLauncher, ProjectStore, RunningProcessEntry,
    StartOptions, StoredPorts,
};
use previewgate::proxy::ProxyServer;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("previewgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("previewgate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Collaborators
    let store = Arc::new(LocalProjects::new(
        config.projects.clone(),
        config.ports.clone(),
    ));
    let registry = Arc::new(InMemoryRegistry::new());
    let launcher = Arc::new(LocalLauncher::new(config.projects.clone()));

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
        connect_timeout: Some(config.preview.proxy_timeout()),
    };
    let pool = Arc::new(ConnectionPool::new(pool_config));

    let preview = Arc::new(PreviewProxy::new(
        config.preview.clone(),
        pool,
        store.clone(),
        registry.clone(),
        launcher.clone(),
    ));

    autostart_projects(&store, &registry, &launcher).await;

    let proxy_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let proxy = ProxyServer::new(proxy_addr, Arc::clone(&preview), shutdown_rx.clone());
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Preview gateway error");
        }
    });

    // Admin API is always bound to loopback
    let admin_handle = if config.server.admin_port > 0 {
        let admin_addr: SocketAddr = format!("127.0.0.1:{}", config.server.admin_port)
            .parse()
            .map_err(|e| {
                error!(admin_port = config.server.admin_port, error = %e, "Invalid admin bind address");
                anyhow::anyhow!("Invalid admin bind address: {}", e)
            })?;

        let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
            let token = uuid::Uuid::new_v4().to_string();
            info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
            token
        });

        let admin_server = AdminServer::new(
            admin_addr,
            Arc::clone(&registry),
            Arc::clone(&preview),
            shutdown_rx.clone(),
            admin_token,
        );

        Some(tokio::spawn(async move {
            if let Err(e) = admin_server.run().await {
                error!(error = %e, "Admin server error");
            }
        }))
    } else {
        None
    };

    wait_for_shutdown_signal().await?;

    let _ = shutdown_tx.send(true);

    info!("Stopping all dev servers...");
    launcher.stop_all().await;

    // Wait for servers to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = proxy_handle.await;
        if let Some(handle) = admin_handle {
            let _ = handle.await;
        }
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

/// Start every `autostart` project and record it as manually launched
async fn autostart_projects(
    store: &Arc<LocalProjects>,
    registry: &Arc<InMemoryRegistry>,
    launcher: &Arc<LocalLauncher>,
) {
    for project_id in store.autostart_ids() {
        if let Err(e) = autostart_project(&project_id, store, registry, launcher).await {
            warn!(project_id = %project_id, error = %e, "Autostart failed");
        }
    }
}

async fn autostart_project(
    project_id: &str,
    store: &Arc<LocalProjects>,
    registry: &Arc<InMemoryRegistry>,
    launcher: &Arc<LocalLauncher>,
) -> anyhow::Result<()> {
    let project_path = store
        .project_path(project_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Unknown project: {}", project_id))?;

    registry.store_running_processes(
        project_id,
        RunningProcessEntry::new(Default::default(), ProcessState::Starting, LaunchType::Manual),
    );

    let options = StartOptions {
        hints: store.port_hints(project_id).await?,
        overrides: store.port_overrides(project_id).await?,
    };
    let outcome = launcher.start_project(project_id, &project_path, options).await?;

    if !outcome.success {
        registry.store_running_processes(
            project_id,
            RunningProcessEntry::new(Default::default(), ProcessState::Stopped, LaunchType::Manual),
        );
        anyhow::bail!("Dev servers did not come up");
    }

    registry.store_running_processes(
        project_id,
        RunningProcessEntry::new(
            outcome.processes.clone(),
            ProcessState::Running,
            LaunchType::Manual,
        ),
    );
    store
        .save_ports(project_id, StoredPorts::from(&outcome.processes))
        .await?;

    info!(
        project_id,
        frontend_port = ?outcome.processes.frontend_port(),
        backend_port = ?outcome.processes.backend_port(),
        "Project autostarted"
    );
    Ok(())
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
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
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting preview gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        admin_port = if config.server.admin_port > 0 { Some(config.server.admin_port) } else { None },
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        proxy_timeout_ms = config.preview.proxy_timeout_ms,
        bad_port_ttl_ms = config.preview.bad_port_ttl_ms,
        failure_window_ms = config.preview.failure_window_ms,
        restart_failure_threshold = config.preview.restart_failure_threshold,
        restart_cooldown_ms = config.preview.restart_cooldown_ms,
        target_host = ?config.preview.target_host,
        "Preview settings"
    );
    info!(
        project_count = config.projects.len(),
        projects = ?config.projects.keys().collect::<Vec<_>>(),
        "Configured projects"
    );
}
