//! Default collaborators for running the gateway on a single machine: a
//! project store backed by the configuration file, an in-memory process
//! registry, and a launcher that spawns dev servers as child processes.

use crate::config::{DevServerConfig, PortSettings, ProjectConfig};
use crate::project::{
    PortHints, PortOverrides, ProcessInfo, ProcessRegistry, ProcessSet, ProjectLauncher,
    ProjectStore, RunningProcessEntry, StartOptions, StartOutcome, StoredPorts,
};
use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// How long a freshly spawned frontend gets to open its port
const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Time between SIGTERM and SIGKILL
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Interval for polling a starting dev server (in milliseconds)
const STARTUP_POLL_INTERVAL_MS: u64 = 100;

/// Ports scanned above a port base before falling back to an ephemeral port
const PORT_SCAN_RANGE: u16 = 100;

// ============================================================================
// Project store
// ============================================================================

/// Project store backed by the `[projects]` table. Ports saved after a start
/// are kept in memory for the lifetime of the gateway.
pub struct LocalProjects {
    projects: HashMap<String, ProjectConfig>,
    ports: PortSettings,
    stored: RwLock<HashMap<String, StoredPorts>>,
}

impl LocalProjects {
    pub fn new(projects: HashMap<String, ProjectConfig>, ports: PortSettings) -> Self {
        Self {
            projects,
            ports,
            stored: RwLock::new(HashMap::new()),
        }
    }

    /// Ids of projects marked `autostart`, sorted
    pub fn autostart_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .projects
            .iter()
            .filter(|(_, p)| p.autostart)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl ProjectStore for LocalProjects {
    async fn project_path(&self, project_id: &str) -> anyhow::Result<Option<PathBuf>> {
        Ok(self.projects.get(project_id).map(|p| p.path.clone()))
    }

    async fn stored_ports(&self, project_id: &str) -> anyhow::Result<StoredPorts> {
        Ok(self
            .stored
            .read()
            .get(project_id)
            .copied()
            .unwrap_or_default())
    }

    async fn port_hints(&self, project_id: &str) -> anyhow::Result<PortHints> {
        let Some(project) = self.projects.get(project_id) else {
            return Ok(PortHints::default());
        };
        Ok(PortHints {
            frontend: project.frontend.as_ref().and_then(|s| s.port),
            backend: project.backend.as_ref().and_then(|s| s.port),
        })
    }

    async fn port_overrides(&self, _project_id: &str) -> anyhow::Result<PortOverrides> {
        Ok(PortOverrides {
            frontend_base: self.ports.frontend_base,
            backend_base: self.ports.backend_base,
        })
    }

    async fn save_ports(&self, project_id: &str, ports: StoredPorts) -> anyhow::Result<()> {
        self.stored.write().insert(project_id.to_string(), ports);
        Ok(())
    }
}

// ============================================================================
// Process registry
// ============================================================================

#[derive(Default)]
pub struct InMemoryRegistry {
    entries: DashMap<String, RunningProcessEntry>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every entry, sorted by project id
    pub fn list(&self) -> Vec<(String, RunningProcessEntry)> {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    #[cfg(test)]
    fn remove(&self, project_id: &str) -> Option<RunningProcessEntry> {
        self.entries.remove(project_id).map(|(_, entry)| entry)
    }
}

impl ProcessRegistry for InMemoryRegistry {
    fn get_running_process_entry(&self, project_id: &str) -> Option<RunningProcessEntry> {
        self.entries.get(project_id).map(|e| e.value().clone())
    }

    fn store_running_processes(&self, project_id: &str, entry: RunningProcessEntry) {
        self.entries.insert(project_id.to_string(), entry);
    }
}

// ============================================================================
// Launcher
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevServerRole {
    Frontend,
    Backend,
}

impl DevServerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            DevServerRole::Frontend => "frontend",
            DevServerRole::Backend => "backend",
        }
    }
}

impl std::fmt::Display for DevServerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

struct ManagedProcess {
    role: DevServerRole,
    port: u16,
    child: Child,
}

/// Spawns dev servers as local child processes
pub struct LocalLauncher {
    projects: HashMap<String, ProjectConfig>,
    children: DashMap<String, Vec<ManagedProcess>>,
    startup_timeout: Duration,
    grace_period: Duration,
}

impl LocalLauncher {
    pub fn new(projects: HashMap<String, ProjectConfig>) -> Self {
        Self {
            projects,
            children: DashMap::new(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    /// Override startup timeout and stop grace period (builder pattern)
    pub fn with_timeouts(mut self, startup_timeout: Duration, grace_period: Duration) -> Self {
        self.startup_timeout = startup_timeout;
        self.grace_period = grace_period;
        self
    }

    /// Number of live child processes for a project
    pub fn process_count(&self, project_id: &str) -> usize {
        self.children.get(project_id).map(|c| c.len()).unwrap_or(0)
    }

    fn spawn_dev_server(
        &self,
        project_id: &str,
        role: DevServerRole,
        server: &DevServerConfig,
        project_path: &Path,
        port: u16,
    ) -> anyhow::Result<ProcessInfo> {
        info!(project_id, role = %role, command = %server.command, port, "Starting dev server");

        let mut cmd = Command::new(&server.command);
        cmd.args(&server.args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let working_dir = match &server.working_dir {
            Some(dir) => project_path.join(dir),
            None => project_path.to_path_buf(),
        };
        cmd.current_dir(working_dir);

        for (key, value) in &server.env {
            cmd.env(key, value);
        }
        cmd.env("PORT", port.to_string());

        let mut child = cmd.spawn().with_context(|| {
            format!(
                "Failed to spawn {} dev server for project {}",
                role, project_id
            )
        })?;
        let pid = child.id();
        debug!(project_id, role = %role, ?pid, "Dev server spawned");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(project_id.to_string(), role, stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(project_id.to_string(), role, stderr));
        }

        self.children
            .entry(project_id.to_string())
            .or_default()
            .push(ManagedProcess { role, port, child });

        Ok(ProcessInfo { pid, port })
    }

    /// Wait until the frontend accepts connections. Gives up early when the
    /// process exits.
    async fn wait_for_frontend(&self, project_id: &str, port: u16) -> bool {
        let start = Instant::now();
        while start.elapsed() < self.startup_timeout {
            if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                return true;
            }

            if self.frontend_exited(project_id) {
                warn!(project_id, port, "Frontend dev server exited during startup");
                return false;
            }

            tokio::time::sleep(Duration::from_millis(STARTUP_POLL_INTERVAL_MS)).await;
        }

        warn!(
            project_id,
            port,
            timeout_secs = self.startup_timeout.as_secs(),
            "Frontend dev server did not open its port in time"
        );
        false
    }

    fn frontend_exited(&self, project_id: &str) -> bool {
        let Some(mut children) = self.children.get_mut(project_id) else {
            return true;
        };
        children
            .iter_mut()
            .filter(|p| p.role == DevServerRole::Frontend)
            .any(|p| matches!(p.child.try_wait(), Ok(Some(_))))
    }

    async fn stop_process(&self, project_id: &str, mut process: ManagedProcess) {
        let role = process.role;
        let port = process.port;

        if let Some(pid) = process.child.id() {
            info!(project_id, role = %role, pid, port, "Sending SIGTERM to dev server");

            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            #[cfg(not(unix))]
            {
                let _ = process.child.start_kill();
            }
        }

        match tokio::time::timeout(self.grace_period, process.child.wait()).await {
            Ok(Ok(status)) => {
                info!(project_id, role = %role, ?status, "Dev server exited");
            }
            Ok(Err(e)) => {
                warn!(project_id, role = %role, error = %e, "Error waiting for dev server to exit");
            }
            Err(_) => {
                warn!(
                    project_id,
                    role = %role,
                    grace_period_secs = self.grace_period.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                let _ = process.child.kill().await;
            }
        }
    }

    /// Stop every dev server this launcher started
    pub async fn stop_all(&self) {
        let project_ids: Vec<String> = self.children.iter().map(|e| e.key().clone()).collect();
        for project_id in project_ids {
            if let Some((_, processes)) = self.children.remove(&project_id) {
                for process in processes {
                    self.stop_process(&project_id, process).await;
                }
            }
        }
    }
}

#[async_trait]
impl ProjectLauncher for LocalLauncher {
    async fn terminate_running_processes(&self, project_id: &str) -> anyhow::Result<()> {
        let Some((_, processes)) = self.children.remove(project_id) else {
            return Ok(());
        };
        for process in processes {
            self.stop_process(project_id, process).await;
        }
        Ok(())
    }

    async fn start_project(
        &self,
        project_id: &str,
        project_path: &Path,
        options: StartOptions,
    ) -> anyhow::Result<StartOutcome> {
        let project = self
            .projects
            .get(project_id)
            .ok_or_else(|| anyhow::anyhow!("Unknown project: {}", project_id))?;
        let frontend = project
            .frontend
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Project {} has no frontend dev server", project_id))?;

        let mut processes = ProcessSet::default();

        if let Some(backend) = &project.backend {
            let port = pick_port(options.hints.backend, options.overrides.backend_base).await?;
            match self.spawn_dev_server(project_id, DevServerRole::Backend, backend, project_path, port)
            {
                Ok(info) => processes.backend = Some(info),
                Err(e) => {
                    self.terminate_running_processes(project_id).await?;
                    return Err(e);
                }
            }
        }

        let port = pick_port(options.hints.frontend, options.overrides.frontend_base).await?;
        match self.spawn_dev_server(project_id, DevServerRole::Frontend, frontend, project_path, port) {
            Ok(info) => processes.frontend = Some(info),
            Err(e) => {
                self.terminate_running_processes(project_id).await?;
                return Err(e);
            }
        }

        if !self.wait_for_frontend(project_id, port).await {
            self.terminate_running_processes(project_id).await?;
            return Ok(StartOutcome::failed());
        }

        info!(project_id, port, "Dev servers ready");
        Ok(StartOutcome {
            success: true,
            processes,
        })
    }
}

/// Preferred port if given, else the first free port at or above `base`,
/// else whatever the OS hands out
async fn pick_port(preferred: Option<u16>, base: Option<u16>) -> anyhow::Result<u16> {
    if let Some(port) = preferred {
        return Ok(port);
    }

    if let Some(base) = base {
        for port in base..base.saturating_add(PORT_SCAN_RANGE) {
            if TcpListener::bind(("127.0.0.1", port)).await.is_ok() {
                return Ok(port);
            }
        }
        debug!(base, "No free port near base, using an ephemeral port");
    }

    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .context("Failed to reserve an ephemeral port")?;
    Ok(listener.local_addr()?.port())
}

/// Forward a dev server's output to tracing, one line per event
async fn forward_output<R>(project_id: String, role: DevServerRole, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(project_id = %project_id, role = %role, "{}", line),
            Ok(None) => break,
            Err(e) => {
                debug!(project_id = %project_id, role = %role, error = %e, "Stopped reading dev server output");
                break;
            }
        }
    }
}
