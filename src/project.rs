//! Interfaces to the parts of the platform the preview proxy depends on but
//! does not own: project lookup, persisted ports, the live-process registry,
//! and the routines that start and stop dev servers.

use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Aggregate state of a project's dev servers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Starting,
    Running,
    Stopped,
}

/// Who started the processes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchType {
    Manual,
    Auto,
}

/// A single running dev server
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    pub pid: Option<u32>,
    pub port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessSet {
    pub frontend: Option<ProcessInfo>,
    pub backend: Option<ProcessInfo>,
}

impl ProcessSet {
    pub fn frontend_port(&self) -> Option<u16> {
        self.frontend.as_ref().map(|p| p.port)
    }

    pub fn backend_port(&self) -> Option<u16> {
        self.backend.as_ref().map(|p| p.port)
    }
}

/// What the live-process registry knows about one project
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunningProcessEntry {
    pub processes: ProcessSet,
    pub state: ProcessState,
    pub launch_type: LaunchType,
}

impl RunningProcessEntry {
    pub fn new(processes: ProcessSet, state: ProcessState, launch_type: LaunchType) -> Self {
        Self {
            processes,
            state,
            launch_type,
        }
    }

    /// Frontend port, only while the registry reports the project as running
    pub fn running_frontend_port(&self) -> Option<u16> {
        if self.state == ProcessState::Running {
            self.processes.frontend_port()
        } else {
            None
        }
    }

    /// Drop the frontend after it was observed dead. The aggregate state
    /// follows whatever survives.
    pub fn without_frontend(&self) -> Self {
        let state = if self.processes.backend.is_some() {
            ProcessState::Running
        } else {
            ProcessState::Stopped
        };
        Self {
            processes: ProcessSet {
                frontend: None,
                backend: self.processes.backend.clone(),
            },
            state,
            launch_type: self.launch_type,
        }
    }
}

/// Ports remembered across restarts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoredPorts {
    pub frontend: Option<u16>,
    pub backend: Option<u16>,
}

impl From<&ProcessSet> for StoredPorts {
    fn from(processes: &ProcessSet) -> Self {
        Self {
            frontend: processes.frontend_port(),
            backend: processes.backend_port(),
        }
    }
}

/// Port guesses derived from the project's own configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortHints {
    pub frontend: Option<u16>,
    pub backend: Option<u16>,
}

/// Port-base overrides from the persisted port settings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortOverrides {
    pub frontend_base: Option<u16>,
    pub backend_base: Option<u16>,
}

/// Options handed to the start routine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartOptions {
    pub hints: PortHints,
    pub overrides: PortOverrides,
}

/// Result of a start attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOutcome {
    pub success: bool,
    pub processes: ProcessSet,
}

impl StartOutcome {
    pub fn failed() -> Self {
        Self {
            success: false,
            processes: ProcessSet::default(),
        }
    }
}

/// Project metadata and persisted port settings
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// On-disk project root, `None` for unknown projects
    async fn project_path(&self, project_id: &str) -> anyhow::Result<Option<PathBuf>>;

    /// Ports persisted from the last successful start
    async fn stored_ports(&self, project_id: &str) -> anyhow::Result<StoredPorts>;

    /// Ports guessed from the project configuration
    async fn port_hints(&self, project_id: &str) -> anyhow::Result<PortHints>;

    /// Port-base overrides for picking fresh ports
    async fn port_overrides(&self, project_id: &str) -> anyhow::Result<PortOverrides>;

    /// Persist newly observed ports
    async fn save_ports(&self, project_id: &str, ports: StoredPorts) -> anyhow::Result<()>;
}

/// Live-process registry shared with the rest of the platform
pub trait ProcessRegistry: Send + Sync {
    fn get_running_process_entry(&self, project_id: &str) -> Option<RunningProcessEntry>;

    fn store_running_processes(&self, project_id: &str, entry: RunningProcessEntry);
}

/// Starts and stops dev servers
#[async_trait]
pub trait ProjectLauncher: Send + Sync {
    /// Forcibly stop every dev server of the project, freeing its ports
    async fn terminate_running_processes(&self, project_id: &str) -> anyhow::Result<()>;

    async fn start_project(
        &self,
        project_id: &str,
        project_path: &Path,
        options: StartOptions,
    ) -> anyhow::Result<StartOutcome>;
}
