//! Auto-restart of crashed dev servers.
//!
//! Failures are counted in a sliding window per project. The first failure of
//! a window is always tolerated; later ones may trigger a restart once the
//! cooldown since the previous attempt has passed. Concurrent restart requests
//! for one project share a single attempt.

use crate::config::PreviewSettings;
use crate::project::{
    LaunchType, ProcessRegistry, ProcessState, ProjectLauncher, ProjectStore, RunningProcessEntry,
    StartOptions, StoredPorts,
};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Failure bookkeeping for one project
#[derive(Debug, Clone, Copy)]
struct AutoRestartState {
    first_failure_at: Instant,
    count: u32,
    last_restart_at: Option<Instant>,
}

type InFlightRestart = Shared<BoxFuture<'static, ()>>;

pub struct AutoRestartController {
    failure_window: Duration,
    failure_threshold: u32,
    cooldown: Duration,
    states: Mutex<HashMap<String, AutoRestartState>>,
    in_flight: Mutex<HashMap<String, InFlightRestart>>,
    store: Arc<dyn ProjectStore>,
    registry: Arc<dyn ProcessRegistry>,
    launcher: Arc<dyn ProjectLauncher>,
}

/// Trimmed project id; blank ids disable the controller
fn normalize_key(project_id: &str) -> Option<String> {
    let key = project_id.trim();
    if key.is_empty() {
        None
    } else {
        Some(key.to_string())
    }
}

impl AutoRestartController {
    pub fn new(
        settings: &PreviewSettings,
        store: Arc<dyn ProjectStore>,
        registry: Arc<dyn ProcessRegistry>,
        launcher: Arc<dyn ProjectLauncher>,
    ) -> Self {
        Self {
            failure_window: settings.failure_window(),
            failure_threshold: settings.restart_failure_threshold,
            cooldown: settings.restart_cooldown(),
            states: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            store,
            registry,
            launcher,
        }
    }

    /// Record a connection failure and decide whether it warrants a restart.
    /// A positive decision starts the cooldown immediately, so a burst of
    /// failures yields a single restart.
    pub fn should_attempt_auto_restart(&self, project_id: &str) -> bool {
        self.should_attempt_auto_restart_at(project_id, Instant::now())
    }

    fn should_attempt_auto_restart_at(&self, project_id: &str, now: Instant) -> bool {
        let Some(key) = normalize_key(project_id) else {
            return false;
        };

        let mut states = self.states.lock();
        let Some(state) = states.get_mut(&key) else {
            states.insert(
                key,
                AutoRestartState {
                    first_failure_at: now,
                    count: 1,
                    last_restart_at: None,
                },
            );
            return false;
        };

        if now.duration_since(state.first_failure_at) > self.failure_window {
            // New window; the cooldown clock carries over
            state.first_failure_at = now;
            state.count = 1;
            return false;
        }

        state.count += 1;
        let cooled_down = state
            .last_restart_at
            .map(|at| now.duration_since(at) >= self.cooldown)
            .unwrap_or(true);

        let attempt = state.count >= self.failure_threshold && cooled_down;
        if attempt {
            state.last_restart_at = Some(now);
        }
        attempt
    }

    /// Start the cooldown clock without touching the failure window
    pub fn mark_auto_restart_attempted(&self, project_id: &str) {
        self.mark_auto_restart_attempted_at(project_id, Instant::now());
    }

    fn mark_auto_restart_attempted_at(&self, project_id: &str, now: Instant) {
        let Some(key) = normalize_key(project_id) else {
            return;
        };

        self.states
            .lock()
            .entry(key)
            .and_modify(|state| state.last_restart_at = Some(now))
            .or_insert(AutoRestartState {
                first_failure_at: now,
                count: 0,
                last_restart_at: Some(now),
            });
    }

    pub fn is_restart_in_flight(&self, project_id: &str) -> bool {
        normalize_key(project_id)
            .map(|key| self.in_flight.lock().contains_key(&key))
            .unwrap_or(false)
    }

    /// Restart the project's dev servers. Callers arriving while an attempt is
    /// running wait for that attempt instead of starting another. Never fails;
    /// problems are logged.
    pub async fn attempt_auto_restart(self: &Arc<Self>, project_id: &str) {
        let Some(key) = normalize_key(project_id) else {
            return;
        };

        let attempt = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(&key) {
                Some(existing) => {
                    debug!(project_id = %key, "Joining in-flight auto-restart");
                    existing.clone()
                }
                None => {
                    let controller = Arc::clone(self);
                    let task_key = key.clone();
                    let attempt = async move {
                        let _slot = InFlightSlot {
                            controller: &controller,
                            key: &task_key,
                        };
                        controller.run_restart(&task_key).await;
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(key, attempt.clone());
                    attempt
                }
            }
        };

        attempt.await;
    }

    async fn run_restart(&self, project_id: &str) {
        if let Err(e) = self.restart_project(project_id).await {
            warn!(project_id, error = %e, "Auto-restart failed");
        }
    }

    async fn restart_project(&self, project_id: &str) -> anyhow::Result<()> {
        self.mark_auto_restart_attempted(project_id);

        let Some(project_path) = self.store.project_path(project_id).await? else {
            debug!(project_id, "Skipping auto-restart for unknown project");
            return Ok(());
        };

        info!(project_id, "Auto-restarting preview dev servers");
        self.launcher.terminate_running_processes(project_id).await?;

        let options = StartOptions {
            hints: self.store.port_hints(project_id).await?,
            overrides: self.store.port_overrides(project_id).await?,
        };
        let outcome = self
            .launcher
            .start_project(project_id, &project_path, options)
            .await?;

        if !outcome.success {
            warn!(project_id, "Auto-restart did not bring the dev servers back");
            return Ok(());
        }

        let ports = StoredPorts::from(&outcome.processes);
        self.registry.store_running_processes(
            project_id,
            RunningProcessEntry::new(outcome.processes, ProcessState::Running, LaunchType::Auto),
        );
        self.store.save_ports(project_id, ports).await?;

        info!(
            project_id,
            frontend_port = ?ports.frontend,
            backend_port = ?ports.backend,
            "Auto-restart complete"
        );
        Ok(())
    }
}

/// Clears the in-flight slot when the attempt settles or is dropped
struct InFlightSlot<'a> {
    controller: &'a AutoRestartController,
    key: &'a str,
}

impl Drop for InFlightSlot<'_> {
    fn drop(&mut self) {
        self.controller.in_flight.lock().remove(self.key);
    }
}
