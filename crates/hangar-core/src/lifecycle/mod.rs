//! Background coordination across all engines: autostart, bounded restart
//! of unhealthy processes, notifications, and the aggregated diagnostics
//! report.
//!
//! The lifecycle manager persists nothing of its own; it is fully
//! reconstructible from the registry plus the live process table.

use crate::config::LifecycleConfig;
use crate::installer::provenance::InstallProvenance;
use crate::installer::Installer;
use crate::manifest::ManifestLoader;
use crate::registry::{EngineConfig, EngineRegistry};
use crate::supervisor::health::HealthProbe;
use crate::supervisor::{EngineState, ProcessStatus, ProcessSupervisor};
use crate::system::gpu;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

/// A user-facing event. Persistent notifications mark conditions that will
/// not resolve without operator action, like an engine that exhausted its
/// restart budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub level: NotificationLevel,
    pub engine_id: Option<String>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub persistent: bool,
}

/// Everything known about one engine, for troubleshooting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineDiagnostics {
    pub id: String,
    pub manifest_name: Option<String>,
    pub manifest_version: Option<String>,
    pub installed: bool,
    pub install_path: Option<std::path::PathBuf>,
    pub install_size_bytes: Option<u64>,
    pub provenance: Option<InstallProvenance>,
    /// Install looks fine but provenance is missing.
    pub degraded: bool,
    pub config: Option<EngineConfig>,
    pub status: ProcessStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsReport {
    pub generated_at: DateTime<Utc>,
    pub engines: Vec<EngineDiagnostics>,
}

struct RestartState {
    attempts: u32,
    next_attempt: Instant,
    gave_up: bool,
}

pub struct LifecycleManager {
    registry: Arc<EngineRegistry>,
    supervisor: Arc<ProcessSupervisor>,
    installer: Arc<Installer>,
    manifest: Arc<ManifestLoader>,
    notifications: Mutex<VecDeque<Notification>>,
    restarts: Mutex<HashMap<String, RestartState>>,
    sweep_interval: Duration,
    max_restart_attempts: u32,
    restart_base_delay: Duration,
    max_notifications: usize,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
}

impl LifecycleManager {
    pub fn new(
        registry: Arc<EngineRegistry>,
        supervisor: Arc<ProcessSupervisor>,
        installer: Arc<Installer>,
        manifest: Arc<ManifestLoader>,
    ) -> Self {
        Self {
            registry,
            supervisor,
            installer,
            manifest,
            notifications: Mutex::new(VecDeque::new()),
            restarts: Mutex::new(HashMap::new()),
            sweep_interval: LifecycleConfig::SWEEP_INTERVAL,
            max_restart_attempts: LifecycleConfig::MAX_RESTART_ATTEMPTS,
            restart_base_delay: LifecycleConfig::RESTART_BASE_DELAY,
            max_notifications: LifecycleConfig::MAX_NOTIFICATIONS,
            sweep_task: Mutex::new(None),
        }
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_restart_policy(mut self, max_attempts: u32, base_delay: Duration) -> Self {
        self.max_restart_attempts = max_attempts;
        self.restart_base_delay = base_delay;
        self
    }

    pub fn with_max_notifications(mut self, max: usize) -> Self {
        self.max_notifications = max;
        self
    }

    /// Start every engine flagged `start_on_launch`. One broken engine
    /// never blocks the rest.
    pub async fn start_configured(&self) -> Result<()> {
        let configs = self.registry.list()?;
        info!(
            "Autostart: {} engine(s) registered",
            configs.len()
        );

        for config in configs.iter().filter(|c| c.start_on_launch) {
            if let Some(required) = self.memory_requirement(&config.id).await {
                if !gpu::meets_memory_requirement(required) {
                    self.notify(
                        NotificationLevel::Warning,
                        Some(&config.id),
                        format!(
                            "Skipping autostart of {}: requires {} MiB of accelerator memory",
                            config.id,
                            required / (1024 * 1024)
                        ),
                        false,
                    );
                    continue;
                }
            }

            match self.start_one(config).await {
                Ok(true) => info!("Autostarted {}", config.id),
                Ok(false) => debug!("{} was already running", config.id),
                Err(e) => {
                    error!("Failed to autostart {}: {}", config.id, e);
                    self.notify(
                        NotificationLevel::Error,
                        Some(&config.id),
                        format!("Failed to start {}: {}", config.id, e),
                        false,
                    );
                }
            }
        }

        Ok(())
    }

    /// Launch the periodic restart sweep. Idempotent; the previous task is
    /// cancelled if one was running.
    pub fn spawn_sweep(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let interval = self.sweep_interval;

        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = manager.sweep().await {
                    warn!("Restart sweep failed: {}", e);
                }
            }
        });

        let mut slot = self.sweep_task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = slot.replace(task) {
            old.abort();
        }
    }

    /// Stop the sweep task and every supervised engine.
    pub async fn shutdown(&self) {
        if let Some(task) = self
            .sweep_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }

        for id in self.supervisor.supervised_ids() {
            if let Err(e) = self.supervisor.stop(&id).await {
                warn!("Failed to stop {} during shutdown: {}", id, e);
            }
        }
    }

    /// One pass over every auto-restart engine: restart the crashed and
    /// unreachable ones with backoff, up to the attempt budget, then park
    /// them behind a persistent notification.
    pub async fn sweep(&self) -> Result<()> {
        let configs = self.registry.list()?;

        for config in configs.iter().filter(|c| c.auto_restart) {
            let status = self.supervisor.status(&config.id);
            match status.state {
                EngineState::Crashed | EngineState::Unreachable => {}
                EngineState::Healthy => {
                    // Recovered on its own; a future failure gets a full
                    // attempt budget again
                    self.reset_restart_counter(&config.id);
                    continue;
                }
                _ => continue,
            }

            let decision = {
                let mut restarts = self.restarts.lock().unwrap_or_else(|e| e.into_inner());
                let state = restarts.entry(config.id.clone()).or_insert(RestartState {
                    attempts: 0,
                    next_attempt: Instant::now(),
                    gave_up: false,
                });

                if state.gave_up {
                    continue;
                }
                if state.attempts >= self.max_restart_attempts {
                    state.gave_up = true;
                    SweepDecision::GiveUp
                } else if Instant::now() < state.next_attempt {
                    continue;
                } else {
                    state.attempts += 1;
                    let backoff = self.restart_base_delay * 2u32.pow(state.attempts - 1);
                    state.next_attempt = Instant::now() + backoff;
                    SweepDecision::Restart(state.attempts)
                }
            };

            match decision {
                SweepDecision::GiveUp => {
                    error!(
                        "{} failed {} restart attempts, giving up",
                        config.id, self.max_restart_attempts
                    );
                    self.notify(
                        NotificationLevel::Error,
                        Some(&config.id),
                        format!(
                            "{} keeps failing and was not restarted after {} attempts; start it manually once the cause is fixed",
                            config.id, self.max_restart_attempts
                        ),
                        true,
                    );
                }
                SweepDecision::Restart(attempt) => {
                    warn!(
                        "Restarting {} ({:?}, attempt {}/{})",
                        config.id, status.state, attempt, self.max_restart_attempts
                    );
                    self.notify(
                        NotificationLevel::Warning,
                        Some(&config.id),
                        format!("{} was {:?}, restarting", config.id, status.state),
                        false,
                    );

                    // An unreachable process is still alive and must go
                    // first
                    if status.state == EngineState::Unreachable {
                        let _ = self.supervisor.stop(&config.id).await;
                    }
                    if let Err(e) = self.start_one(config).await {
                        error!("Restart of {} failed: {}", config.id, e);
                    }
                }
            }
        }

        Ok(())
    }

    /// A manual start gives the engine a fresh restart budget.
    pub fn reset_restart_counter(&self, id: &str) {
        let mut restarts = self.restarts.lock().unwrap_or_else(|e| e.into_inner());
        restarts.remove(id);
    }

    pub fn notify(
        &self,
        level: NotificationLevel,
        engine_id: Option<&str>,
        message: String,
        persistent: bool,
    ) {
        let mut log = self.notifications.lock().unwrap_or_else(|e| e.into_inner());
        log.push_back(Notification {
            level,
            engine_id: engine_id.map(|s| s.to_string()),
            message,
            timestamp: Utc::now(),
            persistent,
        });
        while log.len() > self.max_notifications {
            log.pop_front();
        }
    }

    /// Newest first.
    pub fn recent_notifications(&self, count: usize) -> Vec<Notification> {
        let log = self.notifications.lock().unwrap_or_else(|e| e.into_inner());
        log.iter().rev().take(count).cloned().collect()
    }

    /// Aggregate manifest, install, provenance, registry, and live state
    /// for every engine the system has heard of.
    pub async fn diagnostics_report(&self) -> Result<DiagnosticsReport> {
        let manifest_entries = self.manifest.list().await.unwrap_or_default();
        let configs = self.registry.list()?;

        let mut ids: Vec<String> = manifest_entries.iter().map(|e| e.id.clone()).collect();
        for config in &configs {
            if !ids.contains(&config.id) {
                ids.push(config.id.clone());
            }
        }

        let mut engines = Vec::with_capacity(ids.len());
        for id in ids {
            let entry = manifest_entries.iter().find(|e| e.id == id);
            let config = configs.iter().find(|c| c.id == id).cloned();
            let installed = self.installer.is_installed(&id);
            let install_path = installed.then(|| self.installer.install_dir(&id));

            let provenance = match &install_path {
                Some(dir) => InstallProvenance::load(dir).unwrap_or(None),
                None => None,
            };
            let degraded = installed && provenance.is_none();

            engines.push(EngineDiagnostics {
                id: id.clone(),
                manifest_name: entry.map(|e| e.name.clone()),
                manifest_version: entry.map(|e| e.version.clone()),
                installed,
                install_path,
                install_size_bytes: self.installer.install_size(&id),
                provenance,
                degraded,
                config,
                status: self.supervisor.status(&id),
            });
        }

        Ok(DiagnosticsReport {
            generated_at: Utc::now(),
            engines,
        })
    }

    async fn start_one(&self, config: &EngineConfig) -> Result<bool> {
        let probe = self.probe_for(config).await;
        self.supervisor.start(config, probe)
    }

    /// Probe built from the manifest's descriptor when the entry is known,
    /// falling back to the stored health URL.
    async fn probe_for(&self, config: &EngineConfig) -> HealthProbe {
        match self.manifest.get(&config.id).await {
            Ok(entry) => match entry.health_check {
                Some(check) => HealthProbe::from_check(&check, config.port),
                None => HealthProbe::from_config(config),
            },
            Err(_) => HealthProbe::from_config(config),
        }
    }

    async fn memory_requirement(&self, id: &str) -> Option<u64> {
        self.manifest
            .get(id)
            .await
            .ok()
            .and_then(|e| e.min_accelerator_memory)
    }
}

enum SweepDecision {
    Restart(u32),
    GiveUp,
}
