//! Child-process supervision: spawn, watch, probe, stop.
//!
//! Each started engine gets a background monitor task that owns the child
//! handle, watches for exit, and drives the health probe loop. Status
//! queries read a shared snapshot and never probe or block.

pub mod health;
pub mod logs;

use crate::config::SupervisorConfig;
use crate::platform;
use crate::registry::EngineConfig;
use crate::{HangarError, Result};
use health::HealthProbe;
use logs::RotatingLog;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Engine lifecycle states.
///
/// `Unreachable` means the process is alive but the health probe has not
/// succeeded within the allotted attempts; it is distinct from `Crashed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    Healthy,
    Unreachable,
    Crashed,
}

impl EngineState {
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            EngineState::Starting
                | EngineState::Running
                | EngineState::Healthy
                | EngineState::Unreachable
        )
    }
}

/// Runtime snapshot for one engine. Recomputed by the monitor task; never
/// persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessStatus {
    pub state: EngineState,
    pub pid: Option<u32>,
    pub healthy: bool,
    pub last_error: Option<String>,
    pub log_path: Option<PathBuf>,
}

impl Default for ProcessStatus {
    fn default() -> Self {
        Self {
            state: EngineState::Stopped,
            pid: None,
            healthy: false,
            last_error: None,
            log_path: None,
        }
    }
}

struct EngineHandle {
    pid: u32,
    status: Arc<Mutex<ProcessStatus>>,
    stop_requested: Arc<AtomicBool>,
    #[allow(dead_code)]
    monitor: JoinHandle<()>,
}

pub struct ProcessSupervisor {
    logs_dir: PathBuf,
    client: reqwest::Client,
    poll_interval: Duration,
    startup_attempts: u32,
    stop_grace_ms: u64,
    engines: Mutex<HashMap<String, EngineHandle>>,
}

impl ProcessSupervisor {
    pub fn new(logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            logs_dir: logs_dir.into(),
            client: reqwest::Client::new(),
            poll_interval: SupervisorConfig::HEALTH_POLL_INTERVAL,
            startup_attempts: SupervisorConfig::STARTUP_PROBE_ATTEMPTS,
            stop_grace_ms: SupervisorConfig::STOP_GRACE_TIMEOUT_MS,
            engines: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_startup_attempts(mut self, attempts: u32) -> Self {
        self.startup_attempts = attempts;
        self
    }

    pub fn with_stop_grace_ms(mut self, ms: u64) -> Self {
        self.stop_grace_ms = ms;
        self
    }

    /// Spawn an engine and begin supervising it.
    ///
    /// Returns `Ok(false)` if it is already running. The returned `true`
    /// means the process was spawned, not that it is healthy yet.
    pub fn start(&self, config: &EngineConfig, probe: HealthProbe) -> Result<bool> {
        {
            let engines = self.engines.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(handle) = engines.get(&config.id) {
                let status = handle.status.lock().unwrap_or_else(|e| e.into_inner());
                if status.state.is_running() {
                    debug!("{} is already running (pid {})", config.id, handle.pid);
                    return Ok(false);
                }
            }
        }

        let args = render_args(&config.args, config.port, &config.install_path);
        info!(
            "Starting {}: {} {}",
            config.id,
            config.executable.display(),
            args.join(" ")
        );

        let log = RotatingLog::new(&self.logs_dir, &config.id);
        let log_file = log.open()?;
        let stderr_file = log_file
            .try_clone()
            .map_err(|e| HangarError::io_with_path(e, log.path()))?;

        let mut child = tokio::process::Command::new(&config.executable)
            .args(&args)
            .current_dir(&config.install_path)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(stderr_file))
            .spawn()
            .map_err(|e| HangarError::SpawnFailed {
                id: config.id.clone(),
                message: format!("{}: {}", config.executable.display(), e),
            })?;

        let pid = child.id().ok_or_else(|| HangarError::SpawnFailed {
            id: config.id.clone(),
            message: "Process exited before a pid could be observed".into(),
        })?;

        let status = Arc::new(Mutex::new(ProcessStatus {
            state: EngineState::Starting,
            pid: Some(pid),
            healthy: false,
            last_error: None,
            log_path: Some(log.path().to_path_buf()),
        }));
        let stop_requested = Arc::new(AtomicBool::new(false));

        let monitor = {
            let id = config.id.clone();
            let status = status.clone();
            let stop_requested = stop_requested.clone();
            let client = self.client.clone();
            let poll_interval = self.poll_interval;
            let startup_attempts = self.startup_attempts;

            tokio::spawn(async move {
                monitor_engine(
                    id,
                    &mut child,
                    probe,
                    client,
                    status,
                    stop_requested,
                    poll_interval,
                    startup_attempts,
                )
                .await;
            })
        };

        let mut engines = self.engines.lock().unwrap_or_else(|e| e.into_inner());
        engines.insert(
            config.id.clone(),
            EngineHandle {
                pid,
                status,
                stop_requested,
                monitor,
            },
        );

        Ok(true)
    }

    /// Graceful stop with forced-kill escalation. Always ends `Stopped`;
    /// returns `Ok(false)` if nothing was running.
    pub async fn stop(&self, id: &str) -> Result<bool> {
        let (pid, status, stop_requested) = {
            let engines = self.engines.lock().unwrap_or_else(|e| e.into_inner());
            match engines.get(id) {
                Some(handle) => {
                    let running = handle
                        .status
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .state
                        .is_running();
                    if !running {
                        return Ok(false);
                    }
                    (
                        handle.pid,
                        handle.status.clone(),
                        handle.stop_requested.clone(),
                    )
                }
                None => return Ok(false),
            }
        };

        info!("Stopping {} (pid {})", id, pid);
        stop_requested.store(true, Ordering::SeqCst);

        let grace = self.stop_grace_ms;
        let terminated =
            tokio::task::spawn_blocking(move || platform::terminate_process(pid, grace))
                .await
                .map_err(|e| HangarError::Other(format!("Stop task panicked: {}", e)))??;

        if !terminated {
            warn!("Process {} for {} survived forced termination", pid, id);
        }

        let mut st = status.lock().unwrap_or_else(|e| e.into_inner());
        st.state = EngineState::Stopped;
        st.healthy = false;
        st.pid = None;

        Ok(true)
    }

    /// Snapshot read. Cheap, lock-scoped, never probes.
    pub fn status(&self, id: &str) -> ProcessStatus {
        let engines = self.engines.lock().unwrap_or_else(|e| e.into_inner());
        engines
            .get(id)
            .map(|h| h.status.lock().unwrap_or_else(|e| e.into_inner()).clone())
            .unwrap_or_default()
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.status(id).state.is_running()
    }

    /// Ids of every engine with a live monitor entry.
    pub fn supervised_ids(&self) -> Vec<String> {
        let engines = self.engines.lock().unwrap_or_else(|e| e.into_inner());
        engines.keys().cloned().collect()
    }
}

/// Substitute `{port}` and `{install_dir}` into the argument template.
pub fn render_args(template: &[String], port: u16, install_dir: &Path) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            arg.replace("{port}", &port.to_string())
                .replace("{install_dir}", &install_dir.to_string_lossy())
        })
        .collect()
}

#[allow(clippy::too_many_arguments)]
async fn monitor_engine(
    id: String,
    child: &mut tokio::process::Child,
    probe: HealthProbe,
    client: reqwest::Client,
    status: Arc<Mutex<ProcessStatus>>,
    stop_requested: Arc<AtomicBool>,
    poll_interval: Duration,
    startup_attempts: u32,
) {
    let mut failed_probes: u32 = 0;

    loop {
        tokio::select! {
            exit = child.wait() => {
                let mut st = status.lock().unwrap_or_else(|e| e.into_inner());
                st.healthy = false;
                st.pid = None;

                if stop_requested.load(Ordering::SeqCst) {
                    debug!("{} exited after stop request", id);
                    st.state = EngineState::Stopped;
                } else {
                    let reason = match exit {
                        Ok(exit_status) => match exit_status.code() {
                            Some(code) => format!("Exited unexpectedly with code {}", code),
                            None => "Terminated by signal".to_string(),
                        },
                        Err(e) => format!("Lost track of process: {}", e),
                    };
                    warn!("{}: {}", id, reason);
                    st.state = EngineState::Crashed;
                    st.last_error = Some(reason);
                }
                return;
            }
            _ = tokio::time::sleep(poll_interval) => {
                let ok = probe.probe(&client).await;
                let mut st = status.lock().unwrap_or_else(|e| e.into_inner());

                if ok {
                    if st.state != EngineState::Healthy {
                        info!("{} is healthy", id);
                    }
                    st.state = EngineState::Healthy;
                    st.healthy = true;
                    failed_probes = 0;
                } else {
                    st.healthy = false;
                    match st.state {
                        EngineState::Starting => {
                            // Alive but not yet answering
                            st.state = EngineState::Running;
                            failed_probes = 1;
                        }
                        EngineState::Running => {
                            failed_probes += 1;
                            if failed_probes >= startup_attempts {
                                warn!(
                                    "{} did not become healthy after {} probes",
                                    id, failed_probes
                                );
                                st.state = EngineState::Unreachable;
                            }
                        }
                        EngineState::Healthy => {
                            // Was serving, now silent: restart the bounded
                            // probe window before declaring it unreachable
                            st.state = EngineState::Running;
                            failed_probes = 1;
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}
