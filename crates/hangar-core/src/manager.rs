//! The external face of the subsystem: one handle wiring together the
//! manifest loader, installer, registry, supervisor, lifecycle manager,
//! and the optional detector.

use crate::cancel::CancellationToken;
use crate::config::PathsConfig;
use crate::detector::{DetectionOutcome, EngineDetector};
use crate::installer::provenance::InstallProvenance;
use crate::installer::{InstallOverrides, Installer, VerificationReport};
use crate::lifecycle::{DiagnosticsReport, LifecycleManager, Notification};
use crate::manifest::{ManifestEntry, ManifestLoader, ManifestSource};
use crate::network::DownloadProgress;
use crate::registry::{EngineConfig, EngineRegistry};
use crate::supervisor::health::HealthProbe;
use crate::supervisor::{ProcessStatus, ProcessSupervisor};
use crate::system::gpu;
use crate::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub struct EngineManager {
    manifest: Arc<ManifestLoader>,
    installer: Arc<Installer>,
    registry: Arc<EngineRegistry>,
    supervisor: Arc<ProcessSupervisor>,
    lifecycle: Arc<LifecycleManager>,
    detector: Option<Arc<dyn EngineDetector>>,
}

impl EngineManager {
    /// Build the whole subsystem rooted at `data_dir`:
    ///
    /// ```text
    /// data_dir/
    ///   engines/<id>/      extracted installs + provenance sidecars
    ///   cache/downloads/   archive cache (.part resume files live here)
    ///   logs/<id>.log      rotating per-engine logs
    ///   registry.db        engine configuration
    /// ```
    pub fn new(data_dir: impl Into<PathBuf>, source: Box<dyn ManifestSource>) -> Result<Self> {
        let data_dir = data_dir.into();
        let engines_dir = data_dir.join(PathsConfig::ENGINES_DIR_NAME);
        let cache_dir = data_dir
            .join(PathsConfig::CACHE_DIR_NAME)
            .join(PathsConfig::DOWNLOADS_DIR_NAME);
        let logs_dir = data_dir.join(PathsConfig::LOGS_DIR_NAME);

        let manifest = Arc::new(ManifestLoader::new(source));
        let installer = Arc::new(Installer::new(engines_dir, cache_dir)?);
        let registry = Arc::new(EngineRegistry::open(
            data_dir.join(PathsConfig::REGISTRY_DB_NAME),
        )?);
        let supervisor = Arc::new(ProcessSupervisor::new(logs_dir));
        let lifecycle = Arc::new(LifecycleManager::new(
            registry.clone(),
            supervisor.clone(),
            installer.clone(),
            manifest.clone(),
        ));

        Ok(Self {
            manifest,
            installer,
            registry,
            supervisor,
            lifecycle,
            detector: None,
        })
    }

    pub fn with_detector(mut self, detector: Arc<dyn EngineDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    /// Assemble from pre-built parts; tests use this to tighten timings.
    pub fn from_parts(
        manifest: Arc<ManifestLoader>,
        installer: Arc<Installer>,
        registry: Arc<EngineRegistry>,
        supervisor: Arc<ProcessSupervisor>,
        lifecycle: Arc<LifecycleManager>,
    ) -> Self {
        Self {
            manifest,
            installer,
            registry,
            supervisor,
            lifecycle,
            detector: None,
        }
    }

    /// Autostart configured engines and begin the restart sweep.
    pub async fn startup(self: &Arc<Self>) -> Result<()> {
        self.lifecycle.start_configured().await?;
        self.lifecycle.spawn_sweep();
        Ok(())
    }

    /// Stop the sweep and every running engine.
    pub async fn shutdown(&self) {
        self.lifecycle.shutdown().await;
    }

    pub async fn list_manifest_entries(&self) -> Result<Vec<ManifestEntry>> {
        self.manifest.list().await
    }

    pub async fn reload_manifest(&self) -> Result<()> {
        self.manifest.reload().await
    }

    /// Install an engine and register it. Registration happens only after
    /// the install fully succeeds.
    pub async fn install_engine(
        &self,
        id: &str,
        overrides: InstallOverrides,
        token: &CancellationToken,
        progress_tx: Option<mpsc::Sender<DownloadProgress>>,
    ) -> Result<PathBuf> {
        let entry = self.manifest.get(id).await?;

        if let Some(required) = entry.min_accelerator_memory {
            if !gpu::meets_memory_requirement(required) {
                // Installing is still allowed; only autostart is gated
                warn!(
                    "{} wants {} MiB of accelerator memory; installing anyway",
                    id,
                    required / (1024 * 1024)
                );
            }
        }

        let install_path = self
            .installer
            .install(&entry, &overrides, token, progress_tx)
            .await?;

        let port = overrides.port.unwrap_or(entry.default_port);
        let config = EngineConfig {
            id: entry.id.clone(),
            version: overrides
                .version
                .clone()
                .unwrap_or_else(|| entry.version.clone()),
            install_path: install_path.clone(),
            executable: install_path.join(&entry.entrypoint),
            args: entry.args.clone(),
            port,
            health_url: entry.health_check.as_ref().map(|hc| hc.url(port)),
            start_on_launch: false,
            auto_restart: true,
        };
        self.registry.register(&config)?;

        info!("{} installed and registered", id);
        Ok(install_path)
    }

    pub async fn verify_engine(&self, id: &str) -> Result<VerificationReport> {
        let entry = self.manifest.get(id).await?;
        Ok(self.installer.verify(&entry))
    }

    pub async fn repair_engine(
        &self,
        id: &str,
        token: &CancellationToken,
        progress_tx: Option<mpsc::Sender<DownloadProgress>>,
    ) -> Result<PathBuf> {
        let entry = self.manifest.get(id).await?;
        self.installer
            .repair(&entry, &InstallOverrides::default(), token, progress_tx)
            .await
    }

    /// Stop, unregister, then delete files. File removal is retry-safe on
    /// its own, so a failure here can simply be retried.
    pub async fn remove_engine(&self, id: &str) -> Result<()> {
        let _ = self.supervisor.stop(id).await?;
        self.registry.unregister(id)?;
        self.installer.remove(id)?;
        info!("{} removed", id);
        Ok(())
    }

    /// Returns `true` if the process was spawned, `false` if it was already
    /// running.
    pub async fn start_engine(&self, id: &str, token: &CancellationToken) -> Result<bool> {
        token.check()?;

        let config = self
            .registry
            .get(id)?
            .ok_or_else(|| crate::HangarError::EngineNotFound { id: id.to_string() })?;

        // Explicit starts are never gated on accelerator memory, just warned
        if let Ok(entry) = self.manifest.get(id).await {
            if let Some(required) = entry.min_accelerator_memory {
                if !gpu::meets_memory_requirement(required) {
                    warn!(
                        "Starting {} below its accelerator memory requirement",
                        id
                    );
                }
            }
        }

        self.lifecycle.reset_restart_counter(id);
        let probe = self.probe_for(&config).await;
        self.supervisor.start(&config, probe)
    }

    pub async fn stop_engine(&self, id: &str) -> Result<bool> {
        self.supervisor.stop(id).await
    }

    /// Cheap snapshot; never probes.
    pub fn engine_status(&self, id: &str) -> ProcessStatus {
        self.supervisor.status(id)
    }

    pub fn provenance(&self, id: &str) -> Result<Option<InstallProvenance>> {
        if !self.installer.is_installed(id) {
            return Ok(None);
        }
        InstallProvenance::load(&self.installer.install_dir(id))
    }

    pub async fn diagnostics_report(&self) -> Result<DiagnosticsReport> {
        self.lifecycle.diagnostics_report().await
    }

    pub fn recent_notifications(&self, count: usize) -> Vec<Notification> {
        self.lifecycle.recent_notifications(count)
    }

    /// Probe for an engine already present outside this subsystem.
    /// `Unsupported` when no detector capability is configured.
    pub async fn detect_engine(&self, id: &str) -> Result<DetectionOutcome> {
        let entry = self.manifest.get(id).await?;
        match &self.detector {
            Some(detector) => Ok(detector.detect(&entry).await),
            None => Ok(DetectionOutcome::Unsupported),
        }
    }

    /// Reassign the engine's port, refreshing the derived health URL.
    pub async fn set_engine_port(&self, id: &str, port: u16) -> Result<EngineConfig> {
        let health_url = match self.manifest.get(id).await {
            Ok(entry) => entry.health_check.as_ref().map(|hc| hc.url(port)),
            Err(_) => None,
        };
        self.registry.update(id, move |config| {
            let mut updated = config.with_port(port);
            if health_url.is_some() {
                updated.health_url = health_url;
            }
            updated
        })
    }

    pub fn set_engine_flags(
        &self,
        id: &str,
        start_on_launch: bool,
        auto_restart: bool,
    ) -> Result<EngineConfig> {
        self.registry
            .update(id, |config| config.with_flags(start_on_launch, auto_restart))
    }

    async fn probe_for(&self, config: &EngineConfig) -> HealthProbe {
        match self.manifest.get(&config.id).await {
            Ok(entry) => match entry.health_check {
                Some(check) => HealthProbe::from_check(&check, config.port),
                None => HealthProbe::from_config(config),
            },
            Err(_) => HealthProbe::from_config(config),
        }
    }
}
