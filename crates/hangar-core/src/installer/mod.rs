//! Install orchestration: download, extract, verify, repair, remove.
//!
//! One operation per engine id at a time. The per-id lock map is owned here
//! so tests can construct isolated installers.

pub mod extract;
pub mod provenance;

use crate::cancel::CancellationToken;
use crate::config::InstallConfig;
use crate::manifest::ManifestEntry;
use crate::network::{
    DownloadOutcome, DownloadProgress, DownloadSource, Downloader, SourceCandidate,
};
use crate::platform::current_platform;
use crate::{HangarError, Result};
use chrono::Utc;
use provenance::InstallProvenance;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// Caller-supplied deviations from the manifest defaults.
#[derive(Debug, Clone, Default)]
pub struct InstallOverrides {
    /// Tried before the manifest's primary URL.
    pub custom_url: Option<String>,
    /// Tried after all network candidates.
    pub local_file: Option<PathBuf>,
    /// Overrides the manifest version recorded in provenance.
    pub version: Option<String>,
    /// Port to register the engine with instead of the manifest default.
    pub port: Option<u16>,
}

/// Read-only verification result.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VerificationReport {
    pub valid: bool,
    /// Required files absent from the install directory.
    pub missing: Vec<String>,
    /// Required files present but hashing differently than declared.
    pub mismatched: Vec<String>,
    /// Environment problems: unwritable paths, low disk space.
    pub issues: Vec<String>,
}

impl VerificationReport {
    fn broken_files(&self) -> HashSet<String> {
        self.missing
            .iter()
            .chain(self.mismatched.iter())
            .cloned()
            .collect()
    }
}

pub struct Installer {
    engines_dir: PathBuf,
    cache_dir: PathBuf,
    downloader: Downloader,
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Installer {
    pub fn new(engines_dir: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            engines_dir: engines_dir.into(),
            cache_dir: cache_dir.into(),
            downloader: Downloader::new()?,
            locks: std::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Override the downloader (tests use fast retry policies).
    pub fn with_downloader(mut self, downloader: Downloader) -> Self {
        self.downloader = downloader;
        self
    }

    pub fn install_dir(&self, id: &str) -> PathBuf {
        self.engines_dir.join(id)
    }

    pub fn is_installed(&self, id: &str) -> bool {
        self.install_dir(id).exists()
    }

    /// Total on-disk size of an install, for diagnostics. `None` when not
    /// installed.
    pub fn install_size(&self, id: &str) -> Option<u64> {
        let dir = self.install_dir(id);
        if !dir.exists() {
            return None;
        }
        let total = walkdir::WalkDir::new(&dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum();
        Some(total)
    }

    /// Acquire the per-id operation lock without waiting. A second caller
    /// for the same id gets `AlreadyInProgress` rather than queueing.
    fn try_lock(&self, id: &str) -> Result<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.try_lock_owned()
            .map_err(|_| HangarError::AlreadyInProgress { id: id.to_string() })
    }

    /// Download, extract, and verify one engine. Refuses if already
    /// installed; a prior `remove` is required before reinstalling.
    pub async fn install(
        &self,
        entry: &ManifestEntry,
        overrides: &InstallOverrides,
        token: &CancellationToken,
        progress_tx: Option<mpsc::Sender<DownloadProgress>>,
    ) -> Result<PathBuf> {
        let _guard = self.try_lock(&entry.id)?;

        let install_dir = self.install_dir(&entry.id);
        if install_dir.exists() {
            return Err(HangarError::AlreadyInstalled {
                id: entry.id.clone(),
            });
        }

        info!("Installing {} {}", entry.id, entry.version);
        self.check_disk_space(entry)?;

        let result = self
            .install_inner(entry, overrides, &install_dir, token, progress_tx)
            .await;

        if let Err(HangarError::Cancelled) = &result {
            // A cancelled install must look like it never happened
            debug!("Install of {} cancelled, cleaning up", entry.id);
            let _ = std::fs::remove_dir_all(&install_dir);
        }

        result
    }

    async fn install_inner(
        &self,
        entry: &ManifestEntry,
        overrides: &InstallOverrides,
        install_dir: &Path,
        token: &CancellationToken,
        progress_tx: Option<mpsc::Sender<DownloadProgress>>,
    ) -> Result<PathBuf> {
        let candidates = self.build_candidates(entry, overrides);
        let archive_path = self.archive_cache_path(entry);

        let outcome = self
            .downloader
            .fetch(
                &candidates,
                &entry.sha256,
                &archive_path,
                token,
                progress_tx,
            )
            .await
            .map_err(|f| self.classify_failure(&entry.id, f.error))?;

        token.check()?;

        extract::extract_archive(&archive_path, install_dir)?;
        extract::flatten_wrapping_dir(install_dir)?;

        token.check()?;

        let report = self.verify_installed_files(entry, install_dir);
        if !report.missing.is_empty() || !report.mismatched.is_empty() {
            // Leave the directory in place for diagnosis; nothing gets
            // registered until install returns Ok
            return Err(HangarError::InstallIncomplete {
                id: entry.id.clone(),
                missing: report.broken_files().into_iter().collect(),
            });
        }

        let record = self.provenance_from_outcome(entry, overrides, install_dir, &outcome);
        record.save(install_dir)?;

        info!("Installed {} at {}", entry.id, install_dir.display());
        Ok(install_dir.to_path_buf())
    }

    /// Re-verify and replace only the broken parts of an install.
    ///
    /// A valid install is a no-op apart from refreshing the provenance
    /// timestamp. A cached, checksum-valid archive is reused without any
    /// network traffic.
    pub async fn repair(
        &self,
        entry: &ManifestEntry,
        overrides: &InstallOverrides,
        token: &CancellationToken,
        progress_tx: Option<mpsc::Sender<DownloadProgress>>,
    ) -> Result<PathBuf> {
        let _guard = self.try_lock(&entry.id)?;

        let install_dir = self.install_dir(&entry.id);
        if !install_dir.exists() {
            return Err(HangarError::NotInstalled {
                id: entry.id.clone(),
            });
        }

        let report = self.verify_installed_files(entry, &install_dir);
        if report.valid {
            debug!("{} verified clean, nothing to repair", entry.id);
            if let Some(existing) = InstallProvenance::load(&install_dir)? {
                existing.touched().save(&install_dir)?;
            }
            return Ok(install_dir);
        }

        let broken = report.broken_files();
        info!(
            "Repairing {}: {} broken file(s)",
            entry.id,
            broken.len()
        );

        let (archive_path, fetched) = self
            .obtain_archive(entry, overrides, token, progress_tx)
            .await?;

        token.check()?;

        extract::extract_entries(&archive_path, &install_dir, &broken)?;

        let after = self.verify_installed_files(entry, &install_dir);
        if !after.valid {
            return Err(HangarError::InstallIncomplete {
                id: entry.id.clone(),
                missing: after.broken_files().into_iter().collect(),
            });
        }

        match (InstallProvenance::load(&install_dir)?, fetched) {
            (_, Some(outcome)) => {
                let record =
                    self.provenance_from_outcome(entry, overrides, &install_dir, &outcome);
                record.save(&install_dir)?;
            }
            (Some(existing), None) => existing.touched().save(&install_dir)?,
            (None, None) => {
                warn!("{} repaired from cache with no provenance record", entry.id)
            }
        }

        info!("Repaired {}", entry.id);
        Ok(install_dir)
    }

    /// Structured read-only check of one install. Never mutates anything.
    pub fn verify(&self, entry: &ManifestEntry) -> VerificationReport {
        let install_dir = self.install_dir(&entry.id);
        if !install_dir.exists() {
            return VerificationReport {
                valid: false,
                issues: vec![format!("{} is not installed", entry.id)],
                ..Default::default()
            };
        }

        let mut report = self.verify_installed_files(entry, &install_dir);

        if let Ok(metadata) = std::fs::metadata(&install_dir) {
            if metadata.permissions().readonly() {
                report
                    .issues
                    .push(format!("Install path {} is not writable", install_dir.display()));
            }
        }

        if let Ok(available) = fs2::available_space(&self.engines_dir) {
            let needed =
                (entry.size_estimate as f64 * InstallConfig::DISK_HEADROOM_FACTOR) as u64;
            if available < needed {
                report.issues.push(format!(
                    "Insufficient disk space for repair: {} bytes available, {} needed",
                    available, needed
                ));
            }
        }

        report.valid = report.valid && report.issues.is_empty();
        report
    }

    /// Delete the install directory and its provenance sidecar. Safe to
    /// retry; never touches the registry.
    pub fn remove(&self, id: &str) -> Result<()> {
        let install_dir = self.install_dir(id);
        if !install_dir.exists() {
            debug!("{} already removed", id);
            return Ok(());
        }

        std::fs::remove_dir_all(&install_dir)
            .map_err(|e| HangarError::io_with_path(e, &install_dir))?;
        info!("Removed install directory for {}", id);
        Ok(())
    }

    /// Candidate ordering: custom URL override, primary, mirrors for this
    /// platform, local file last.
    fn build_candidates(
        &self,
        entry: &ManifestEntry,
        overrides: &InstallOverrides,
    ) -> Vec<SourceCandidate> {
        let mut candidates = Vec::new();

        if let Some(url) = &overrides.custom_url {
            candidates.push(SourceCandidate::custom(url.clone()));
        }

        candidates.push(SourceCandidate::primary(entry.download_url.clone()));

        for mirror in entry.mirrors_for_platform(current_platform()) {
            candidates.push(SourceCandidate::mirror(mirror));
        }

        if let Some(path) = &overrides.local_file {
            candidates.push(SourceCandidate::local(path.to_string_lossy().to_string()));
        }

        candidates
    }

    /// Archive for `entry`, from the cache when its checksum still matches,
    /// otherwise freshly downloaded. Returns the outcome only when a fetch
    /// actually happened.
    async fn obtain_archive(
        &self,
        entry: &ManifestEntry,
        overrides: &InstallOverrides,
        token: &CancellationToken,
        progress_tx: Option<mpsc::Sender<DownloadProgress>>,
    ) -> Result<(PathBuf, Option<DownloadOutcome>)> {
        let archive_path = self.archive_cache_path(entry);

        if archive_path.exists() {
            match crate::hashing::sha256_file(&archive_path) {
                Ok(actual) if actual == entry.sha256 => {
                    debug!("Reusing cached archive {}", archive_path.display());
                    return Ok((archive_path, None));
                }
                _ => {
                    debug!("Cached archive is stale, re-downloading");
                    let _ = std::fs::remove_file(&archive_path);
                }
            }
        }

        let candidates = self.build_candidates(entry, overrides);
        let outcome = self
            .downloader
            .fetch(
                &candidates,
                &entry.sha256,
                &archive_path,
                token,
                progress_tx,
            )
            .await
            .map_err(|f| self.classify_failure(&entry.id, f.error))?;

        Ok((archive_path, Some(outcome)))
    }

    fn archive_cache_path(&self, entry: &ManifestEntry) -> PathBuf {
        let ext = archive_extension(&entry.download_url);
        self.cache_dir
            .join(format!("{}-{}{}", entry.id, entry.version, ext))
    }

    fn check_disk_space(&self, entry: &ManifestEntry) -> Result<()> {
        if entry.size_estimate == 0 {
            return Ok(());
        }

        std::fs::create_dir_all(&self.engines_dir)
            .map_err(|e| HangarError::io_with_path(e, &self.engines_dir))?;

        let available =
            fs2::available_space(&self.engines_dir).unwrap_or(u64::MAX);
        let needed = (entry.size_estimate as f64 * InstallConfig::DISK_HEADROOM_FACTOR) as u64;

        if available < needed {
            return Err(HangarError::InsufficientDisk {
                path: self.engines_dir.clone(),
                needed,
                available,
            });
        }
        Ok(())
    }

    fn verify_installed_files(
        &self,
        entry: &ManifestEntry,
        install_dir: &Path,
    ) -> VerificationReport {
        let mut report = VerificationReport {
            valid: true,
            ..Default::default()
        };

        let mut required: Vec<(&str, Option<&str>)> = entry
            .required_files
            .iter()
            .map(|f| (f.path.as_str(), f.sha256.as_deref()))
            .collect();
        if !entry
            .required_files
            .iter()
            .any(|f| f.path == entry.entrypoint)
        {
            required.push((entry.entrypoint.as_str(), None));
        }

        for (relative, expected) in required {
            let path = install_dir.join(relative);
            if !path.exists() {
                report.missing.push(relative.to_string());
                continue;
            }
            if let Some(expected) = expected {
                match crate::hashing::sha256_file(&path) {
                    Ok(actual) if actual == expected => {}
                    Ok(_) => report.mismatched.push(relative.to_string()),
                    Err(e) => report
                        .issues
                        .push(format!("Failed to hash {}: {}", relative, e)),
                }
            }
        }

        report.valid =
            report.missing.is_empty() && report.mismatched.is_empty() && report.issues.is_empty();
        report
    }

    fn provenance_from_outcome(
        &self,
        entry: &ManifestEntry,
        overrides: &InstallOverrides,
        install_dir: &Path,
        outcome: &DownloadOutcome,
    ) -> InstallProvenance {
        InstallProvenance {
            engine_id: entry.id.clone(),
            version: overrides
                .version
                .clone()
                .unwrap_or_else(|| entry.version.clone()),
            installed_at: Utc::now(),
            install_path: install_dir.to_path_buf(),
            source: outcome.source,
            origin: outcome.origin.clone(),
            sha256: outcome.sha256.clone(),
        }
    }

    /// Fill in the engine id on terminal download classifications that
    /// carry one.
    fn classify_failure(&self, id: &str, error: HangarError) -> HangarError {
        match error {
            HangarError::AllCandidatesFailed { summary, .. } => {
                HangarError::AllCandidatesFailed {
                    id: id.to_string(),
                    summary,
                }
            }
            other => other,
        }
    }
}

fn archive_extension(url: &str) -> &'static str {
    let lower = url.to_lowercase();
    if lower.ends_with(".zip") {
        ".zip"
    } else if lower.ends_with(".tgz") {
        ".tgz"
    } else if lower.ends_with(".tar.zst") {
        ".tar.zst"
    } else {
        ".tar.gz"
    }
}

/// `DownloadSource` doubles as the provenance source kind.
pub type InstallSource = DownloadSource;
