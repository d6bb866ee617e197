//! Install provenance: how an installed engine got onto disk.
//!
//! Written as a `provenance.json` sidecar inside the install directory on
//! every successful install or repair. Its absence on an otherwise valid
//! install is tolerated but reported as degraded in diagnostics.

use crate::config::PathsConfig;
use crate::network::DownloadSource;
use crate::storage::{read_json, write_json_atomic};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstallProvenance {
    pub engine_id: String,
    pub version: String,
    pub installed_at: DateTime<Utc>,
    pub install_path: PathBuf,
    pub source: DownloadSource,
    /// Exact URL or local path the artifact came from.
    pub origin: String,
    /// Verified SHA-256 of the downloaded archive.
    pub sha256: String,
}

impl InstallProvenance {
    pub fn sidecar_path(install_dir: &Path) -> PathBuf {
        install_dir.join(PathsConfig::PROVENANCE_FILE_NAME)
    }

    /// Load the sidecar from an install directory, if present.
    pub fn load(install_dir: &Path) -> Result<Option<Self>> {
        read_json(&Self::sidecar_path(install_dir))
    }

    /// Write the sidecar atomically into the install directory.
    pub fn save(&self, install_dir: &Path) -> Result<()> {
        write_json_atomic(&Self::sidecar_path(install_dir), self)
    }

    /// Same record with a fresh timestamp; repair of a valid install only
    /// refreshes this.
    pub fn touched(&self) -> Self {
        Self {
            installed_at: Utc::now(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample(dir: &Path) -> InstallProvenance {
        InstallProvenance {
            engine_id: "comfyui".into(),
            version: "0.3.0".into(),
            installed_at: Utc::now(),
            install_path: dir.to_path_buf(),
            source: DownloadSource::Mirror,
            origin: "https://mirror.example.com/comfyui.tar.gz".into(),
            sha256: "deadbeef".into(),
        }
    }

    #[test]
    fn test_save_load_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let record = sample(temp_dir.path());

        record.save(temp_dir.path()).unwrap();
        let loaded = InstallProvenance::load(temp_dir.path()).unwrap().unwrap();
        assert_eq!(loaded, record);
    }

    #[test]
    fn test_missing_sidecar_is_none() {
        let temp_dir = TempDir::new().unwrap();
        assert!(InstallProvenance::load(temp_dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_touched_changes_only_timestamp() {
        let temp_dir = TempDir::new().unwrap();
        let record = sample(temp_dir.path());
        let touched = record.touched();

        assert!(touched.installed_at >= record.installed_at);
        assert_eq!(touched.engine_id, record.engine_id);
        assert_eq!(touched.sha256, record.sha256);
        assert_eq!(touched.origin, record.origin);
    }
}
