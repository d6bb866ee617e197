//! Rotating per-engine log files.
//!
//! The child's stdout/stderr are redirected straight into the current log
//! file. Rotation happens at spawn time: if the file has grown past the
//! size cap, it is shifted into numbered backups and a fresh file is
//! started, keeping a bounded number of old logs.

use crate::config::AppConfig;
use crate::{HangarError, Result};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct RotatingLog {
    path: PathBuf,
    max_bytes: u64,
    backup_count: u32,
}

impl RotatingLog {
    pub fn new(logs_dir: &Path, engine_id: &str) -> Self {
        Self {
            path: logs_dir.join(format!("{}.log", engine_id)),
            max_bytes: AppConfig::LOG_FILE_MAX_BYTES,
            backup_count: AppConfig::LOG_FILE_BACKUP_COUNT,
        }
    }

    pub fn with_limits(mut self, max_bytes: u64, backup_count: u32) -> Self {
        self.max_bytes = max_bytes;
        self.backup_count = backup_count;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rotate if the current file is over the cap, then open for append.
    pub fn open(&self) -> Result<File> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| HangarError::io_with_path(e, parent))?;
        }

        let current_size = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        if current_size >= self.max_bytes {
            self.rotate()?;
        }

        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| HangarError::io_with_path(e, &self.path))
    }

    /// Shift `engine.log` → `engine.log.1` → … → `engine.log.N`, dropping
    /// the oldest.
    fn rotate(&self) -> Result<()> {
        debug!("Rotating log {}", self.path.display());

        let backup = |n: u32| PathBuf::from(format!("{}.{}", self.path.display(), n));

        let oldest = backup(self.backup_count);
        if oldest.exists() {
            std::fs::remove_file(&oldest).map_err(|e| HangarError::io_with_path(e, &oldest))?;
        }

        for n in (1..self.backup_count).rev() {
            let from = backup(n);
            if from.exists() {
                let to = backup(n + 1);
                std::fs::rename(&from, &to).map_err(|e| HangarError::io_with_path(e, &to))?;
            }
        }

        if self.path.exists() && self.backup_count > 0 {
            let to = backup(1);
            std::fs::rename(&self.path, &to)
                .map_err(|e| HangarError::io_with_path(e, &to))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_file() {
        let temp_dir = TempDir::new().unwrap();
        let log = RotatingLog::new(temp_dir.path(), "ollama");
        log.open().unwrap();
        assert!(temp_dir.path().join("ollama.log").exists());
    }

    #[test]
    fn test_rotation_under_cap_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        let log = RotatingLog::new(temp_dir.path(), "ollama").with_limits(1024, 3);

        std::fs::write(log.path(), b"small").unwrap();
        log.open().unwrap();

        assert!(!temp_dir.path().join("ollama.log.1").exists());
        assert_eq!(std::fs::read(log.path()).unwrap(), b"small");
    }

    #[test]
    fn test_rotation_caps_backup_count() {
        let temp_dir = TempDir::new().unwrap();
        let log = RotatingLog::new(temp_dir.path(), "ollama").with_limits(4, 2);

        for generation in 0..5u8 {
            std::fs::write(log.path(), format!("gen{}xx", generation)).unwrap();
            log.open().unwrap();
        }

        assert!(temp_dir.path().join("ollama.log.1").exists());
        assert!(temp_dir.path().join("ollama.log.2").exists());
        assert!(!temp_dir.path().join("ollama.log.3").exists());

        // Newest backup holds the most recent rotated content
        let newest = std::fs::read_to_string(temp_dir.path().join("ollama.log.1")).unwrap();
        assert_eq!(newest, "gen4xx");
    }
}
