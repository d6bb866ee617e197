//! Centralized configuration constants.
//!
//! Groups timeouts, retry counts, and path names for the installer, network
//! layer, supervisor, and lifecycle manager.

use std::time::Duration;

/// Application-level configuration.
pub struct AppConfig;

impl AppConfig {
    pub const APP_NAME: &'static str = "Hangar";
    pub const USER_AGENT: &'static str = "hangar-core/0.3";
    pub const LOG_FILE_MAX_BYTES: u64 = 10_485_760; // 10MB
    pub const LOG_FILE_BACKUP_COUNT: u32 = 3;
}

/// Network-related configuration.
pub struct NetworkConfig;

impl NetworkConfig {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
    pub const MANIFEST_TIMEOUT: Duration = Duration::from_secs(30);
    pub const MAX_RETRIES_PER_CANDIDATE: u32 = 3;
    pub const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
    pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(60);
    pub const DOWNLOAD_PROGRESS_INTERVAL: Duration = Duration::from_millis(500);
    pub const DOWNLOAD_TEMP_SUFFIX: &'static str = ".part";
}

/// Configuration for the install/repair/verify pipeline.
pub struct InstallConfig;

impl InstallConfig {
    /// Headroom multiplier applied to the manifest size estimate when
    /// checking free disk space before extraction.
    pub const DISK_HEADROOM_FACTOR: f64 = 1.5;
    pub const HASH_CHUNK_SIZE: usize = 8 * 1024 * 1024;
}

/// Process supervisor timing.
pub struct SupervisorConfig;

impl SupervisorConfig {
    pub const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(1000);
    pub const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
    /// Probe attempts before a Starting engine is declared Unreachable.
    pub const STARTUP_PROBE_ATTEMPTS: u32 = 60;
    pub const STOP_GRACE_TIMEOUT_MS: u64 = 5000;
}

/// Lifecycle manager timing and restart policy.
pub struct LifecycleConfig;

impl LifecycleConfig {
    pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);
    pub const MAX_RESTART_ATTEMPTS: u32 = 3;
    pub const RESTART_BASE_DELAY: Duration = Duration::from_secs(2);
    pub const MAX_NOTIFICATIONS: usize = 100;
}

/// Directory and file name layout under the hangar root.
pub struct PathsConfig;

impl PathsConfig {
    pub const ENGINES_DIR_NAME: &'static str = "engines";
    pub const CACHE_DIR_NAME: &'static str = "cache";
    pub const DOWNLOADS_DIR_NAME: &'static str = "downloads";
    pub const LOGS_DIR_NAME: &'static str = "logs";
    pub const REGISTRY_DB_NAME: &'static str = "registry.db";
    pub const PROVENANCE_FILE_NAME: &'static str = "provenance.json";

    /// Per-user default root (`~/.local/share/hangar` on Linux), falling
    /// back to the working directory when the platform dirs are unknown.
    pub fn default_data_dir() -> std::path::PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("."))
            .join("hangar")
    }
}
