//! Hangar Core - Engine acquisition and supervision for external binaries.
//!
//! Manages optional, independently-versioned engine binaries (local
//! inference servers, media tools) that a host application depends on but
//! does not bundle: a manifest-driven installer with mirror fallback,
//! checksum verification, local-file import, and repair/provenance
//! tracking, plus a process supervisor that starts, health-checks,
//! restarts, and tears down the installed binaries.
//!
//! # Example
//!
//! ```rust,ignore
//! use hangar_core::{CancellationToken, EngineManager, InstallOverrides};
//! use hangar_core::manifest::HttpManifestSource;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> hangar_core::Result<()> {
//!     let source = HttpManifestSource::new("https://example.com/engines.json")?;
//!     let manager = Arc::new(EngineManager::new("/path/to/hangar", Box::new(source))?);
//!
//!     manager.install_engine(
//!         "ollama",
//!         InstallOverrides::default(),
//!         &CancellationToken::new(),
//!         None,
//!     )
//!     .await?;
//!
//!     manager.start_engine("ollama", &CancellationToken::new()).await?;
//!     println!("{:?}", manager.engine_status("ollama"));
//!
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod detector;
pub mod error;
pub mod hashing;
pub mod installer;
pub mod lifecycle;
pub mod manifest;
pub mod network;
pub mod platform;
pub mod registry;
pub mod storage;
pub mod supervisor;
pub mod system;

mod manager;

// Re-export commonly used types
pub use cancel::CancellationToken;
pub use detector::{DetectionOutcome, EngineDetector, SystemDetector};
pub use error::{HangarError, Result};
pub use installer::provenance::InstallProvenance;
pub use installer::{InstallOverrides, Installer, VerificationReport};
pub use lifecycle::{
    DiagnosticsReport, EngineDiagnostics, LifecycleManager, Notification, NotificationLevel,
};
pub use manager::EngineManager;
pub use manifest::{HealthCheck, ManifestEntry, ManifestLoader, ManifestSource};
pub use network::{DownloadProgress, DownloadSource, Downloader, SourceCandidate};
pub use registry::{EngineConfig, EngineRegistry};
pub use supervisor::{EngineState, ProcessStatus, ProcessSupervisor};
