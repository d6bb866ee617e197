//! Detection of engines that already exist outside this subsystem's
//! control, so a user with a system-wide Ollama is not pushed into a
//! redundant install.
//!
//! Detection is an optional capability. Callers hold an
//! `Option<Arc<dyn EngineDetector>>` and must treat
//! [`DetectionOutcome::Unsupported`] as a first-class answer.

use crate::manifest::ManifestEntry;
use crate::platform::find_processes_by_cmdline;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// What a detection pass concluded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectionOutcome {
    /// An external instance was found.
    Found(ExternalEngine),
    /// Probing ran and found nothing.
    NotFound,
    /// This platform or build cannot probe for this engine.
    Unsupported,
}

/// Evidence of an engine running or installed outside our tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalEngine {
    pub engine_id: String,
    /// How it was spotted.
    pub evidence: DetectionEvidence,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectionEvidence {
    /// Executable resolved on PATH.
    OnPath { path: String },
    /// Something is listening on the engine's default port.
    PortOccupied { port: u16 },
    /// A process with a matching command line is running.
    ProcessRunning { pid: u32, cmdline: String },
}

#[async_trait]
pub trait EngineDetector: Send + Sync {
    async fn detect(&self, entry: &ManifestEntry) -> DetectionOutcome;
}

/// Best-effort detector probing PATH, the default port, and the process
/// table.
pub struct SystemDetector {
    connect_timeout: Duration,
}

impl SystemDetector {
    pub fn new() -> Self {
        Self {
            connect_timeout: Duration::from_millis(500),
        }
    }
}

impl Default for SystemDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EngineDetector for SystemDetector {
    async fn detect(&self, entry: &ManifestEntry) -> DetectionOutcome {
        if !cfg!(any(unix, windows)) {
            return DetectionOutcome::Unsupported;
        }

        // Executable name, without any directory part, for PATH and
        // process-table scans
        let exe_name = std::path::Path::new(&entry.entrypoint)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| entry.entrypoint.clone());

        if let Some(path) = find_on_path(&exe_name) {
            debug!("Found {} on PATH at {}", entry.id, path);
            return DetectionOutcome::Found(ExternalEngine {
                engine_id: entry.id.clone(),
                evidence: DetectionEvidence::OnPath { path },
            });
        }

        let matches = {
            let exe_name = exe_name.clone();
            tokio::task::spawn_blocking(move || find_processes_by_cmdline(&exe_name))
                .await
                .unwrap_or_default()
        };
        if let Some((pid, cmdline)) = matches.into_iter().next() {
            debug!("Found {} process {} ({})", entry.id, pid, cmdline);
            return DetectionOutcome::Found(ExternalEngine {
                engine_id: entry.id.clone(),
                evidence: DetectionEvidence::ProcessRunning { pid, cmdline },
            });
        }

        let addr = format!("127.0.0.1:{}", entry.default_port);
        if let Ok(Ok(_)) = tokio::time::timeout(
            self.connect_timeout,
            tokio::net::TcpStream::connect(&addr),
        )
        .await
        {
            debug!("Port {} for {} is occupied", entry.default_port, entry.id);
            return DetectionOutcome::Found(ExternalEngine {
                engine_id: entry.id.clone(),
                evidence: DetectionEvidence::PortOccupied {
                    port: entry.default_port,
                },
            });
        }

        DetectionOutcome::NotFound
    }
}

/// Resolve an executable name against PATH.
fn find_on_path(name: &str) -> Option<String> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate.to_string_lossy().to_string());
        }
        #[cfg(windows)]
        {
            let with_exe = dir.join(format!("{}.exe", name));
            if with_exe.is_file() {
                return Some(with_exe.to_string_lossy().to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_with(entrypoint: &str, port: u16) -> ManifestEntry {
        serde_json::from_value(serde_json::json!({
            "id": "probe-target",
            "name": "Probe Target",
            "version": "1",
            "download_url": "https://example.com/x.tar.gz",
            "sha256": "h",
            "default_port": port,
            "entrypoint": entrypoint,
        }))
        .unwrap()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_detects_executable_on_path() {
        // `sh` is on PATH everywhere we run tests
        let entry = entry_with("bin/sh", 1);

        let outcome = SystemDetector::new().detect(&entry).await;
        match outcome {
            DetectionOutcome::Found(found) => {
                assert!(matches!(found.evidence, DetectionEvidence::OnPath { .. }));
            }
            other => panic!("Expected OnPath detection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_detects_occupied_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let entry = entry_with("bin/no-such-binary-xyz", port);
        let outcome = SystemDetector::new().detect(&entry).await;
        match outcome {
            DetectionOutcome::Found(found) => {
                assert_eq!(
                    found.evidence,
                    DetectionEvidence::PortOccupied { port }
                );
            }
            other => panic!("Expected PortOccupied detection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_nothing_found() {
        // Closed port and a binary name that exists nowhere
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let entry = entry_with("bin/no-such-binary-xyz", port);
        assert_eq!(
            SystemDetector::new().detect(&entry).await,
            DetectionOutcome::NotFound
        );
    }

    #[test]
    fn test_find_on_path_missing() {
        assert!(find_on_path("definitely-not-a-real-binary-name").is_none());
    }
}
