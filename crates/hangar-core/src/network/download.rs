//! Multi-candidate downloader with mirror fallback, resume, and checksum
//! verification.
//!
//! Candidates are tried strictly in order. Transient failures are retried on
//! the same candidate with backoff; a 404 or a checksum mismatch advances to
//! the next candidate immediately. Only when every candidate is exhausted
//! does the whole fetch fail, carrying the full attempt history.

use crate::cancel::CancellationToken;
use crate::config::{AppConfig, NetworkConfig};
use crate::hashing::sha256_file;
use crate::network::retry::{with_retries, RetryPolicy};
use crate::{HangarError, Result};
use futures::StreamExt;
use reqwest::{header, StatusCode};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Where a candidate came from, recorded into provenance on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DownloadSource {
    Primary,
    Mirror,
    CustomUrl,
    LocalFile,
}

/// One entry in the ordered candidate list.
#[derive(Debug, Clone)]
pub struct SourceCandidate {
    pub source: DownloadSource,
    /// URL for network sources, filesystem path for `LocalFile`.
    pub location: String,
}

impl SourceCandidate {
    pub fn primary(url: impl Into<String>) -> Self {
        Self {
            source: DownloadSource::Primary,
            location: url.into(),
        }
    }

    pub fn mirror(url: impl Into<String>) -> Self {
        Self {
            source: DownloadSource::Mirror,
            location: url.into(),
        }
    }

    pub fn custom(url: impl Into<String>) -> Self {
        Self {
            source: DownloadSource::CustomUrl,
            location: url.into(),
        }
    }

    pub fn local(path: impl Into<String>) -> Self {
        Self {
            source: DownloadSource::LocalFile,
            location: path.into(),
        }
    }
}

/// Record of a single candidate attempt, kept for diagnostics.
#[derive(Debug, Clone)]
pub struct DownloadAttempt {
    pub url: String,
    pub source: DownloadSource,
    pub bytes_transferred: u64,
    pub elapsed: Duration,
    /// `None` means the attempt succeeded.
    pub error: Option<String>,
}

/// Progress information sent to callers while a transfer is running.
#[derive(Debug, Clone)]
pub struct DownloadProgress {
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
    pub speed_bytes_per_sec: f64,
    pub percent: Option<f64>,
    pub eta_seconds: Option<f64>,
    /// The candidate currently being fetched, so a UI can show which mirror
    /// is in use.
    pub active_url: String,
    pub active_source: DownloadSource,
}

impl DownloadProgress {
    fn new(
        bytes_downloaded: u64,
        total_bytes: Option<u64>,
        speed: f64,
        candidate: &SourceCandidate,
    ) -> Self {
        let percent = total_bytes.map(|total| {
            if total > 0 {
                (bytes_downloaded as f64 / total as f64) * 100.0
            } else {
                0.0
            }
        });

        let eta_seconds = total_bytes.and_then(|total| {
            if speed > 0.0 && bytes_downloaded < total {
                Some((total - bytes_downloaded) as f64 / speed)
            } else {
                None
            }
        });

        Self {
            bytes_downloaded,
            total_bytes,
            speed_bytes_per_sec: speed,
            percent,
            eta_seconds,
            active_url: candidate.location.clone(),
            active_source: candidate.source,
        }
    }
}

/// Result of a successful fetch.
#[derive(Debug)]
pub struct DownloadOutcome {
    pub path: PathBuf,
    pub source: DownloadSource,
    /// The exact URL or local path the bytes came from.
    pub origin: String,
    /// Verified SHA-256 of the delivered file.
    pub sha256: String,
    /// Set when a local-file import hashed differently than the manifest
    /// expected; the import still succeeds.
    pub checksum_warning: Option<String>,
    pub attempts: Vec<DownloadAttempt>,
}

/// Terminal failure carrying the attempt history for diagnostics.
#[derive(Debug)]
pub struct DownloadFailure {
    pub error: HangarError,
    pub attempts: Vec<DownloadAttempt>,
}

impl From<DownloadFailure> for HangarError {
    fn from(f: DownloadFailure) -> Self {
        f.error
    }
}

/// Downloader over an ordered candidate list.
pub struct Downloader {
    client: reqwest::Client,
    retry: RetryPolicy,
    progress_interval: Duration,
    temp_suffix: String,
}

impl Downloader {
    pub fn new() -> Result<Self> {
        // Connect timeout only: large archives can legitimately take longer
        // than any sane overall timeout.
        let client = reqwest::Client::builder()
            .connect_timeout(NetworkConfig::CONNECT_TIMEOUT)
            .user_agent(AppConfig::USER_AGENT)
            .build()
            .map_err(|e| HangarError::Network {
                message: format!("Failed to create HTTP client: {}", e),
                cause: Some(e.to_string()),
            })?;

        Ok(Self {
            client,
            retry: RetryPolicy::new()
                .with_max_attempts(NetworkConfig::MAX_RETRIES_PER_CANDIDATE)
                .with_base_delay(NetworkConfig::RETRY_BASE_DELAY)
                .with_max_delay(NetworkConfig::RETRY_MAX_DELAY),
            progress_interval: NetworkConfig::DOWNLOAD_PROGRESS_INTERVAL,
            temp_suffix: NetworkConfig::DOWNLOAD_TEMP_SUFFIX.to_string(),
        })
    }

    /// Override the retry policy (tests use millisecond delays).
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Fetch a verified file from the first candidate that delivers bytes
    /// matching `expected_sha256`.
    ///
    /// `destination` is written atomically: bytes stream into a `.part`
    /// sibling which is renamed only after the hash checks out.
    pub async fn fetch(
        &self,
        candidates: &[SourceCandidate],
        expected_sha256: &str,
        destination: &Path,
        token: &CancellationToken,
        progress_tx: Option<mpsc::Sender<DownloadProgress>>,
    ) -> std::result::Result<DownloadOutcome, DownloadFailure> {
        let mut attempts: Vec<DownloadAttempt> = Vec::new();
        let mut last_error: Option<HangarError> = None;
        let mut all_not_found = true;
        let mut all_mismatch = true;

        if candidates.is_empty() {
            return Err(DownloadFailure {
                error: HangarError::Other("No download candidates supplied".into()),
                attempts,
            });
        }

        if let Some(parent) = destination.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                return Err(DownloadFailure {
                    error: HangarError::io_with_path(e, parent),
                    attempts,
                });
            }
        }

        let temp_path = PathBuf::from(format!("{}{}", destination.display(), self.temp_suffix));

        for candidate in candidates {
            if token.is_cancelled() {
                let _ = std::fs::remove_file(&temp_path);
                return Err(DownloadFailure {
                    error: HangarError::Cancelled,
                    attempts,
                });
            }

            let started = Instant::now();
            let result = match candidate.source {
                DownloadSource::LocalFile => {
                    self.import_local(candidate, expected_sha256, destination)
                }
                _ => {
                    self.fetch_network(
                        candidate,
                        expected_sha256,
                        destination,
                        &temp_path,
                        token,
                        progress_tx.clone(),
                    )
                    .await
                }
            };

            match result {
                Ok(outcome) => {
                    attempts.push(DownloadAttempt {
                        url: candidate.location.clone(),
                        source: candidate.source,
                        bytes_transferred: std::fs::metadata(destination)
                            .map(|m| m.len())
                            .unwrap_or(0),
                        elapsed: started.elapsed(),
                        error: None,
                    });
                    // A leftover partial from an earlier failed candidate
                    // must not survive a successful fetch.
                    let _ = std::fs::remove_file(&temp_path);
                    info!(
                        "Fetched {} from {:?} candidate {}",
                        destination.display(),
                        candidate.source,
                        candidate.location
                    );
                    return Ok(DownloadOutcome {
                        attempts,
                        ..outcome
                    });
                }
                Err(e) => {
                    // Disk failures and cancellation abort the whole fetch;
                    // everything else advances to the next candidate.
                    let fatal = matches!(
                        e,
                        HangarError::Io { .. }
                            | HangarError::InsufficientDisk { .. }
                            | HangarError::Cancelled
                    );

                    warn!(
                        "Candidate {} ({:?}) failed: {}",
                        candidate.location, candidate.source, e
                    );
                    attempts.push(DownloadAttempt {
                        url: candidate.location.clone(),
                        source: candidate.source,
                        bytes_transferred: std::fs::metadata(&temp_path)
                            .map(|m| m.len())
                            .unwrap_or(0),
                        elapsed: started.elapsed(),
                        error: Some(e.to_string()),
                    });

                    if fatal {
                        let _ = std::fs::remove_file(&temp_path);
                        return Err(DownloadFailure { error: e, attempts });
                    }

                    all_not_found &= matches!(e, HangarError::SourceNotFound { .. });
                    all_mismatch &= matches!(e, HangarError::ChecksumMismatch { .. });
                    last_error = Some(e);

                    // Partial bytes are scoped to the candidate that wrote
                    // them; the next candidate starts from zero so a range
                    // resume never stitches two sources together.
                    let _ = std::fs::remove_file(&temp_path);
                }
            }
        }

        Err(DownloadFailure {
            error: Self::classify_exhaustion(&attempts, last_error, all_not_found || all_mismatch),
            attempts,
        })
    }

    /// Collapse a fully-exhausted candidate list into one stable
    /// classification: when every candidate failed the same way (all 404,
    /// all checksum mismatch) the real last error surfaces with its fields
    /// intact; mixed failures roll up into an attempt summary.
    fn classify_exhaustion(
        attempts: &[DownloadAttempt],
        last_error: Option<HangarError>,
        uniform: bool,
    ) -> HangarError {
        if uniform {
            if let Some(e) = last_error {
                return e;
            }
        }

        let summary = attempts
            .iter()
            .filter_map(|a| a.error.as_deref())
            .collect::<Vec<_>>()
            .join("; ");

        // The installer fills in the engine id before surfacing this.
        HangarError::AllCandidatesFailed {
            id: String::new(),
            summary,
        }
    }

    fn import_local(
        &self,
        candidate: &SourceCandidate,
        expected_sha256: &str,
        destination: &Path,
    ) -> Result<DownloadOutcome> {
        let source_path = PathBuf::from(&candidate.location);
        if !source_path.exists() {
            return Err(HangarError::DownloadFailed {
                url: candidate.location.clone(),
                message: "Local file does not exist".into(),
            });
        }

        std::fs::copy(&source_path, destination)
            .map_err(|e| HangarError::io_with_path(e, destination))?;

        let actual = sha256_file(destination)?;
        let checksum_warning = if !expected_sha256.is_empty() && actual != expected_sha256 {
            // The user supplied this file explicitly; it may be an
            // intentionally different but compatible build.
            let msg = format!(
                "Local file hash {} differs from manifest hash {}; importing anyway",
                actual, expected_sha256
            );
            warn!("{}", msg);
            Some(msg)
        } else {
            None
        };

        Ok(DownloadOutcome {
            path: destination.to_path_buf(),
            source: DownloadSource::LocalFile,
            origin: candidate.location.clone(),
            sha256: actual,
            checksum_warning,
            attempts: Vec::new(),
        })
    }

    async fn fetch_network(
        &self,
        candidate: &SourceCandidate,
        expected_sha256: &str,
        destination: &Path,
        temp_path: &Path,
        token: &CancellationToken,
        progress_tx: Option<mpsc::Sender<DownloadProgress>>,
    ) -> Result<DownloadOutcome> {
        with_retries(&self.retry, token, || {
            self.transfer(candidate, temp_path, token, progress_tx.clone())
        })
        .await?;

        let actual = sha256_file(temp_path)?;
        if !expected_sha256.is_empty() && actual != expected_sha256 {
            // A stale or corrupt mirror is a candidate failure, not a hard
            // abort; leave nothing behind and let the caller advance.
            let _ = std::fs::remove_file(temp_path);
            return Err(HangarError::ChecksumMismatch {
                url: candidate.location.clone(),
                expected: expected_sha256.to_string(),
                actual,
            });
        }

        std::fs::rename(temp_path, destination).map_err(|e| {
            let _ = std::fs::remove_file(temp_path);
            HangarError::io_with_path(e, destination)
        })?;

        Ok(DownloadOutcome {
            path: destination.to_path_buf(),
            source: candidate.source,
            origin: candidate.location.clone(),
            sha256: actual,
            checksum_warning: None,
            attempts: Vec::new(),
        })
    }

    /// Stream one candidate into the temp file, resuming a previous partial
    /// transfer when the server honors range requests.
    async fn transfer(
        &self,
        candidate: &SourceCandidate,
        temp_path: &Path,
        token: &CancellationToken,
        progress_tx: Option<mpsc::Sender<DownloadProgress>>,
    ) -> Result<()> {
        let resume_from = std::fs::metadata(temp_path).map(|m| m.len()).unwrap_or(0);

        let mut request = self.client.get(&candidate.location);
        if resume_from > 0 {
            debug!(
                "Resuming {} from byte {}",
                candidate.location, resume_from
            );
            request = request.header(header::RANGE, format!("bytes={}-", resume_from));
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(HangarError::SourceNotFound {
                url: candidate.location.clone(),
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(HangarError::DownloadFailed {
                url: candidate.location.clone(),
                message: format!("HTTP {}", status),
            });
        }

        let resumed = status == StatusCode::PARTIAL_CONTENT && resume_from > 0;
        let mut file = if resumed {
            let mut f = std::fs::OpenOptions::new()
                .append(true)
                .open(temp_path)
                .map_err(|e| HangarError::io_with_path(e, temp_path))?;
            f.seek(SeekFrom::End(0))
                .map_err(|e| HangarError::io_with_path(e, temp_path))?;
            f
        } else {
            std::fs::File::create(temp_path)
                .map_err(|e| HangarError::io_with_path(e, temp_path))?
        };

        let mut bytes_downloaded: u64 = if resumed { resume_from } else { 0 };
        let total_bytes = response
            .content_length()
            .map(|len| if resumed { len + resume_from } else { len });

        let mut last_progress_update = Instant::now();
        let started = Instant::now();
        let mut stream = response.bytes_stream();

        if let Some(ref tx) = progress_tx {
            let _ = tx
                .send(DownloadProgress::new(
                    bytes_downloaded,
                    total_bytes,
                    0.0,
                    candidate,
                ))
                .await;
        }

        while let Some(chunk_result) = stream.next().await {
            if token.is_cancelled() {
                return Err(HangarError::Cancelled);
            }

            let chunk = chunk_result.map_err(|e| HangarError::Network {
                message: format!("Error reading download stream: {}", e),
                cause: Some(e.to_string()),
            })?;

            file.write_all(&chunk)
                .map_err(|e| HangarError::io_with_path(e, temp_path))?;

            bytes_downloaded += chunk.len() as u64;

            if last_progress_update.elapsed() >= self.progress_interval {
                if let Some(ref tx) = progress_tx {
                    let elapsed = started.elapsed().as_secs_f64();
                    let speed = if elapsed > 0.0 {
                        (bytes_downloaded - resume_from) as f64 / elapsed
                    } else {
                        0.0
                    };
                    let _ = tx
                        .send(DownloadProgress::new(
                            bytes_downloaded,
                            total_bytes,
                            speed,
                            candidate,
                        ))
                        .await;
                }
                last_progress_update = Instant::now();
            }
        }

        file.flush()
            .map_err(|e| HangarError::io_with_path(e, temp_path))?;

        if let Some(ref tx) = progress_tx {
            let elapsed = started.elapsed().as_secs_f64();
            let speed = if elapsed > 0.0 {
                (bytes_downloaded - resume_from) as f64 / elapsed
            } else {
                0.0
            };
            let _ = tx
                .send(DownloadProgress::new(
                    bytes_downloaded,
                    total_bytes,
                    speed,
                    candidate,
                ))
                .await;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::sha256_bytes;
    use tempfile::TempDir;

    fn quick_retry() -> RetryPolicy {
        RetryPolicy::new()
            .with_max_attempts(2)
            .with_base_delay(Duration::from_millis(5))
            .with_jitter(false)
    }

    #[test]
    fn test_progress_math() {
        let candidate = SourceCandidate::primary("http://example.com/a");
        let progress = DownloadProgress::new(50, Some(100), 10.0, &candidate);
        assert_eq!(progress.percent, Some(50.0));
        assert_eq!(progress.eta_seconds, Some(5.0));
        assert_eq!(progress.active_source, DownloadSource::Primary);
    }

    #[tokio::test]
    async fn test_local_import_with_matching_hash() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("engine.tar.gz");
        std::fs::write(&source, b"payload").unwrap();
        let dest = temp_dir.path().join("out.tar.gz");

        let downloader = Downloader::new().unwrap().with_retry(quick_retry());
        let outcome = downloader
            .fetch(
                &[SourceCandidate::local(source.to_string_lossy())],
                &sha256_bytes(b"payload"),
                &dest,
                &CancellationToken::new(),
                None,
            )
            .await
            .unwrap();

        assert_eq!(outcome.source, DownloadSource::LocalFile);
        assert!(outcome.checksum_warning.is_none());
        assert!(dest.exists());
    }

    #[tokio::test]
    async fn test_local_import_hash_mismatch_is_warning_not_failure() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("engine.tar.gz");
        std::fs::write(&source, b"different payload").unwrap();
        let dest = temp_dir.path().join("out.tar.gz");

        let downloader = Downloader::new().unwrap().with_retry(quick_retry());
        let outcome = downloader
            .fetch(
                &[SourceCandidate::local(source.to_string_lossy())],
                &sha256_bytes(b"expected payload"),
                &dest,
                &CancellationToken::new(),
                None,
            )
            .await
            .unwrap();

        assert!(outcome.checksum_warning.is_some());
        assert!(dest.exists());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("out.bin");

        let token = CancellationToken::new();
        token.cancel();

        let downloader = Downloader::new().unwrap().with_retry(quick_retry());
        let failure = downloader
            .fetch(
                &[SourceCandidate::primary("http://127.0.0.1:1/x")],
                "",
                &dest,
                &token,
                None,
            )
            .await
            .unwrap_err();

        assert!(matches!(failure.error, HangarError::Cancelled));
    }

    #[tokio::test]
    async fn test_stale_partial_removed_on_success() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("engine.tar.gz");
        std::fs::write(&source, b"payload").unwrap();
        let dest = temp_dir.path().join("out.tar.gz");

        // Leftover from an earlier interrupted run
        let stale = temp_dir.path().join("out.tar.gz.part");
        std::fs::write(&stale, b"half an archive").unwrap();

        let downloader = Downloader::new().unwrap().with_retry(quick_retry());
        downloader
            .fetch(
                &[SourceCandidate::local(source.to_string_lossy())],
                &sha256_bytes(b"payload"),
                &dest,
                &CancellationToken::new(),
                None,
            )
            .await
            .unwrap();

        assert!(dest.exists());
        assert!(!stale.exists());
    }

    #[tokio::test]
    async fn test_mixed_exhaustion_rolls_up_all_attempts() {
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("out.tar.gz");
        let missing = temp_dir.path().join("no-such-file.tar.gz");

        // A missing local file and an unreachable host fail differently, so
        // neither classification fits alone.
        let downloader = Downloader::new().unwrap().with_retry(quick_retry());
        let failure = downloader
            .fetch(
                &[
                    SourceCandidate::local(missing.to_string_lossy()),
                    SourceCandidate::primary("http://127.0.0.1:1/engine.tar.gz"),
                ],
                "",
                &dest,
                &CancellationToken::new(),
                None,
            )
            .await
            .unwrap_err();

        assert_eq!(failure.attempts.len(), 2);
        match failure.error {
            HangarError::AllCandidatesFailed { ref summary, .. } => {
                assert!(summary.contains("Local file does not exist"));
            }
            other => panic!("Expected AllCandidatesFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_candidates_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("out.bin");

        let downloader = Downloader::new().unwrap();
        let failure = downloader
            .fetch(&[], "", &dest, &CancellationToken::new(), None)
            .await
            .unwrap_err();

        assert!(failure.attempts.is_empty());
    }
}
