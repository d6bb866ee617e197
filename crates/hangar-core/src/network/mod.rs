//! Network layer: retry policy and the multi-candidate downloader.

pub mod download;
pub mod retry;

pub use download::{
    DownloadAttempt, DownloadOutcome, DownloadProgress, DownloadSource, Downloader, SourceCandidate,
};
pub use retry::{with_retries, RetryPolicy};
