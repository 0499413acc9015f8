//! Download Engine for the image harvester
//!
//! This module provides the concurrent fetch stage:
//! 1. Uses bounded concurrency (a Semaphore sized by `pools.max_download_concurrency`)
//! 2. Streams each body into a per-task staging file under `.cache`
//! 3. Retries failed fetches a fixed number of times with a fixed backoff
//! 4. Drops undersized results and promotes the rest under `<keyword>_<index><ext>`
//! 5. Returns one outcome per input URL, in input order

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::stream::StreamExt;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::harvest::client::{build_client, ClientRole};
use crate::harvest::logger::{LogEntryType, OperationStatus};
use crate::harvest::Configuration;

/// Error types for the download engine
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("HTTP status {0}")]
    Status(StatusCode),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Result type for download operations
pub type DownloadResult<T> = Result<T, DownloadError>;

/// Why a URL was rejected before any request was made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    DataUri,
    BlockedDomain(String),
    InvalidUrl,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::DataUri => write!(f, "inline data URI"),
            SkipReason::BlockedDomain(domain) => write!(f, "blocked domain {}", domain),
            SkipReason::InvalidUrl => write!(f, "unparseable URL"),
        }
    }
}

/// How a single download task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Promoted(PathBuf),
    Skipped(SkipReason),
    TooSmall { size: u64 },
    Failed { attempts: usize, reason: String },
}

impl FetchOutcome {
    pub fn into_final_path(self) -> Option<PathBuf> {
        match self {
            FetchOutcome::Promoted(path) => Some(path),
            _ => None,
        }
    }

    /// Whether a later run would reach the same verdict for this URL.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, FetchOutcome::Failed { .. })
    }
}

/// One URL to fetch. `ordinal` keys the staging file and the promotion index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
    pub ordinal: usize,
    pub url: String,
}

impl DownloadTask {
    pub fn new(ordinal: usize, url: impl Into<String>) -> Self {
        Self {
            ordinal,
            url: url.into(),
        }
    }
}

/// Emitted once per finished task.
#[derive(Debug, Clone)]
pub struct DownloadEvent {
    pub ordinal: usize,
    pub url: String,
    pub outcome: FetchOutcome,
}

/// A download body on disk that has not been promoted yet.
///
/// Dropping it removes the file; `promote` hands the file over to its final name.
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
    file: Option<File>,
    size: u64,
    promoted: bool,
}

impl StagedFile {
    pub async fn create(path: PathBuf) -> io::Result<Self> {
        let file = File::create(&path).await?;
        Ok(Self {
            path,
            file: Some(file),
            size: 0,
            promoted: false,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => {
                file.write_all(chunk).await?;
                self.size += chunk.len() as u64;
                Ok(())
            }
            None => Err(io::Error::new(io::ErrorKind::Other, "staged file already closed")),
        }
    }

    /// Flush and close the handle, then report the size actually on disk.
    pub async fn finish(&mut self) -> io::Result<u64> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        self.size = fs::metadata(&self.path).await?.len();
        Ok(self.size)
    }

    /// Move the staged body to `destination`, replacing whatever is there.
    pub async fn promote(mut self, destination: &Path) -> io::Result<PathBuf> {
        self.finish().await?;
        match fs::remove_file(destination).await {
            Ok(()) => debug!("Replacing existing file {}", destination.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        fs::rename(&self.path, destination).await?;
        self.promoted = true;
        Ok(destination.to_path_buf())
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if self.promoted {
            return;
        }
        // Close the handle before unlinking so Windows lets go of the file
        self.file.take();
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed staged file {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => debug!("Failed to remove staged file {}: {}", self.path.display(), e),
        }
    }
}

/// Decide whether a URL must not be fetched at all.
pub fn skip_reason(url: &str, skip_domains: &[String]) -> Option<SkipReason> {
    if url.get(..5).is_some_and(|scheme| scheme.eq_ignore_ascii_case("data:")) {
        return Some(SkipReason::DataUri);
    }

    let parsed = match Url::parse(url) {
        Ok(parsed) => parsed,
        Err(_) => return Some(SkipReason::InvalidUrl),
    };
    let host = parsed.host_str()?.to_ascii_lowercase();

    skip_domains
        .iter()
        .find(|domain| host.ends_with(&domain.to_ascii_lowercase()))
        .map(|domain| SkipReason::BlockedDomain(domain.clone()))
}

/// `<keyword>_<index><ext>`, with the extension taken from the URL path.
pub fn final_file_name(keyword: &str, index: usize, url: &str) -> DownloadResult<String> {
    let parsed = Url::parse(url)?;
    let ext = Path::new(parsed.path())
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
        .unwrap_or_default();
    Ok(format!("{}_{}{}", keyword, index, ext))
}

/// Result of one attempt that did not fail at the transport level.
enum Attempt {
    Staged(StagedFile),
    Rejected(StatusCode),
}

/// Bounded-concurrency fetcher for a batch of candidate URLs.
pub struct DownloadScheduler {
    config: Arc<Configuration>,
    client: Client,
    semaphore: Arc<Semaphore>,
    save_folder: PathBuf,
    cache_folder: PathBuf,
    start_index: usize,
}

impl DownloadScheduler {
    /// Create a scheduler. Promoted files are numbered from `start_index`.
    pub fn new(config: Arc<Configuration>, start_index: usize) -> DownloadResult<Self> {
        let client = build_client(&config, ClientRole::Images)?;
        let semaphore = Arc::new(Semaphore::new(config.pools.max_download_concurrency));

        info!(
            "Download scheduler ready: {} slots, {} attempts per URL",
            config.pools.max_download_concurrency, config.fetch.max_attempts
        );

        Ok(Self {
            save_folder: config.save_folder(),
            cache_folder: config.cache_folder(),
            config,
            client,
            semaphore,
            start_index,
        })
    }

    /// Run every task to completion. `outcomes[i]` belongs to `tasks[i]`.
    ///
    /// All tasks are polled on the caller's task; the semaphore caps how many
    /// are past the gate at once. A completion event goes to `events` as each
    /// task finishes; the sender is dropped on return.
    pub async fn fetch_all(
        &self,
        tasks: Vec<DownloadTask>,
        events: mpsc::UnboundedSender<DownloadEvent>,
    ) -> Vec<FetchOutcome> {
        let futures = tasks.into_iter().map(|task| {
            let events = events.clone();
            async move {
                let outcome = self.fetch_one(&task).await;
                let _ = events.send(DownloadEvent {
                    ordinal: task.ordinal,
                    url: task.url.clone(),
                    outcome: outcome.clone(),
                });
                outcome
            }
        });

        join_all(futures).await
    }

    /// Fetch a single URL under one concurrency slot.
    #[instrument(skip(self, task), fields(ordinal = task.ordinal))]
    pub async fn fetch_one(&self, task: &DownloadTask) -> FetchOutcome {
        let _permit = match self.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                error!("Concurrency gate closed: {}", e);
                return FetchOutcome::Failed {
                    attempts: 0,
                    reason: e.to_string(),
                };
            }
        };

        if let Some(reason) = skip_reason(&task.url, &self.config.network.skip_domains) {
            info!(
                entry_type = %LogEntryType::Download,
                status = %OperationStatus::Skipped,
                "Skipping {}: {}", preview(&task.url), reason
            );
            return FetchOutcome::Skipped(reason);
        }

        if let Err(e) = fs::create_dir_all(&self.cache_folder).await {
            error!("Failed to create cache folder {}: {}", self.cache_folder.display(), e);
            return FetchOutcome::Failed {
                attempts: 0,
                reason: e.to_string(),
            };
        }

        let staged_path = self.cache_folder.join(format!("temp_{}.tmp", task.ordinal));
        let max_attempts = self.config.fetch.max_attempts;
        let backoff = Duration::from_millis(self.config.fetch.retry_backoff_ms);
        let mut last_failure = String::from("no attempt made");

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                info!("Retry attempt {}/{} for {}", attempt, max_attempts, task.url);
            }

            match self.stage(&task.url, &staged_path).await {
                Ok(Attempt::Staged(staged)) => {
                    return self.settle(task, staged).await;
                }
                Ok(Attempt::Rejected(status)) => {
                    warn!(
                        entry_type = %LogEntryType::Download,
                        status_code = status.as_u16(),
                        "Download failed with status {} for {}", status, task.url
                    );
                    last_failure = DownloadError::Status(status).to_string();
                }
                Err(e) => {
                    error!(
                        entry_type = %LogEntryType::Download,
                        status = %OperationStatus::Failed,
                        "Download error for {}: {}", task.url, e
                    );
                    last_failure = e.to_string();
                    if attempt < max_attempts {
                        debug!("Backing off for {}ms before retry", backoff.as_millis());
                        sleep(backoff).await;
                    }
                }
            }
        }

        FetchOutcome::Failed {
            attempts: max_attempts,
            reason: last_failure,
        }
    }

    /// One request: stream a success body into a fresh staging file.
    async fn stage(&self, url: &str, staged_path: &Path) -> DownloadResult<Attempt> {
        let response = self
            .client
            .get(url)
            .timeout(Duration::from_secs(self.config.fetch.timeout_secs))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Ok(Attempt::Rejected(status));
        }

        // Any early return below drops `staged`, which removes the partial file
        let mut staged = StagedFile::create(staged_path.to_path_buf()).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            staged.write_chunk(&chunk?).await?;
        }
        staged.finish().await?;

        Ok(Attempt::Staged(staged))
    }

    /// Apply the size threshold and promote.
    async fn settle(&self, task: &DownloadTask, staged: StagedFile) -> FetchOutcome {
        let size = staged.size();
        if size < self.config.limits.min_file_size {
            info!(
                entry_type = %LogEntryType::Download,
                status = %OperationStatus::Skipped,
                "{} is below the minimum size ({} < {} bytes)",
                task.url, size, self.config.limits.min_file_size
            );
            return FetchOutcome::TooSmall { size };
        }

        let index = self.start_index + task.ordinal;
        let file_name = match final_file_name(&self.config.keyword, index, &task.url) {
            Ok(name) => name,
            Err(e) => {
                warn!("Cannot name download from {}: {}", task.url, e);
                return FetchOutcome::Failed {
                    attempts: 1,
                    reason: e.to_string(),
                };
            }
        };

        let destination = self.save_folder.join(file_name);
        match staged.promote(&destination).await {
            Ok(path) => {
                info!(
                    entry_type = %LogEntryType::Download,
                    status = %OperationStatus::Completed,
                    file_size = size,
                    "Downloaded {} -> {}", task.url, path.display()
                );
                FetchOutcome::Promoted(path)
            }
            Err(e) => {
                error!("Failed to promote {}: {}", destination.display(), e);
                FetchOutcome::Failed {
                    attempts: 1,
                    reason: e.to_string(),
                }
            }
        }
    }
}

/// First 50 characters, enough to identify inline data URIs in logs.
fn preview(url: &str) -> String {
    let head: String = url.chars().take(50).collect();
    if head.len() < url.len() {
        format!("{}...", head)
    } else {
        head
    }
}
