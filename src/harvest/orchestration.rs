//! Orchestration layer for the image harvester
//!
//! This module drives one run through its stages, each finishing before the next starts:
//! 1. Extract candidate URLs from the search endpoint
//! 2. Drop URLs recorded in the ledger and fetch the rest under the concurrency bound
//! 3. Normalize every promoted file
//! 4. Deduplicate and renumber the keyword folder
//! 5. Remove the `.cache` staging folder

use std::fs;
use std::io::Error as IoError;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

use crate::harvest::deduplicator::{DedupReport, Deduplicator};
use crate::harvest::download_engine::{DownloadError, DownloadScheduler, DownloadTask};
use crate::harvest::image_normalizer::ImageNormalizer;
use crate::harvest::ledger::UrlLedger;
use crate::harvest::logger::{log_stage, report_progress, LogEntryType, OperationStatus};
use crate::harvest::url_extractor::{ExtractError, UrlExtractor};
use crate::harvest::Configuration;

/// Error types for the orchestration layer
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    #[error("Extractor error: {0}")]
    Extract(#[from] ExtractError),

    #[error("Download engine error: {0}")]
    Download(#[from] DownloadError),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

/// Result type for orchestration operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Counts for one finished run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub candidates: usize,
    pub already_downloaded: usize,
    pub scheduled: usize,
    pub promoted: usize,
    pub normalized: usize,
    pub duplicates_removed: usize,
    pub final_count: usize,
}

pub struct Orchestrator {
    config: Arc<Configuration>,
    run_id: Uuid,
    show_progress: bool,
}

impl Orchestrator {
    pub fn new(config: Arc<Configuration>) -> Self {
        Self {
            config,
            run_id: Uuid::new_v4(),
            show_progress: true,
        }
    }

    /// Toggle the terminal progress bar (log lines are emitted either way).
    pub fn with_progress_bar(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub async fn run(&self) -> OrchestratorResult<RunSummary> {
        let span = tracing::info_span!("harvest", run_id = %self.run_id, keyword = %self.config.keyword);
        self.run_stages().instrument(span).await
    }

    async fn run_stages(&self) -> OrchestratorResult<RunSummary> {
        let config = &self.config;
        let save_folder = config.save_folder();
        fs::create_dir_all(&save_folder)?;
        let start_index = next_start_index(&save_folder, &config.keyword, &config.limits.target_format);
        info!("Saving into {} starting at index {}", save_folder.display(), start_index);

        let mut summary = RunSummary::default();

        log_stage(LogEntryType::Extract, OperationStatus::Started, &config.keyword);
        let candidates = UrlExtractor::new(config.clone())?.extract().await;
        summary.candidates = candidates.len();

        let mut ledger = match UrlLedger::load(config.ledger_path()).await {
            Ok(ledger) => ledger,
            Err(e) => {
                warn!("Failed to read URL ledger, treating it as empty: {}", e);
                UrlLedger::empty(config.ledger_path())
            }
        };

        info!("URL ledger holds {} entries", ledger.len());

        let mut tasks = Vec::with_capacity(candidates.len());
        for (ordinal, candidate) in candidates.into_iter().enumerate() {
            if ledger.contains(&candidate.url) {
                info!("Skipping already downloaded URL: {}", candidate.url);
                summary.already_downloaded += 1;
                continue;
            }
            tasks.push(DownloadTask::new(ordinal, candidate.url));
        }
        summary.scheduled = tasks.len();

        log_stage(
            LogEntryType::Download,
            OperationStatus::Started,
            &format!("{} URLs", tasks.len()),
        );
        let scheduler = DownloadScheduler::new(config.clone(), start_index)?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let total = tasks.len();
        let (outcomes, tally) = tokio::join!(
            scheduler.fetch_all(tasks.clone(), events_tx),
            report_progress(events_rx, total, self.show_progress),
        );
        info!(
            "Fetch finished: {} promoted, {} skipped, {} too small, {} failed",
            tally.promoted, tally.skipped, tally.too_small, tally.failed
        );

        let terminal_urls = tasks
            .iter()
            .zip(&outcomes)
            .filter(|(_, outcome)| outcome.is_terminal())
            .map(|(task, _)| task.url.as_str());
        match ledger.record(terminal_urls).await {
            Ok(written) => info!("Recorded {} URLs in the ledger", written),
            Err(e) => warn!("Failed to append to URL ledger: {}", e),
        }

        let promoted: Vec<PathBuf> = outcomes
            .into_iter()
            .filter_map(|outcome| outcome.into_final_path())
            .collect();
        summary.promoted = promoted.len();

        log_stage(
            LogEntryType::Normalize,
            OperationStatus::Started,
            &format!("{} files", promoted.len()),
        );
        let normalizer = ImageNormalizer::new(config.clone());
        let normalized = tokio::task::spawn_blocking(move || normalizer.normalize_all(&promoted))
            .await
            .map_err(|e| OrchestratorError::TaskJoin(e.to_string()))?;
        summary.normalized = normalized.len();

        log_stage(LogEntryType::Dedup, OperationStatus::Started, &save_folder.display().to_string());
        let deduplicator = Deduplicator::new(config.clone());
        let dedup_folder = save_folder.clone();
        let report = tokio::task::spawn_blocking(move || deduplicator.run(&dedup_folder))
            .await
            .map_err(|e| OrchestratorError::TaskJoin(e.to_string()))?
            .unwrap_or_else(|e| {
                error!("Failed to tidy file names: {}", e);
                DedupReport::default()
            });
        summary.duplicates_removed = report.removed;
        summary.final_count = report.final_count;

        remove_cache_folder(&config.cache_folder());

        log_stage(
            LogEntryType::System,
            OperationStatus::Completed,
            &format!("{} images in {}", summary.final_count, save_folder.display()),
        );
        Ok(summary)
    }
}

/// One past the number of finished images already in `folder`.
pub fn next_start_index(folder: &Path, keyword: &str, target_format: &str) -> usize {
    let suffix = format!(".{}", target_format);
    let existing = match fs::read_dir(folder) {
        Ok(entries) => entries
            .filter_map(Result::ok)
            .filter(|entry| {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                name.starts_with(keyword) && name.ends_with(&suffix)
            })
            .count(),
        Err(_) => 0,
    };
    existing + 1
}

/// Best-effort removal of the staging folder.
fn remove_cache_folder(cache_folder: &Path) {
    if !cache_folder.exists() {
        return;
    }
    match fs::remove_dir_all(cache_folder) {
        Ok(()) => info!("Removed cache folder: {}", cache_folder.display()),
        Err(e) => warn!("Failed to remove cache folder {}: {}", cache_folder.display(), e),
    }
}
