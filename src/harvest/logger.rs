//! Structured Logging for the image harvester
//!
//! This module provides functionality for:
//! 1. Tagging every extract, download, normalize and dedup event with its stage
//! 2. Writing to the terminal and, optionally, a daily rotating file in JSON or line format
//! 3. Reporting fetch progress from the scheduler's completion events

use std::fmt;

use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt as tracing_fmt, prelude::*, EnvFilter};

use crate::harvest::config_loader::Logging;
use crate::harvest::download_engine::{DownloadEvent, FetchOutcome};

/// Error types for logging
#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Logging error: {0}")]
    Logging(String),
}

/// Result type for logging operations
pub type LoggerResult<T> = Result<T, LoggerError>;

/// Pipeline stage an event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEntryType {
    Extract,
    Download,
    Normalize,
    Dedup,
    System,
}

impl fmt::Display for LogEntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogEntryType::Extract => write!(f, "extract"),
            LogEntryType::Download => write!(f, "download"),
            LogEntryType::Normalize => write!(f, "normalize"),
            LogEntryType::Dedup => write!(f, "dedup"),
            LogEntryType::System => write!(f, "system"),
        }
    }
}

/// Status of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Started,
    Completed,
    Skipped,
    Failed,
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationStatus::Started => write!(f, "started"),
            OperationStatus::Completed => write!(f, "completed"),
            OperationStatus::Skipped => write!(f, "skipped"),
            OperationStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop and must live as long as the process.
pub fn init_logger(logging: &Logging) -> LoggerResult<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.log_level))
        .map_err(|e| LoggerError::Logging(e.to_string()))?;

    let mut layers = Vec::new();
    let mut guard = None;

    if logging.log_to_terminal {
        layers.push(tracing_fmt::layer().with_target(false).boxed());
    }

    if logging.log_to_file {
        std::fs::create_dir_all(&logging.log_directory)?;
        let file_appender = RollingFileAppender::new(
            Rotation::DAILY,
            &logging.log_directory,
            "image_harvester.log",
        );
        let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);
        guard = Some(file_guard);

        let layer = match logging.log_format.as_str() {
            "json" => tracing_fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_ansi(false)
                .boxed(),
            _ => tracing_fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .boxed(),
        };
        layers.push(layer);
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(layers)
        .try_init()
        .map_err(|e| LoggerError::Logging(e.to_string()))?;

    info!(
        entry_type = %LogEntryType::System,
        log_format = %logging.log_format,
        log_level = %logging.log_level,
        timestamp = %Utc::now().to_rfc3339(),
        "Logger initialized"
    );

    Ok(guard)
}

/// Log a stage boundary.
pub fn log_stage(entry_type: LogEntryType, status: OperationStatus, details: &str) {
    info!(
        entry_type = %entry_type,
        status = %status,
        timestamp = %Utc::now().to_rfc3339(),
        "{} {}: {}", entry_type, status, details
    );
}

/// Tallies of a finished fetch batch, as observed through completion events.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProgressTally {
    pub completed: usize,
    pub promoted: usize,
    pub skipped: usize,
    pub too_small: usize,
    pub failed: usize,
}

/// Consume completion events until the scheduler drops its sender.
pub async fn report_progress(
    mut events: mpsc::UnboundedReceiver<DownloadEvent>,
    total: usize,
    show_bar: bool,
) -> ProgressTally {
    let bar = if show_bar {
        let bar = ProgressBar::new(total as u64);
        match ProgressStyle::with_template("{spinner} [{bar:40}] {pos}/{len} {msg}") {
            Ok(style) => bar.set_style(style.progress_chars("=> ")),
            Err(e) => warn!("Invalid progress template: {}", e),
        }
        bar
    } else {
        ProgressBar::hidden()
    };

    let mut tally = ProgressTally::default();
    while let Some(event) = events.recv().await {
        tally.completed += 1;
        match &event.outcome {
            FetchOutcome::Promoted(_) => tally.promoted += 1,
            FetchOutcome::Skipped(_) => tally.skipped += 1,
            FetchOutcome::TooSmall { .. } => tally.too_small += 1,
            FetchOutcome::Failed { .. } => tally.failed += 1,
        }

        let percent = if total == 0 {
            100.0
        } else {
            tally.completed as f64 / total as f64 * 100.0
        };
        bar.inc(1);
        bar.set_message(format!("#{}", event.ordinal));
        info!(
            entry_type = %LogEntryType::Download,
            ordinal = event.ordinal,
            url = %event.url,
            "Download progress: {}/{} ({:.1}%)", tally.completed, total, percent
        );
    }

    bar.finish_and_clear();
    tally
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harvest::download_engine::SkipReason;
    use std::path::PathBuf;

    #[test]
    fn test_display_names() {
        assert_eq!(LogEntryType::Normalize.to_string(), "normalize");
        assert_eq!(OperationStatus::Skipped.to_string(), "skipped");
    }

    #[tokio::test]
    async fn test_report_progress_tallies_outcomes() {
        let (tx, rx) = mpsc::unbounded_channel();
        let events = vec![
            FetchOutcome::Promoted(PathBuf::from("orange_1.jpg")),
            FetchOutcome::Skipped(SkipReason::DataUri),
            FetchOutcome::TooSmall { size: 10 },
            FetchOutcome::Failed { attempts: 3, reason: "HTTP 404".to_string() },
        ];
        for (ordinal, outcome) in events.into_iter().enumerate() {
            tx.send(DownloadEvent {
                ordinal,
                url: format!("https://img.example.com/{}.jpg", ordinal),
                outcome,
            })
            .unwrap();
        }
        drop(tx);

        let tally = report_progress(rx, 4, false).await;
        assert_eq!(
            tally,
            ProgressTally {
                completed: 4,
                promoted: 1,
                skipped: 1,
                too_small: 1,
                failed: 1,
            }
        );
    }
}
