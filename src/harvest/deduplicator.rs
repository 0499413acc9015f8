//! Duplicate removal and sequential renaming of the final image set.
//!
//! Files are keyed by byte size (or by blake3 digest when configured), the
//! oldest file of each key survives, and survivors are renumbered
//! `<keyword>_1..N` in modification-time order.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use blake3::Hasher as Blake3Hasher;
use thiserror::Error;
use tracing::{error, info, warn};
use walkdir::WalkDir;

use crate::harvest::config_loader::DedupStrategy;
use crate::harvest::logger::{LogEntryType, OperationStatus};
use crate::harvest::Configuration;

#[derive(Error, Debug)]
pub enum DedupError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Walk error: {0}")]
    Walk(#[from] walkdir::Error),
}

pub type DedupResult<T> = Result<T, DedupError>;

/// What two files must share to count as duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DuplicateKey {
    Size(u64),
    Digest(String),
}

/// Files that collapsed onto one key. `kept` is the oldest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateGroup {
    pub key: DuplicateKey,
    pub kept: PathBuf,
    pub removed: Vec<PathBuf>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DedupReport {
    pub groups: Vec<DuplicateGroup>,
    pub removed: usize,
    pub renamed: usize,
    pub final_count: usize,
}

#[derive(Debug)]
struct ScannedFile {
    path: PathBuf,
    modified: SystemTime,
    size: u64,
}

pub struct Deduplicator {
    config: Arc<Configuration>,
}

impl Deduplicator {
    pub fn new(config: Arc<Configuration>) -> Self {
        Self { config }
    }

    /// Dedup and renumber the files of the target format in `folder`.
    pub fn run(&self, folder: &Path) -> DedupResult<DedupReport> {
        let files = self.scan(folder)?;
        let mut report = DedupReport::default();

        let (survivors, groups) = self.partition(files);
        for group in &groups {
            for duplicate in &group.removed {
                match fs::remove_file(duplicate) {
                    Ok(()) => {
                        report.removed += 1;
                        info!(
                            entry_type = %LogEntryType::Dedup,
                            status = %OperationStatus::Completed,
                            "Removed duplicate file: {} (same as {})",
                            duplicate.display(),
                            group.kept.display()
                        );
                    }
                    Err(e) => warn!("Failed to remove duplicate {}: {}", duplicate.display(), e),
                }
            }
        }
        report.groups = groups;

        report.renamed = self.renumber(folder, &survivors);
        report.final_count = survivors.len();

        info!(
            entry_type = %LogEntryType::Dedup,
            status = %OperationStatus::Completed,
            "Dedup finished: {} kept, {} removed, {} renamed",
            report.final_count, report.removed, report.renamed
        );
        Ok(report)
    }

    /// Files directly inside `folder` with the target extension, oldest first.
    fn scan(&self, folder: &Path) -> DedupResult<Vec<ScannedFile>> {
        let target = &self.config.limits.target_format;
        let mut files = Vec::new();

        for entry in WalkDir::new(folder).min_depth(1).max_depth(1) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let matches_format = entry
                .path()
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case(target));
            if !matches_format {
                continue;
            }

            let metadata = entry.metadata()?;
            files.push(ScannedFile {
                path: entry.into_path(),
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                size: metadata.len(),
            });
        }

        files.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));
        Ok(files)
    }

    /// Split into survivors (in order) and the duplicate groups that lost files.
    fn partition(&self, files: Vec<ScannedFile>) -> (Vec<PathBuf>, Vec<DuplicateGroup>) {
        let mut first_seen: HashMap<DuplicateKey, usize> = HashMap::new();
        let mut groups: Vec<DuplicateGroup> = Vec::new();
        let mut group_of_key: HashMap<DuplicateKey, usize> = HashMap::new();
        let mut survivors = Vec::new();

        for file in files {
            let key = match self.key_for(&file) {
                Ok(key) => key,
                Err(e) => {
                    warn!("Cannot key {}: {}, keeping it", file.path.display(), e);
                    survivors.push(file.path);
                    continue;
                }
            };

            match first_seen.get(&key) {
                None => {
                    first_seen.insert(key, survivors.len());
                    survivors.push(file.path);
                }
                Some(&kept_index) => {
                    let slot = *group_of_key.entry(key.clone()).or_insert_with(|| {
                        groups.push(DuplicateGroup {
                            key: key.clone(),
                            kept: survivors[kept_index].clone(),
                            removed: Vec::new(),
                        });
                        groups.len() - 1
                    });
                    groups[slot].removed.push(file.path);
                }
            }
        }

        (survivors, groups)
    }

    fn key_for(&self, file: &ScannedFile) -> io::Result<DuplicateKey> {
        match self.config.dedup.strategy {
            DedupStrategy::Size => Ok(DuplicateKey::Size(file.size)),
            DedupStrategy::ContentHash => {
                let buffer = fs::read(&file.path)?;
                let mut hasher = Blake3Hasher::new();
                hasher.update(&buffer);
                Ok(DuplicateKey::Digest(hex::encode(hasher.finalize().as_bytes())))
            }
        }
    }

    /// Rename survivors to `<keyword>_<n>.<fmt>`; returns how many moved.
    ///
    /// Files are first parked under staging names so that no survivor
    /// overwrites another survivor that has not moved yet.
    fn renumber(&self, folder: &Path, survivors: &[PathBuf]) -> usize {
        let keyword = &self.config.keyword;
        let format = &self.config.limits.target_format;

        let mut parked = Vec::new();
        for (position, current) in survivors.iter().enumerate() {
            let target = folder.join(format!("{}_{}.{}", keyword, position + 1, format));
            if *current == target {
                continue;
            }
            let staging = folder.join(format!(".{}_{}.renaming", keyword, position + 1));
            match fs::rename(current, &staging) {
                Ok(()) => parked.push((current.clone(), staging, target)),
                Err(e) => error!("Failed to stage rename of {}: {}", current.display(), e),
            }
        }

        let mut renamed = 0;
        for (original, staging, target) in parked {
            if target.exists() {
                if let Err(e) = fs::remove_file(&target) {
                    warn!("Failed to clear {}: {}", target.display(), e);
                }
            }
            match fs::rename(&staging, &target) {
                Ok(()) => {
                    renamed += 1;
                    info!(
                        entry_type = %LogEntryType::Dedup,
                        "Renamed: {} -> {}",
                        display_name(&original),
                        display_name(&target)
                    );
                }
                Err(e) => error!("Failed to rename {} -> {}: {}", staging.display(), target.display(), e),
            }
        }
        renamed
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{set_file_mtime, FileTime};
    use tempfile::tempdir;

    /// Write `len` bytes of `fill` and pin the mtime to `age` seconds after the epoch.
    fn put(folder: &Path, name: &str, len: usize, fill: u8, age: i64) -> PathBuf {
        let path = folder.join(name);
        fs::write(&path, vec![fill; len]).unwrap();
        set_file_mtime(&path, FileTime::from_unix_time(1_700_000_000 + age, 0)).unwrap();
        path
    }

    fn names(folder: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(folder)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    fn dedup(strategy: DedupStrategy) -> Deduplicator {
        let mut config = Configuration::default();
        config.dedup.strategy = strategy;
        Deduplicator::new(Arc::new(config))
    }

    #[test]
    fn test_same_size_keeps_oldest() {
        let dir = tempdir().unwrap();
        put(dir.path(), "orange_7.jpg", 5000, 1, 20);
        put(dir.path(), "orange_3.jpg", 5000, 2, 10);

        let report = dedup(DedupStrategy::Size).run(dir.path()).unwrap();

        assert_eq!(report.removed, 1);
        assert_eq!(report.final_count, 1);
        assert_eq!(report.groups[0].key, DuplicateKey::Size(5000));
        assert_eq!(names(dir.path()), vec!["orange_1.jpg"]);
        // The survivor is the older file
        assert_eq!(fs::read(dir.path().join("orange_1.jpg")).unwrap()[0], 2);
    }

    #[test]
    fn test_renumbering_is_contiguous_and_ordered() {
        let dir = tempdir().unwrap();
        put(dir.path(), "orange_2.jpg", 3000, 1, 1);
        put(dir.path(), "orange_1.jpg", 4000, 2, 2);
        put(dir.path(), "orange_9.jpg", 3000, 3, 3);
        put(dir.path(), "orange_5.jpg", 6000, 4, 4);
        put(dir.path(), "downloaded_urls.log", 10, 5, 5);
        put(dir.path(), "orange_8.png", 7000, 6, 6);

        let report = dedup(DedupStrategy::Size).run(dir.path()).unwrap();

        assert_eq!(report.final_count, 3);
        assert_eq!(
            names(dir.path()),
            vec!["downloaded_urls.log", "orange_1.jpg", "orange_2.jpg", "orange_3.jpg", "orange_8.png"]
        );
        let first_bytes: Vec<u8> = (1..=3)
            .map(|n| fs::read(dir.path().join(format!("orange_{}.jpg", n))).unwrap()[0])
            .collect();
        assert_eq!(first_bytes, vec![1, 2, 4]);
    }

    #[test]
    fn test_content_hash_keeps_distinct_same_size_files() {
        let dir = tempdir().unwrap();
        put(dir.path(), "a.jpg", 5000, 1, 1);
        put(dir.path(), "b.jpg", 5000, 2, 2);
        put(dir.path(), "c.jpg", 5000, 1, 3);

        let report = dedup(DedupStrategy::ContentHash).run(dir.path()).unwrap();

        assert_eq!(report.removed, 1);
        assert_eq!(names(dir.path()), vec!["orange_1.jpg", "orange_2.jpg"]);
        assert!(matches!(report.groups[0].key, DuplicateKey::Digest(_)));
    }

    #[test]
    fn test_already_numbered_set_is_untouched() {
        let dir = tempdir().unwrap();
        put(dir.path(), "orange_1.jpg", 3000, 1, 1);
        put(dir.path(), "orange_2.jpg", 4000, 2, 2);

        let report = dedup(DedupStrategy::Size).run(dir.path()).unwrap();
        assert_eq!(report.renamed, 0);
        assert_eq!(report.final_count, 2);
    }
}
