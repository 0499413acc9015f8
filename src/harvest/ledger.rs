//! Newline-delimited record of URLs already handled for a keyword.

use std::collections::HashSet;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};

use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

#[derive(Debug)]
pub struct UrlLedger {
    path: PathBuf,
    seen: HashSet<String>,
}

impl UrlLedger {
    /// Read the ledger at `path`. A missing file is an empty ledger.
    pub async fn load(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let seen = match fs::read_to_string(&path).await {
            Ok(content) => content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => HashSet::new(),
            Err(e) => return Err(e),
        };
        debug!("Loaded {} ledger entries from {}", seen.len(), path.display());
        Ok(Self { path, seen })
    }

    /// A ledger with no entries that appends to `path`.
    pub fn empty(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            seen: HashSet::new(),
        }
    }

    pub fn contains(&self, url: &str) -> bool {
        self.seen.contains(url.trim())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Append URLs not yet recorded. Returns how many lines were written.
    pub async fn record<'a, I>(&mut self, urls: I) -> io::Result<usize>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut buffer = String::new();
        let mut written = 0;
        for url in urls {
            let url = url.trim();
            if url.is_empty() || !self.seen.insert(url.to_string()) {
                continue;
            }
            buffer.push_str(url);
            buffer.push('\n');
            written += 1;
        }
        if written == 0 {
            return Ok(0);
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .await?;

        // A hand-edited ledger may lack the final newline
        let len = file.metadata().await?.len();
        if len > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::Start(len - 1)).await?;
            file.read_exact(&mut last).await?;
            if last[0] != b'\n' {
                buffer.insert(0, '\n');
            }
        }

        file.write_all(buffer.as_bytes()).await?;
        file.flush().await?;
        Ok(written)
    }
}
