use std::fs;
use std::path::{Path, PathBuf};

use reqwest::header::HeaderValue;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

// Define error types for config loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// Result type alias for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Formats the normalizer knows how to encode.
pub const SUPPORTED_FORMATS: &[&str] = &["jpg", "jpeg", "png", "bmp", "gif", "tiff", "webp"];

// Config structs for harvester.toml
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Paths {
    pub target_folder: PathBuf,
    pub cache_dir_name: String,
    pub ledger_file_name: String,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            target_folder: PathBuf::from("train_data"),
            cache_dir_name: ".cache".to_string(),
            ledger_file_name: "downloaded_urls.log".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Limits {
    /// Minimum accepted file size in bytes.
    pub min_file_size: u64,
    pub target_width: u32,
    pub target_height: u32,
    pub target_format: String,
    pub max_pages: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            min_file_size: 2 * 1024,
            target_width: 200,
            target_height: 200,
            target_format: "jpg".to_string(),
            max_pages: 1,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Pools {
    pub max_download_concurrency: usize,
}

impl Default for Pools {
    fn default() -> Self {
        Self {
            max_download_concurrency: 10,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Fetch {
    pub max_attempts: usize,
    pub retry_backoff_ms: u64,
    pub timeout_secs: u64,
}

impl Default for Fetch {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff_ms: 2_000,
            timeout_secs: 15,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Search {
    /// Endpoint returning one page of result markup.
    pub endpoint: String,
    /// Origin that relative image references are resolved against.
    pub origin: String,
    pub page_size: usize,
    pub accept_invalid_certs: bool,
}

impl Default for Search {
    fn default() -> Self {
        Self {
            endpoint: "https://cn.bing.com/images/async".to_string(),
            origin: "https://cn.bing.com".to_string(),
            page_size: 30,
            accept_invalid_certs: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Headers {
    pub user_agent: String,
    pub accept_language: String,
}

impl Default for Headers {
    fn default() -> Self {
        Self {
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/114.0.0.0 Safari/537.36".to_string(),
            accept_language: "zh-CN,zh;q=0.8,en-US;q=0.5,en;q=0.3".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Network {
    pub use_system_proxy: bool,
    /// Hosts ending with any of these suffixes are never fetched.
    pub skip_domains: Vec<String>,
    pub headers: Headers,
}

impl Default for Network {
    fn default() -> Self {
        Self {
            use_system_proxy: true,
            skip_domains: vec![
                "wallpaperflare.com".to_string(),
                "healthjade.com".to_string(),
                "specialtyproduce.com".to_string(),
            ],
            headers: Headers::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DedupStrategy {
    /// Files sharing a byte size are treated as duplicates.
    #[default]
    Size,
    /// Files sharing a blake3 digest are treated as duplicates.
    ContentHash,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(default)]
pub struct Dedup {
    pub strategy: DedupStrategy,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Logging {
    pub log_level: String,
    pub log_format: String,
    pub log_to_terminal: bool,
    pub log_to_file: bool,
    pub log_directory: PathBuf,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "line".to_string(),
            log_to_terminal: true,
            log_to_file: false,
            log_directory: PathBuf::from("./logs"),
        }
    }
}

/// Run parameters. Assembled once, then shared read-only behind an `Arc`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Configuration {
    pub keyword: String,
    pub paths: Paths,
    pub limits: Limits,
    pub pools: Pools,
    pub fetch: Fetch,
    pub search: Search,
    pub network: Network,
    pub dedup: Dedup,
    pub logging: Logging,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            keyword: "orange".to_string(),
            paths: Paths::default(),
            limits: Limits::default(),
            pools: Pools::default(),
            fetch: Fetch::default(),
            search: Search::default(),
            network: Network::default(),
            dedup: Dedup::default(),
            logging: Logging::default(),
        }
    }
}

/// Values supplied on the command line. `None` keeps the loaded value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub keyword: Option<String>,
    pub min_file_size_kb: Option<u64>,
    pub target_width: Option<u32>,
    pub target_height: Option<u32>,
    pub max_pages: Option<usize>,
    pub target_folder: Option<PathBuf>,
    pub target_format: Option<String>,
    pub concurrency: Option<usize>,
}

impl Configuration {
    /// Load the configuration file, falling back to defaults when it is missing or unreadable.
    pub fn load(config_path: &Path) -> ConfigResult<Self> {
        if !config_path.exists() {
            warn!("Config file not found: {}, using defaults", config_path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(config_path)?;
        match toml::from_str(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                error!("Failed to parse {}: {}", config_path.display(), e);
                info!("Backing up old config and continuing with default values");

                if let Err(backup_err) = fs::rename(config_path, config_path.with_extension("toml.backup")) {
                    warn!("Failed to backup old config: {}", backup_err);
                }

                let default_config = Self::default();
                if let Err(save_err) = default_config.save(config_path) {
                    warn!("Failed to write default config: {}", save_err);
                }
                Ok(default_config)
            }
        }
    }

    /// Write this configuration as pretty TOML.
    pub fn save(&self, config_path: &Path) -> ConfigResult<()> {
        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::TomlSer(e.to_string()))?;
        fs::write(config_path, toml_string)?;
        Ok(())
    }

    /// Apply command line overrides. Consumes `self` so the result can be frozen by the caller.
    pub fn apply_overrides(mut self, overrides: &Overrides) -> Self {
        if let Some(keyword) = &overrides.keyword {
            self.keyword = keyword.clone();
        }
        if let Some(kb) = overrides.min_file_size_kb {
            self.limits.min_file_size = kb * 1024;
        }
        if let Some(width) = overrides.target_width {
            self.limits.target_width = width;
        }
        if let Some(height) = overrides.target_height {
            self.limits.target_height = height;
        }
        if let Some(pages) = overrides.max_pages {
            self.limits.max_pages = pages;
        }
        if let Some(folder) = &overrides.target_folder {
            self.paths.target_folder = folder.clone();
        }
        if let Some(format) = &overrides.target_format {
            self.limits.target_format = format.to_ascii_lowercase();
        }
        if let Some(concurrency) = overrides.concurrency {
            self.pools.max_download_concurrency = concurrency;
        }
        self
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.keyword.trim().is_empty() {
            return Err(ConfigError::Invalid("keyword must not be empty".to_string()));
        }
        if self.limits.target_width == 0 || self.limits.target_height == 0 {
            return Err(ConfigError::Invalid("target dimensions must be positive".to_string()));
        }
        if self.limits.max_pages == 0 {
            return Err(ConfigError::Invalid("max_pages must be at least 1".to_string()));
        }
        if self.pools.max_download_concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be at least 1".to_string()));
        }
        if self.fetch.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".to_string()));
        }
        let format = self.limits.target_format.to_ascii_lowercase();
        if !SUPPORTED_FORMATS.contains(&format.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "unsupported target format '{}'",
                self.limits.target_format
            )));
        }
        Url::parse(&self.search.endpoint)
            .map_err(|e| ConfigError::Invalid(format!("search endpoint: {}", e)))?;
        Url::parse(&self.search.origin)
            .map_err(|e| ConfigError::Invalid(format!("search origin: {}", e)))?;
        for (name, value) in [
            ("user_agent", &self.network.headers.user_agent),
            ("accept_language", &self.network.headers.accept_language),
        ] {
            HeaderValue::from_str(value)
                .map_err(|e| ConfigError::Invalid(format!("{} header: {}", name, e)))?;
        }
        Ok(())
    }

    /// `target_folder/keyword`
    pub fn save_folder(&self) -> PathBuf {
        self.paths.target_folder.join(&self.keyword)
    }

    pub fn cache_folder(&self) -> PathBuf {
        self.save_folder().join(&self.paths.cache_dir_name)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.save_folder().join(&self.paths.ledger_file_name)
    }

    /// URL of result page `page` (zero based).
    pub fn search_page_url(&self, page: usize) -> ConfigResult<Url> {
        let first = (page * self.search.page_size).to_string();
        let count = self.search.page_size.to_string();
        Url::parse_with_params(
            &self.search.endpoint,
            &[
                ("q", self.keyword.as_str()),
                ("first", first.as_str()),
                ("count", count.as_str()),
                ("cw", "1920"),
                ("ch", "937"),
                ("relp", count.as_str()),
                ("tsc", "ImageBasicHover"),
                ("datsrc", "N_I"),
                ("layout", "RowBased"),
                ("mmasync", "1"),
            ],
        )
        .map_err(|e| ConfigError::Invalid(format!("search endpoint: {}", e)))
    }

    /// Referer sent with every request, derived from the keyword.
    pub fn referer(&self) -> String {
        let mut referer = format!("{}/images/search", self.search.origin.trim_end_matches('/'));
        if let Ok(mut url) = Url::parse(&referer) {
            url.query_pairs_mut().append_pair("q", &self.keyword);
            referer = url.to_string();
        }
        referer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = Configuration::default();
        assert_eq!(config.keyword, "orange");
        assert_eq!(config.paths.target_folder, PathBuf::from("train_data"));
        assert_eq!(config.limits.min_file_size, 2048);
        assert_eq!((config.limits.target_width, config.limits.target_height), (200, 200));
        assert_eq!(config.limits.max_pages, 1);
        assert_eq!(config.limits.target_format, "jpg");
        assert_eq!(config.pools.max_download_concurrency, 10);
        assert_eq!(config.fetch.max_attempts, 3);
        assert_eq!(config.dedup.strategy, DedupStrategy::Size);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides_convert_kilobytes() {
        let overrides = Overrides {
            keyword: Some("apple".to_string()),
            min_file_size_kb: Some(5),
            target_width: Some(320),
            max_pages: Some(3),
            ..Default::default()
        };
        let config = Configuration::default().apply_overrides(&overrides);
        assert_eq!(config.keyword, "apple");
        assert_eq!(config.limits.min_file_size, 5 * 1024);
        assert_eq!(config.limits.target_width, 320);
        assert_eq!(config.limits.target_height, 200);
        assert_eq!(config.limits.max_pages, 3);
        assert_eq!(config.save_folder(), PathBuf::from("train_data").join("apple"));
        assert_eq!(config.cache_folder(), PathBuf::from("train_data").join("apple").join(".cache"));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("harvester.toml");
        fs::write(&path, "keyword = \"banana\"\n[limits]\ntarget_width = 64\n").unwrap();

        let config = Configuration::load(&path).unwrap();
        assert_eq!(config.keyword, "banana");
        assert_eq!(config.limits.target_width, 64);
        assert_eq!(config.limits.target_height, 200);
        assert_eq!(config.network.skip_domains.len(), 3);
    }

    #[test]
    fn test_broken_file_is_backed_up() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("harvester.toml");
        fs::write(&path, "keyword = [not toml").unwrap();

        let config = Configuration::load(&path).unwrap();
        assert_eq!(config, Configuration::default());
        assert!(dir.path().join("harvester.toml.backup").exists());
        // A fresh default file replaces the broken one
        assert_eq!(Configuration::load(&path).unwrap(), Configuration::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("harvester.toml");
        let mut config = Configuration::default();
        config.dedup.strategy = DedupStrategy::ContentHash;
        config.save(&path).unwrap();

        assert_eq!(Configuration::load(&path).unwrap(), config);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Configuration::default();
        config.limits.target_format = "svg".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Configuration::default();
        config.pools.max_download_concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = Configuration::default();
        config.keyword = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unsendable_headers() {
        let mut config = Configuration::default();
        config.network.headers.user_agent = "Mozilla/5.0\nInjected: yes".to_string();
        match config.validate() {
            Err(ConfigError::Invalid(message)) => assert!(message.starts_with("user_agent header")),
            other => panic!("expected invalid header, got {:?}", other),
        }
    }

    #[test]
    fn test_search_page_url_offsets() {
        let config = Configuration::default();
        let url = config.search_page_url(2).unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("q".to_string(), "orange".to_string())));
        assert!(pairs.contains(&("first".to_string(), "60".to_string())));
        assert!(url.as_str().starts_with("https://cn.bing.com/images/async?"));
        assert_eq!(config.referer(), "https://cn.bing.com/images/search?q=orange");
    }
}
