//! Search result extraction.
//!
//! Walks a fixed number of result pages, pulling the image reference out of
//! every `img.mimg` element in document order.

use std::sync::Arc;

use once_cell::sync::Lazy;
use reqwest::Client;
use scraper::{Html, Selector};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::harvest::client::{build_client, ClientRole};
use crate::harvest::logger::{LogEntryType, OperationStatus};
use crate::harvest::config_loader::ConfigError;
use crate::harvest::Configuration;

static RESULT_IMAGE: Lazy<Selector> =
    Lazy::new(|| Selector::parse("img.mimg").expect("static selector is valid"));

/// Error types for extraction
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid origin: {0}")]
    Origin(#[from] url::ParseError),
}

pub type ExtractResult<T> = Result<T, ExtractError>;

/// An image reference discovered on a result page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateUrl {
    pub url: String,
    pub page: usize,
}

pub struct UrlExtractor {
    config: Arc<Configuration>,
    client: Client,
    origin: Url,
}

impl UrlExtractor {
    pub fn new(config: Arc<Configuration>) -> ExtractResult<Self> {
        let client = build_client(&config, ClientRole::Search)?;
        let origin = Url::parse(&config.search.origin)?;
        Ok(Self {
            config,
            client,
            origin,
        })
    }

    /// Collect candidates from every configured page.
    ///
    /// A non-success status or a failed page ends the scan; whatever was
    /// gathered before that point is returned.
    #[instrument(skip(self), fields(keyword = %self.config.keyword))]
    pub async fn extract(&self) -> Vec<CandidateUrl> {
        let mut candidates = Vec::new();

        for page in 0..self.config.limits.max_pages {
            match self.fetch_page(page).await {
                Ok(Some(html)) => {
                    let found = parse_result_page(&html, &self.origin, page);
                    debug!("Page {} yielded {} candidates", page, found.len());
                    candidates.extend(found);
                }
                Ok(None) => break,
                Err(e) => {
                    error!(
                        entry_type = %LogEntryType::Extract,
                        status = %OperationStatus::Failed,
                        page = page,
                        "Failed to extract image links: {}", e
                    );
                    break;
                }
            }
        }

        info!(
            entry_type = %LogEntryType::Extract,
            status = %OperationStatus::Completed,
            candidates = candidates.len(),
            "Extracted {} candidate URLs",
            candidates.len()
        );
        candidates
    }

    /// Fetch one page. `Ok(None)` means the endpoint answered with a non-success status.
    async fn fetch_page(&self, page: usize) -> ExtractResult<Option<String>> {
        let url = self.config.search_page_url(page)?;
        let response = self.client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            warn!(
                entry_type = %LogEntryType::Extract,
                page = page,
                status_code = status.as_u16(),
                "Search page request failed with status {}", status
            );
            return Ok(None);
        }

        Ok(Some(response.text().await?))
    }
}

/// Pull candidate URLs out of one page of result markup.
pub fn parse_result_page(html: &str, origin: &Url, page: usize) -> Vec<CandidateUrl> {
    let document = Html::parse_document(html);

    document
        .select(&RESULT_IMAGE)
        .filter_map(|img| {
            let element = img.value();
            element
                .attr("src")
                .filter(|src| !src.is_empty())
                .or_else(|| element.attr("data-src").filter(|src| !src.is_empty()))
        })
        .filter_map(|raw| resolve_reference(raw, origin))
        .map(|url| CandidateUrl { url, page })
        .collect()
}

fn resolve_reference(raw: &str, origin: &Url) -> Option<String> {
    let raw = raw.trim();
    if raw.starts_with("http") {
        return Some(raw.to_string());
    }
    origin.join(raw).ok().map(|url| url.to_string())
}
