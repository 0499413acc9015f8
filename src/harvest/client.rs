//! HTTP client construction shared by the extractor and the download scheduler.

use std::time::Duration;

use reqwest::header::{ACCEPT_LANGUAGE, HeaderMap, HeaderValue, InvalidHeaderValue, REFERER, USER_AGENT};
use reqwest::Client;
use tracing::{info, warn};

use crate::harvest::Configuration;

/// Which side of the pipeline the client talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientRole {
    /// The search endpoint. Certificate checks may be relaxed.
    Search,
    /// Arbitrary image hosts. Certificates are always validated.
    Images,
}

/// Default headers for every request: user agent, accept-language and the keyword referer.
pub fn default_headers(config: &Configuration) -> Result<HeaderMap, InvalidHeaderValue> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_str(&config.network.headers.user_agent)?);
    headers.insert(
        ACCEPT_LANGUAGE,
        HeaderValue::from_str(&config.network.headers.accept_language)?,
    );
    headers.insert(REFERER, HeaderValue::from_str(&config.referer())?);
    Ok(headers)
}

/// Build a pooled async client for the given role.
pub fn build_client(config: &Configuration, role: ClientRole) -> Result<Client, reqwest::Error> {
    let headers = match default_headers(config) {
        Ok(headers) => headers,
        Err(e) => {
            warn!("Invalid default header value, sending requests without default headers: {}", e);
            HeaderMap::new()
        }
    };
    let relaxed = role == ClientRole::Search && config.search.accept_invalid_certs;

    let mut builder = Client::builder()
        .default_headers(headers)
        .connect_timeout(Duration::from_secs(config.fetch.timeout_secs))
        .pool_max_idle_per_host(config.pools.max_download_concurrency)
        .gzip(true)
        .tcp_nodelay(true)
        .danger_accept_invalid_certs(relaxed);

    if !config.network.use_system_proxy {
        builder = builder.no_proxy();
    }

    let client = builder.build()?;
    info!(
        role = ?role,
        relaxed_tls = relaxed,
        "Initialized HTTP client"
    );
    Ok(client)
}
