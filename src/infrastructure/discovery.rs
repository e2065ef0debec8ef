//! Listing-page discovery and candidate extraction
//!
//! Fetches the claim listing for one (month, year, scheme) triple and turns
//! every table row carrying a download anchor into a [`Candidate`]. The
//! portal is inconsistent about which query parameter names the file across
//! claim types, so several known variants are checked in priority order
//! with a timestamp-based synthetic name as the last resort. That fallback
//! chain is deliberate, not dead code.

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::domain::entities::{Candidate, DownloadParams};
use crate::infrastructure::http_client::PortalClient;

static UNSAFE_FILENAME_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9._-]").expect("valid filename regex"));

/// CSS selectors and parameter variants for the listing page.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Selector for candidate rows in the listing table
    pub row_selector: String,
    /// Selector for the download anchor within a row
    pub anchor_selector: String,
    /// Query parameter names that may carry the filename, highest
    /// priority first
    pub filename_params: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            row_selector: "table tr".to_string(),
            anchor_selector: "a[href*='download']".to_string(),
            filename_params: vec![
                "filename".to_string(),
                "file".to_string(),
                "fname".to_string(),
                "file_name".to_string(),
                "downloadfile".to_string(),
            ],
        }
    }
}

/// Extracts download candidates from the claim listing page.
pub struct ClaimListExtractor {
    config: DiscoveryConfig,
}

impl ClaimListExtractor {
    pub fn new() -> Self {
        Self::with_config(DiscoveryConfig::default())
    }

    pub fn with_config(config: DiscoveryConfig) -> Self {
        Self { config }
    }

    /// Listing URL for one (month, year, scheme) triple.
    pub fn listing_url(&self, client: &PortalClient, params: &DownloadParams) -> String {
        format!(
            "{}?serviceMonth={:02}&fiscalYear={}&scheme={}",
            client.absolute_url(&client.portal().listing_path),
            params.service_month,
            params.fiscal_year,
            params.scheme
        )
    }

    /// Fetch and parse the listing for the given period.
    ///
    /// An empty list is a valid result (no claims for the period); fetch or
    /// parse errors propagate because there is nothing to download without
    /// a candidate list. Cancelling the batch aborts the listing fetch.
    pub async fn discover(
        &self,
        client: &PortalClient,
        params: &DownloadParams,
        cancel: &CancellationToken,
    ) -> Result<Vec<Candidate>> {
        let url = self.listing_url(client, params);
        info!(
            "Discovering claims for {}/{} scheme {}",
            params.service_month, params.fiscal_year, params.scheme
        );

        let html = client
            .get_text_with_cancellation(&url, cancel)
            .await
            .context("Failed to fetch claim listing page")?;

        let candidates = self.extract_candidates(&html, &url)?;
        info!("Discovery found {} candidate file(s)", candidates.len());
        Ok(candidates)
    }

    /// Parse candidates out of listing HTML, deduplicated by filename with
    /// the first occurrence winning.
    pub fn extract_candidates(&self, html: &str, page_url: &str) -> Result<Vec<Candidate>> {
        let document = Html::parse_document(html);
        let row_selector = Selector::parse(&self.config.row_selector)
            .map_err(|e| anyhow!("Invalid row selector: {e}"))?;
        let anchor_selector = Selector::parse(&self.config.anchor_selector)
            .map_err(|e| anyhow!("Invalid anchor selector: {e}"))?;

        let base_url = Url::parse(page_url).context("Invalid listing page URL")?;

        let mut seen = std::collections::HashSet::new();
        let mut candidates = Vec::new();

        for row in document.select(&row_selector) {
            let Some(anchor) = row.select(&anchor_selector).next() else {
                continue;
            };
            let Some(href) = anchor.value().attr("href") else {
                continue;
            };

            let absolute = match base_url.join(href) {
                Ok(url) => url,
                Err(err) => {
                    debug!("Skipping unparseable href '{}': {}", href, err);
                    continue;
                }
            };

            let filename = self
                .filename_from_url(&absolute)
                .unwrap_or_else(synthetic_filename);

            if seen.insert(filename.clone()) {
                let file_type = filename.rsplit('.').next().map(|ext| ext.to_lowercase());
                candidates.push(Candidate {
                    url: absolute.to_string(),
                    filename,
                    file_type,
                    size_hint: None,
                });
            }
        }

        debug!("Extracted {} unique candidate(s)", candidates.len());
        Ok(candidates)
    }

    /// Extract a filename from the URL's query string, checking the known
    /// parameter name variants in priority order.
    fn filename_from_url(&self, url: &Url) -> Option<String> {
        for param in &self.config.filename_params {
            if let Some((_, value)) = url.query_pairs().find(|(key, _)| key == param.as_str()) {
                let trimmed = value.trim();
                if !trimmed.is_empty() {
                    return Some(sanitize_filename(trimmed));
                }
            }
        }
        None
    }
}

impl Default for ClaimListExtractor {
    fn default() -> Self {
        Self::new()
    }
}

/// Replace path separators and shell-hostile characters so the portal can
/// never steer where we write on disk.
fn sanitize_filename(raw: &str) -> String {
    let name = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
    UNSAFE_FILENAME_CHARS.replace_all(name, "_").to_string()
}

fn synthetic_filename() -> String {
    format!("claim_{}.xls", Utc::now().format("%Y%m%d%H%M%S%3f"))
}
