//! Background research from the web.

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::Url;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

const SCRAPINGDOG_ENDPOINT: &str = "https://api.scrapingdog.com/scrape";
const SEARCH_PAGE: &str = "https://www.google.com/search";

/// Longest summary handed back, in characters.
pub const MAX_SUMMARY_CHARS: usize = 2000;

lazy_static! {
    static ref SCRIPT_OR_STYLE: Regex =
        Regex::new(r"(?is)<(script|style)\b[^>]*>.*?</(script|style)>").expect("valid regex");
    static ref TAG: Regex = Regex::new(r"(?s)<[^>]*>").expect("valid regex");
    static ref MULTI_SPACE: Regex = Regex::new(r" {2,}").expect("valid regex");
}

/// Errors from research.
#[derive(Debug, Error)]
pub enum ResearchError {
    #[error("Research not configured: set SCRAPINGDOG_API_KEY")]
    NotConfigured,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Research service returned status {status}")]
    Status { status: u16 },

    #[error("Invalid research URL: {0}")]
    Url(String),

    #[error("No readable text found")]
    Empty,
}

/// Fetches a plain-text summary for a query.
#[async_trait]
pub trait Researcher: Send + Sync {
    async fn fetch_summary(&self, query: &str) -> Result<String, ResearchError>;
}

/// Researcher that scrapes a search results page through ScrapingDog.
#[derive(Clone)]
pub struct ScrapingDogResearcher {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
}

impl ScrapingDogResearcher {
    pub fn new(api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            api_key: api_key.into(),
            endpoint: SCRAPINGDOG_ENDPOINT.to_string(),
        }
    }

    /// Create from `SCRAPINGDOG_API_KEY`.
    pub fn from_env() -> Result<Self, ResearchError> {
        match std::env::var("SCRAPINGDOG_API_KEY") {
            Ok(key) if !key.trim().is_empty() => Ok(Self::new(key)),
            _ => Err(ResearchError::NotConfigured),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl Researcher for ScrapingDogResearcher {
    async fn fetch_summary(&self, query: &str) -> Result<String, ResearchError> {
        if self.api_key.is_empty() {
            return Err(ResearchError::NotConfigured);
        }

        let search_url = Url::parse_with_params(SEARCH_PAGE, &[("q", query)])
            .map_err(|e| ResearchError::Url(e.to_string()))?;
        info!(query, "Researching topic");

        let response = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("api_key", self.api_key.as_str()),
                ("url", search_url.as_str()),
                ("dynamic", "false"),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), "Research request failed");
            return Err(ResearchError::Status {
                status: status.as_u16(),
            });
        }

        let html = response.text().await?;
        let text = html_to_text(&html);
        if text.is_empty() {
            return Err(ResearchError::Empty);
        }
        Ok(truncate_summary(&text, MAX_SUMMARY_CHARS))
    }
}

/// Visible text of an HTML page, one phrase per line.
pub fn html_to_text(html: &str) -> String {
    let without_code = SCRIPT_OR_STYLE.replace_all(html, " ");
    let with_breaks = TAG.replace_all(&without_code, "\n");
    let decoded = decode_entities(&with_breaks);

    decoded
        .lines()
        .flat_map(|line| MULTI_SPACE.split(line.trim()).collect::<Vec<_>>())
        .map(str::trim)
        .filter(|chunk| !chunk.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// Cut `text` to `max_chars` characters, marking the cut with an ellipsis.
pub fn truncate_summary(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => format!("{}...", &text[..byte_index]),
        None => text.to_string(),
    }
}
