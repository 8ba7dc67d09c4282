//! Source adapter contracts and the concrete upstream variants.
//!
//! Every adapter returns a plain `Result`; nothing an upstream does can escape
//! the adapter boundary as a panic or an untyped error.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokuten_core::SourceItem;
use tokuten_storage::{FetchError, HttpFetcher};
use tracing::debug;
use uuid::Uuid;

mod cinema;
mod editorial;
mod metadata;
mod social;

pub use cinema::{CinemaScraperAdapter, CinemaSelectors};
pub use editorial::EditorialTrackerAdapter;
pub use metadata::{MetadataProviderAdapter, MetadataProviderConfig};
pub use social::SocialFeedScraperAdapter;

pub const CRATE_NAME: &str = "tokuten-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    MetadataProvider,
    CinemaScraper,
    SocialFeedScraper,
    EditorialTracker,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub content_type: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

impl FetchedPage {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("fetching {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("parsing {url}: {message}")]
    Parse { url: String, message: String },
    #[error("invalid configuration for source {source_id}: {message}")]
    Config { source_id: String, message: String },
}

impl AdapterError {
    pub fn parse(page: &FetchedPage, message: impl ToString) -> Self {
        AdapterError::Parse {
            url: tokuten_storage::loggable_url(&page.url).to_string(),
            message: message.to_string(),
        }
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    fn kind(&self) -> SourceKind;

    /// URLs pulled on each run.
    fn targets(&self) -> Vec<String>;

    fn parse(&self, page: &FetchedPage) -> Result<Vec<SourceItem>, AdapterError>;

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<SourceItem>, AdapterError> {
        fetch_targets(self, http, ctx).await
    }
}

/// Fetches every target in order and parses each page.
pub async fn fetch_targets<A: SourceAdapter + ?Sized>(
    adapter: &A,
    http: &HttpFetcher,
    ctx: &AdapterContext,
) -> Result<Vec<SourceItem>, AdapterError> {
    let mut items = Vec::new();
    for url in adapter.targets() {
        let response = http
            .fetch_bytes(ctx.run_id, adapter.source_id(), &url)
            .await
            .map_err(|source| AdapterError::Fetch {
                url: tokuten_storage::loggable_url(&url).to_string(),
                source,
            })?;
        let page = FetchedPage {
            url: response.final_url,
            content_type: response.content_type.unwrap_or_default(),
            body: response.body,
            fetched_at: ctx.fetched_at,
        };
        let parsed = adapter.parse(&page)?;
        debug!(
            source_id = adapter.source_id(),
            items = parsed.len(),
            "parsed page"
        );
        items.extend(parsed);
    }
    Ok(items)
}

/// One `sources.yaml` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDefinition {
    pub source_id: String,
    pub display_name: String,
    pub kind: SourceKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub exhibitor_id: Option<String>,
    #[serde(default)]
    pub exhibitor_name: Option<String>,
    #[serde(default)]
    pub selectors: Option<CinemaSelectors>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub pages: Option<u32>,
    #[serde(default)]
    pub inter_call_delay_ms: Option<u64>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl SourceDefinition {
    pub fn inter_call_delay(&self) -> Option<Duration> {
        self.inter_call_delay_ms.map(Duration::from_millis)
    }

    fn required(&self, value: &Option<String>, field: &str) -> Result<String, AdapterError> {
        value
            .as_deref()
            .and_then(text_or_none)
            .ok_or_else(|| AdapterError::Config {
                source_id: self.source_id.clone(),
                message: format!("missing `{field}`"),
            })
    }
}

/// Builds the adapter for a registry entry. The metadata credential is resolved here, once.
pub fn build_adapter(
    definition: &SourceDefinition,
    metadata_api_key: Option<&str>,
) -> Result<Box<dyn SourceAdapter>, AdapterError> {
    match definition.kind {
        SourceKind::MetadataProvider => {
            let mut config = MetadataProviderConfig::new(
                definition.source_id.clone(),
                metadata_api_key.map(str::to_string),
            );
            if let Some(base_url) = &definition.base_url {
                config.base_url = base_url.clone();
            }
            if let Some(region) = &definition.region {
                config.region = region.clone();
            }
            if let Some(language) = &definition.language {
                config.language = language.clone();
            }
            if let Some(pages) = definition.pages {
                config.pages = pages.max(1);
            }
            Ok(Box::new(MetadataProviderAdapter::new(config)))
        }
        SourceKind::CinemaScraper => {
            let selectors = definition.selectors.clone().ok_or_else(|| AdapterError::Config {
                source_id: definition.source_id.clone(),
                message: "missing `selectors`".to_string(),
            })?;
            selectors.validate().map_err(|message| AdapterError::Config {
                source_id: definition.source_id.clone(),
                message,
            })?;
            Ok(Box::new(CinemaScraperAdapter::new(
                definition.source_id.clone(),
                definition.required(&definition.exhibitor_id, "exhibitor_id")?,
                definition.required(&definition.exhibitor_name, "exhibitor_name")?,
                definition.urls.clone(),
                selectors,
            )))
        }
        SourceKind::SocialFeedScraper => Ok(Box::new(SocialFeedScraperAdapter::new(
            definition.source_id.clone(),
            definition.required(&definition.exhibitor_id, "exhibitor_id")?,
            definition.required(&definition.exhibitor_name, "exhibitor_name")?,
            definition.urls.clone(),
        ))),
        SourceKind::EditorialTracker => Ok(Box::new(EditorialTrackerAdapter::new(
            definition.source_id.clone(),
            definition.urls.clone(),
        ))),
    }
}

pub(crate) fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Unsigned integers in reading order; full-width digits count.
pub(crate) fn extract_numbers(text: &str) -> Vec<u32> {
    let mut out = Vec::new();
    let mut current = String::new();
    for ch in text.chars().map(tokuten_core::fold_width) {
        if ch.is_ascii_digit() {
            current.push(ch);
            continue;
        }
        if !current.is_empty() {
            if let Ok(v) = current.parse::<u32>() {
                out.push(v);
            }
            current.clear();
        }
    }
    if !current.is_empty() {
        if let Ok(v) = current.parse::<u32>() {
            out.push(v);
        }
    }
    out
}

/// Accepts `2026-02-24`, `2026/02/24` and `2026.02.24`.
pub(crate) fn parse_loose_date(text: &str) -> Option<NaiveDate> {
    let nums = extract_numbers(text);
    match nums.as_slice() {
        [y, m, d, ..] if *y >= 1900 => NaiveDate::from_ymd_opt(*y as i32, *m, *d),
        _ => None,
    }
}
