//! TMDB-style metadata API producing canonical movie seeds.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use tokuten_core::{CanonicalMovieSeed, SourceItem};
use tokuten_storage::HttpFetcher;
use tracing::info;

use crate::{fetch_targets, AdapterContext, AdapterError, FetchedPage, SourceAdapter, SourceKind};

const DEFAULT_BASE_URL: &str = "https://api.themoviedb.org/3";
const IMAGE_BASE_URL: &str = "https://image.tmdb.org/t/p";
const LISTS: [&str; 2] = ["now_playing", "upcoming"];

#[derive(Debug, Clone)]
pub struct MetadataProviderConfig {
    pub source_id: String,
    pub api_key: Option<String>,
    pub base_url: String,
    pub region: String,
    pub language: String,
    pub pages: u32,
}

impl MetadataProviderConfig {
    pub fn new(source_id: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            source_id: source_id.into(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            base_url: DEFAULT_BASE_URL.to_string(),
            region: "TW".to_string(),
            language: "zh-TW".to_string(),
            pages: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetadataProviderAdapter {
    config: MetadataProviderConfig,
}

#[derive(Debug, Deserialize)]
struct ListPage {
    #[serde(default)]
    results: Vec<ListMovie>,
}

#[derive(Debug, Deserialize)]
struct ListMovie {
    id: u64,
    title: String,
    #[serde(default)]
    original_title: Option<String>,
    #[serde(default)]
    release_date: Option<String>,
    #[serde(default)]
    overview: Option<String>,
    #[serde(default)]
    poster_path: Option<String>,
    #[serde(default)]
    backdrop_path: Option<String>,
    #[serde(default)]
    vote_average: Option<f64>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|v| crate::text_or_none(&v))
}

fn image_url(size: &str, path: Option<String>) -> Option<String> {
    non_empty(path).map(|p| format!("{IMAGE_BASE_URL}/{size}{p}"))
}

impl ListMovie {
    fn into_seed(self) -> CanonicalMovieSeed {
        let title = self.title.trim().to_string();
        let english_title = non_empty(self.original_title)
            .filter(|t| t.is_ascii() && *t != title);
        CanonicalMovieSeed {
            external_id: self.id.to_string(),
            english_title,
            release_date: self
                .release_date
                .as_deref()
                .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok()),
            synopsis: non_empty(self.overview),
            poster_url: image_url("w500", self.poster_path),
            backdrop_url: image_url("w1280", self.backdrop_path),
            rating: self.vote_average.filter(|r| *r > 0.0),
            title,
        }
    }
}

impl MetadataProviderAdapter {
    pub fn new(config: MetadataProviderConfig) -> Self {
        Self { config }
    }

    pub fn has_credential(&self) -> bool {
        self.config.api_key.is_some()
    }
}

#[async_trait]
impl SourceAdapter for MetadataProviderAdapter {
    fn source_id(&self) -> &str {
        &self.config.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::MetadataProvider
    }

    fn targets(&self) -> Vec<String> {
        let Some(api_key) = &self.config.api_key else {
            return Vec::new();
        };
        let base = self.config.base_url.trim_end_matches('/');
        LISTS
            .iter()
            .flat_map(|list| {
                (1..=self.config.pages).map(move |page| {
                    format!(
                        "{base}/movie/{list}?api_key={api_key}&language={}&region={}&page={page}",
                        self.config.language, self.config.region
                    )
                })
            })
            .collect()
    }

    fn parse(&self, page: &FetchedPage) -> Result<Vec<SourceItem>, AdapterError> {
        let list: ListPage =
            serde_json::from_slice(&page.body).map_err(|e| AdapterError::parse(page, e))?;
        Ok(list
            .results
            .into_iter()
            .filter(|m| !m.title.trim().is_empty())
            .map(|m| SourceItem::Seed(m.into_seed()))
            .collect())
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<SourceItem>, AdapterError> {
        if !self.has_credential() {
            info!(
                source_id = %self.config.source_id,
                "no metadata credential configured; continuing without canonical titles"
            );
            return Ok(Vec::new());
        }

        // The same movie shows up in both lists and across pages.
        let mut seen = HashSet::new();
        let items = fetch_targets(self, http, ctx).await?;
        Ok(items
            .into_iter()
            .filter(|item| match item {
                SourceItem::Seed(seed) => seen.insert(seed.external_id.clone()),
                SourceItem::Observation(_) => true,
            })
            .collect())
    }
}
