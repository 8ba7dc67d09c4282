//! Curated editorial tracker: already structured, but still keyed by free-text titles.

use async_trait::async_trait;
use serde::Deserialize;
use tokuten_core::{RawBonusObservation, SourceItem};

use crate::{parse_loose_date, text_or_none, AdapterError, FetchedPage, SourceAdapter, SourceKind};

#[derive(Debug, Deserialize)]
struct Tracker {
    #[serde(default)]
    entries: Vec<Entry>,
}

#[derive(Debug, Deserialize)]
struct Entry {
    movie_title: String,
    exhibitor_id: String,
    exhibitor_name: String,
    #[serde(default)]
    release_date: Option<String>,
    #[serde(default)]
    items: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    description: String,
    #[serde(default)]
    quantity: Option<u32>,
    #[serde(default)]
    week_index: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct EditorialTrackerAdapter {
    source_id: String,
    urls: Vec<String>,
}

impl EditorialTrackerAdapter {
    pub fn new(source_id: String, urls: Vec<String>) -> Self {
        Self { source_id, urls }
    }
}

#[async_trait]
impl SourceAdapter for EditorialTrackerAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::EditorialTracker
    }

    fn targets(&self) -> Vec<String> {
        self.urls.clone()
    }

    fn parse(&self, page: &FetchedPage) -> Result<Vec<SourceItem>, AdapterError> {
        let tracker: Tracker =
            serde_json::from_slice(&page.body).map_err(|e| AdapterError::parse(page, e))?;
        let mut out = Vec::new();
        for entry in tracker.entries {
            let (Some(title), Some(exhibitor_id)) = (
                text_or_none(&entry.movie_title),
                text_or_none(&entry.exhibitor_id),
            ) else {
                continue;
            };
            let release_date_hint = entry.release_date.as_deref().and_then(parse_loose_date);
            for item in entry.items {
                let Some(description) = text_or_none(&item.description) else {
                    continue;
                };
                out.push(SourceItem::Observation(RawBonusObservation {
                    source_id: self.source_id.clone(),
                    exhibitor_id: exhibitor_id.clone(),
                    exhibitor_name: entry.exhibitor_name.trim().to_string(),
                    movie_title_raw: title.clone(),
                    description,
                    quantity: item.quantity,
                    week_index: item.week_index,
                    observed_at: page.fetched_at,
                    release_date_hint,
                    source_url: Some(page.url.clone()),
                }));
            }
        }
        Ok(out)
    }
}
