//! Exhibitor bonus pages scraped with per-source CSS selectors.

use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use tokuten_core::{RawBonusObservation, SourceItem};

use crate::{
    extract_numbers, parse_loose_date, text_or_none, AdapterError, FetchedPage, SourceAdapter,
    SourceKind,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CinemaSelectors {
    pub item: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub quantity: Option<String>,
    #[serde(default)]
    pub week: Option<String>,
    #[serde(default)]
    pub release_date: Option<String>,
}

impl CinemaSelectors {
    pub fn validate(&self) -> Result<(), String> {
        let optional = [&self.quantity, &self.week, &self.release_date];
        [&self.item, &self.title, &self.description]
            .into_iter()
            .chain(optional.into_iter().flatten())
            .try_for_each(|s| {
                Selector::parse(s)
                    .map(|_| ())
                    .map_err(|e| format!("bad selector `{s}`: {e}"))
            })
    }
}

#[derive(Debug, Clone)]
pub struct CinemaScraperAdapter {
    source_id: String,
    exhibitor_id: String,
    exhibitor_name: String,
    urls: Vec<String>,
    selectors: CinemaSelectors,
}

fn selector(page: &FetchedPage, raw: &str) -> Result<Selector, AdapterError> {
    Selector::parse(raw).map_err(|e| AdapterError::parse(page, e))
}

fn first_text(element: &ElementRef<'_>, sel: &Selector) -> Option<String> {
    element
        .select(sel)
        .next()
        .and_then(|n| text_or_none(&n.text().collect::<String>()))
}

impl CinemaScraperAdapter {
    pub fn new(
        source_id: String,
        exhibitor_id: String,
        exhibitor_name: String,
        urls: Vec<String>,
        selectors: CinemaSelectors,
    ) -> Self {
        Self {
            source_id,
            exhibitor_id,
            exhibitor_name,
            urls,
            selectors,
        }
    }
}

#[async_trait]
impl SourceAdapter for CinemaScraperAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::CinemaScraper
    }

    fn targets(&self) -> Vec<String> {
        self.urls.clone()
    }

    fn parse(&self, page: &FetchedPage) -> Result<Vec<SourceItem>, AdapterError> {
        let document = Html::parse_document(&page.text());
        let item_sel = selector(page, &self.selectors.item)?;
        let title_sel = selector(page, &self.selectors.title)?;
        let description_sel = selector(page, &self.selectors.description)?;
        let quantity_sel = self
            .selectors
            .quantity
            .as_deref()
            .map(|s| selector(page, s))
            .transpose()?;
        let week_sel = self
            .selectors
            .week
            .as_deref()
            .map(|s| selector(page, s))
            .transpose()?;
        let release_sel = self
            .selectors
            .release_date
            .as_deref()
            .map(|s| selector(page, s))
            .transpose()?;

        let mut items = Vec::new();
        for element in document.select(&item_sel) {
            let (Some(title), Some(description)) = (
                first_text(&element, &title_sel),
                first_text(&element, &description_sel),
            ) else {
                continue;
            };
            let number_in = |sel: &Option<Selector>| {
                sel.as_ref()
                    .and_then(|s| first_text(&element, s))
                    .and_then(|t| extract_numbers(&t).first().copied())
            };
            items.push(SourceItem::Observation(RawBonusObservation {
                source_id: self.source_id.clone(),
                exhibitor_id: self.exhibitor_id.clone(),
                exhibitor_name: self.exhibitor_name.clone(),
                movie_title_raw: title,
                description,
                quantity: number_in(&quantity_sel),
                week_index: number_in(&week_sel),
                observed_at: page.fetched_at,
                release_date_hint: release_sel
                    .as_ref()
                    .and_then(|s| first_text(&element, s))
                    .and_then(|t| parse_loose_date(&t)),
                source_url: Some(page.url.clone()),
            }));
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};

    const HTML: &str = r#"
        <html><body>
          <div class="bonus-item">
            <h3 class="movie-title">鬼滅之刃 劇場版</h3>
            <p class="gift">入場海報</p>
            <span class="qty">限量 ３００ 份</span>
            <span class="week">第1週</span>
            <span class="release">2026/02/24</span>
          </div>
          <div class="bonus-item">
            <h3 class="movie-title">航海王</h3>
            <p class="gift">角色色紙</p>
          </div>
          <div class="bonus-item">
            <h3 class="movie-title">No gift listed</h3>
          </div>
        </body></html>
    "#;

    fn adapter() -> CinemaScraperAdapter {
        CinemaScraperAdapter::new(
            "vieshow".into(),
            "vieshow".into(),
            "威秀影城".into(),
            vec!["https://cinema.example/bonus".into()],
            CinemaSelectors {
                item: ".bonus-item".into(),
                title: ".movie-title".into(),
                description: ".gift".into(),
                quantity: Some(".qty".into()),
                week: Some(".week".into()),
                release_date: Some(".release".into()),
            },
        )
    }

    #[test]
    fn parses_bonus_items_and_skips_incomplete_ones() {
        let page = FetchedPage {
            url: "https://cinema.example/bonus".into(),
            content_type: "text/html".into(),
            body: HTML.as_bytes().to_vec(),
            fetched_at: Utc::now(),
        };
        let items = adapter().parse(&page).expect("parse");
        assert_eq!(items.len(), 2);

        let SourceItem::Observation(first) = &items[0] else {
            panic!("expected observation");
        };
        assert_eq!(first.movie_title_raw, "鬼滅之刃 劇場版");
        assert_eq!(first.description, "入場海報");
        assert_eq!(first.quantity, Some(300));
        assert_eq!(first.week_index, Some(1));
        assert_eq!(first.release_date_hint, NaiveDate::from_ymd_opt(2026, 2, 24));
        assert_eq!(first.exhibitor_name, "威秀影城");

        let SourceItem::Observation(second) = &items[1] else {
            panic!("expected observation");
        };
        assert_eq!(second.quantity, None);
        assert_eq!(second.week_index, None);
    }

    #[test]
    fn invalid_selectors_fail_validation() {
        let mut selectors = adapter().selectors;
        assert!(selectors.validate().is_ok());
        selectors.week = Some("div[".into());
        assert!(selectors.validate().is_err());
    }
}
