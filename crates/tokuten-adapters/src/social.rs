//! Exhibitor social feeds: free-text posts announcing bonuses.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokuten_core::{fold_width, RawBonusObservation, SourceItem};

use crate::{extract_numbers, text_or_none, AdapterError, FetchedPage, SourceAdapter, SourceKind};

const BONUS_MARKER: &str = "特典";
const LIMITED_MARKER: &str = "限量";
const TITLE_BRACKETS: [(char, char); 3] = [('《', '》'), ('「', '」'), ('『', '』')];
const QUANTITY_UNITS: [char; 5] = ['份', '張', '個', '組', '张'];
const DESCRIPTION_STOPS: [&str; 5] = [LIMITED_MARKER, "，", ",", "（", "("];

#[derive(Debug, Deserialize)]
struct Feed {
    #[serde(default)]
    posts: Vec<Post>,
}

#[derive(Debug, Deserialize)]
struct Post {
    text: String,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SocialFeedScraperAdapter {
    source_id: String,
    exhibitor_id: String,
    exhibitor_name: String,
    urls: Vec<String>,
}

impl SocialFeedScraperAdapter {
    pub fn new(
        source_id: String,
        exhibitor_id: String,
        exhibitor_name: String,
        urls: Vec<String>,
    ) -> Self {
        Self {
            source_id,
            exhibitor_id,
            exhibitor_name,
            urls,
        }
    }

    fn observations_from_post(&self, post: &Post, page: &FetchedPage) -> Vec<RawBonusObservation> {
        let Some(title) = bracketed_title(&post.text) else {
            return Vec::new();
        };
        let post_week = week_index(&post.text);
        post.text
            .lines()
            .filter_map(|line| {
                let description = bonus_description(line)?;
                Some(RawBonusObservation {
                    source_id: self.source_id.clone(),
                    exhibitor_id: self.exhibitor_id.clone(),
                    exhibitor_name: self.exhibitor_name.clone(),
                    movie_title_raw: title.clone(),
                    description,
                    quantity: quantity(line),
                    week_index: week_index(line).or(post_week),
                    observed_at: post.created_at.unwrap_or(page.fetched_at),
                    release_date_hint: None,
                    source_url: post.url.clone().or_else(|| Some(page.url.clone())),
                })
            })
            .collect()
    }
}

#[async_trait]
impl SourceAdapter for SocialFeedScraperAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::SocialFeedScraper
    }

    fn targets(&self) -> Vec<String> {
        self.urls.clone()
    }

    fn parse(&self, page: &FetchedPage) -> Result<Vec<SourceItem>, AdapterError> {
        let feed: Feed =
            serde_json::from_slice(&page.body).map_err(|e| AdapterError::parse(page, e))?;
        Ok(feed
            .posts
            .iter()
            .flat_map(|post| self.observations_from_post(post, page))
            .map(SourceItem::Observation)
            .collect())
    }
}

fn bracketed_title(text: &str) -> Option<String> {
    TITLE_BRACKETS.iter().find_map(|(open, close)| {
        let start = text.find(*open)? + open.len_utf8();
        let rest = &text[start..];
        let end = rest.find(*close)?;
        text_or_none(&rest[..end])
    })
}

fn bonus_description(line: &str) -> Option<String> {
    // Only `特典：…` lines carry an item; headlines like `第二週特典來囉` do not.
    let idx = line.find(BONUS_MARKER)?;
    let mut rest = line[idx + BONUS_MARKER.len()..].trim_start();
    rest = rest
        .strip_prefix(':')
        .or_else(|| rest.strip_prefix('：'))?
        .trim_start();
    for stop in DESCRIPTION_STOPS {
        if let Some(cut) = rest.find(stop) {
            rest = &rest[..cut];
        }
    }
    text_or_none(rest)
}

/// Chinese numerals up to 99, or plain digits.
fn numeral(text: &str) -> Option<u32> {
    let folded: String = text.chars().map(fold_width).collect();
    if !folded.is_empty() && folded.chars().all(|c| c.is_ascii_digit()) {
        return folded.parse().ok();
    }
    let digit = |c: char| "一二三四五六七八九".chars().position(|d| d == c).map(|p| p as u32 + 1);
    let chars: Vec<char> = folded.chars().collect();
    match chars.as_slice() {
        [c] if *c == '十' => Some(10),
        [c] => digit(*c),
        ['十', u] => digit(*u).map(|u| 10 + u),
        [t, '十'] => digit(*t).map(|t| t * 10),
        [t, '十', u] => Some(digit(*t)? * 10 + digit(*u)?),
        _ => None,
    }
}

fn week_index(text: &str) -> Option<u32> {
    let mut rest = text;
    while let Some(start) = rest.find('第') {
        let after = &rest[start + '第'.len_utf8()..];
        if let Some(end) = after.find(|c: char| c == '週' || c == '周') {
            if let Some(n) = numeral(after[..end].trim()) {
                return Some(n);
            }
        }
        rest = after;
    }
    let lower = text.to_ascii_lowercase();
    let idx = lower.find("week")?;
    extract_numbers(&lower[idx..]).first().copied()
}

fn quantity(text: &str) -> Option<u32> {
    if let Some(idx) = text.find(LIMITED_MARKER) {
        if let Some(n) = extract_numbers(&text[idx..]).first() {
            return Some(*n);
        }
    }
    QUANTITY_UNITS.iter().find_map(|unit| {
        let idx = text.find(*unit)?;
        let digits: String = text[..idx]
            .trim_end()
            .chars()
            .rev()
            .map(fold_width)
            .take_while(|c| c.is_ascii_digit())
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        digits.parse().ok()
    })
}
