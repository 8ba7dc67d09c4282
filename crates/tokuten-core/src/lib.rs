//! Core domain model for the Tokuten bonus tracker: seeds, observations, merged records and run reports.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tokuten-core";

const BONUS_KEY_HEX_LEN: usize = 16;

/// Canonical movie record from the metadata provider. `external_id` is the only stable join key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalMovieSeed {
    pub external_id: String,
    pub title: String,
    pub english_title: Option<String>,
    pub release_date: Option<NaiveDate>,
    pub synopsis: Option<String>,
    pub poster_url: Option<String>,
    #[serde(default)]
    pub backdrop_url: Option<String>,
    #[serde(default)]
    pub rating: Option<f64>,
}

impl CanonicalMovieSeed {
    pub fn new(external_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            title: title.into(),
            english_title: None,
            release_date: None,
            synopsis: None,
            poster_url: None,
            backdrop_url: None,
            rating: None,
        }
    }
}

/// Raw bonus offer scraped from an exhibitor or social source. Free text, no movie foreign key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBonusObservation {
    pub source_id: String,
    pub exhibitor_id: String,
    pub exhibitor_name: String,
    pub movie_title_raw: String,
    pub description: String,
    pub quantity: Option<u32>,
    pub week_index: Option<u32>,
    pub observed_at: DateTime<Utc>,
    #[serde(default)]
    pub release_date_hint: Option<NaiveDate>,
    #[serde(default)]
    pub source_url: Option<String>,
}

impl RawBonusObservation {
    /// Deterministic identity of this bonus within one movie.
    pub fn bonus_key(&self) -> String {
        bonus_key(&self.exhibitor_id, self.week_index, &self.description)
    }
}

/// Handoff contract from adapters into the sync pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "item", rename_all = "camelCase")]
pub enum SourceItem {
    Seed(CanonicalMovieSeed),
    Observation(RawBonusObservation),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataSource {
    #[serde(rename = "metadata-provider")]
    MetadataProvider,
    #[serde(rename = "manual")]
    Manual,
}

impl DataSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSource::MetadataProvider => "metadata-provider",
            DataSource::Manual => "manual",
        }
    }

    pub fn is_manual(&self) -> bool {
        matches!(self, DataSource::Manual)
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "metadata-provider" => Ok(DataSource::MetadataProvider),
            "manual" => Ok(DataSource::Manual),
            other => Err(format!("unknown data source `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExhibitorBonusGroup {
    pub exhibitor_id: String,
    pub exhibitor_name: String,
    pub bonuses: Vec<RawBonusObservation>,
}

/// Seed plus everything the merge and classify stages attach to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedMovieRecord {
    #[serde(flatten)]
    pub seed: CanonicalMovieSeed,
    pub is_rerelease: bool,
    pub data_source: DataSource,
    pub bonus_groups: Vec<ExhibitorBonusGroup>,
}

impl MergedMovieRecord {
    pub fn from_seed(seed: CanonicalMovieSeed) -> Self {
        Self {
            seed,
            is_rerelease: false,
            data_source: DataSource::MetadataProvider,
            bonus_groups: Vec::new(),
        }
    }

    pub fn external_id(&self) -> &str {
        &self.seed.external_id
    }

    pub fn bonus_count(&self) -> usize {
        self.bonus_groups.iter().map(|g| g.bonuses.len()).sum()
    }

    pub fn bonuses(&self) -> impl Iterator<Item = &RawBonusObservation> {
        self.bonus_groups.iter().flat_map(|g| g.bonuses.iter())
    }
}

/// Observation that cleared no seed's match threshold; kept for manual review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnmatchedObservation {
    #[serde(flatten)]
    pub observation: RawBonusObservation,
    pub best_score: f64,
    pub best_candidate: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Authorization,
    Configuration,
    SourceFetch,
    PersistencePrimary,
    PersistenceFallback,
    PipelineTimeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub scope: String,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(kind: ErrorKind, scope: impl Into<String>, message: impl fmt::Display) -> Self {
        Self {
            kind,
            scope: scope.into(),
            message: message.to_string(),
        }
    }

    pub fn source_fetch(source_id: &str, message: impl fmt::Display) -> Self {
        Self::new(ErrorKind::SourceFetch, source_id, message)
    }

    pub fn fallback_write(external_id: &str, message: impl fmt::Display) -> Self {
        Self::new(ErrorKind::PersistenceFallback, external_id, message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPath {
    Primary,
    Fallback,
}

/// Result of one persistence batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub path: SyncPath,
    pub saved_count: usize,
    pub skipped_count: usize,
    pub inserted_count: usize,
    pub updated_count: usize,
    pub unchanged_count: usize,
    pub errors: Vec<ErrorRecord>,
}

impl SyncOutcome {
    pub fn empty(path: SyncPath) -> Self {
        Self {
            path,
            saved_count: 0,
            skipped_count: 0,
            inserted_count: 0,
            updated_count: 0,
            unchanged_count: 0,
            errors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Idle,
    FetchingSources,
    Merging,
    Classifying,
    Persisting,
    Reported,
}

/// Structured body returned by every authorized trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub run_id: Uuid,
    pub success: bool,
    pub incomplete: bool,
    pub stage: RunStage,
    pub last_scraped_at: DateTime<Utc>,
    pub source_movie_count: usize,
    pub total_bonuses: usize,
    pub merged_movies: Vec<MergedMovieRecord>,
    pub unmatched_bonuses: Vec<UnmatchedObservation>,
    pub source_errors: Vec<ErrorRecord>,
    pub sync_outcome: Option<SyncOutcome>,
    pub timestamp: DateTime<Utc>,
}

/// Persisted movie row as seen by the write paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMovie {
    pub external_id: String,
    pub title: String,
    pub english_title: Option<String>,
    pub release_date: Option<NaiveDate>,
    pub synopsis: Option<String>,
    pub poster_url: Option<String>,
    pub backdrop_url: Option<String>,
    pub rating: Option<f64>,
    pub is_rerelease: bool,
    pub data_source: DataSource,
    pub bonuses: Vec<StoredBonus>,
}

impl StoredMovie {
    pub fn bonus(&self, bonus_key: &str) -> Option<&StoredBonus> {
        self.bonuses.iter().find(|b| b.bonus_key == bonus_key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredBonus {
    pub bonus_key: String,
    pub exhibitor_id: String,
    pub exhibitor_name: String,
    pub description: String,
    pub quantity: Option<u32>,
    pub week_index: Option<u32>,
    pub data_source: DataSource,
}

impl StoredBonus {
    pub fn from_observation(observation: &RawBonusObservation) -> Self {
        Self {
            bonus_key: observation.bonus_key(),
            exhibitor_id: observation.exhibitor_id.clone(),
            exhibitor_name: observation.exhibitor_name.clone(),
            description: observation.description.trim().to_string(),
            quantity: observation.quantity,
            week_index: observation.week_index,
            data_source: DataSource::MetadataProvider,
        }
    }
}

pub fn bonus_key(exhibitor_id: &str, week_index: Option<u32>, description: &str) -> String {
    let week = week_index.map(|w| w.to_string()).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(exhibitor_id.trim().as_bytes());
    hasher.update(b"|");
    hasher.update(week.as_bytes());
    hasher.update(b"|");
    hasher.update(fold_text(description).as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..BONUS_KEY_HEX_LEN].to_string()
}

/// Folds full-width forms to ASCII and the ideographic space to a plain space.
pub fn fold_width(c: char) -> char {
    match c {
        '\u{3000}' => ' ',
        '\u{FF01}'..='\u{FF5E}' => char::from_u32(c as u32 - 0xFEE0).unwrap_or(c),
        _ => c,
    }
}

pub fn is_separator(c: char) -> bool {
    c.is_whitespace()
        || c.is_ascii_punctuation()
        || matches!(
            c,
            '\u{00B7}'
                | '\u{2010}'..='\u{2027}'
                | '\u{3001}'..='\u{3003}'
                | '\u{3008}'..='\u{3011}'
                | '\u{3014}'..='\u{301F}'
                | '\u{30FB}'
                | '\u{FF65}'
        )
}

/// Width/case folded text with whitespace and punctuation removed.
pub fn fold_text(input: &str) -> String {
    input
        .chars()
        .map(fold_width)
        .filter(|c| !is_separator(*c))
        .flat_map(char::to_lowercase)
        .collect()
}
