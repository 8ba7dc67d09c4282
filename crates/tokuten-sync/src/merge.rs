//! Joins free-text bonus observations to canonical movie seeds.
//!
//! Scoring mixes token overlap (Dice over Latin words and CJK bigrams), Jaro-Winkler over the
//! folded titles, and a containment bonus, minus a penalty when release dates disagree.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use strsim::jaro_winkler;
use tokuten_core::{
    fold_text, fold_width, is_separator, CanonicalMovieSeed, ExhibitorBonusGroup,
    MergedMovieRecord, RawBonusObservation, UnmatchedObservation,
};

pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.50;
pub const DEFAULT_DATE_WINDOW_DAYS: i64 = 120;

const TOKEN_WEIGHT: f64 = 0.55;
const JARO_WEIGHT: f64 = 0.15;
const CONTAINMENT_WEIGHT: f64 = 0.30;
const DATE_PENALTY: f64 = 0.20;
const MIN_CONTAINED_CHARS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergeConfig {
    pub threshold: f64,
    pub date_window_days: i64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
            date_window_days: DEFAULT_DATE_WINDOW_DAYS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutput {
    pub records: Vec<MergedMovieRecord>,
    pub unmatched: Vec<UnmatchedObservation>,
}

impl MergeOutput {
    pub fn total_bonuses(&self) -> usize {
        self.records.iter().map(MergedMovieRecord::bonus_count).sum()
    }
}

/// Width/case folded title without whitespace or punctuation.
pub fn normalize_title(title: &str) -> String {
    fold_text(title)
}

/// Latin/digit words whole, CJK runs as overlapping character bigrams.
pub fn title_tokens(title: &str) -> Vec<String> {
    let folded: String = title
        .chars()
        .map(fold_width)
        .flat_map(char::to_lowercase)
        .collect();
    let mut tokens = Vec::new();
    for segment in folded.split(is_separator).filter(|s| !s.is_empty()) {
        let mut word = String::new();
        let mut run: Vec<char> = Vec::new();
        for c in segment.chars() {
            if c.is_ascii_alphanumeric() {
                push_cjk_run(&mut tokens, &mut run);
                word.push(c);
            } else {
                if !word.is_empty() {
                    tokens.push(std::mem::take(&mut word));
                }
                run.push(c);
            }
        }
        if !word.is_empty() {
            tokens.push(word);
        }
        push_cjk_run(&mut tokens, &mut run);
    }
    tokens
}

fn push_cjk_run(tokens: &mut Vec<String>, run: &mut Vec<char>) {
    match run.len() {
        0 => {}
        1 => tokens.push(run[0].to_string()),
        _ => tokens.extend(run.windows(2).map(|pair| pair.iter().collect::<String>())),
    }
    run.clear();
}

fn dice(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for token in a {
        *counts.entry(token.as_str()).or_default() += 1;
    }
    let mut shared = 0usize;
    for token in b {
        if let Some(n) = counts.get_mut(token.as_str()) {
            if *n > 0 {
                *n -= 1;
                shared += 1;
            }
        }
    }
    (2 * shared) as f64 / (a.len() + b.len()) as f64
}

fn containment(a: &str, b: &str) -> f64 {
    let (short, long) = if a.chars().count() <= b.chars().count() {
        (a, b)
    } else {
        (b, a)
    };
    if short.chars().count() >= MIN_CONTAINED_CHARS && long.contains(short) {
        1.0
    } else {
        0.0
    }
}

/// Title similarity in `[0, 1]` before any date penalty.
pub fn title_similarity(a: &str, b: &str) -> f64 {
    let (na, nb) = (normalize_title(a), normalize_title(b));
    if na.is_empty() || nb.is_empty() {
        return 0.0;
    }
    let score = TOKEN_WEIGHT * dice(&title_tokens(a), &title_tokens(b))
        + JARO_WEIGHT * jaro_winkler(&na, &nb)
        + CONTAINMENT_WEIGHT * containment(&na, &nb);
    score.clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Copy)]
struct Candidate<'a> {
    seed: &'a CanonicalMovieSeed,
    score: f64,
}

/// Higher score first, then earlier release date (unknown last), then smaller external id.
fn better(a: &Candidate<'_>, b: &Candidate<'_>) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| match (a.seed.release_date, b.seed.release_date) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.seed.external_id.cmp(&b.seed.external_id))
}

#[derive(Debug, Clone, Default)]
pub struct MergeEngine {
    config: MergeConfig,
}

impl MergeEngine {
    pub fn new(config: MergeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    /// Score of one observation against one seed; the seed's english title counts too.
    pub fn score(&self, seed: &CanonicalMovieSeed, observation: &RawBonusObservation) -> f64 {
        let raw = &observation.movie_title_raw;
        let title_score = std::iter::once(seed.title.as_str())
            .chain(seed.english_title.as_deref())
            .map(|t| title_similarity(t, raw))
            .fold(0.0, f64::max);
        let penalty = match (seed.release_date, observation.release_date_hint) {
            (Some(a), Some(b)) if (a - b).num_days().abs() > self.config.date_window_days => {
                DATE_PENALTY
            }
            _ => 0.0,
        };
        (title_score - penalty).clamp(0.0, 1.0)
    }

    fn best_candidate<'a>(
        &self,
        seeds: &'a [CanonicalMovieSeed],
        observation: &RawBonusObservation,
    ) -> Option<Candidate<'a>> {
        seeds
            .iter()
            .map(|seed| Candidate {
                seed,
                score: self.score(seed, observation),
            })
            .min_by(better)
    }

    /// Deterministic for a given input multiset: seeds are deduplicated by external id (first
    /// wins) and records come back ordered by external id.
    pub fn merge(
        &self,
        seeds: &[CanonicalMovieSeed],
        observations: &[RawBonusObservation],
    ) -> MergeOutput {
        let mut unique: BTreeMap<&str, &CanonicalMovieSeed> = BTreeMap::new();
        for seed in seeds {
            unique.entry(seed.external_id.as_str()).or_insert(seed);
        }
        let seeds: Vec<CanonicalMovieSeed> = unique.values().map(|s| (*s).clone()).collect();

        let mut ordered: Vec<&RawBonusObservation> = observations.iter().collect();
        ordered.sort_by(|a, b| {
            (&a.source_id, a.observed_at, &a.movie_title_raw, &a.description).cmp(&(
                &b.source_id,
                b.observed_at,
                &b.movie_title_raw,
                &b.description,
            ))
        });

        let mut matched: BTreeMap<String, Vec<RawBonusObservation>> = BTreeMap::new();
        let mut unmatched = Vec::new();
        for observation in ordered {
            let best = self.best_candidate(&seeds, observation);
            match best {
                Some(c) if c.score >= self.config.threshold => {
                    matched
                        .entry(c.seed.external_id.clone())
                        .or_default()
                        .push(observation.clone());
                }
                _ => unmatched.push(UnmatchedObservation {
                    observation: observation.clone(),
                    best_score: best.map(|c| c.score).unwrap_or(0.0),
                    best_candidate: best
                        .filter(|c| c.score > 0.0)
                        .map(|c| c.seed.external_id.clone()),
                }),
            }
        }

        let records = seeds
            .into_iter()
            .map(|seed| {
                let bonuses = matched.remove(&seed.external_id).unwrap_or_default();
                let mut record = MergedMovieRecord::from_seed(seed);
                record.bonus_groups = group_by_exhibitor(bonuses);
                record
            })
            .collect();

        MergeOutput { records, unmatched }
    }
}

/// Collapses repeated bonus keys to their first sighting and groups the rest per exhibitor.
fn group_by_exhibitor(bonuses: Vec<RawBonusObservation>) -> Vec<ExhibitorBonusGroup> {
    let mut groups: BTreeMap<String, ExhibitorBonusGroup> = BTreeMap::new();
    let mut seen_keys = Vec::new();
    for bonus in bonuses {
        let key = bonus.bonus_key();
        if seen_keys.contains(&key) {
            continue;
        }
        seen_keys.push(key);
        groups
            .entry(bonus.exhibitor_id.clone())
            .or_insert_with(|| ExhibitorBonusGroup {
                exhibitor_id: bonus.exhibitor_id.clone(),
                exhibitor_name: bonus.exhibitor_name.clone(),
                bonuses: Vec::new(),
            })
            .bonuses
            .push(bonus);
    }
    groups
        .into_values()
        .map(|mut group| {
            group
                .bonuses
                .sort_by(|a, b| (a.week_index, &a.description).cmp(&(b.week_index, &b.description)));
            group
        })
        .collect()
}
