//! Keyword heuristic flagging theatrical re-releases.

use tokuten_core::{fold_text, MergedMovieRecord};

pub const RERELEASE_PHRASES: [&str; 13] = [
    "數位修復",
    "数位修复",
    "重映",
    "重新上映",
    "週年紀念",
    "周年纪念",
    "經典回歸",
    "4K修復",
    "リバイバル",
    "re-release",
    "rerelease",
    "remastered",
    "anniversary",
];

#[derive(Debug, Clone)]
pub struct RereleaseClassifier {
    phrases: Vec<String>,
}

impl Default for RereleaseClassifier {
    fn default() -> Self {
        Self::with_phrases(RERELEASE_PHRASES)
    }
}

impl RereleaseClassifier {
    pub fn with_phrases<I, S>(phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut phrases: Vec<String> = phrases
            .into_iter()
            .map(|p| fold_text(p.as_ref()))
            .filter(|p| !p.is_empty())
            .collect();
        phrases.dedup();
        Self { phrases }
    }

    pub fn is_rerelease(&self, title: &str, synopsis: Option<&str>) -> bool {
        let text = fold_text(&format!("{title} {}", synopsis.unwrap_or_default()));
        self.phrases.iter().any(|p| text.contains(p.as_str()))
    }

    /// Never turns a known re-release back into a first run.
    pub fn classify(&self, prior: bool, title: &str, synopsis: Option<&str>) -> bool {
        prior || self.is_rerelease(title, synopsis)
    }

    pub fn apply(&self, record: &mut MergedMovieRecord) {
        let seed = &record.seed;
        let english = seed.english_title.as_deref().unwrap_or_default();
        let flagged = self.classify(
            record.is_rerelease,
            &format!("{} {english}", seed.title),
            seed.synopsis.as_deref(),
        );
        record.is_rerelease = flagged;
    }
}
