//! Dual-path persistence with idempotent upserts and manual-data protection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokuten_core::{
    ErrorKind, ErrorRecord, MergedMovieRecord, StoredBonus, StoredMovie, SyncOutcome, SyncPath,
};
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PathError {
    #[error("request to persistence backend failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("persistence backend returned status {status} for {external_id}")]
    Status { status: u16, external_id: String },
    #[error("persistence call timed out after {0:?}")]
    Timeout(Duration),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decoding stored row for {external_id}: {message}")]
    Decode {
        external_id: String,
        message: String,
    },
    #[error("{0}")]
    Unavailable(String),
}

/// One durable write path keyed by `external_id`.
#[async_trait]
pub trait WritePath: Send + Sync {
    fn name(&self) -> &'static str;

    async fn load(&self, external_id: &str) -> Result<Option<StoredMovie>, PathError>;

    async fn store(&self, movie: &StoredMovie) -> Result<(), PathError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteEffect {
    Insert,
    Update,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WritePlan {
    pub movie: StoredMovie,
    pub effect: WriteEffect,
    /// Bonus keys dropped because the stored row is manually curated.
    pub skipped: Vec<String>,
}

fn sort_bonuses(bonuses: &mut [StoredBonus]) {
    bonuses.sort_by(|a, b| {
        (&a.exhibitor_id, a.week_index, &a.bonus_key).cmp(&(&b.exhibitor_id, b.week_index, &b.bonus_key))
    });
}

/// Computes the row a record should leave behind, given what is stored now.
pub fn plan_write(existing: Option<&StoredMovie>, record: &MergedMovieRecord) -> WritePlan {
    let seed = &record.seed;
    let Some(current) = existing else {
        let mut bonuses: Vec<StoredBonus> = Vec::new();
        for obs in record.bonuses() {
            let bonus = StoredBonus::from_observation(obs);
            if !bonuses.iter().any(|b| b.bonus_key == bonus.bonus_key) {
                bonuses.push(bonus);
            }
        }
        sort_bonuses(&mut bonuses);
        return WritePlan {
            movie: StoredMovie {
                external_id: seed.external_id.clone(),
                title: seed.title.clone(),
                english_title: seed.english_title.clone(),
                release_date: seed.release_date,
                synopsis: seed.synopsis.clone(),
                poster_url: seed.poster_url.clone(),
                backdrop_url: seed.backdrop_url.clone(),
                rating: seed.rating,
                is_rerelease: record.is_rerelease,
                data_source: record.data_source,
                bonuses,
            },
            effect: WriteEffect::Insert,
            skipped: Vec::new(),
        };
    };

    let mut baseline = current.clone();
    sort_bonuses(&mut baseline.bonuses);
    let mut movie = baseline.clone();

    if !current.data_source.is_manual() {
        movie.title = seed.title.clone();
        movie.english_title = seed.english_title.clone().or(movie.english_title);
        movie.release_date = seed.release_date.or(movie.release_date);
        movie.synopsis = seed.synopsis.clone().or(movie.synopsis);
        movie.poster_url = seed.poster_url.clone().or(movie.poster_url);
        movie.backdrop_url = seed.backdrop_url.clone().or(movie.backdrop_url);
        movie.rating = seed.rating.or(movie.rating);
    }
    movie.is_rerelease = current.is_rerelease || record.is_rerelease;

    let mut skipped = Vec::new();
    for obs in record.bonuses() {
        let incoming = StoredBonus::from_observation(obs);
        match movie
            .bonuses
            .iter_mut()
            .find(|b| b.bonus_key == incoming.bonus_key)
        {
            Some(stored) if stored.data_source.is_manual() => {
                if !skipped.contains(&incoming.bonus_key) {
                    skipped.push(incoming.bonus_key);
                }
            }
            Some(stored) => *stored = incoming,
            None => movie.bonuses.push(incoming),
        }
    }
    sort_bonuses(&mut movie.bonuses);

    let effect = if movie == baseline {
        WriteEffect::Unchanged
    } else {
        WriteEffect::Update
    };
    WritePlan {
        movie,
        effect,
        skipped,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GatewayConfig {
    pub primary_timeout: Duration,
    pub max_concurrent_writes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            primary_timeout: Duration::from_secs(10),
            max_concurrent_writes: 8,
        }
    }
}

#[derive(Debug, Default)]
struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    async fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut map = self.locks.lock().await;
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drops the entry once no other writer holds or waits on it.
    async fn release(&self, key: &str, lock: Arc<Mutex<()>>) {
        let mut map = self.locks.lock().await;
        if Arc::strong_count(&lock) <= 2 {
            map.remove(key);
        }
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }
}

struct RecordResult {
    external_id: String,
    path: SyncPath,
    outcome: Result<WritePlan, PathError>,
}

#[derive(Clone)]
pub struct PersistenceGateway {
    primary: Option<Arc<dyn WritePath>>,
    fallback: Arc<dyn WritePath>,
    config: GatewayConfig,
    locks: Arc<KeyedLocks>,
}

impl PersistenceGateway {
    pub fn new(
        primary: Option<Arc<dyn WritePath>>,
        fallback: Arc<dyn WritePath>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            primary,
            fallback,
            config,
            locks: Arc::new(KeyedLocks::default()),
        }
    }

    pub fn fallback_only(fallback: Arc<dyn WritePath>, config: GatewayConfig) -> Self {
        Self::new(None, fallback, config)
    }

    pub fn has_primary(&self) -> bool {
        self.primary.is_some()
    }

    /// Writes every record, never failing the batch for one record's error.
    pub async fn sync(
        &self,
        records: &[MergedMovieRecord],
        cancel: &CancellationToken,
    ) -> SyncOutcome {
        self.sync_batch(records, cancel).await.0
    }

    /// Like [`sync`](Self::sync), then copies the persisted re-release flag back onto each
    /// written record so callers report what storage holds.
    pub async fn sync_records(
        &self,
        records: &mut [MergedMovieRecord],
        cancel: &CancellationToken,
    ) -> SyncOutcome {
        let (outcome, persisted) = self.sync_batch(records, cancel).await;
        for record in records.iter_mut() {
            if let Some(&flag) = persisted.get(record.external_id()) {
                record.is_rerelease = flag;
            }
        }
        outcome
    }

    async fn sync_batch(
        &self,
        records: &[MergedMovieRecord],
        cancel: &CancellationToken,
    ) -> (SyncOutcome, HashMap<String, bool>) {
        let default_path = if self.primary.is_some() {
            SyncPath::Primary
        } else {
            SyncPath::Fallback
        };
        let mut outcome = SyncOutcome::empty(default_path);
        let mut persisted = HashMap::new();
        let primary_healthy = Arc::new(AtomicBool::new(self.primary.is_some()));
        let limit = Arc::new(Semaphore::new(self.config.max_concurrent_writes.max(1)));
        let mut tasks = JoinSet::new();

        for record in records.iter().cloned() {
            let gateway = self.clone();
            let healthy = primary_healthy.clone();
            let limit = limit.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let external_id = record.external_id().to_string();
                let Ok(_permit) = limit.acquire_owned().await else {
                    return None;
                };
                if cancel.is_cancelled() {
                    return None;
                }
                Some(gateway.write_one(external_id, record, healthy).await)
            });
        }

        loop {
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!(pending = tasks.len(), "persistence cancelled; abandoning pending writes");
                    tasks.abort_all();
                    break;
                }
                joined = tasks.join_next() => joined,
            };
            let Some(joined) = joined else { break };
            match joined {
                Ok(Some(result)) => {
                    if let Ok(plan) = &result.outcome {
                        persisted.insert(result.external_id.clone(), plan.movie.is_rerelease);
                    }
                    tally(&mut outcome, result)
                }
                Ok(None) => {}
                Err(err) if err.is_cancelled() => {}
                Err(err) => outcome.errors.push(ErrorRecord::new(
                    ErrorKind::PersistenceFallback,
                    "persistence-task",
                    format!("write task panicked: {err}"),
                )),
            }
        }

        info!(
            path = ?outcome.path,
            saved = outcome.saved_count,
            skipped = outcome.skipped_count,
            unchanged = outcome.unchanged_count,
            errors = outcome.errors.len(),
            "persistence batch finished"
        );
        (outcome, persisted)
    }

    async fn write_one(
        &self,
        external_id: String,
        record: MergedMovieRecord,
        primary_healthy: Arc<AtomicBool>,
    ) -> RecordResult {
        let lock = self.locks.lock_for(&external_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.write_locked(external_id.clone(), &record, &primary_healthy).await
        };
        self.locks.release(&external_id, lock).await;
        result
    }

    async fn write_locked(
        &self,
        external_id: String,
        record: &MergedMovieRecord,
        primary_healthy: &AtomicBool,
    ) -> RecordResult {
        if let Some(primary) = &self.primary {
            if primary_healthy.load(Ordering::SeqCst) {
                let attempt = tokio::time::timeout(
                    self.config.primary_timeout,
                    apply_record(primary.as_ref(), record),
                )
                .await
                .unwrap_or(Err(PathError::Timeout(self.config.primary_timeout)));
                match attempt {
                    Ok(plan) => {
                        return RecordResult {
                            external_id,
                            path: SyncPath::Primary,
                            outcome: Ok(plan),
                        }
                    }
                    Err(err) => {
                        warn!(
                            external_id = %external_id,
                            path = primary.name(),
                            error = %err,
                            "primary persistence failed; switching batch to fallback"
                        );
                        primary_healthy.store(false, Ordering::SeqCst);
                    }
                }
            }
        }

        RecordResult {
            outcome: apply_record(self.fallback.as_ref(), record).await,
            external_id,
            path: SyncPath::Fallback,
        }
    }
}

async fn apply_record(path: &dyn WritePath, record: &MergedMovieRecord) -> Result<WritePlan, PathError> {
    let existing = path.load(record.external_id()).await?;
    let plan = plan_write(existing.as_ref(), record);
    if plan.effect != WriteEffect::Unchanged {
        path.store(&plan.movie).await?;
    }
    for key in &plan.skipped {
        info!(
            external_id = record.external_id(),
            bonus_key = %key,
            "skipping manually curated bonus"
        );
    }
    Ok(plan)
}

fn tally(outcome: &mut SyncOutcome, result: RecordResult) {
    if result.path == SyncPath::Fallback {
        outcome.path = SyncPath::Fallback;
    }
    match result.outcome {
        Ok(plan) => {
            outcome.saved_count += 1;
            outcome.skipped_count += plan.skipped.len();
            match plan.effect {
                WriteEffect::Insert => outcome.inserted_count += 1,
                WriteEffect::Update => outcome.updated_count += 1,
                WriteEffect::Unchanged => outcome.unchanged_count += 1,
            }
        }
        Err(err) => {
            warn!(external_id = %result.external_id, error = %err, "fallback persistence failed");
            outcome
                .errors
                .push(ErrorRecord::fallback_write(&result.external_id, err));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::AtomicUsize;
    use tokuten_core::{
        CanonicalMovieSeed, DataSource, ExhibitorBonusGroup, RawBonusObservation,
    };

    struct DownPath {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl WritePath for DownPath {
        fn name(&self) -> &'static str {
            "down"
        }

        async fn load(&self, _external_id: &str) -> Result<Option<StoredMovie>, PathError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(PathError::Unavailable("connection refused".into()))
        }

        async fn store(&self, _movie: &StoredMovie) -> Result<(), PathError> {
            Err(PathError::Unavailable("connection refused".into()))
        }
    }

    /// Counts how many stores run at once.
    #[derive(Default)]
    struct SlowPath {
        inner: InMemoryStore,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl WritePath for SlowPath {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn load(&self, external_id: &str) -> Result<Option<StoredMovie>, PathError> {
            self.inner.load(external_id).await
        }

        async fn store(&self, movie: &StoredMovie) -> Result<(), PathError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            let stored = self.inner.store(movie).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            stored
        }
    }

    fn observation(description: &str, week: u32) -> RawBonusObservation {
        RawBonusObservation {
            source_id: "cinema-a".into(),
            exhibitor_id: "A".into(),
            exhibitor_name: "Cinema A".into(),
            movie_title_raw: "鬼滅之刃 劇場版".into(),
            description: description.into(),
            quantity: Some(100),
            week_index: Some(week),
            observed_at: Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).unwrap(),
            release_date_hint: None,
            source_url: None,
        }
    }

    fn record(id: &str, bonuses: Vec<RawBonusObservation>) -> MergedMovieRecord {
        let mut record = MergedMovieRecord::from_seed(CanonicalMovieSeed::new(id, "鬼滅之刃"));
        if !bonuses.is_empty() {
            record.bonus_groups.push(ExhibitorBonusGroup {
                exhibitor_id: "A".into(),
                exhibitor_name: "Cinema A".into(),
                bonuses,
            });
        }
        record
    }

    #[test]
    fn plan_inserts_absent_rows_as_metadata_provider() {
        let plan = plan_write(None, &record("100", vec![observation("入場海報", 1)]));
        assert_eq!(plan.effect, WriteEffect::Insert);
        assert_eq!(plan.movie.data_source, DataSource::MetadataProvider);
        assert_eq!(plan.movie.bonuses.len(), 1);
        assert_eq!(plan.movie.bonuses[0].data_source, DataSource::MetadataProvider);
    }

    #[test]
    fn replanning_the_written_row_is_unchanged() {
        let incoming = record("100", vec![observation("入場海報", 1), observation("色紙", 2)]);
        let first = plan_write(None, &incoming);
        let second = plan_write(Some(&first.movie), &incoming);
        assert_eq!(second.effect, WriteEffect::Unchanged);
        assert_eq!(second.movie, first.movie);
    }

    #[test]
    fn manual_bonus_is_skipped_and_left_intact() {
        let incoming = record("100", vec![observation("入場海報", 1)]);
        let mut stored = plan_write(None, &incoming).movie;
        stored.bonuses[0].data_source = DataSource::Manual;
        stored.bonuses[0].quantity = Some(3);
        stored.bonuses[0].description = "入場海報（手動校正）".into();

        let plan = plan_write(Some(&stored), &incoming);
        assert_eq!(plan.skipped, vec![incoming.bonus_groups[0].bonuses[0].bonus_key()]);
        assert_eq!(plan.effect, WriteEffect::Unchanged);
        assert_eq!(plan.movie.bonuses[0].quantity, Some(3));
        assert_eq!(plan.movie.bonuses[0].description, "入場海報（手動校正）");
    }

    #[test]
    fn manual_movie_keeps_curated_fields_but_accepts_new_bonuses() {
        let mut stored = plan_write(None, &record("100", vec![])).movie;
        stored.data_source = DataSource::Manual;
        stored.title = "鬼滅之刃 無限列車篇".into();

        let mut incoming = record("100", vec![observation("入場海報", 1)]);
        incoming.is_rerelease = true;
        let plan = plan_write(Some(&stored), &incoming);
        assert_eq!(plan.effect, WriteEffect::Update);
        assert_eq!(plan.movie.title, "鬼滅之刃 無限列車篇");
        assert!(plan.movie.is_rerelease);
        assert_eq!(plan.movie.bonuses.len(), 1);
    }

    #[test]
    fn stored_rerelease_flag_is_never_cleared() {
        let mut stored = plan_write(None, &record("100", vec![])).movie;
        stored.is_rerelease = true;
        let plan = plan_write(Some(&stored), &record("100", vec![]));
        assert!(plan.movie.is_rerelease);
        assert_eq!(plan.effect, WriteEffect::Unchanged);
    }

    #[tokio::test]
    async fn falls_back_when_primary_is_down() {
        let primary = Arc::new(DownPath {
            calls: AtomicUsize::new(0),
        });
        let store = Arc::new(InMemoryStore::new());
        let gateway = PersistenceGateway::new(
            Some(primary.clone()),
            store.clone(),
            GatewayConfig {
                max_concurrent_writes: 1,
                ..Default::default()
            },
        );
        let records = vec![
            record("100", vec![observation("入場海報", 1)]),
            record("200", vec![]),
            record("300", vec![]),
        ];

        let outcome = gateway.sync(&records, &CancellationToken::new()).await;
        assert_eq!(outcome.path, SyncPath::Fallback);
        assert_eq!(outcome.saved_count, 3);
        assert!(outcome.errors.is_empty());
        assert_eq!(store.len().await, 3);
        // The first failure marks the primary unhealthy for the rest of the batch.
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fallback_failure_is_reported_per_record() {
        let gateway = PersistenceGateway::fallback_only(
            Arc::new(DownPath {
                calls: AtomicUsize::new(0),
            }),
            GatewayConfig::default(),
        );
        let outcome = gateway
            .sync(&[record("100", vec![]), record("200", vec![])], &CancellationToken::new())
            .await;
        assert_eq!(outcome.path, SyncPath::Fallback);
        assert_eq!(outcome.saved_count, 0);
        assert_eq!(outcome.errors.len(), 2);
        assert!(outcome
            .errors
            .iter()
            .all(|e| e.kind == ErrorKind::PersistenceFallback));
    }

    #[tokio::test]
    async fn second_sync_of_same_records_is_a_no_op() {
        let store = Arc::new(InMemoryStore::new());
        let gateway = PersistenceGateway::fallback_only(store.clone(), GatewayConfig::default());
        let records = vec![record("200", vec![observation("入場海報", 1)])];

        let first = gateway.sync(&records, &CancellationToken::new()).await;
        let second = gateway.sync(&records, &CancellationToken::new()).await;
        assert_eq!(first.inserted_count, 1);
        assert_eq!(second.unchanged_count, 1);
        assert_eq!(second.updated_count, 0);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn writes_for_one_external_id_never_overlap() {
        let path = Arc::new(SlowPath::default());
        let gateway = PersistenceGateway::fallback_only(path.clone(), GatewayConfig::default());
        let first = vec![record("100", vec![observation("入場海報", 1)])];
        let second = vec![record("100", vec![observation("色紙", 2)])];
        let cancel = CancellationToken::new();

        let (a, b) = tokio::join!(gateway.sync(&first, &cancel), gateway.sync(&second, &cancel));
        assert_eq!(a.saved_count + b.saved_count, 2);
        assert_eq!(path.peak.load(Ordering::SeqCst), 1);
        let stored = path.inner.get("100").await.expect("row");
        assert_eq!(stored.bonuses.len(), 2);
        assert_eq!(gateway.locks.len().await, 0);
    }

    #[tokio::test]
    async fn different_external_ids_write_concurrently() {
        let path = Arc::new(SlowPath::default());
        let gateway = PersistenceGateway::fallback_only(path.clone(), GatewayConfig::default());
        let records = vec![record("100", vec![]), record("200", vec![])];
        let outcome = gateway.sync(&records, &CancellationToken::new()).await;
        assert_eq!(outcome.saved_count, 2);
        assert_eq!(path.peak.load(Ordering::SeqCst), 2);
        assert_eq!(gateway.locks.len().await, 0);
    }

    #[tokio::test]
    async fn sync_records_reports_the_persisted_rerelease_flag() {
        let store = Arc::new(InMemoryStore::new());
        let mut stored = plan_write(None, &record("100", vec![])).movie;
        stored.is_rerelease = true;
        store.put(stored).await;
        let gateway = PersistenceGateway::fallback_only(store, GatewayConfig::default());

        let mut records = vec![record("100", vec![]), record("200", vec![])];
        gateway.sync_records(&mut records, &CancellationToken::new()).await;
        assert!(records[0].is_rerelease);
        assert!(!records[1].is_rerelease);
    }

    #[tokio::test]
    async fn cancelled_batch_writes_nothing_new() {
        let store = Arc::new(InMemoryStore::new());
        let gateway = PersistenceGateway::fallback_only(store.clone(), GatewayConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = gateway.sync(&[record("100", vec![])], &cancel).await;
        assert_eq!(outcome.saved_count, 0);
        assert!(store.is_empty().await);
    }
}
