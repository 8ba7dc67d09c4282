use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokuten_adapters::{AdapterContext, AdapterError, FetchedPage, SourceAdapter, SourceKind};
use tokuten_core::{
    CanonicalMovieSeed, DataSource, ErrorKind, MergedMovieRecord, RawBonusObservation, RunStage,
    SourceItem, SyncPath,
};
use tokuten_storage::{
    plan_write, GatewayConfig, HttpBackend, HttpBackendConfig, HttpFetcher, InMemoryStore,
    PersistenceGateway,
};
use tokuten_sync::{CoordinatorOptions, SyncCoordinator, DAILY_BRIEF_FILE, RUN_REPORT_FILE};

enum Behavior {
    Items(Vec<SourceItem>),
    Fail,
    Panic,
    Hang,
}

struct StubAdapter {
    id: String,
    behavior: Behavior,
}

fn stub(id: &str, behavior: Behavior) -> Arc<dyn SourceAdapter> {
    Arc::new(StubAdapter {
        id: id.to_string(),
        behavior,
    })
}

#[async_trait]
impl SourceAdapter for StubAdapter {
    fn source_id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::EditorialTracker
    }

    fn targets(&self) -> Vec<String> {
        Vec::new()
    }

    fn parse(&self, _page: &FetchedPage) -> Result<Vec<SourceItem>, AdapterError> {
        Ok(Vec::new())
    }

    async fn fetch(
        &self,
        _http: &HttpFetcher,
        _ctx: &AdapterContext,
    ) -> Result<Vec<SourceItem>, AdapterError> {
        match &self.behavior {
            Behavior::Items(items) => Ok(items.clone()),
            Behavior::Fail => Err(AdapterError::Parse {
                url: "https://down.example/feed".into(),
                message: "unexpected markup".into(),
            }),
            Behavior::Panic => panic!("adapter bug"),
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(Vec::new())
            }
        }
    }
}

fn seed(id: &str, title: &str) -> SourceItem {
    SourceItem::Seed(CanonicalMovieSeed::new(id, title))
}

fn observation(source: &str, exhibitor: &str, title: &str, description: &str, week: u32) -> SourceItem {
    SourceItem::Observation(RawBonusObservation {
        source_id: source.into(),
        exhibitor_id: exhibitor.into(),
        exhibitor_name: format!("Cinema {exhibitor}"),
        movie_title_raw: title.into(),
        description: description.into(),
        quantity: None,
        week_index: Some(week),
        observed_at: Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).unwrap(),
        release_date_hint: None,
        source_url: None,
    })
}

fn http() -> Arc<HttpFetcher> {
    Arc::new(HttpFetcher::new(Default::default()).expect("fetcher"))
}

fn coordinator(
    adapters: Vec<Arc<dyn SourceAdapter>>,
    store: &Arc<InMemoryStore>,
    options: CoordinatorOptions,
) -> SyncCoordinator {
    let gateway = PersistenceGateway::fallback_only(store.clone(), GatewayConfig::default());
    SyncCoordinator::new(adapters, http(), gateway, options)
}

fn demon_slayer_sources() -> Vec<Arc<dyn SourceAdapter>> {
    vec![
        stub("tmdb", Behavior::Items(vec![seed("100", "鬼滅之刃")])),
        stub(
            "cinema-a",
            Behavior::Items(vec![observation("cinema-a", "A", "鬼滅之刃 劇場版", "入場海報", 1)]),
        ),
    ]
}

#[tokio::test]
async fn seed_and_observation_merge_into_one_grouped_record() {
    let store = Arc::new(InMemoryStore::new());
    let report = coordinator(demon_slayer_sources(), &store, CoordinatorOptions::default())
        .run()
        .await;

    assert!(report.success);
    assert!(!report.incomplete);
    assert_eq!(report.stage, RunStage::Reported);
    assert_eq!(report.source_movie_count, 1);
    assert_eq!(report.total_bonuses, 1);
    assert_eq!(report.merged_movies.len(), 1);
    let record = &report.merged_movies[0];
    assert_eq!(record.external_id(), "100");
    assert_eq!(record.bonus_groups.len(), 1);
    assert_eq!(record.bonus_groups[0].exhibitor_id, "A");
    assert_eq!(record.bonus_groups[0].bonuses.len(), 1);

    let outcome = report.sync_outcome.expect("persisted");
    assert_eq!(outcome.path, SyncPath::Fallback);
    assert_eq!(outcome.saved_count, 1);
    assert_eq!(outcome.inserted_count, 1);
    let stored = store.get("100").await.expect("row written");
    assert_eq!(stored.bonuses.len(), 1);
    assert_eq!(stored.bonuses[0].description, "入場海報");
}

#[tokio::test]
async fn unrelated_titles_land_in_unmatched_bonuses() {
    let store = Arc::new(InMemoryStore::new());
    let adapters = vec![
        stub("tmdb", Behavior::Items(vec![seed("100", "鬼滅之刃")])),
        stub(
            "cinema-a",
            Behavior::Items(vec![
                observation("cinema-a", "A", "鬼滅之刃 劇場版", "入場海報", 1),
                observation("cinema-a", "A", "航海王", "海賊旗", 1),
            ]),
        ),
    ];
    let report = coordinator(adapters, &store, CoordinatorOptions::default())
        .run()
        .await;

    assert_eq!(report.total_bonuses, 1);
    assert_eq!(report.unmatched_bonuses.len(), 1);
    assert_eq!(report.unmatched_bonuses[0].observation.movie_title_raw, "航海王");

    let body = serde_json::to_value(&report).expect("json");
    assert_eq!(body["unmatchedBonuses"][0]["movieTitleRaw"], "航海王");
    assert!(body["lastScrapedAt"].is_string());
    assert_eq!(body["syncOutcome"]["path"], "fallback");
}

#[tokio::test]
async fn second_run_on_same_snapshot_changes_nothing() {
    let store = Arc::new(InMemoryStore::new());
    let first = coordinator(demon_slayer_sources(), &store, CoordinatorOptions::default())
        .run()
        .await;
    let after_first = store.snapshot().await;

    let second = coordinator(demon_slayer_sources(), &store, CoordinatorOptions::default())
        .run()
        .await;
    let after_second = store.snapshot().await;

    assert_eq!(after_first, after_second);
    assert_eq!(first.sync_outcome.expect("first").inserted_count, 1);
    let second = second.sync_outcome.expect("second");
    assert_eq!(second.unchanged_count, 1);
    assert_eq!(second.inserted_count + second.updated_count, 0);
}

#[tokio::test]
async fn repeated_seed_is_stored_once() {
    let store = Arc::new(InMemoryStore::new());
    for _ in 0..2 {
        let adapters = vec![stub("tmdb", Behavior::Items(vec![seed("200", "航海王"), seed("200", "航海王")]))];
        coordinator(adapters, &store, CoordinatorOptions::default())
            .run()
            .await;
    }
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn manual_bonus_survives_sync() {
    let store = Arc::new(InMemoryStore::new());
    let mut record = MergedMovieRecord::from_seed(CanonicalMovieSeed::new("100", "鬼滅之刃"));
    let SourceItem::Observation(obs) = observation("cinema-a", "A", "鬼滅之刃 劇場版", "入場海報", 1) else {
        unreachable!();
    };
    record.bonus_groups.push(tokuten_core::ExhibitorBonusGroup {
        exhibitor_id: "A".into(),
        exhibitor_name: "Cinema A".into(),
        bonuses: vec![obs],
    });
    let mut curated = plan_write(None, &record).movie;
    curated.bonuses[0].data_source = DataSource::Manual;
    curated.bonuses[0].quantity = Some(42);
    store.put(curated.clone()).await;

    let report = coordinator(demon_slayer_sources(), &store, CoordinatorOptions::default())
        .run()
        .await;

    assert_eq!(report.sync_outcome.expect("persisted").skipped_count, 1);
    let stored = store.get("100").await.expect("row");
    assert_eq!(stored.bonuses, curated.bonuses);
}

#[tokio::test]
async fn failing_sources_are_isolated() {
    let store = Arc::new(InMemoryStore::new());
    let mut adapters = demon_slayer_sources();
    adapters.push(stub("broken", Behavior::Fail));
    adapters.push(stub("buggy", Behavior::Panic));
    adapters.push(stub("slow", Behavior::Hang));
    let options = CoordinatorOptions {
        adapter_timeout: Duration::from_millis(200),
        ..Default::default()
    };

    let report = coordinator(adapters, &store, options).run().await;

    assert!(!report.incomplete);
    assert!(report.success);
    let mut failed: Vec<_> = report
        .source_errors
        .iter()
        .map(|e| {
            assert_eq!(e.kind, ErrorKind::SourceFetch);
            e.scope.as_str()
        })
        .collect();
    failed.sort();
    assert_eq!(failed, vec!["broken", "buggy", "slow"]);
    assert_eq!(report.total_bonuses, 1);
    assert_eq!(report.sync_outcome.expect("persisted").saved_count, 1);
    assert_eq!(store.get("100").await.expect("row").bonuses.len(), 1);
}

#[tokio::test]
async fn run_deadline_returns_partial_results() {
    let store = Arc::new(InMemoryStore::new());
    let adapters = vec![
        stub("tmdb", Behavior::Items(vec![seed("100", "鬼滅之刃")])),
        stub("slow", Behavior::Hang),
    ];
    let options = CoordinatorOptions {
        run_timeout: Duration::from_millis(200),
        adapter_timeout: Duration::from_secs(60),
        ..Default::default()
    };

    let report = coordinator(adapters, &store, options).run().await;

    assert!(report.incomplete);
    assert!(!report.success);
    assert_eq!(report.stage, RunStage::Reported);
    assert!(report.sync_outcome.is_none());
    assert_eq!(report.merged_movies.len(), 1, "fetched seeds are still merged");
    assert!(report
        .source_errors
        .iter()
        .any(|e| e.kind == ErrorKind::PipelineTimeout));
    assert!(report
        .source_errors
        .iter()
        .any(|e| e.kind == ErrorKind::SourceFetch && e.scope == "slow"));
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn unreachable_primary_falls_back_to_direct_writes() {
    let store = Arc::new(InMemoryStore::new());
    let primary = HttpBackend::new(HttpBackendConfig {
        endpoint: "http://127.0.0.1:9".into(),
        token: "t".into(),
        timeout: Duration::from_secs(2),
        user_agent: None,
    })
    .expect("backend");
    let gateway = PersistenceGateway::new(Some(Arc::new(primary)), store.clone(), GatewayConfig::default());
    let report = SyncCoordinator::new(demon_slayer_sources(), http(), gateway, CoordinatorOptions::default())
        .run()
        .await;

    let outcome = report.sync_outcome.expect("persisted");
    assert_eq!(outcome.path, SyncPath::Fallback);
    assert_eq!(outcome.saved_count, 1);
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn stored_rerelease_flag_survives_a_plain_run() {
    let store = Arc::new(InMemoryStore::new());
    let mut stored = plan_write(
        None,
        &MergedMovieRecord::from_seed(CanonicalMovieSeed::new("300", "神隱少女")),
    )
    .movie;
    stored.is_rerelease = true;
    store.put(stored).await;

    let adapters = vec![stub("tmdb", Behavior::Items(vec![seed("300", "神隱少女")]))];
    let report = coordinator(adapters, &store, CoordinatorOptions::default())
        .run()
        .await;

    assert!(report.merged_movies[0].is_rerelease);
    assert!(store.get("300").await.expect("row").is_rerelease);
}

#[tokio::test]
async fn rerelease_phrases_flag_merged_records() {
    let store = Arc::new(InMemoryStore::new());
    let adapters = vec![stub(
        "tmdb",
        Behavior::Items(vec![seed("400", "神隱少女 數位修復版")]),
    )];
    let report = coordinator(adapters, &store, CoordinatorOptions::default())
        .run()
        .await;
    assert!(report.merged_movies[0].is_rerelease);
    assert!(store.get("400").await.expect("row").is_rerelease);
}

#[tokio::test]
async fn run_writes_report_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(InMemoryStore::new());
    let options = CoordinatorOptions {
        workspace_root: Some(dir.path().to_path_buf()),
        ..Default::default()
    };
    let report = coordinator(demon_slayer_sources(), &store, options).run().await;

    let run_dir = dir.path().join("reports").join(report.run_id.to_string());
    assert!(run_dir.join(RUN_REPORT_FILE).is_file());
    let brief = std::fs::read_to_string(run_dir.join(DAILY_BRIEF_FILE)).expect("brief");
    assert!(brief.contains("Cinema A: 1"));

    let md = tokuten_sync::report_daily_markdown(3, dir.path()).expect("summary");
    assert!(md.contains(&report.run_id.to_string()));
}
