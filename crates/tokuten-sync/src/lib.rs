//! Scrape → merge → classify → persist, one coordinated run at a time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Deserialize;
use tokio::fs;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tokuten_adapters::{build_adapter, AdapterContext, SourceAdapter, SourceDefinition};
use tokuten_core::{
    CanonicalMovieSeed, ErrorKind, ErrorRecord, RawBonusObservation, RunStage, SourceItem,
    SyncReport,
};
use tokuten_storage::{
    GatewayConfig, HttpBackend, HttpBackendConfig, HttpClientConfig, HttpFetcher, InMemoryStore,
    PersistenceGateway, PgMovieStore, WritePath,
};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod merge;
pub mod rerelease;
mod report;

pub use merge::{MergeConfig, MergeEngine, MergeOutput};
pub use rerelease::RereleaseClassifier;
pub use report::{report_daily_markdown, write_run_reports, DAILY_BRIEF_FILE, RUN_REPORT_FILE};

pub const CRATE_NAME: &str = "tokuten-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceDefinition>,
}

impl SourceRegistry {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("in {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceDefinition> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSettings {
    pub endpoint: String,
    pub token: String,
}

/// Everything a run needs, resolved once at startup.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub trigger_secret: Option<String>,
    pub metadata_api_key: Option<String>,
    /// Primary persistence service; `None` means fallback-only.
    pub backend: Option<BackendSettings>,
    pub database_url: Option<String>,
    pub run_timeout: Duration,
    pub adapter_timeout: Duration,
    pub primary_timeout: Duration,
    pub http_timeout: Duration,
    pub inter_call_delay: Duration,
    pub max_concurrent_adapters: usize,
    pub max_concurrent_writes: usize,
    pub merge: MergeConfig,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub bind_addr: String,
}

impl SyncConfig {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            trigger_secret: None,
            metadata_api_key: None,
            backend: None,
            database_url: None,
            run_timeout: Duration::from_secs(300),
            adapter_timeout: Duration::from_secs(90),
            primary_timeout: Duration::from_secs(10),
            http_timeout: Duration::from_secs(20),
            inter_call_delay: Duration::from_millis(250),
            max_concurrent_adapters: 4,
            max_concurrent_writes: 8,
            merge: MergeConfig::default(),
            scheduler_enabled: false,
            sync_cron: "0 0 6,18 * * *".to_string(),
            user_agent: "tokuten-bot/0.1".to_string(),
            bind_addr: "127.0.0.1:8080".to_string(),
        }
    }

    /// The only place process environment is read.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let text = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let secs = |key: &str, default: Duration| {
            text(key)
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };

        let mut config = Self::new(text("TOKUTEN_WORKSPACE_ROOT").unwrap_or_else(|| ".".into()));
        config.trigger_secret = text("TOKUTEN_TRIGGER_SECRET");
        config.metadata_api_key = text("TOKUTEN_METADATA_API_KEY");
        config.backend = match (text("TOKUTEN_BACKEND_URL"), text("TOKUTEN_BACKEND_TOKEN")) {
            (Some(endpoint), Some(token)) => Some(BackendSettings { endpoint, token }),
            _ => None,
        };
        config.database_url = text("DATABASE_URL");
        config.run_timeout = secs("TOKUTEN_RUN_TIMEOUT_SECS", config.run_timeout);
        config.adapter_timeout = secs("TOKUTEN_ADAPTER_TIMEOUT_SECS", config.adapter_timeout);
        config.primary_timeout = secs("TOKUTEN_BACKEND_TIMEOUT_SECS", config.primary_timeout);
        config.http_timeout = secs("TOKUTEN_HTTP_TIMEOUT_SECS", config.http_timeout);
        if let Some(ms) = text("TOKUTEN_INTER_CALL_DELAY_MS").and_then(|v| v.parse().ok()) {
            config.inter_call_delay = Duration::from_millis(ms);
        }
        if let Some(threshold) = text("TOKUTEN_MATCH_THRESHOLD").and_then(|v| v.parse::<f64>().ok()) {
            config.merge.threshold = threshold.clamp(0.0, 1.0);
        }
        if let Some(days) = text("TOKUTEN_DATE_WINDOW_DAYS").and_then(|v| v.parse().ok()) {
            config.merge.date_window_days = days;
        }
        config.scheduler_enabled = text("TOKUTEN_SCHEDULER_ENABLED")
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        if let Some(cron) = text("TOKUTEN_SYNC_CRON") {
            config.sync_cron = cron;
        }
        if let Some(user_agent) = text("TOKUTEN_USER_AGENT") {
            config.user_agent = user_agent;
        }
        if let Some(bind) = text("TOKUTEN_BIND") {
            config.bind_addr = bind;
        }
        config
    }

    pub fn sources_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub run_timeout: Duration,
    pub adapter_timeout: Duration,
    pub max_concurrent_adapters: usize,
    pub merge: MergeConfig,
    /// Where `reports/<run_id>/` lands; `None` skips report files.
    pub workspace_root: Option<PathBuf>,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            run_timeout: Duration::from_secs(300),
            adapter_timeout: Duration::from_secs(90),
            max_concurrent_adapters: 4,
            merge: MergeConfig::default(),
            workspace_root: None,
        }
    }
}

impl From<&SyncConfig> for CoordinatorOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            run_timeout: config.run_timeout,
            adapter_timeout: config.adapter_timeout,
            max_concurrent_adapters: config.max_concurrent_adapters,
            merge: config.merge,
            workspace_root: Some(config.workspace_root.clone()),
        }
    }
}

enum AdapterOutcome {
    Fetched(Vec<SourceItem>),
    Failed(String),
    Cancelled,
}

#[derive(Default)]
struct Collected {
    seeds: Vec<CanonicalMovieSeed>,
    observations: Vec<RawBonusObservation>,
    errors: Vec<ErrorRecord>,
}

/// One run's worth of adapters wired to a gateway.
pub struct SyncCoordinator {
    adapters: Vec<Arc<dyn SourceAdapter>>,
    http: Arc<HttpFetcher>,
    gateway: PersistenceGateway,
    merge: MergeEngine,
    classifier: RereleaseClassifier,
    options: CoordinatorOptions,
}

fn advance(run_id: Uuid, stage: &mut RunStage, next: RunStage) {
    info!(%run_id, from = ?*stage, to = ?next, "run stage");
    *stage = next;
}

impl SyncCoordinator {
    pub fn new(
        adapters: Vec<Arc<dyn SourceAdapter>>,
        http: Arc<HttpFetcher>,
        gateway: PersistenceGateway,
        options: CoordinatorOptions,
    ) -> Self {
        Self {
            adapters,
            http,
            gateway,
            merge: MergeEngine::new(options.merge),
            classifier: RereleaseClassifier::default(),
            options,
        }
    }

    pub fn with_classifier(mut self, classifier: RereleaseClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Runs under the configured wall-clock budget.
    pub async fn run(&self) -> SyncReport {
        let cancel = CancellationToken::new();
        let budget = self.options.run_timeout;
        let deadline = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(budget).await;
                cancel.cancel();
            })
        };
        let report = self.run_with_cancel(cancel).await;
        deadline.abort();
        report
    }

    /// Cancelling `cancel` ends the run early with whatever has been merged and written so far.
    pub async fn run_with_cancel(&self, cancel: CancellationToken) -> SyncReport {
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let span = info_span!("sync_run", %run_id, adapters = self.adapters.len());
        async move {
            let scraped_at = Utc::now();
            let mut stage = RunStage::Idle;

            advance(run_id, &mut stage, RunStage::FetchingSources);
            let collected = self.fetch_all(run_id, &cancel).await;
            let mut source_errors = collected.errors;

            advance(run_id, &mut stage, RunStage::Merging);
            let mut merged = self.merge.merge(&collected.seeds, &collected.observations);
            info!(
                seeds = collected.seeds.len(),
                observations = collected.observations.len(),
                records = merged.records.len(),
                unmatched = merged.unmatched.len(),
                "merged"
            );

            advance(run_id, &mut stage, RunStage::Classifying);
            for record in &mut merged.records {
                self.classifier.apply(record);
            }

            let sync_outcome = if cancel.is_cancelled() {
                None
            } else {
                advance(run_id, &mut stage, RunStage::Persisting);
                Some(self.gateway.sync_records(&mut merged.records, &cancel).await)
            };

            let incomplete = cancel.is_cancelled();
            if incomplete {
                let elapsed = started.elapsed();
                warn!(?elapsed, "run cancelled before completion; reporting partial results");
                source_errors.push(ErrorRecord::new(
                    ErrorKind::PipelineTimeout,
                    "pipeline",
                    format!("run stopped after {elapsed:?} (budget {:?})", self.options.run_timeout),
                ));
            }

            advance(run_id, &mut stage, RunStage::Reported);
            let success = !incomplete
                && sync_outcome
                    .as_ref()
                    .is_some_and(|outcome| outcome.errors.is_empty());
            let report = SyncReport {
                run_id,
                success,
                incomplete,
                stage,
                last_scraped_at: scraped_at,
                source_movie_count: merged.records.len(),
                total_bonuses: merged.total_bonuses(),
                merged_movies: merged.records,
                unmatched_bonuses: merged.unmatched,
                source_errors,
                sync_outcome,
                timestamp: Utc::now(),
            };

            if let Some(root) = &self.options.workspace_root {
                match write_run_reports(root, &report).await {
                    Ok(dir) => info!(dir = %dir.display(), "wrote run reports"),
                    Err(err) => {
                        let message = format!("{err:#}");
                        warn!(error = %message, "failed to write run reports");
                    }
                }
            }
            report
        }
        .instrument(span)
        .await
    }

    async fn fetch_all(&self, run_id: Uuid, cancel: &CancellationToken) -> Collected {
        let ctx = AdapterContext {
            run_id,
            fetched_at: Utc::now(),
        };
        let limit = Arc::new(Semaphore::new(self.options.max_concurrent_adapters.max(1)));
        let timeout = self.options.adapter_timeout;
        let mut tasks = JoinSet::new();

        for (index, adapter) in self.adapters.iter().enumerate() {
            let adapter = adapter.clone();
            let http = self.http.clone();
            let ctx = ctx.clone();
            let limit = limit.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let source_id = adapter.source_id().to_string();
                let _permit = tokio::select! {
                    _ = cancel.cancelled() => return (index, source_id, AdapterOutcome::Cancelled),
                    permit = limit.acquire_owned() => permit.ok(),
                };
                let fetch = tokio::spawn(async move { adapter.fetch(&http, &ctx).await });
                let abort = fetch.abort_handle();
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => {
                        abort.abort();
                        AdapterOutcome::Cancelled
                    }
                    joined = tokio::time::timeout(timeout, fetch) => match joined {
                        Err(_) => {
                            abort.abort();
                            AdapterOutcome::Failed(format!("timed out after {timeout:?}"))
                        }
                        Ok(Err(join)) if join.is_panic() => {
                            AdapterOutcome::Failed("adapter panicked".to_string())
                        }
                        Ok(Err(join)) => AdapterOutcome::Failed(join.to_string()),
                        Ok(Ok(Err(err))) => AdapterOutcome::Failed(err.to_string()),
                        Ok(Ok(Ok(items))) => AdapterOutcome::Fetched(items),
                    },
                };
                (index, source_id, outcome)
            });
        }

        let mut settled: Vec<Option<(String, AdapterOutcome)>> =
            (0..self.adapters.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, source_id, outcome)) => settled[index] = Some((source_id, outcome)),
                Err(err) => error!(error = %err, "adapter supervisor task failed"),
            }
        }

        let mut collected = Collected::default();
        for (index, slot) in settled.into_iter().enumerate() {
            let (source_id, outcome) = slot.unwrap_or_else(|| {
                let source_id = self.adapters[index].source_id().to_string();
                (source_id, AdapterOutcome::Failed("adapter task lost".to_string()))
            });
            match outcome {
                AdapterOutcome::Fetched(items) => {
                    info!(source_id = %source_id, items = items.len(), "source fetched");
                    for item in items {
                        match item {
                            SourceItem::Seed(seed) => collected.seeds.push(seed),
                            SourceItem::Observation(obs) => collected.observations.push(obs),
                        }
                    }
                }
                AdapterOutcome::Failed(message) => {
                    warn!(source_id = %source_id, error = %message, "source failed; continuing without it");
                    collected.errors.push(ErrorRecord::source_fetch(&source_id, message));
                }
                AdapterOutcome::Cancelled => {
                    collected
                        .errors
                        .push(ErrorRecord::source_fetch(&source_id, "cancelled at run deadline"));
                }
            }
        }
        collected
    }
}

/// Primary path when both endpoint and token are configured; Postgres fallback when a database
/// URL is set, otherwise an in-memory dry-run store.
pub async fn build_gateway(config: &SyncConfig) -> Result<PersistenceGateway> {
    let gateway_config = GatewayConfig {
        primary_timeout: config.primary_timeout,
        max_concurrent_writes: config.max_concurrent_writes,
    };
    let primary: Option<Arc<dyn WritePath>> = match &config.backend {
        Some(settings) => Some(Arc::new(HttpBackend::new(HttpBackendConfig {
            endpoint: settings.endpoint.clone(),
            token: settings.token.clone(),
            timeout: config.primary_timeout,
            user_agent: Some(config.user_agent.clone()),
        })?)),
        None => None,
    };
    let fallback: Arc<dyn WritePath> = match &config.database_url {
        Some(url) => Arc::new(PgMovieStore::connect_lazy(url)?),
        None => {
            warn!("no DATABASE_URL configured; fallback writes go to an in-memory dry-run store");
            Arc::new(InMemoryStore::new())
        }
    };
    if primary.is_none() {
        info!("no persistence backend configured; running fallback-only");
    }
    Ok(PersistenceGateway::new(primary, fallback, gateway_config))
}

pub fn build_http(config: &SyncConfig, sources: &[SourceDefinition]) -> Result<HttpFetcher> {
    let source_delays: HashMap<String, Duration> = sources
        .iter()
        .filter_map(|s| s.inter_call_delay().map(|d| (s.source_id.clone(), d)))
        .collect();
    HttpFetcher::new(HttpClientConfig {
        timeout: config.http_timeout,
        user_agent: Some(config.user_agent.clone()),
        default_inter_call_delay: config.inter_call_delay,
        source_delays,
        ..Default::default()
    })
}

/// Builds the enabled adapters; a broken registry entry is reported, not fatal.
pub fn build_adapters(
    sources: &[SourceDefinition],
    metadata_api_key: Option<&str>,
) -> (Vec<Arc<dyn SourceAdapter>>, Vec<ErrorRecord>) {
    let mut adapters = Vec::new();
    let mut errors = Vec::new();
    for definition in sources.iter().filter(|s| s.enabled) {
        match build_adapter(definition, metadata_api_key) {
            Ok(adapter) => adapters.push(Arc::from(adapter)),
            Err(err) => {
                warn!(source_id = %definition.source_id, error = %err, "skipping misconfigured source");
                errors.push(ErrorRecord::new(
                    ErrorKind::Configuration,
                    definition.source_id.clone(),
                    err,
                ));
            }
        }
    }
    (adapters, errors)
}

/// Long-lived handle shared by the CLI, the HTTP trigger and the scheduler.
pub struct SyncService {
    config: SyncConfig,
    gateway: PersistenceGateway,
    running: Mutex<()>,
}

impl SyncService {
    pub async fn connect(config: SyncConfig) -> Result<Self> {
        let gateway = build_gateway(&config).await?;
        Ok(Self::with_gateway(config, gateway))
    }

    pub fn with_gateway(config: SyncConfig, gateway: PersistenceGateway) -> Self {
        Self {
            config,
            gateway,
            running: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Runs are serialized; a second trigger waits for the one in flight.
    pub async fn run_sync_once(&self) -> Result<SyncReport> {
        let _guard = self.running.lock().await;
        let registry = SourceRegistry::load(&self.config.sources_path()).await?;
        let (adapters, config_errors) =
            build_adapters(&registry.sources, self.config.metadata_api_key.as_deref());
        let http = build_http(&self.config, &registry.sources)?;
        let coordinator = SyncCoordinator::new(
            adapters,
            Arc::new(http),
            self.gateway.clone(),
            CoordinatorOptions::from(&self.config),
        );
        let mut report = coordinator.run().await;
        if !config_errors.is_empty() {
            let mut errors = config_errors;
            errors.append(&mut report.source_errors);
            report.source_errors = errors;
        }
        info!(
            run_id = %report.run_id,
            success = report.success,
            movies = report.merged_movies.len(),
            bonuses = report.total_bonuses,
            unmatched = report.unmatched_bonuses.len(),
            "sync run finished"
        );
        Ok(report)
    }
}

/// Registers the cron job when the scheduler is enabled. Every tick calls the same entry point
/// as the CLI and the trigger endpoint.
pub async fn maybe_build_scheduler(service: Arc<SyncService>) -> Result<Option<JobScheduler>> {
    if !service.config().scheduler_enabled {
        return Ok(None);
    }
    let cron = service.config().sync_cron.clone();
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let service = service.clone();
        Box::pin(async move {
            if let Err(err) = service.run_sync_once().await {
                let message = format!("{err:#}");
                error!(error = %message, "scheduled sync failed");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
