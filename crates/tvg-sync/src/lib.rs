//! Sync pipeline: ingest pending days, export snapshots, repeat.

mod cache;
mod export;
mod ingest;
mod window;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local, NaiveDate, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use tvg_adapters::{adapter_for_provider, MetadataLookup, NoopMetadataLookup, OmdbLookup};
use tvg_storage::{HttpFetcher, HttpSettings, SnapshotSink, SqliteEventStore, DATABASE_FILE_NAME};

pub use cache::{CacheConfig, EnrichmentCache, DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL_DAYS};
pub use export::{
    parquet_key, render_json_snapshot, render_parquet_snapshot, snapshot_key, snapshot_rows,
    ExportOutcome, ExportSummary, SnapshotExporter, SnapshotRow,
};
pub use ingest::{
    DateReport, ErrorCategory, IngestError, IngestSummary, IngestionCoordinator,
    DEFAULT_ITEM_CONCURRENCY, DEFAULT_ITEM_TIMEOUT_SECS,
};
pub use window::{DateWindow, WindowDay, DEFAULT_HORIZON_DAYS};

pub const CRATE_NAME: &str = "tvg-sync";

pub const DEFAULT_QUERY_INTERVAL_SECS: u64 = 14_400;
const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// Source of "now" and "today" for TTL math and the date window.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Calendar day the schedule window starts on.
    fn today(&self) -> NaiveDate;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }
}

/// Settable clock for tests and replays.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub db_folder: PathBuf,
    pub json_dumps_folder: PathBuf,
    pub query_interval_secs: u64,
    pub sync_cron: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_min_interval_ms: Option<u64>,
    pub item_timeout_secs: u64,
    pub item_concurrency: usize,
    pub cache_capacity: usize,
    pub cache_ttl_days: i64,
    pub horizon_days: u32,
    pub snapshot_parquet: bool,
    pub providers: Vec<String>,
    pub omdb_api_key: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any variable source; unset or unparsable values fall back to defaults.
    pub fn from_lookup<F>(var: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| var(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let parsed = |key: &str| non_empty(key).and_then(|v| v.parse::<u64>().ok());

        Self {
            db_folder: non_empty("DB_FOLDER")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/files")),
            json_dumps_folder: non_empty("JSON_DUMPS_FOLDER")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/files/json_dumps")),
            query_interval_secs: parsed("QUERY_INTERVAL_IN_SECONDS")
                .unwrap_or(DEFAULT_QUERY_INTERVAL_SECS),
            sync_cron: non_empty("TVG_SYNC_CRON"),
            user_agent: non_empty("TVG_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: parsed("TVG_HTTP_TIMEOUT_SECS").unwrap_or(20),
            http_min_interval_ms: parsed("TVG_HTTP_MIN_INTERVAL_MS").filter(|ms| *ms > 0),
            item_timeout_secs: parsed("TVG_ITEM_TIMEOUT_SECS").unwrap_or(DEFAULT_ITEM_TIMEOUT_SECS),
            item_concurrency: parsed("TVG_ITEM_CONCURRENCY")
                .and_then(|v| usize::try_from(v).ok())
                .unwrap_or(DEFAULT_ITEM_CONCURRENCY),
            cache_capacity: parsed("TVG_CACHE_CAPACITY")
                .and_then(|v| usize::try_from(v).ok())
                .unwrap_or(DEFAULT_CACHE_CAPACITY),
            cache_ttl_days: parsed("TVG_CACHE_TTL_DAYS")
                .and_then(|v| i64::try_from(v).ok())
                .unwrap_or(DEFAULT_CACHE_TTL_DAYS),
            horizon_days: parsed("TVG_HORIZON_DAYS")
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(DEFAULT_HORIZON_DAYS),
            snapshot_parquet: non_empty("TVG_SNAPSHOT_PARQUET")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            providers: non_empty("TVG_PROVIDERS")
                .map(|v| {
                    v.split(',')
                        .map(|p| p.trim().to_string())
                        .filter(|p| !p.is_empty())
                        .collect()
                })
                .unwrap_or_else(|| vec![tvg_adapters::SINEMATV_PROVIDER.to_string()]),
            omdb_api_key: non_empty("OMDB_API_KEY"),
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.db_folder.join(DATABASE_FILE_NAME)
    }

    pub fn http_settings(&self) -> HttpSettings {
        HttpSettings {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            min_interval: self.http_min_interval_ms.map(Duration::from_millis),
            ..HttpSettings::default()
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            capacity: self.cache_capacity,
            ttl: TimeDelta::days(self.cache_ttl_days),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub ingest: Vec<IngestSummary>,
    /// Absent when the snapshot directory could not be prepared.
    pub export: Option<ExportSummary>,
    pub cache_entries: usize,
}

impl CycleSummary {
    pub fn inserted(&self) -> usize {
        self.ingest.iter().map(IngestSummary::inserted).sum()
    }

    pub fn snapshots_written(&self) -> usize {
        self.export.as_ref().map(|e| e.written.len()).unwrap_or(0)
    }
}

/// Store, coordinators and exporter wired together for the long-running process.
pub struct SyncPipeline {
    config: SyncConfig,
    store: SqliteEventStore,
    cache: Arc<EnrichmentCache>,
    clock: Arc<dyn Clock>,
    coordinators: Vec<IngestionCoordinator>,
    exporter: SnapshotExporter,
    cycle_lock: tokio::sync::Mutex<()>,
}

impl SyncPipeline {
    /// Opens the store and snapshot directory and builds one coordinator per provider.
    /// Any failure here is a startup error.
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        fs::create_dir_all(&config.db_folder)
            .await
            .with_context(|| format!("creating {}", config.db_folder.display()))?;
        let store = SqliteEventStore::open(config.database_path())
            .await
            .with_context(|| format!("opening store {}", config.database_path().display()))?;
        let sink = SnapshotSink::new(&config.json_dumps_folder);
        sink.ensure_root().await?;

        let http = Arc::new(HttpFetcher::new(config.http_settings())?);
        let lookup: Arc<dyn MetadataLookup> = match &config.omdb_api_key {
            Some(key) => Arc::new(OmdbLookup::new(Arc::clone(&http), key.clone())),
            None => {
                info!("OMDB_API_KEY not set; ratings stay empty");
                Arc::new(NoopMetadataLookup)
            }
        };
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let cache = Arc::new(EnrichmentCache::new(config.cache_config()));

        let mut coordinators = Vec::with_capacity(config.providers.len());
        for provider in &config.providers {
            let adapter = adapter_for_provider(provider, Arc::clone(&http))?
                .map(Arc::new)
                .ok_or_else(|| anyhow!("no adapter registered for provider `{provider}`"))?;
            coordinators.push(
                IngestionCoordinator::new(
                    store.clone(),
                    Arc::clone(&cache),
                    adapter.clone(),
                    adapter,
                    Arc::clone(&lookup),
                    Arc::clone(&clock),
                )
                .with_call_timeout(Duration::from_secs(config.item_timeout_secs))
                .with_item_concurrency(config.item_concurrency)
                .with_horizon_days(config.horizon_days),
            );
        }

        let exporter = SnapshotExporter::new(store.clone(), sink, Arc::clone(&clock))
            .with_horizon_days(config.horizon_days)
            .with_parquet(config.snapshot_parquet);

        Ok(Self::assemble(config, store, cache, clock, coordinators, exporter))
    }

    /// Wires prebuilt parts; `from_config` is the production path.
    pub fn assemble(
        config: SyncConfig,
        store: SqliteEventStore,
        cache: Arc<EnrichmentCache>,
        clock: Arc<dyn Clock>,
        coordinators: Vec<IngestionCoordinator>,
        exporter: SnapshotExporter,
    ) -> Self {
        Self {
            config,
            store,
            cache,
            clock,
            coordinators,
            exporter,
            cycle_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &SqliteEventStore {
        &self.store
    }

    pub fn coordinators(&self) -> &[IngestionCoordinator] {
        &self.coordinators
    }

    pub fn exporter(&self) -> &SnapshotExporter {
        &self.exporter
    }

    /// One ingest + export pass. Never fails: every problem is logged and
    /// whatever could not be done is retried on the next cycle.
    pub async fn run_cycle(&self) -> CycleSummary {
        let _running = self.cycle_lock.lock().await;
        let started_at = self.clock.now();

        let mut ingest = Vec::with_capacity(self.coordinators.len());
        for coordinator in &self.coordinators {
            match coordinator.run_pass().await {
                Ok(summary) => ingest.push(summary),
                Err(err) => error!(
                    provider = %coordinator.provider(),
                    category = %ErrorCategory::Store,
                    error = %err,
                    "could not determine pending dates"
                ),
            }
        }

        let export = match self.exporter.export().await {
            Ok(summary) => Some(summary),
            Err(err) => {
                error!(error = %format!("{err:#}"), "snapshot export skipped");
                None
            }
        };

        let finished_at = self.clock.now();
        let purged = self.cache.purge_expired(finished_at);
        let summary = CycleSummary {
            started_at,
            finished_at,
            ingest,
            export,
            cache_entries: self.cache.len(),
        };
        info!(
            inserted = summary.inserted(),
            snapshots = summary.snapshots_written(),
            cache_entries = summary.cache_entries,
            cache_purged = purged,
            "sync cycle finished"
        );
        summary
    }

    /// Runs cycles until ctrl-c: on the cron schedule when one is configured,
    /// otherwise back to back with the configured sleep in between.
    pub async fn run_forever(self: Arc<Self>) -> Result<()> {
        if let Some(cron) = self.config.sync_cron.clone() {
            return self.run_scheduled(&cron).await;
        }

        let interval = Duration::from_secs(self.config.query_interval_secs);
        loop {
            self.run_cycle().await;
            info!(seconds = interval.as_secs(), "sleeping until next cycle");
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown requested");
                    return Ok(());
                }
            }
        }
    }

    async fn run_scheduled(self: Arc<Self>, cron: &str) -> Result<()> {
        let mut sched = JobScheduler::new().await.context("creating scheduler")?;
        let pipeline = Arc::clone(&self);
        let job = Job::new_async(cron, move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                pipeline.run_cycle().await;
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;

        self.run_cycle().await;
        sched.start().await.context("starting scheduler")?;
        info!(cron, "scheduler started");

        tokio::signal::ctrl_c()
            .await
            .context("waiting for shutdown signal")?;
        info!("shutdown requested");
        sched.shutdown().await.context("stopping scheduler")?;
        Ok(())
    }
}
