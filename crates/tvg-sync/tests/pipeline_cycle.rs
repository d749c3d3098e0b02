use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, TimeZone, Utc};
use tvg_adapters::{AdapterError, DetailSource, MetadataLookup, ScheduleSource};
use tvg_core::{AirDate, ChannelSchedule, DaySchedule, DetailInfo, RatingInfo, RawItem};
use tvg_storage::{SnapshotSink, SqliteEventStore};
use tvg_sync::{
    snapshot_key, CacheConfig, Clock, EnrichmentCache, IngestionCoordinator, ManualClock,
    SnapshotExporter, SyncConfig, SyncPipeline,
};

const PROVIDER: &str = "fake-tv";

#[derive(Default)]
struct FakeSchedule {
    days: HashMap<AirDate, DaySchedule>,
    failing: HashSet<AirDate>,
    calls: AtomicUsize,
}

#[async_trait]
impl ScheduleSource for FakeSchedule {
    fn provider(&self) -> &str {
        PROVIDER
    }

    async fn fetch_schedule(&self, date: AirDate) -> Result<DaySchedule, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(&date) {
            return Err(AdapterError::Parse(format!("guide for {date} unavailable")));
        }
        Ok(self.days.get(&date).cloned().unwrap_or_default())
    }

    fn resolve_detail_url(&self, href: &str) -> Result<String, AdapterError> {
        if href.trim().is_empty() {
            return Err(AdapterError::InvalidUrl {
                url: href.to_string(),
                reason: "empty link".to_string(),
            });
        }
        Ok(format!("https://tv.example{href}"))
    }
}

#[derive(Default)]
struct FakeDetail {
    years: HashMap<String, u16>,
    hanging: HashSet<String>,
    calls: AtomicUsize,
}

#[async_trait]
impl DetailSource for FakeDetail {
    async fn fetch_detail(&self, detail_url: &str) -> Result<Option<DetailInfo>, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hanging.contains(detail_url) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(self.years.get(detail_url).map(|year| DetailInfo {
            release_year: Some(*year),
            image_url: Some(format!("{detail_url}.jpg")),
            summary: Some("özet".to_string()),
        }))
    }
}

#[derive(Default)]
struct FakeLookup {
    failing: bool,
    hanging: HashSet<String>,
    calls: AtomicUsize,
}

#[async_trait]
impl MetadataLookup for FakeLookup {
    async fn lookup(
        &self,
        title: &str,
        release_year: Option<u16>,
    ) -> Result<Option<RatingInfo>, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hanging.contains(title) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if self.failing {
            return Err(AdapterError::Parse("rating service down".to_string()));
        }
        Ok(release_year.map(|year| RatingInfo {
            external_id: format!("tt-{title}-{year}"),
            external_rating: Some(7.5),
        }))
    }
}

fn item(title: &str, start: &str, href: &str) -> RawItem {
    RawItem {
        title: title.to_string(),
        start_time: start.to_string(),
        detail_url: href.to_string(),
    }
}

fn day(channels: Vec<(&str, Vec<RawItem>)>) -> DaySchedule {
    DaySchedule {
        channels: channels
            .into_iter()
            .map(|(channel, items)| ChannelSchedule {
                channel: channel.to_string(),
                items,
            })
            .collect(),
    }
}

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 3, 10, 9, 0, 0).single().expect("ts"),
    ))
}

fn nth_day(clock: &ManualClock, offset: u64) -> AirDate {
    AirDate::new(clock.today()).plus_days(offset).expect("date")
}

struct Harness {
    store: SqliteEventStore,
    cache: Arc<EnrichmentCache>,
    schedule: Arc<FakeSchedule>,
    detail: Arc<FakeDetail>,
    lookup: Arc<FakeLookup>,
    clock: Arc<ManualClock>,
}

impl Harness {
    async fn new(schedule: FakeSchedule, detail: FakeDetail, lookup: FakeLookup, clock: Arc<ManualClock>) -> Self {
        Self {
            store: SqliteEventStore::open_in_memory().await.expect("store"),
            cache: Arc::new(EnrichmentCache::new(CacheConfig::default())),
            schedule: Arc::new(schedule),
            detail: Arc::new(detail),
            lookup: Arc::new(lookup),
            clock,
        }
    }

    fn coordinator(&self) -> IngestionCoordinator {
        IngestionCoordinator::new(
            self.store.clone(),
            Arc::clone(&self.cache),
            self.schedule.clone(),
            self.detail.clone(),
            self.lookup.clone(),
            self.clock.clone(),
        )
    }
}

#[tokio::test]
async fn pending_dates_are_ingested_and_then_left_alone() {
    let clock = clock();
    let today = nth_day(&clock, 0);
    let mut schedule = FakeSchedule::default();
    schedule.days.insert(
        today,
        day(vec![
            ("C1", vec![item("Heat", "20:00", "/film/1"), item("Ronin", "22:45", "/film/2")]),
            ("C2", vec![item("Heat", "20:00", "/film/1")]),
        ]),
    );
    let detail = FakeDetail {
        years: HashMap::from([("https://tv.example/film/1".to_string(), 1995)]),
        ..Default::default()
    };
    let h = Harness::new(schedule, detail, FakeLookup::default(), clock).await;
    let coordinator = h.coordinator();

    assert_eq!(coordinator.pending_dates().await.expect("pending").len(), 7);
    let summary = coordinator.run_pass().await.expect("pass");
    assert_eq!(summary.inserted(), 3);
    assert!(summary.failed.is_empty());

    let pending = coordinator.pending_dates().await.expect("pending");
    assert_eq!(pending.len(), 6);
    assert!(!pending.contains(&today));

    let stored = h.store.query_by_date(PROVIDER, today).await.expect("query");
    let heat = stored
        .iter()
        .find(|s| s.event.channel == "C1" && s.event.title == "Heat")
        .expect("heat");
    assert_eq!(heat.event.release_year, 1995);
    assert_eq!(heat.event.external_id, "tt-Heat-1995");
    assert_eq!(heat.event.external_rating, Some(7.5));
    assert_eq!(heat.event.source_url, "https://tv.example/film/1");

    let calls_before = h.schedule.calls.load(Ordering::SeqCst);
    coordinator.run_pass().await.expect("pass");
    // Today is no longer pending, so only the six empty days are fetched again.
    assert_eq!(h.schedule.calls.load(Ordering::SeqCst) - calls_before, 6);
}

#[tokio::test]
async fn a_failing_date_does_not_block_later_dates() {
    let clock = clock();
    let second = nth_day(&clock, 1);
    let third = nth_day(&clock, 2);
    let mut schedule = FakeSchedule::default();
    schedule.failing.insert(second);
    schedule
        .days
        .insert(third, day(vec![("C1", vec![item("Heat", "20:00", "/film/1")])]));
    let h = Harness::new(schedule, FakeDetail::default(), FakeLookup::default(), clock).await;
    let coordinator = h.coordinator();

    let summary = coordinator.run_pass().await.expect("pass");

    assert_eq!(summary.failed, vec![second]);
    assert_eq!(h.store.count_by_date(PROVIDER, third).await.expect("count"), 1);
    let pending = coordinator.pending_dates().await.expect("pending");
    assert!(pending.contains(&second));
    assert!(!pending.contains(&third));
}

#[tokio::test]
async fn malformed_items_are_skipped_individually() {
    let clock = clock();
    let today = nth_day(&clock, 0);
    let mut schedule = FakeSchedule::default();
    schedule.days.insert(
        today,
        day(vec![(
            "C1",
            vec![
                item("Heat", "25:99", "/film/1"),
                item("", "", ""),
                item("Ronin", "22:45", ""),
                item("Amélie", "09:30", "/film/3"),
            ],
        )]),
    );
    let h = Harness::new(schedule, FakeDetail::default(), FakeLookup::default(), clock).await;

    let report = h.coordinator().ingest_date(today).await.expect("date");

    assert_eq!(report.items, 4);
    assert_eq!(report.skipped, 3);
    assert_eq!(report.inserted, 1);
    let stored = h.store.query_by_date(PROVIDER, today).await.expect("query");
    assert_eq!(stored[0].event.title, "Amélie");
}

#[tokio::test]
async fn repeated_airing_in_one_guide_is_stored_once() {
    let clock = clock();
    let today = nth_day(&clock, 0);
    let mut schedule = FakeSchedule::default();
    schedule.days.insert(
        today,
        day(vec![(
            "C1",
            vec![item("Heat", "20:00", "/film/1"), item("Heat", "20:00", "/film/1")],
        )]),
    );
    let h = Harness::new(schedule, FakeDetail::default(), FakeLookup::default(), clock).await;

    let report = h.coordinator().ingest_date(today).await.expect("date");

    assert_eq!(report.inserted, 1);
    assert_eq!(report.duplicates, 1);
    assert_eq!(h.store.count_all().await.expect("count"), 1);
}

#[tokio::test]
async fn cache_hit_on_a_later_date_skips_detail_and_lookup() {
    let clock = clock();
    let first = nth_day(&clock, 0);
    let second = nth_day(&clock, 1);
    let mut schedule = FakeSchedule::default();
    schedule
        .days
        .insert(first, day(vec![("C1", vec![item("Heat", "20:00", "/film/1")])]));
    schedule
        .days
        .insert(second, day(vec![("C2", vec![item("Heat", "21:00", "/film/1")])]));
    let detail = FakeDetail {
        years: HashMap::from([("https://tv.example/film/1".to_string(), 1995)]),
        ..Default::default()
    };
    let h = Harness::new(schedule, detail, FakeLookup::default(), clock).await;

    let summary = h.coordinator().run_pass().await.expect("pass");

    assert_eq!(summary.inserted(), 2);
    assert_eq!(h.detail.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.lookup.calls.load(Ordering::SeqCst), 1);
    let hits: usize = summary.dates.iter().map(|d| d.cache_hits).sum();
    assert_eq!(hits, 1);
    let later = h.store.query_by_date(PROVIDER, second).await.expect("query");
    assert_eq!(later[0].event.release_year, 1995);
    assert_eq!(later[0].event.external_id, "tt-Heat-1995");
}

#[tokio::test]
async fn expired_enrichment_is_fetched_again() {
    let clock = clock();
    let mut schedule = FakeSchedule::default();
    let dates = [nth_day(&clock, 0), nth_day(&clock, 1), nth_day(&clock, 2)];
    for date in dates {
        schedule
            .days
            .insert(date, day(vec![("C1", vec![item("Heat", "20:00", "/film/1")])]));
    }
    let h = Harness::new(schedule, FakeDetail::default(), FakeLookup::default(), clock).await;
    let coordinator = h.coordinator();

    coordinator.ingest_date(dates[0]).await.expect("date");
    assert_eq!(h.detail.calls.load(Ordering::SeqCst), 1);

    h.clock.advance(TimeDelta::days(29));
    coordinator.ingest_date(dates[1]).await.expect("date");
    assert_eq!(h.detail.calls.load(Ordering::SeqCst), 1);

    h.clock.advance(TimeDelta::days(2));
    coordinator.ingest_date(dates[2]).await.expect("date");
    assert_eq!(h.detail.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn hanging_detail_call_times_out_and_skips_only_that_item() {
    let clock = clock();
    let today = nth_day(&clock, 0);
    let mut schedule = FakeSchedule::default();
    schedule.days.insert(
        today,
        day(vec![(
            "C1",
            vec![item("Heat", "20:00", "/film/1"), item("Ronin", "22:45", "/film/2")],
        )]),
    );
    let detail = FakeDetail {
        hanging: HashSet::from(["https://tv.example/film/1".to_string()]),
        ..Default::default()
    };
    let h = Harness::new(schedule, detail, FakeLookup::default(), clock).await;
    let coordinator = h.coordinator().with_call_timeout(Duration::from_millis(50));

    let report = coordinator.ingest_date(today).await.expect("date");

    assert_eq!(report.skipped, 1);
    assert_eq!(report.inserted, 1);
    let stored = h.store.query_by_date(PROVIDER, today).await.expect("query");
    assert_eq!(stored[0].event.title, "Ronin");
}

#[tokio::test]
async fn hanging_lookup_times_out_and_skips_only_that_item() {
    let clock = clock();
    let today = nth_day(&clock, 0);
    let mut schedule = FakeSchedule::default();
    schedule.days.insert(
        today,
        day(vec![(
            "C1",
            vec![item("Heat", "20:00", "/film/1"), item("Ronin", "22:45", "/film/2")],
        )]),
    );
    let lookup = FakeLookup {
        hanging: HashSet::from(["Heat".to_string()]),
        ..Default::default()
    };
    let h = Harness::new(schedule, FakeDetail::default(), lookup, clock).await;
    let coordinator = h.coordinator().with_call_timeout(Duration::from_millis(50));

    let report = coordinator.ingest_date(today).await.expect("date");

    assert_eq!(report.skipped, 1);
    assert_eq!(report.inserted, 1);
    let stored = h.store.query_by_date(PROVIDER, today).await.expect("query");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].event.title, "Ronin");
    assert!(h.cache.get("https://tv.example/film/1", h.clock.now()).is_none());
}

#[tokio::test]
async fn lookup_failure_stores_event_but_not_cache_entry() {
    let clock = clock();
    let first = nth_day(&clock, 0);
    let second = nth_day(&clock, 1);
    let mut schedule = FakeSchedule::default();
    schedule
        .days
        .insert(first, day(vec![("C1", vec![item("Heat", "20:00", "/film/1")])]));
    schedule
        .days
        .insert(second, day(vec![("C1", vec![item("Heat", "20:00", "/film/1")])]));
    let detail = FakeDetail {
        years: HashMap::from([("https://tv.example/film/1".to_string(), 1995)]),
        ..Default::default()
    };
    let lookup = FakeLookup {
        failing: true,
        ..Default::default()
    };
    let h = Harness::new(schedule, detail, lookup, clock).await;

    let summary = h.coordinator().run_pass().await.expect("pass");

    assert_eq!(summary.inserted(), 2);
    assert!(h.cache.is_empty());
    assert_eq!(h.detail.calls.load(Ordering::SeqCst), 2);
    let stored = h.store.query_by_date(PROVIDER, first).await.expect("query");
    assert_eq!(stored[0].event.release_year, 1995);
    assert_eq!(stored[0].event.external_rating, None);
    assert!(stored[0].event.external_id.is_empty());
}

async fn pipeline_with(h: &Harness, dumps: &std::path::Path) -> SyncPipeline {
    let clock: Arc<dyn Clock> = h.clock.clone();
    let exporter = SnapshotExporter::new(h.store.clone(), SnapshotSink::new(dumps), Arc::clone(&clock));
    SyncPipeline::assemble(
        SyncConfig::default(),
        h.store.clone(),
        Arc::clone(&h.cache),
        clock,
        vec![h.coordinator()],
        exporter,
    )
}

#[tokio::test]
async fn cycle_ingests_then_exports_each_day_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = clock();
    let today = nth_day(&clock, 0);
    let mut schedule = FakeSchedule::default();
    schedule.days.insert(
        today,
        day(vec![("C1", vec![item("Ronin", "22:45", "/film/2"), item("Heat", "20:00", "/film/1")])]),
    );
    let h = Harness::new(schedule, FakeDetail::default(), FakeLookup::default(), clock).await;
    let pipeline = pipeline_with(&h, dir.path()).await;

    let first = pipeline.run_cycle().await;

    assert_eq!(first.inserted(), 2);
    assert_eq!(first.snapshots_written(), 1);
    let path = dir.path().join(snapshot_key(today));
    assert_eq!(path.file_name().and_then(|n| n.to_str()), Some("10.03.2025.json"));
    let rows: Vec<serde_json::Value> =
        serde_json::from_slice(&std::fs::read(&path).expect("read")).expect("json");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["title"], "Heat");
    assert_eq!(rows[1]["title"], "Ronin");

    let second = pipeline.run_cycle().await;
    assert_eq!(second.inserted(), 0);
    assert_eq!(second.snapshots_written(), 0);
}

#[tokio::test]
async fn closed_store_is_logged_not_fatal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = clock();
    let h = Harness::new(FakeSchedule::default(), FakeDetail::default(), FakeLookup::default(), clock).await;
    let pipeline = pipeline_with(&h, dir.path()).await;
    h.store.pool().close().await;

    let summary = pipeline.run_cycle().await;

    assert!(summary.ingest.is_empty());
    let export = summary.export.expect("export ran");
    assert_eq!(export.failed.len(), 7);
    assert!(export.written.is_empty());
}
