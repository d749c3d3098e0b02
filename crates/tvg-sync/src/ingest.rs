//! Ingestion coordinator: pending dates in, enriched and deduplicated events out.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::{stream, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use tvg_adapters::{AdapterError, DetailSource, MetadataLookup, ScheduleSource};
use tvg_core::{AirDate, AirTime, BroadcastEvent, Enrichment, EnrichmentCacheEntry, RawItem};
use tvg_storage::{SqliteEventStore, StoreError};

use crate::cache::EnrichmentCache;
use crate::window::{DateWindow, DEFAULT_HORIZON_DAYS};
use crate::Clock;

pub const DEFAULT_ITEM_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_ITEM_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    TransientSource,
    MalformedItem,
    Store,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransientSource => "transient_source",
            Self::MalformedItem => "malformed_item",
            Self::Store => "store",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("schedule fetch failed: {0}")]
    Schedule(#[source] AdapterError),
    #[error("detail fetch failed for {url}: {source}")]
    Detail {
        url: String,
        #[source]
        source: AdapterError,
    },
    #[error("metadata lookup failed for `{title}`: {source}")]
    Lookup {
        title: String,
        #[source]
        source: AdapterError,
    },
    #[error("{stage} call timed out after {millis}ms")]
    Timeout { stage: &'static str, millis: u64 },
    #[error("malformed item: {0}")]
    MalformedItem(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IngestError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Schedule(_) | Self::Detail { .. } | Self::Lookup { .. } | Self::Timeout { .. } => {
                ErrorCategory::TransientSource
            }
            Self::MalformedItem(_) => ErrorCategory::MalformedItem,
            Self::Store(_) => ErrorCategory::Store,
        }
    }
}

/// What happened to one date during a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DateReport {
    pub date: AirDate,
    pub channels: usize,
    pub items: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub cache_hits: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestSummary {
    pub provider: String,
    pub pending: Vec<AirDate>,
    pub dates: Vec<DateReport>,
    /// Dates aborted this pass; they stay pending and are retried next cycle.
    pub failed: Vec<AirDate>,
}

impl IngestSummary {
    pub fn inserted(&self) -> usize {
        self.dates.iter().map(|d| d.inserted).sum()
    }

    pub fn skipped(&self) -> usize {
        self.dates.iter().map(|d| d.skipped).sum()
    }
}

struct PreparedItem {
    event: BroadcastEvent,
    cache_hit: bool,
}

/// Drives one provider's schedule into the store, consulting the shared enrichment cache.
pub struct IngestionCoordinator {
    store: SqliteEventStore,
    cache: Arc<EnrichmentCache>,
    schedule: Arc<dyn ScheduleSource>,
    detail: Arc<dyn DetailSource>,
    lookup: Arc<dyn MetadataLookup>,
    clock: Arc<dyn Clock>,
    call_timeout: Duration,
    item_concurrency: usize,
    horizon_days: u32,
}

impl IngestionCoordinator {
    pub fn new(
        store: SqliteEventStore,
        cache: Arc<EnrichmentCache>,
        schedule: Arc<dyn ScheduleSource>,
        detail: Arc<dyn DetailSource>,
        lookup: Arc<dyn MetadataLookup>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            cache,
            schedule,
            detail,
            lookup,
            clock,
            call_timeout: Duration::from_secs(DEFAULT_ITEM_TIMEOUT_SECS),
            item_concurrency: DEFAULT_ITEM_CONCURRENCY,
            horizon_days: DEFAULT_HORIZON_DAYS,
        }
    }

    /// Upper bound on every collaborator call (schedule, detail, lookup).
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_item_concurrency(mut self, concurrency: usize) -> Self {
        self.item_concurrency = concurrency.max(1);
        self
    }

    pub fn with_horizon_days(mut self, days: u32) -> Self {
        self.horizon_days = days;
        self
    }

    pub fn provider(&self) -> &str {
        self.schedule.provider()
    }

    pub fn window(&self) -> DateWindow {
        DateWindow::starting(self.clock.today(), self.horizon_days)
    }

    pub async fn pending_dates(&self) -> Result<Vec<AirDate>, StoreError> {
        self.window().pending_dates(&self.store, self.provider()).await
    }

    /// Ingests every pending date. A failing date is logged and left pending;
    /// only the pending-date query itself can fail the pass.
    pub async fn run_pass(&self) -> Result<IngestSummary, StoreError> {
        let pending = self.pending_dates().await?;
        let mut summary = IngestSummary {
            provider: self.provider().to_string(),
            pending: pending.clone(),
            ..Default::default()
        };

        for date in pending {
            match self.ingest_date(date).await {
                Ok(report) => {
                    info!(
                        provider = %self.provider(),
                        date = %date,
                        channels = report.channels,
                        items = report.items,
                        inserted = report.inserted,
                        duplicates = report.duplicates,
                        skipped = report.skipped,
                        cache_hits = report.cache_hits,
                        "date ingested"
                    );
                    summary.dates.push(report);
                }
                Err(err) => {
                    error!(
                        provider = %self.provider(),
                        date = %date,
                        category = %err.category(),
                        error = %err,
                        "date aborted; retried next cycle"
                    );
                    summary.failed.push(date);
                }
            }
        }
        Ok(summary)
    }

    /// Fetches, enriches and stores one date. Item-level problems skip the item;
    /// a schedule or store failure fails the whole date and nothing is written.
    pub async fn ingest_date(&self, date: AirDate) -> Result<DateReport, IngestError> {
        let schedule = self
            .bounded("schedule", self.schedule.fetch_schedule(date))
            .await?
            .map_err(IngestError::Schedule)?;

        let items = schedule
            .channels
            .iter()
            .flat_map(|c| c.items.iter().map(move |item| (c.channel.clone(), item.clone())))
            .collect::<Vec<_>>();
        let item_count = items.len();

        let prepared = stream::iter(items)
            .map(|(channel, item)| async move {
                let outcome = self.prepare_item(date, &channel, &item).await;
                (channel, item, outcome)
            })
            .buffered(self.item_concurrency)
            .collect::<Vec<_>>()
            .await;

        let mut events = Vec::with_capacity(prepared.len());
        let mut skipped = 0;
        let mut cache_hits = 0;
        for (channel, item, outcome) in prepared {
            match outcome {
                Ok(p) => {
                    cache_hits += usize::from(p.cache_hit);
                    events.push(p.event);
                }
                Err(err) => {
                    skipped += 1;
                    warn!(
                        provider = %self.provider(),
                        date = %date,
                        channel = %channel,
                        title = %item.title,
                        source_url = %item.detail_url,
                        category = %err.category(),
                        error = %err,
                        "item skipped"
                    );
                }
            }
        }

        let outcome = self.store.insert_all(&events).await?;
        Ok(DateReport {
            date,
            channels: schedule.channels.len(),
            items: item_count,
            inserted: outcome.inserted,
            duplicates: outcome.duplicates,
            skipped,
            cache_hits,
        })
    }

    async fn prepare_item(
        &self,
        date: AirDate,
        channel: &str,
        item: &RawItem,
    ) -> Result<PreparedItem, IngestError> {
        let title = item.title.trim();
        if title.is_empty() {
            return Err(IngestError::MalformedItem("missing title".to_string()));
        }
        let air_time = item
            .start_time
            .parse::<AirTime>()
            .map_err(|e| IngestError::MalformedItem(format!("start time of `{title}`: {e}")))?;
        let source_url = self
            .schedule
            .resolve_detail_url(&item.detail_url)
            .map_err(|e| IngestError::MalformedItem(format!("link of `{title}`: {e}")))?;

        let event = BroadcastEvent::new(self.provider(), channel, date, air_time, title, source_url.as_str());

        if let Some(hit) = self.cache.get(&source_url, self.clock.now()) {
            debug!(source_url = %source_url, "enrichment cache hit");
            return Ok(PreparedItem {
                event: event.with_enrichment(&hit.enrichment),
                cache_hit: true,
            });
        }

        let mut enrichment = Enrichment::default();
        let detail = self
            .bounded("detail", self.detail.fetch_detail(&source_url))
            .await?
            .map_err(|source| IngestError::Detail {
                url: source_url.clone(),
                source,
            })?;
        if let Some(detail) = detail {
            enrichment.apply_detail(detail);
        }

        // A timed-out lookup skips the item.
        let rating = self
            .bounded("lookup", self.lookup.lookup(title, enrichment.release_year()))
            .await?
            .map_err(|source| IngestError::Lookup {
                title: title.to_string(),
                source,
            });
        let cacheable = match rating {
            Ok(Some(rating)) => {
                enrichment.apply_rating(rating);
                true
            }
            Ok(None) => true,
            Err(err) => {
                warn!(
                    provider = %self.provider(),
                    date = %date,
                    channel,
                    source_url = %source_url,
                    category = %err.category(),
                    error = %err,
                    "storing without rating"
                );
                false
            }
        };

        if cacheable {
            let now = self.clock.now();
            self.cache.put(
                EnrichmentCacheEntry::new(source_url.as_str(), enrichment.clone(), now),
                now,
            );
        }

        Ok(PreparedItem {
            event: event.with_enrichment(&enrichment),
            cache_hit: false,
        })
    }

    async fn bounded<F: Future>(&self, stage: &'static str, fut: F) -> Result<F::Output, IngestError> {
        tokio::time::timeout(self.call_timeout, fut)
            .await
            .map_err(|_| IngestError::Timeout {
                stage,
                millis: u64::try_from(self.call_timeout.as_millis()).unwrap_or(u64::MAX),
            })
    }
}
