//! Write-once daily snapshots of stored events.

use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use tracing::{debug, error, info};
use tvg_core::{AirDate, StoredEvent};
use tvg_storage::{SnapshotSink, SqliteEventStore, StoredSnapshot};

use crate::window::{DateWindow, DEFAULT_HORIZON_DAYS};
use crate::Clock;

/// One exported event. Fields are declared in alphabetical order so the JSON
/// object keys come out sorted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotRow {
    pub air_date: AirDate,
    pub air_hour: u8,
    pub air_minute: u8,
    pub channel: String,
    pub external_id: String,
    pub external_rating: Option<f64>,
    pub id: String,
    pub image_url: String,
    pub provider: String,
    pub release_year: u16,
    pub source_url: String,
    pub summary: String,
    pub title: String,
}

impl SnapshotRow {
    fn sort_key(&self) -> (&str, &str, u8, u8, &str) {
        (
            &self.provider,
            &self.channel,
            self.air_hour,
            self.air_minute,
            &self.title,
        )
    }
}

impl From<&StoredEvent> for SnapshotRow {
    fn from(stored: &StoredEvent) -> Self {
        let e = &stored.event;
        Self {
            air_date: e.air_date,
            air_hour: e.air_hour,
            air_minute: e.air_minute,
            channel: e.channel.clone(),
            external_id: e.external_id.clone(),
            external_rating: e.external_rating,
            id: stored.id.to_string(),
            image_url: e.image_url.clone(),
            provider: e.provider.clone(),
            release_year: e.release_year,
            source_url: e.source_url.clone(),
            summary: e.summary.clone(),
            title: e.title.clone(),
        }
    }
}

pub fn snapshot_key(date: AirDate) -> String {
    format!("{date}.json")
}

pub fn parquet_key(date: AirDate) -> String {
    format!("{date}.parquet")
}

/// Rows ordered by natural identity, independent of query order.
pub fn snapshot_rows(events: &[StoredEvent]) -> Vec<SnapshotRow> {
    let mut rows = events.iter().map(SnapshotRow::from).collect::<Vec<_>>();
    rows.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    rows
}

/// Pretty JSON array, four-space indent, non-ASCII left as UTF-8.
pub fn render_json_snapshot(rows: &[SnapshotRow]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(b"    "));
    rows.serialize(&mut ser).context("serializing snapshot rows")?;
    out.push(b'\n');
    Ok(out)
}

pub fn render_parquet_snapshot(rows: &[SnapshotRow]) -> Result<Vec<u8>> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Utf8, false),
        ArrowField::new("provider", DataType::Utf8, false),
        ArrowField::new("channel", DataType::Utf8, false),
        ArrowField::new("air_date", DataType::Utf8, false),
        ArrowField::new("air_hour", DataType::UInt32, false),
        ArrowField::new("air_minute", DataType::UInt32, false),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("release_year", DataType::UInt32, false),
        ArrowField::new("summary", DataType::Utf8, false),
        ArrowField::new("image_url", DataType::Utf8, false),
        ArrowField::new("source_url", DataType::Utf8, false),
        ArrowField::new("external_id", DataType::Utf8, false),
        ArrowField::new("external_rating", DataType::Float64, true),
    ]));

    let text = |f: fn(&SnapshotRow) -> &str| -> ArrayRef {
        Arc::new(StringArray::from(rows.iter().map(f).collect::<Vec<_>>()))
    };
    let number = |f: fn(&SnapshotRow) -> u32| -> ArrayRef {
        Arc::new(UInt32Array::from(rows.iter().map(f).collect::<Vec<_>>()))
    };
    let air_dates = rows.iter().map(|r| r.air_date.to_string()).collect::<Vec<_>>();

    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            text(|r| r.id.as_str()),
            text(|r| r.provider.as_str()),
            text(|r| r.channel.as_str()),
            Arc::new(StringArray::from(air_dates)) as ArrayRef,
            number(|r| u32::from(r.air_hour)),
            number(|r| u32::from(r.air_minute)),
            text(|r| r.title.as_str()),
            number(|r| u32::from(r.release_year)),
            text(|r| r.summary.as_str()),
            text(|r| r.image_url.as_str()),
            text(|r| r.source_url.as_str()),
            text(|r| r.external_id.as_str()),
            Arc::new(Float64Array::from(
                rows.iter().map(|r| r.external_rating).collect::<Vec<_>>(),
            )) as ArrayRef,
        ],
    )
    .context("building snapshot record batch")?;

    let mut writer =
        ArrowWriter::try_new(Vec::new(), schema, None).context("opening parquet writer")?;
    writer.write(&batch).context("writing snapshot record batch")?;
    writer.into_inner().context("closing parquet writer")
}

#[derive(Debug, Clone)]
pub enum ExportOutcome {
    Written(StoredSnapshot),
    AlreadyExists,
    Empty,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExportSummary {
    pub written: Vec<String>,
    pub existing: Vec<AirDate>,
    pub empty: Vec<AirDate>,
    pub failed: Vec<AirDate>,
}

/// Exports each day of the horizon at most once; existing artifacts are never touched.
pub struct SnapshotExporter {
    store: SqliteEventStore,
    sink: SnapshotSink,
    clock: Arc<dyn Clock>,
    horizon_days: u32,
    parquet: bool,
}

impl SnapshotExporter {
    pub fn new(store: SqliteEventStore, sink: SnapshotSink, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            sink,
            clock,
            horizon_days: DEFAULT_HORIZON_DAYS,
            parquet: false,
        }
    }

    pub fn with_horizon_days(mut self, days: u32) -> Self {
        self.horizon_days = days;
        self
    }

    pub fn with_parquet(mut self, enabled: bool) -> Self {
        self.parquet = enabled;
        self
    }

    pub fn sink(&self) -> &SnapshotSink {
        &self.sink
    }

    pub async fn export(&self) -> Result<ExportSummary> {
        self.sink.ensure_root().await?;
        let window = DateWindow::starting(self.clock.today(), self.horizon_days);
        let mut summary = ExportSummary::default();

        for date in window.dates() {
            match self.export_date(date).await {
                Ok(ExportOutcome::Written(stored)) => summary.written.push(stored.key),
                Ok(ExportOutcome::AlreadyExists) => summary.existing.push(date),
                Ok(ExportOutcome::Empty) => summary.empty.push(date),
                Err(err) => {
                    error!(date = %date, error = %format!("{err:#}"), "snapshot export failed");
                    summary.failed.push(date);
                }
            }
        }
        Ok(summary)
    }

    pub async fn export_date(&self, date: AirDate) -> Result<ExportOutcome> {
        let key = snapshot_key(date);
        if self.sink.exists(&key).await? {
            debug!(key = %key, "snapshot already exported");
            return Ok(ExportOutcome::AlreadyExists);
        }

        let events = self
            .store
            .query_all_by_date(date)
            .await
            .with_context(|| format!("querying events for {date}"))?;
        if events.is_empty() {
            return Ok(ExportOutcome::Empty);
        }

        let rows = snapshot_rows(&events);
        let json = render_json_snapshot(&rows)?;
        let stored = self.sink.write_if_absent(&key, &json).await?;
        if !stored.written {
            return Ok(ExportOutcome::AlreadyExists);
        }

        if self.parquet {
            let bytes = render_parquet_snapshot(&rows)?;
            self.sink.write_if_absent(&parquet_key(date), &bytes).await?;
        }

        info!(
            key = %stored.key,
            rows = rows.len(),
            bytes = stored.byte_size,
            sha256 = %stored.content_hash,
            "snapshot written"
        );
        Ok(ExportOutcome::Written(stored))
    }
}
