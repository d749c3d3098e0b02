//! Deduplicating event store, write-once snapshot sink, and HTTP fetch utilities.

mod http;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use sha2::{Digest, Sha256};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Row, Sqlite};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use tvg_core::{AirDate, BroadcastEvent, EventIdentity, StoredEvent};
use uuid::Uuid;

pub use http::{
    is_transient_status, FetchError, FetchedResponse, HttpFetcher, HttpSettings, RequestPacer,
    RetryPolicy,
};

pub const CRATE_NAME: &str = "tvg-storage";

/// File name of the event database inside the configured store folder.
pub const DATABASE_FILE_NAME: &str = "movie_ratings.db";

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt row {id}: {reason}")]
    CorruptRow { id: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(Uuid),
    Duplicate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub inserted: usize,
    pub duplicates: usize,
}

impl InsertOutcome {
    pub fn is_inserted(&self) -> bool {
        matches!(self, Self::Inserted(_))
    }
}

/// Broadcast events keyed by their natural identity.
///
/// Uniqueness is enforced by a unique index, so concurrent inserts of the same
/// identity resolve inside SQLite and never yield two rows. Rows are never updated.
#[derive(Debug, Clone)]
pub struct SqliteEventStore {
    pool: SqlitePool,
}

impl SqliteEventStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    /// Single-connection in-memory store; the connection is pinned so the data survives.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn exists(&self, identity: &EventIdentity) -> Result<bool, StoreError> {
        let found: i64 = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1
                  FROM broadcast_events
                 WHERE provider = ?
                   AND channel = ?
                   AND air_date = ?
                   AND air_hour = ?
                   AND air_minute = ?
                   AND title = ?
            )
            "#,
        )
        .bind(&identity.provider)
        .bind(&identity.channel)
        .bind(identity.air_date.to_string())
        .bind(i64::from(identity.air_hour))
        .bind(i64::from(identity.air_minute))
        .bind(&identity.title)
        .fetch_one(&self.pool)
        .await?;
        Ok(found != 0)
    }

    /// Inserts the event unless its identity is already stored. A duplicate is not an error.
    pub async fn insert(&self, event: &BroadcastEvent) -> Result<InsertOutcome, StoreError> {
        Ok(insert_event(&self.pool, event).await?)
    }

    /// Inserts a batch in one transaction: either every new identity lands or none does.
    pub async fn insert_all(&self, events: &[BroadcastEvent]) -> Result<BatchOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut outcome = BatchOutcome::default();
        for event in events {
            match insert_event(&mut *tx, event).await? {
                InsertOutcome::Inserted(_) => outcome.inserted += 1,
                InsertOutcome::Duplicate => outcome.duplicates += 1,
            }
        }
        tx.commit().await?;
        Ok(outcome)
    }

    pub async fn count_by_date(&self, provider: &str, date: AirDate) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM broadcast_events WHERE provider = ? AND air_date = ?",
        )
        .bind(provider)
        .bind(date.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    pub async fn query_by_date(
        &self,
        provider: &str,
        date: AirDate,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, provider, channel, air_date, air_hour, air_minute, title,
                   release_year, summary, image_url, source_url, external_id, external_rating
              FROM broadcast_events
             WHERE provider = ?
               AND air_date = ?
             ORDER BY channel, air_hour, air_minute, title
            "#,
        )
        .bind(provider)
        .bind(date.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(stored_event_from_row).collect()
    }

    /// Every provider's events for one day, as the snapshot exporter reads them.
    pub async fn query_all_by_date(&self, date: AirDate) -> Result<Vec<StoredEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, provider, channel, air_date, air_hour, air_minute, title,
                   release_year, summary, image_url, source_url, external_id, external_rating
              FROM broadcast_events
             WHERE air_date = ?
             ORDER BY provider, channel, air_hour, air_minute, title
            "#,
        )
        .bind(date.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(stored_event_from_row).collect()
    }

    pub async fn count_all(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM broadcast_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

async fn insert_event<'c, E>(executor: E, event: &BroadcastEvent) -> Result<InsertOutcome, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Sqlite>,
{
    let id = Uuid::new_v4();
    let result = sqlx::query(
        r#"
        INSERT INTO broadcast_events (
            id, provider, channel, air_date, air_hour, air_minute, title,
            release_year, summary, image_url, source_url, external_id, external_rating
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (provider, channel, air_date, air_hour, air_minute, title) DO NOTHING
        "#,
    )
    .bind(id.to_string())
    .bind(&event.provider)
    .bind(&event.channel)
    .bind(event.air_date.to_string())
    .bind(i64::from(event.air_hour))
    .bind(i64::from(event.air_minute))
    .bind(&event.title)
    .bind(i64::from(event.release_year))
    .bind(&event.summary)
    .bind(&event.image_url)
    .bind(&event.source_url)
    .bind(&event.external_id)
    .bind(event.external_rating)
    .execute(executor)
    .await?;

    if result.rows_affected() == 0 {
        debug!(provider = %event.provider, channel = %event.channel, date = %event.air_date, title = %event.title, "identity already stored");
        return Ok(InsertOutcome::Duplicate);
    }
    Ok(InsertOutcome::Inserted(id))
}

fn stored_event_from_row(row: &SqliteRow) -> Result<StoredEvent, StoreError> {
    let raw_id: String = row.try_get("id")?;
    let corrupt = |reason: String| StoreError::CorruptRow {
        id: raw_id.clone(),
        reason,
    };

    let id = Uuid::parse_str(&raw_id).map_err(|e| corrupt(e.to_string()))?;
    let air_date: AirDate = row
        .try_get::<String, _>("air_date")?
        .parse()
        .map_err(|e: tvg_core::AirDateError| corrupt(e.to_string()))?;
    let air_hour = u8::try_from(row.try_get::<i64, _>("air_hour")?)
        .map_err(|_| corrupt("air_hour out of range".to_string()))?;
    let air_minute = u8::try_from(row.try_get::<i64, _>("air_minute")?)
        .map_err(|_| corrupt("air_minute out of range".to_string()))?;
    let release_year = u16::try_from(row.try_get::<i64, _>("release_year")?)
        .map_err(|_| corrupt("release_year out of range".to_string()))?;

    Ok(StoredEvent {
        id,
        event: BroadcastEvent {
            provider: row.try_get("provider")?,
            channel: row.try_get("channel")?,
            air_date,
            air_hour,
            air_minute,
            title: row.try_get("title")?,
            release_year,
            summary: row.try_get("summary")?,
            image_url: row.try_get("image_url")?,
            source_url: row.try_get("source_url")?,
            external_id: row.try_get("external_id")?,
            external_rating: row.try_get("external_rating")?,
        },
    })
}

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub key: String,
    pub content_hash: String,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    /// False when an artifact for the key already existed and was left untouched.
    pub written: bool,
}

/// Date-keyed immutable artifacts on the local filesystem.
#[derive(Debug, Clone)]
pub struct SnapshotSink {
    root: PathBuf,
}

impl SnapshotSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn path_for(&self, key: &str) -> anyhow::Result<PathBuf> {
        let key = key.trim();
        if key.is_empty()
            || key.starts_with('.')
            || key.contains(&['/', '\\'][..])
            || key.contains("..")
        {
            anyhow::bail!("invalid snapshot key `{key}`");
        }
        Ok(self.root.join(key))
    }

    pub async fn ensure_root(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating snapshot directory {}", self.root.display()))
    }

    pub async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        let path = self.path_for(key)?;
        fs::try_exists(&path)
            .await
            .with_context(|| format!("checking snapshot path {}", path.display()))
    }

    /// Write bytes under `key` unless an artifact already exists there.
    ///
    /// The content lands in a temp file first and is hard-linked into place, which
    /// fails instead of clobbering when another writer got there first.
    pub async fn write_if_absent(&self, key: &str, bytes: &[u8]) -> anyhow::Result<StoredSnapshot> {
        let absolute_path = self.path_for(key)?;
        let content_hash = Self::sha256_hex(bytes);
        let snapshot = |written: bool| StoredSnapshot {
            key: key.to_string(),
            content_hash: content_hash.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            written,
        };

        self.ensure_root().await?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking snapshot path {}", absolute_path.display()))?
        {
            return Ok(snapshot(false));
        }

        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot file {}", temp_path.display()))?;
        let written = async {
            file.write_all(bytes).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);
        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err)
                .with_context(|| format!("writing temp snapshot file {}", temp_path.display()));
        }

        let linked = fs::hard_link(&temp_path, &absolute_path).await;
        let _ = fs::remove_file(&temp_path).await;
        match linked {
            Ok(()) => Ok(snapshot(true)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(snapshot(false)),
            Err(err) => Err(err).with_context(|| {
                format!(
                    "linking temp snapshot {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            }),
        }
    }
}
