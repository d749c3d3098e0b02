//! Core domain model for the TV guide harvester.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "tvg-core";

/// Textual form used by the schedule source, the store and snapshot keys.
pub const AIR_DATE_FORMAT: &str = "%d.%m.%Y";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AirDateError {
    #[error("air date `{0}` is not in DD.MM.YYYY form")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AirTimeError {
    #[error("start time `{0}` is not in HH:MM form")]
    Malformed(String),
    #[error("start time `{0}` is out of range")]
    OutOfRange(String),
}

/// Calendar day of an airing. Structured internally, `DD.MM.YYYY` at the edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AirDate(NaiveDate);

impl AirDate {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }

    /// Day `days` after this one, `None` past the end of chrono's range.
    pub fn plus_days(&self, days: u64) -> Option<Self> {
        self.0.checked_add_days(Days::new(days)).map(Self)
    }
}

impl fmt::Display for AirDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(AIR_DATE_FORMAT))
    }
}

impl FromStr for AirDate {
    type Err = AirDateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.len() != 10 {
            return Err(AirDateError::Malformed(s.to_string()));
        }
        NaiveDate::parse_from_str(trimmed, AIR_DATE_FORMAT)
            .map(Self)
            .map_err(|_| AirDateError::Malformed(s.to_string()))
    }
}

impl From<NaiveDate> for AirDate {
    fn from(date: NaiveDate) -> Self {
        Self(date)
    }
}

impl Serialize for AirDate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AirDate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Wall-clock start of an airing as listed in the guide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AirTime {
    pub hour: u8,
    pub minute: u8,
}

impl AirTime {
    pub fn new(hour: u8, minute: u8) -> Result<Self, AirTimeError> {
        if hour > 23 || minute > 59 {
            return Err(AirTimeError::OutOfRange(format!("{hour:02}:{minute:02}")));
        }
        Ok(Self { hour, minute })
    }
}

impl FromStr for AirTime {
    type Err = AirTimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || AirTimeError::Malformed(s.to_string());
        let (hour, minute) = s.trim().split_once(':').ok_or_else(malformed)?;
        let hour: u8 = hour.trim().parse().map_err(|_| malformed())?;
        let minute: u8 = minute.trim().parse().map_err(|_| malformed())?;
        Self::new(hour, minute).map_err(|_| AirTimeError::OutOfRange(s.to_string()))
    }
}

impl fmt::Display for AirTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// Natural key of a broadcast instance. Two events with equal identity are the same airing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventIdentity {
    pub provider: String,
    pub channel: String,
    pub air_date: AirDate,
    pub air_hour: u8,
    pub air_minute: u8,
    pub title: String,
}

/// Metadata attached to an airing from the detail page and the rating provider.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Enrichment {
    /// 0 when unknown.
    pub release_year: u16,
    pub image_url: String,
    pub summary: String,
    pub external_id: String,
    pub external_rating: Option<f64>,
}

impl Enrichment {
    pub fn apply_detail(&mut self, detail: DetailInfo) {
        if let Some(year) = detail.release_year {
            self.release_year = year;
        }
        if let Some(image_url) = detail.image_url {
            self.image_url = image_url;
        }
        if let Some(summary) = detail.summary {
            self.summary = summary;
        }
    }

    pub fn apply_rating(&mut self, rating: RatingInfo) {
        self.external_id = rating.external_id;
        self.external_rating = rating.external_rating;
    }

    pub fn release_year(&self) -> Option<u16> {
        (self.release_year != 0).then_some(self.release_year)
    }
}

/// One scheduled airing, fully assembled and ready for the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastEvent {
    pub provider: String,
    pub channel: String,
    pub air_date: AirDate,
    pub air_hour: u8,
    pub air_minute: u8,
    pub title: String,
    pub release_year: u16,
    pub summary: String,
    pub image_url: String,
    pub source_url: String,
    pub external_id: String,
    pub external_rating: Option<f64>,
}

impl BroadcastEvent {
    pub fn new(
        provider: impl Into<String>,
        channel: impl Into<String>,
        air_date: AirDate,
        air_time: AirTime,
        title: impl Into<String>,
        source_url: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            channel: channel.into(),
            air_date,
            air_hour: air_time.hour,
            air_minute: air_time.minute,
            title: title.into(),
            release_year: 0,
            summary: String::new(),
            image_url: String::new(),
            source_url: source_url.into(),
            external_id: String::new(),
            external_rating: None,
        }
    }

    pub fn identity(&self) -> EventIdentity {
        EventIdentity {
            provider: self.provider.clone(),
            channel: self.channel.clone(),
            air_date: self.air_date,
            air_hour: self.air_hour,
            air_minute: self.air_minute,
            title: self.title.clone(),
        }
    }

    pub fn with_enrichment(mut self, enrichment: &Enrichment) -> Self {
        self.release_year = enrichment.release_year;
        self.image_url = enrichment.image_url.clone();
        self.summary = enrichment.summary.clone();
        self.external_id = enrichment.external_id.clone();
        self.external_rating = enrichment.external_rating;
        self
    }

    pub fn enrichment(&self) -> Enrichment {
        Enrichment {
            release_year: self.release_year,
            image_url: self.image_url.clone(),
            summary: self.summary.clone(),
            external_id: self.external_id.clone(),
            external_rating: self.external_rating,
        }
    }
}

/// A persisted airing with the surrogate id assigned at insert time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: Uuid,
    pub event: BroadcastEvent,
}

/// Schedule entry as scraped, before any normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawItem {
    pub title: String,
    pub start_time: String,
    pub detail_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSchedule {
    pub channel: String,
    pub items: Vec<RawItem>,
}

/// Everything the schedule source returned for one day.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DaySchedule {
    pub channels: Vec<ChannelSchedule>,
}

impl DaySchedule {
    /// Pairs channel names with their flows positionally.
    ///
    /// Returns the number of unpaired entries on either side alongside the schedule.
    pub fn from_parts(channels: Vec<String>, flows: Vec<Vec<RawItem>>) -> (Self, usize) {
        let unpaired = channels.len().abs_diff(flows.len());
        let channels = channels
            .into_iter()
            .zip(flows)
            .map(|(channel, items)| ChannelSchedule { channel, items })
            .collect();
        (Self { channels }, unpaired)
    }

    pub fn item_count(&self) -> usize {
        self.channels.iter().map(|c| c.items.len()).sum()
    }
}

/// Fields recovered from a programme's detail page.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DetailInfo {
    pub release_year: Option<u16>,
    pub image_url: Option<String>,
    pub summary: Option<String>,
}

/// Match returned by the rating provider.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RatingInfo {
    pub external_id: String,
    pub external_rating: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentCacheEntry {
    pub source_url: String,
    pub enrichment: Enrichment,
    pub queried_at: DateTime<Utc>,
}

impl EnrichmentCacheEntry {
    pub fn new(source_url: impl Into<String>, enrichment: Enrichment, queried_at: DateTime<Utc>) -> Self {
        Self {
            source_url: source_url.into(),
            enrichment,
            queried_at,
        }
    }
}
