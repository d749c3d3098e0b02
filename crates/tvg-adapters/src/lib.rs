//! Schedule, detail-page and rating collaborators, plus the SinemaTV and OMDb implementations.

use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use thiserror::Error;
use tvg_core::{AirDate, DaySchedule, DetailInfo, RatingInfo, RawItem};
use tvg_storage::{FetchError, HttpFetcher};
use url::Url;

pub const CRATE_NAME: &str = "tvg-adapters";

pub const SINEMATV_PROVIDER: &str = "sinematv";
pub const SINEMATV_BASE_URL: &str = "https://sinematv.com.tr";
pub const OMDB_ENDPOINT: &str = "https://www.omdbapi.com/";

const OMDB_SOURCE_ID: &str = "omdb";

static VERIFICATION_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"value="([^"]*)""#).expect("static regex"));
static RELEASE_YEAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\((\d{4})\)").expect("static regex"));

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("parse failed: {0}")]
    Parse(String),
    #[error("invalid url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Daily programme listing for one provider.
#[async_trait]
pub trait ScheduleSource: Send + Sync {
    fn provider(&self) -> &str;

    async fn fetch_schedule(&self, date: AirDate) -> Result<DaySchedule, AdapterError>;

    /// Absolute form of a listing's detail link; this is the enrichment cache key.
    fn resolve_detail_url(&self, href: &str) -> Result<String, AdapterError>;
}

#[async_trait]
pub trait DetailSource: Send + Sync {
    /// `Ok(None)` when the page carries nothing usable.
    async fn fetch_detail(&self, detail_url: &str) -> Result<Option<DetailInfo>, AdapterError>;
}

#[async_trait]
pub trait MetadataLookup: Send + Sync {
    /// `Ok(None)` when the provider has no match.
    async fn lookup(
        &self,
        title: &str,
        release_year: Option<u16>,
    ) -> Result<Option<RatingInfo>, AdapterError>;
}

/// Lookup used when no rating provider is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetadataLookup;

#[async_trait]
impl MetadataLookup for NoopMetadataLookup {
    async fn lookup(
        &self,
        _title: &str,
        _release_year: Option<u16>,
    ) -> Result<Option<RatingInfo>, AdapterError> {
        Ok(None)
    }
}

pub fn resolve_against(base: &Url, href: &str) -> Result<String, AdapterError> {
    let href = href.trim();
    if href.is_empty() {
        return Err(AdapterError::InvalidUrl {
            url: href.to_string(),
            reason: "empty link".to_string(),
        });
    }
    base.join(href)
        .map(|u| u.to_string())
        .map_err(|e| AdapterError::InvalidUrl {
            url: href.to_string(),
            reason: e.to_string(),
        })
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Parse(e.to_string()))
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Anti-forgery token embedded in the guide landing page script.
pub fn extract_verification_token(page: &str) -> Option<String> {
    page.lines()
        .filter(|line| line.contains("var requestVerificationToken"))
        .filter_map(|line| VERIFICATION_TOKEN.captures(line))
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .last()
}

/// Splits the guide fragment into channel names and their per-channel flows.
///
/// Events missing anchors still yield an item with empty fields so callers can
/// account for them as malformed rather than silently losing them.
pub fn parse_tv_guide(html: &str) -> Result<(Vec<String>, Vec<Vec<RawItem>>), AdapterError> {
    let document = Html::parse_document(html);
    let channel_sel = selector("div.flow-channel")?;
    let column_sel = selector("div.row.flow > div.col-xs-12")?;
    let row_sel = selector("div.row")?;
    let event_sel = selector("div.event")?;
    let anchor_sel = selector("a")?;

    let channels = document.select(&channel_sel).map(element_text).collect::<Vec<_>>();

    let columns = document.select(&column_sel).collect::<Vec<_>>();
    let Some(flow_column) = columns.get(1) else {
        if channels.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }
        return Err(AdapterError::Parse(format!(
            "guide lists {} channels but no flow column",
            channels.len()
        )));
    };

    let flows = flow_column
        .select(&row_sel)
        .map(|row| {
            row.select(&event_sel)
                .map(|event| {
                    let anchors = event.select(&anchor_sel).collect::<Vec<_>>();
                    RawItem {
                        title: anchors.first().map(|a| element_text(*a)).unwrap_or_default(),
                        detail_url: anchors
                            .first()
                            .and_then(|a| a.value().attr("href"))
                            .map(|h| h.trim().to_string())
                            .unwrap_or_default(),
                        start_time: anchors.get(2).map(|a| element_text(*a)).unwrap_or_default(),
                    }
                })
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();

    Ok((channels, flows))
}

pub fn parse_detail_page(html: &str) -> Result<DetailInfo, AdapterError> {
    let document = Html::parse_document(html);
    let title_sel = selector("span.fl-title-medium")?;
    let image_sel = selector("div.img-fl-detail > img")?;
    let summary_sel = selector("div.container > div.row > div.col-xs-12 > p")?;

    let release_year = document.select(&title_sel).next().and_then(|title| {
        let text = element_text(title);
        RELEASE_YEAR
            .captures_iter(&text)
            .filter_map(|caps| caps.get(1))
            .last()
            .and_then(|m| m.as_str().parse::<u16>().ok())
    });
    let image_url = document
        .select(&image_sel)
        .next()
        .and_then(|img| img.value().attr("data-slazy-src"))
        .and_then(|src| text_or_none(src.to_string()));
    let summary = document
        .select(&summary_sel)
        .next()
        .and_then(|p| text_or_none(element_text(p)));

    Ok(DetailInfo {
        release_year,
        image_url,
        summary,
    })
}

/// Scrapes sinematv.com.tr: the guide is a form POST guarded by a verification token.
#[derive(Debug, Clone)]
pub struct SinemaTvAdapter {
    http: Arc<HttpFetcher>,
    base_url: Url,
}

impl SinemaTvAdapter {
    pub fn new(http: Arc<HttpFetcher>) -> Result<Self, AdapterError> {
        Self::with_base_url(http, SINEMATV_BASE_URL)
    }

    pub fn with_base_url(http: Arc<HttpFetcher>, base_url: &str) -> Result<Self, AdapterError> {
        let base_url = Url::parse(base_url).map_err(|e| AdapterError::InvalidUrl {
            url: base_url.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { http, base_url })
    }

    fn endpoint(&self, path: &str) -> Result<String, AdapterError> {
        resolve_against(&self.base_url, path)
    }
}

#[async_trait]
impl ScheduleSource for SinemaTvAdapter {
    fn provider(&self) -> &str {
        SINEMATV_PROVIDER
    }

    async fn fetch_schedule(&self, date: AirDate) -> Result<DaySchedule, AdapterError> {
        let landing_url = self.endpoint("/Yayin-Akisi")?;
        let landing = self.http.get(SINEMATV_PROVIDER, &landing_url).await?;
        let token = extract_verification_token(&landing.text()).unwrap_or_default();

        let guide_url = self.endpoint("/Asset/GetTvGuide/")?;
        let date_text = date.to_string();
        let guide = self
            .http
            .post_form(
                SINEMATV_PROVIDER,
                &guide_url,
                &[
                    ("date", date_text.as_str()),
                    ("__RequestVerificationToken", token.as_str()),
                ],
            )
            .await?;

        let (channels, flows) = parse_tv_guide(&guide.text())?;
        let (schedule, unpaired) = DaySchedule::from_parts(channels, flows);
        if unpaired > 0 {
            tracing::warn!(
                provider = SINEMATV_PROVIDER,
                date = %date,
                unpaired,
                "channel names and flows differ in count"
            );
        }
        Ok(schedule)
    }

    fn resolve_detail_url(&self, href: &str) -> Result<String, AdapterError> {
        resolve_against(&self.base_url, href)
    }
}

#[async_trait]
impl DetailSource for SinemaTvAdapter {
    async fn fetch_detail(&self, detail_url: &str) -> Result<Option<DetailInfo>, AdapterError> {
        let page = self.http.get(SINEMATV_PROVIDER, detail_url).await?;
        let detail = parse_detail_page(&page.text())?;
        if detail == DetailInfo::default() {
            return Ok(None);
        }
        Ok(Some(detail))
    }
}

#[derive(Debug, Deserialize)]
struct OmdbResponse {
    #[serde(rename = "Response")]
    response: String,
    #[serde(rename = "imdbID", default)]
    imdb_id: Option<String>,
    #[serde(rename = "imdbRating", default)]
    imdb_rating: Option<String>,
}

fn omdb_value(value: Option<String>) -> Option<String> {
    value
        .and_then(text_or_none)
        .filter(|v| !v.eq_ignore_ascii_case("N/A"))
}

/// Interprets an OMDb title lookup body. A "False" response means no match.
pub fn parse_omdb_response(body: &str) -> Result<Option<RatingInfo>, AdapterError> {
    let response: OmdbResponse = serde_json::from_str(body)
        .map_err(|e| AdapterError::Parse(format!("invalid OMDb response: {e}")))?;
    if !response.response.eq_ignore_ascii_case("true") {
        return Ok(None);
    }
    let Some(external_id) = omdb_value(response.imdb_id) else {
        return Ok(None);
    };
    let external_rating = omdb_value(response.imdb_rating).and_then(|r| r.parse::<f64>().ok());
    Ok(Some(RatingInfo {
        external_id,
        external_rating,
    }))
}

#[derive(Debug, Clone)]
pub struct OmdbLookup {
    http: Arc<HttpFetcher>,
    api_key: String,
    endpoint: String,
}

impl OmdbLookup {
    pub fn new(http: Arc<HttpFetcher>, api_key: impl Into<String>) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            endpoint: OMDB_ENDPOINT.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl MetadataLookup for OmdbLookup {
    async fn lookup(
        &self,
        title: &str,
        release_year: Option<u16>,
    ) -> Result<Option<RatingInfo>, AdapterError> {
        let year = release_year.map(|y| y.to_string()).unwrap_or_default();
        let mut query = vec![("t", title), ("type", "movie"), ("apikey", self.api_key.as_str())];
        if !year.is_empty() {
            query.push(("y", year.as_str()));
        }
        let response = self
            .http
            .get_with_query(OMDB_SOURCE_ID, &self.endpoint, &query)
            .await?;
        parse_omdb_response(&response.text())
    }
}

/// Schedule adapter registered for a provider name.
pub fn adapter_for_provider(
    provider: &str,
    http: Arc<HttpFetcher>,
) -> Result<Option<SinemaTvAdapter>, AdapterError> {
    match provider {
        SINEMATV_PROVIDER => SinemaTvAdapter::new(http).map(Some),
        _ => Ok(None),
    }
}
