//! Shared HTTP client for the schedule scrapers and the rating lookup.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::{Client, RequestBuilder, StatusCode};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info_span, Instrument};

/// Exponential pauses between attempts after a transient failure.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: usize,
    pub first_delay: Duration,
    pub ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            first_delay: Duration::from_millis(250),
            ceiling: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Pause before retry number `retry`, counting from zero.
    pub fn pause_before(&self, retry: usize) -> Duration {
        let shift = u32::try_from(retry).unwrap_or(u32::MAX).min(31);
        self.first_delay
            .saturating_mul(1u32 << shift)
            .min(self.ceiling)
    }
}

/// 5xx and 429 are worth another try; any other non-success status is final.
pub fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_in_flight: usize,
    pub max_in_flight_per_source: usize,
    pub retry: RetryPolicy,
    /// Minimum spacing between request starts across all sources.
    pub min_interval: Option<Duration>,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_in_flight: 16,
            max_in_flight_per_source: 4,
            retry: RetryPolicy::default(),
            min_interval: None,
        }
    }
}

/// Hands out request start slots at least `interval` apart.
#[derive(Debug)]
pub struct RequestPacer {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    pub async fn wait_turn(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = next.map_or(now, |n| n.max(now));
            *next = Some(slot + self.interval);
            slot
        };
        sleep_until(slot).await;
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Errors name the requested URL without its query string, so API keys stay out of logs.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered {status}")]
    HttpStatus { status: u16, url: String },
}

enum Attempt {
    Done(FetchedResponse),
    Transient(FetchError),
    Failed(FetchError),
}

/// reqwest client with a cookie jar, bounded concurrency, optional pacing and retries.
#[derive(Debug)]
pub struct HttpFetcher {
    client: Client,
    in_flight: Semaphore,
    per_source_cap: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    pacer: Option<RequestPacer>,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(settings: HttpSettings) -> anyhow::Result<Self> {
        let mut builder = Client::builder()
            .gzip(true)
            .brotli(true)
            .cookie_store(true)
            .timeout(settings.timeout);
        if let Some(user_agent) = settings.user_agent.as_deref() {
            builder = builder.user_agent(user_agent);
        }

        Ok(Self {
            client: builder.build().context("building http client")?,
            in_flight: Semaphore::new(settings.max_in_flight.max(1)),
            per_source_cap: settings.max_in_flight_per_source.max(1),
            per_source: Mutex::new(HashMap::new()),
            pacer: settings
                .min_interval
                .filter(|interval| !interval.is_zero())
                .map(RequestPacer::new),
            retry: settings.retry,
        })
    }

    pub async fn get(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        self.send(source_id, url, |client| client.get(url)).await
    }

    pub async fn get_with_query(
        &self,
        source_id: &str,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        self.send(source_id, url, |client| client.get(url).query(query))
            .await
    }

    pub async fn post_form(
        &self,
        source_id: &str,
        url: &str,
        form: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        self.send(source_id, url, |client| client.post(url).form(form))
            .await
    }

    async fn source_limit(&self, source_id: &str) -> Arc<Semaphore> {
        let mut limits = self.per_source.lock().await;
        Arc::clone(
            limits
                .entry(source_id.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_cap))),
        )
    }

    async fn send<F>(&self, source_id: &str, url: &str, build: F) -> Result<FetchedResponse, FetchError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let source_limit = self.source_limit(source_id).await;
        // Semaphores are never closed, so a failed acquire cannot happen.
        let _global = self.in_flight.acquire().await.ok();
        let _source = source_limit.acquire().await.ok();

        async {
            let mut retry = 0;
            loop {
                if let Some(pacer) = &self.pacer {
                    pacer.wait_turn().await;
                }
                match self.attempt(build(&self.client), url).await {
                    Attempt::Done(response) => return Ok(response),
                    Attempt::Failed(err) => return Err(err),
                    Attempt::Transient(err) if retry < self.retry.retries => {
                        let pause = self.retry.pause_before(retry);
                        debug!(retry, pause_ms = pause.as_millis() as u64, error = %err, "transient failure");
                        tokio::time::sleep(pause).await;
                        retry += 1;
                    }
                    Attempt::Transient(err) => return Err(err),
                }
            }
        }
        .instrument(info_span!("http_fetch", source_id, url))
        .await
    }

    async fn attempt(&self, request: RequestBuilder, url: &str) -> Attempt {
        let response = match request.send().await {
            Ok(response) => response,
            Err(source) => {
                let transient = is_transient_error(&source);
                let err = FetchError::Request {
                    url: url.to_string(),
                    source: source.without_url(),
                };
                return if transient {
                    Attempt::Transient(err)
                } else {
                    Attempt::Failed(err)
                };
            }
        };

        let status = response.status();
        if !status.is_success() {
            let err = FetchError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            };
            return if is_transient_status(status) {
                Attempt::Transient(err)
            } else {
                Attempt::Failed(err)
            };
        }

        let final_url = response.url().to_string();
        match response.bytes().await {
            Ok(body) => Attempt::Done(FetchedResponse {
                status,
                final_url,
                body: body.to_vec(),
            }),
            Err(source) => Attempt::Transient(FetchError::Request {
                url: url.to_string(),
                source: source.without_url(),
            }),
        }
    }
}
