use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::retry::RetryPolicy;

const SERVICE: &str = "places";

/// Answer of an upstream validity check on a stored place id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaceRefresh {
    Same,
    Changed(String),
    /// The id no longer resolves upstream.
    Invalid,
}

#[async_trait]
pub trait PlaceLookup: Send + Sync {
    /// Best candidate id for a free-text query, `None` when nothing matches.
    async fn find_place(&self, query: &str) -> AppResult<Option<String>>;
    async fn refresh_place(&self, place_id: &str) -> AppResult<PlaceRefresh>;
}

/// Rate-limited, retrying front for a [`PlaceLookup`].
#[derive(Clone)]
pub struct PlacesService {
    inner: Arc<dyn PlaceLookup>,
    rate_limiter: Arc<RateLimiter>,
    retry: Arc<RetryPolicy>,
}

impl PlacesService {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let key = config.google_places_api_key.clone().ok_or_else(|| {
            AppError::Config("GOOGLE_PLACES_API_KEY must be set to resolve restaurants".into())
        })?;
        let client = HttpPlacesClient::new(&config.google_places_api_base, key)?;
        Ok(Self::with_lookup(
            Arc::new(client),
            config.places_rate_limit_qps,
            RetryPolicy::from_config(config),
        ))
    }

    pub fn with_lookup(lookup: Arc<dyn PlaceLookup>, qps: u32, retry: RetryPolicy) -> Self {
        Self {
            inner: lookup,
            rate_limiter: Arc::new(RateLimiter::new(qps.max(1))),
            retry: Arc::new(retry),
        }
    }

    pub async fn find_place(&self, query: &str) -> AppResult<Option<String>> {
        self.retry
            .run(SERVICE, move || async move {
                self.rate_limiter.wait().await;
                self.inner.find_place(query).await
            })
            .await
    }

    pub async fn refresh_place(&self, place_id: &str) -> AppResult<PlaceRefresh> {
        self.retry
            .run(SERVICE, move || async move {
                self.rate_limiter.wait().await;
                self.inner.refresh_place(place_id).await
            })
            .await
    }
}

struct RateLimiter {
    min_interval: Duration,
    last_tick: AsyncMutex<Option<Instant>>,
}

impl RateLimiter {
    fn new(qps: u32) -> Self {
        Self {
            min_interval: Duration::from_millis(Self::interval_ms(qps)),
            last_tick: AsyncMutex::new(None),
        }
    }

    fn interval_ms(qps: u32) -> u64 {
        let safe_qps = qps.max(1);
        let interval_ms = (1000_f64 / safe_qps as f64).ceil() as u64;
        interval_ms.max(50)
    }

    async fn wait(&self) {
        let interval = self.min_interval;
        let mut guard = self.last_tick.lock().await;
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < interval {
                trace!(wait = ?(interval - elapsed), "places rate limit");
                sleep(interval - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }
}

/// Google Places "find place from text" and "details" endpoints, asking only
/// for the `place_id` field.
pub struct HttpPlacesClient {
    http: reqwest::Client,
    base_url: String,
    api_key: SecretString,
}

#[derive(Deserialize)]
struct FindPlaceResponse {
    status: String,
    #[serde(default)]
    candidates: Vec<Candidate>,
    error_message: Option<String>,
}

#[derive(Deserialize)]
struct Candidate {
    place_id: Option<String>,
}

#[derive(Deserialize)]
struct DetailsResponse {
    status: String,
    result: Option<Candidate>,
    error_message: Option<String>,
}

impl HttpPlacesClient {
    pub fn new(base_url: &str, api_key: SecretString) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    async fn get<T: for<'de> Deserialize<'de>>(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
    ) -> AppResult<T> {
        let response = self
            .http
            .get(format!("{}/{endpoint}/json", self.base_url))
            .query(params)
            .query(&[("key", self.api_key.expose_secret())])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Upstream {
                service: SERVICE,
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.json().await?)
    }
}

/// Maps the body-level status Google reports alongside HTTP 200.
fn status_error(status: &str, message: Option<String>) -> AppError {
    let code = match status {
        "OVER_QUERY_LIMIT" => 429,
        "REQUEST_DENIED" => 403,
        "INVALID_REQUEST" => 400,
        _ => 500,
    };
    AppError::Upstream {
        service: SERVICE,
        status: code,
        message: message.unwrap_or_else(|| status.to_string()),
    }
}

#[async_trait]
impl PlaceLookup for HttpPlacesClient {
    async fn find_place(&self, query: &str) -> AppResult<Option<String>> {
        let response: FindPlaceResponse = self
            .get(
                "findplacefromtext",
                &[("input", query), ("inputtype", "textquery"), ("fields", "place_id")],
            )
            .await?;
        match response.status.as_str() {
            "OK" => {
                let place_id = response
                    .candidates
                    .into_iter()
                    .find_map(|candidate| candidate.place_id);
                debug!(query, ?place_id, "place lookup");
                Ok(place_id)
            }
            "ZERO_RESULTS" => Ok(None),
            other => Err(status_error(other, response.error_message)),
        }
    }

    async fn refresh_place(&self, place_id: &str) -> AppResult<PlaceRefresh> {
        let response: DetailsResponse = self
            .get("details", &[("place_id", place_id), ("fields", "place_id")])
            .await?;
        match response.status.as_str() {
            "OK" => match response.result.and_then(|result| result.place_id) {
                Some(current) if current == place_id => Ok(PlaceRefresh::Same),
                Some(current) => Ok(PlaceRefresh::Changed(current)),
                None => Ok(PlaceRefresh::Invalid),
            },
            "NOT_FOUND" | "ZERO_RESULTS" | "INVALID_REQUEST" => Ok(PlaceRefresh::Invalid),
            other => Err(status_error(other, response.error_message)),
        }
    }
}
