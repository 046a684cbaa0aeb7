//! HTTP client for the historical futures, spot and index endpoints
//!
//! Handles:
//! - A shared inter-call spacing via `governor`, across all syncers
//! - Retry with exponential backoff via [`RetryPolicy`]
//! - Mapping of HTTP status codes to [`ProviderError`]

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorRateLimiter,
};
use reqwest::{header, Client, Response, StatusCode};
use serde::Deserialize;
use tracing::debug;

use feed_common::RetryPolicy;

use crate::config::ProviderSettings;
use crate::provider::{FeedProvider, Page, PageRequest, ProviderError, ProviderInfo, ProviderResult};
use crate::schema::{DataKind, Interval, Market};

type Limiter = GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Response envelope; `Data` may be absent or null when nothing matched
#[derive(Debug, Deserialize)]
struct HistoricalResponse {
    #[serde(rename = "Data", default)]
    data: Option<serde_json::Value>,
    #[serde(rename = "Err", default)]
    err: Option<serde_json::Value>,
}

/// Historical market data client
pub struct CcdataProvider {
    client: Client,
    base_url: String,
    limiter: Option<Arc<Limiter>>,
    retry: RetryPolicy,
    timeout: Duration,
    info: ProviderInfo,
}

impl CcdataProvider {
    /// Create a client from provider settings
    pub fn from_settings(settings: &ProviderSettings) -> ProviderResult<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));

        if let Some(key) = settings.api_key.as_deref().filter(|k| !k.is_empty()) {
            let value = header::HeaderValue::from_str(&format!("Apikey {}", key))
                .map_err(|e| ProviderError::Configuration(format!("Invalid API key: {}", e)))?;
            headers.insert(header::AUTHORIZATION, value);
        }

        let client = Client::builder()
            .timeout(settings.request_timeout())
            .default_headers(headers)
            .build()
            .map_err(|e| ProviderError::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            limiter: Self::create_limiter(settings.call_delay()),
            retry: settings.retry.policy(),
            timeout: settings.request_timeout(),
            info: ProviderInfo {
                name: "ccdata".to_string(),
                display_name: "CCData historical".to_string(),
                supported_kinds: DataKind::ALL.to_vec(),
            },
        })
    }

    /// One call per `delay`; no limiter when the delay is zero
    fn create_limiter(delay: Duration) -> Option<Arc<Limiter>> {
        Quota::with_period(delay)
            .map(|quota| quota.allow_burst(NonZeroU32::MIN))
            .map(|quota| Arc::new(GovernorRateLimiter::direct(quota)))
    }

    /// Endpoint path for a kind and interval
    pub fn endpoint(kind: DataKind, interval: Interval) -> String {
        let period = match interval {
            Interval::Day => "days",
            Interval::Hour => "hours",
            Interval::Minute => "minutes",
        };
        match kind {
            DataKind::Ohlcv => format!("/futures/v1/historical/{}", period),
            DataKind::FundingRate => format!("/futures/v1/historical/funding-rate/{}", period),
            DataKind::OpenInterest => format!("/futures/v1/historical/open-interest/{}", period),
            DataKind::SpotOhlcv => format!("/spot/v1/historical/{}", period),
            DataKind::IndexOhlcv => format!("/index/cc/v1/historical/{}", period),
        }
    }

    /// Query parameters for one page; index families have no instrument mapping
    fn query_params(request: &PageRequest) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("market", request.source_id.clone()),
            ("instrument", request.entity_id.clone()),
            ("to_ts", request.to_ts.to_string()),
            ("limit", request.limit.to_string()),
        ];
        if request.kind.market() != Market::Index {
            params.push(("apply_mapping", "true".to_string()));
        }
        params
    }

    async fn fetch_once(&self, request: &PageRequest) -> ProviderResult<Page> {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }

        let url = format!("{}{}", self.base_url, Self::endpoint(request.kind, request.interval));
        let params = Self::query_params(request);

        debug!(url = %url, market = %request.source_id, instrument = %request.entity_id, to_ts = request.to_ts, limit = request.limit, "GET");

        let response = self
            .client
            .get(&url)
            .query(&params)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        self.handle_response(response).await
    }

    fn map_transport_error(&self, err: reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout(self.timeout)
        } else if err.is_connect() || err.is_request() || err.is_body() {
            ProviderError::Connection(err.to_string())
        } else {
            ProviderError::Internal(err.to_string())
        }
    }

    async fn handle_response(&self, response: Response) -> ProviderResult<Page> {
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(ProviderError::RateLimit { retry_after });
        }

        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Connection(format!("Failed to read response: {}", e)))?;

        if !status.is_success() {
            // Some endpoints answer "no data in range" as a 404 with an empty Data array
            if status == StatusCode::NOT_FOUND {
                if let Ok(page) = parse_page(&body) {
                    return Ok(page);
                }
            }
            return Err(ProviderError::from_status(status.as_u16(), truncate(&body, 512)));
        }

        parse_page(&body)
    }
}

/// Decode the response body into a page; absent or null `Data` is an empty page
pub(crate) fn parse_page(body: &str) -> ProviderResult<Page> {
    let response: HistoricalResponse = serde_json::from_str(body)
        .map_err(|e| ProviderError::Parse(format!("Failed to parse response: {} - body: {}", e, truncate(body, 256))))?;

    match response.data {
        None | Some(serde_json::Value::Null) => {
            if let Some(err) = response.err.filter(|e| e.as_object().is_some_and(|o| !o.is_empty())) {
                debug!("Provider returned no data: {}", err);
            }
            Ok(Vec::new())
        }
        Some(serde_json::Value::Array(records)) => Ok(records),
        Some(other) => Err(ProviderError::Parse(format!(
            "Expected Data to be an array, got {}",
            truncate(&other.to_string(), 128)
        ))),
    }
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[async_trait]
impl FeedProvider for CcdataProvider {
    fn info(&self) -> &ProviderInfo {
        &self.info
    }

    async fn fetch_page(&self, request: &PageRequest) -> ProviderResult<Page> {
        let label = format!("fetch {} {}:{}", request.kind, request.source_id, request.entity_id);
        self.retry.run(&label, || self.fetch_once(request)).await
    }
}
