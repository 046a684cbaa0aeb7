//! Mock data provider for testing
//!
//! Serves deterministic series from memory. Each (source, entity) pair has an
//! availability range; pages are generated on demand so any interval works.
//! Failures, malformed records and misbehaving responses can be injected
//! per entity.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::json;

use crate::provider::{FeedProvider, Page, PageRequest, ProviderError, ProviderInfo, ProviderResult};
use crate::schema::{DataKind, Interval, Market};

/// One simulated series
#[derive(Debug, Clone)]
struct MockSeries {
    first: DateTime<Utc>,
    last: DateTime<Utc>,
    /// Extra periods returned past `to_ts`, simulating a provider that ignores it
    overshoot: i64,
    /// Append one record without a timestamp to every page
    malformed: bool,
    /// `MAPPED_INSTRUMENT` reported instead of the requested entity
    reported_entity: Option<String>,
}

/// Mock data provider for testing
pub struct MockProvider {
    info: ProviderInfo,
    series: RwLock<HashMap<(String, String), MockSeries>>,
    failures: RwLock<HashMap<String, ProviderError>>,
    latency: Option<Duration>,
    calls: AtomicUsize,
    requests: Mutex<Vec<PageRequest>>,
}

impl MockProvider {
    /// Create a new mock provider with no series
    pub fn new() -> Self {
        Self {
            info: ProviderInfo {
                name: "mock".to_string(),
                display_name: "Mock Provider".to_string(),
                supported_kinds: DataKind::ALL.to_vec(),
            },
            series: RwLock::new(HashMap::new()),
            failures: RwLock::new(HashMap::new()),
            latency: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Delay every response by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Serve records for every period start in `[first, last]`
    pub fn with_series(
        self,
        source_id: &str,
        entity_id: &str,
        first: DateTime<Utc>,
        last: DateTime<Utc>,
    ) -> Self {
        self.series.write().insert(
            (source_id.to_string(), entity_id.to_string()),
            MockSeries {
                first,
                last,
                overshoot: 0,
                malformed: false,
                reported_entity: None,
            },
        );
        self
    }

    /// Fail every request for `entity_id` with `error`
    pub fn with_failure(self, entity_id: &str, error: ProviderError) -> Self {
        self.failures.write().insert(entity_id.to_string(), error);
        self
    }

    /// Return `periods` extra records beyond `to_ts` for a series
    pub fn with_overshoot(self, source_id: &str, entity_id: &str, periods: i64) -> Self {
        if let Some(series) = self
            .series
            .write()
            .get_mut(&(source_id.to_string(), entity_id.to_string()))
        {
            series.overshoot = periods;
        }
        self
    }

    /// Append a record with no timestamp to every page of a series
    pub fn with_malformed_records(self, source_id: &str, entity_id: &str) -> Self {
        if let Some(series) = self
            .series
            .write()
            .get_mut(&(source_id.to_string(), entity_id.to_string()))
        {
            series.malformed = true;
        }
        self
    }

    /// Report every record of a series under another instrument id
    pub fn with_reported_entity(self, source_id: &str, entity_id: &str, reported: &str) -> Self {
        if let Some(series) = self
            .series
            .write()
            .get_mut(&(source_id.to_string(), entity_id.to_string()))
        {
            series.reported_entity = Some(reported.to_string());
        }
        self
    }

    /// Extend the last available period of a series
    pub fn extend_series(&self, source_id: &str, entity_id: &str, last: DateTime<Utc>) {
        if let Some(series) = self
            .series
            .write()
            .get_mut(&(source_id.to_string(), entity_id.to_string()))
        {
            series.last = last;
        }
    }

    /// Clear an injected failure
    pub fn clear_failure(&self, entity_id: &str) {
        self.failures.write().remove(entity_id);
    }

    /// Number of `fetch_page` calls so far
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requests received for one entity, in arrival order
    pub fn requests_for(&self, entity_id: &str) -> Vec<PageRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.entity_id == entity_id)
            .cloned()
            .collect()
    }

    fn generate_record(kind: DataKind, request: &PageRequest, ts: DateTime<Utc>) -> serde_json::Value {
        let base = 100 + (ts.timestamp() / request.interval.seconds()) % 50;
        let mut record = match kind.market() {
            Market::Futures => json!({
                "TIMESTAMP": ts.timestamp(),
                "MARKET": request.source_id,
                "INSTRUMENT": request.entity_id.replace('-', ""),
                "MAPPED_INSTRUMENT": request.entity_id,
                "TYPE": "952",
                "QUOTE_CURRENCY": "USDT",
            }),
            Market::Spot => json!({
                "TIMESTAMP": ts.timestamp(),
                "MARKET": request.source_id,
                "INSTRUMENT": request.entity_id,
                "MAPPED_INSTRUMENT": request.entity_id,
            }),
            // Index families report the instrument only
            Market::Index => json!({
                "UNIT": "DAY",
                "TIMESTAMP": ts.timestamp(),
                "MARKET": request.source_id,
                "INSTRUMENT": request.entity_id,
            }),
        };

        let fields = match kind {
            DataKind::Ohlcv | DataKind::SpotOhlcv => json!({
                "OPEN": base,
                "HIGH": base + 2,
                "LOW": base - 1,
                "CLOSE": base + 1,
                "VOLUME": base * 10,
                "TOTAL_TRADES": base * 3,
            }),
            DataKind::FundingRate => json!({
                "OPEN": 0.0001,
                "HIGH": 0.00015,
                "LOW": 0.00005,
                "CLOSE": 0.0001,
                "INTERVAL_MS": 28_800_000,
            }),
            DataKind::OpenInterest => json!({
                "OPEN_SETTLEMENT": base * 1000,
                "CLOSE_SETTLEMENT": base * 1000 + 50,
                "CLOSE_MARK_PRICE": base,
            }),
            DataKind::IndexOhlcv => json!({
                "OPEN": base,
                "HIGH": base + 2,
                "LOW": base - 1,
                "CLOSE": base + 1,
                "TOTAL_INDEX_UPDATES": base * 100,
            }),
        };

        if let (Some(target), Some(extra)) = (record.as_object_mut(), fields.as_object()) {
            target.extend(extra.clone());
        }
        record
    }

    fn build_page(series: &MockSeries, request: &PageRequest) -> Page {
        let interval: Interval = request.interval;
        let Some(to) = DateTime::from_timestamp(request.to_ts, 0) else {
            return Vec::new();
        };

        let from = interval.advance(to, -(i64::from(request.limit) - 1));
        let to = interval.advance(to, series.overshoot);

        let mut page = Vec::new();
        let mut ts = interval.floor(from);
        while ts <= to {
            if ts >= series.first && ts <= series.last && ts >= from {
                let mut record = Self::generate_record(request.kind, request, ts);
                if let Some(reported) = &series.reported_entity {
                    let field = if record.get("MAPPED_INSTRUMENT").is_some() { "MAPPED_INSTRUMENT" } else { "INSTRUMENT" };
                    record[field] = json!(reported);
                }
                page.push(record);
            }
            ts = interval.advance(ts, 1);
        }

        if series.malformed && !page.is_empty() {
            page.push(json!({ "MARKET": request.source_id, "MAPPED_INSTRUMENT": request.entity_id }));
        }
        page
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FeedProvider for MockProvider {
    fn info(&self) -> &ProviderInfo {
        &self.info
    }

    async fn fetch_page(&self, request: &PageRequest) -> ProviderResult<Page> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        if let Some(err) = self.failures.read().get(&request.entity_id) {
            return Err(err.clone());
        }

        let series = self
            .series
            .read()
            .get(&(request.source_id.clone(), request.entity_id.clone()))
            .cloned();

        Ok(series
            .map(|s| Self::build_page(&s, request))
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()
    }

    fn request(entity: &str, to: DateTime<Utc>, limit: u32) -> PageRequest {
        PageRequest {
            kind: DataKind::Ohlcv,
            interval: Interval::Day,
            source_id: "binance".to_string(),
            entity_id: entity.to_string(),
            to_ts: to.timestamp(),
            limit,
        }
    }

    #[tokio::test]
    async fn test_page_respects_limit_and_availability() {
        let provider = MockProvider::new().with_series("binance", "BTC", day(3), day(20));

        let page = provider.fetch_page(&request("BTC", day(9), 4)).await.unwrap();
        let stamps: Vec<i64> = page.iter().map(|r| r["TIMESTAMP"].as_i64().unwrap()).collect();
        assert_eq!(stamps, vec![day(6).timestamp(), day(7).timestamp(), day(8).timestamp(), day(9).timestamp()]);

        let page = provider.fetch_page(&request("BTC", day(4), 5)).await.unwrap();
        assert_eq!(page.len(), 2);

        assert_eq!(provider.call_count(), 2);
        assert_eq!(provider.requests_for("BTC").len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_series_is_empty() {
        let provider = MockProvider::new();
        assert!(provider.fetch_page(&request("ETH", day(9), 4)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let provider = MockProvider::new()
            .with_series("binance", "BTC", day(1), day(20))
            .with_failure("BTC", ProviderError::from_status(503, "maintenance"));

        assert!(provider.fetch_page(&request("BTC", day(9), 4)).await.is_err());
        provider.clear_failure("BTC");
        assert!(provider.fetch_page(&request("BTC", day(9), 4)).await.is_ok());
    }

    #[tokio::test]
    async fn test_overshoot_and_malformed() {
        let provider = MockProvider::new()
            .with_series("binance", "BTC", day(1), day(20))
            .with_overshoot("binance", "BTC", 2)
            .with_malformed_records("binance", "BTC");

        let page = provider.fetch_page(&request("BTC", day(9), 4)).await.unwrap();
        // 4 requested + 2 past to_ts + 1 malformed
        assert_eq!(page.len(), 7);
        assert!(page.last().unwrap().get("TIMESTAMP").is_none());
    }
}
