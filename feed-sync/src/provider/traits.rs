//! Provider trait definitions
//!
//! A feed provider serves pages of time-keyed records for one
//! (source, entity, kind, interval) series, ending at a given timestamp.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use feed_common::error::{ErrorCategory, ErrorClassification};

use crate::schema::{DataKind, FetchWindow, Interval, SyncTarget};

/// Provider error types
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ProviderError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Rate limit exceeded (retry after {retry_after:?})")]
    RateLimit { retry_after: Option<Duration> },

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProviderError {
    /// Map a non-success HTTP status to the matching error
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        match status {
            401 | 403 => ProviderError::Authentication(message.into()),
            429 => ProviderError::RateLimit { retry_after: None },
            _ => ProviderError::Http {
                status,
                message: message.into(),
            },
        }
    }
}

impl ErrorClassification for ProviderError {
    fn category(&self) -> ErrorCategory {
        match self {
            ProviderError::Connection(_) => ErrorCategory::Transient,
            ProviderError::Timeout(_) => ErrorCategory::Transient,
            ProviderError::RateLimit { .. } => ErrorCategory::ResourceExhausted,
            ProviderError::Http { status, .. } => match status {
                408 | 500..=599 => ErrorCategory::Transient,
                _ => ErrorCategory::Permanent,
            },
            ProviderError::Parse(_) => ErrorCategory::Permanent,
            ProviderError::Authentication(_) => ErrorCategory::Configuration,
            ProviderError::Configuration(_) => ErrorCategory::Configuration,
            ProviderError::Internal(_) => ErrorCategory::Internal,
        }
    }

    fn suggested_retry_delay(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimit { retry_after } => {
                Some(retry_after.unwrap_or(Duration::from_secs(5)))
            }
            ProviderError::Connection(_) | ProviderError::Timeout(_) => Some(Duration::from_secs(2)),
            ProviderError::Http { .. } if self.is_transient() => Some(Duration::from_secs(2)),
            _ => None,
        }
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// One page of raw provider records, oldest first
pub type Page = Vec<serde_json::Value>;

/// Information about a data provider
#[derive(Debug, Clone)]
pub struct ProviderInfo {
    /// Provider name (e.g., "ccdata", "mock")
    pub name: String,
    /// Provider display name
    pub display_name: String,
    /// Kinds this provider can serve
    pub supported_kinds: Vec<DataKind>,
}

/// Request for one page of a series
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub kind: DataKind,
    pub interval: Interval,
    pub source_id: String,
    pub entity_id: String,
    /// Epoch seconds of the newest period wanted
    pub to_ts: i64,
    /// Number of periods ending at `to_ts`
    pub limit: u32,
}

impl PageRequest {
    /// Request covering `window` for `target`
    pub fn for_window(target: &SyncTarget, window: &FetchWindow) -> Self {
        Self {
            kind: target.kind,
            interval: target.interval,
            source_id: target.source_id.clone(),
            entity_id: target.entity_id.clone(),
            to_ts: window.end.timestamp(),
            limit: window.limit,
        }
    }
}

/// Source of historical time-series pages
#[async_trait]
pub trait FeedProvider: Send + Sync {
    /// Get provider information
    fn info(&self) -> &ProviderInfo;

    /// Fetch one page; an empty page means no records for the window
    async fn fetch_page(&self, request: &PageRequest) -> ProviderResult<Page>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::LifecycleStatus;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_transient_statuses() {
        for status in [500, 502, 503, 504, 507, 520, 522, 524] {
            assert!(ProviderError::from_status(status, "upstream").is_transient());
        }
        assert!(ProviderError::from_status(429, "slow down").is_transient());
        assert!(ProviderError::from_status(400, "bad instrument").is_permanent());
        assert!(ProviderError::from_status(404, "unknown market").is_permanent());
        assert_eq!(
            ProviderError::from_status(401, "bad key").category(),
            ErrorCategory::Configuration
        );
    }

    #[test]
    fn test_rate_limit_honours_retry_after() {
        let err = ProviderError::RateLimit {
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(err.suggested_retry_delay(), Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_page_request_for_window() {
        let target = SyncTarget::new(
            "binance",
            "BTC-USDT-VANILLA-PERPETUAL",
            DataKind::FundingRate,
            Interval::Hour,
            LifecycleStatus::Active,
        );
        let window = FetchWindow {
            start: Utc.with_ymd_and_hms(2024, 1, 9, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 1, 9, 3, 0, 0).unwrap(),
            limit: 4,
        };

        let request = PageRequest::for_window(&target, &window);
        assert_eq!(request.to_ts, 1704769200);
        assert_eq!(request.limit, 4);
        assert_eq!(request.kind, DataKind::FundingRate);
    }
}
