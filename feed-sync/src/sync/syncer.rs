//! Per-target pagination loop
//!
//! Resumes from the persisted watermark and walks forward one window at a
//! time: fetch, normalize, persist, advance. Windows of one target are
//! strictly sequential; the next window is computed only after the previous
//! persist outcome is known.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::normalizer::normalize_page;
use crate::provider::{FeedProvider, PageRequest, ProviderError};
use crate::schema::{FetchWindow, NormalizedRecord, SyncTarget, WatermarkKey};
use crate::storage::{GatewayError, PersistenceGateway};
use crate::window::WindowCalculator;

/// Wall clock used to bound windows; injectable for tests
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Why a target's sync loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    /// No window left before the effective end
    UpToDate,
    /// Provider returned an empty page
    NoData,
    /// Advancing produced no forward progress past the watermark
    Stalled,
    /// Fetch or persist failed after retries
    Error,
    /// Run-level cancellation
    Cancelled,
}

impl TerminalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalReason::UpToDate => "up_to_date",
            TerminalReason::NoData => "no_data",
            TerminalReason::Stalled => "stalled",
            TerminalReason::Error => "error",
            TerminalReason::Cancelled => "cancelled",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TerminalReason::UpToDate | TerminalReason::NoData)
    }
}

impl std::fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that end one target's loop
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SyncError {
    #[error("Fetch failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("Persist failed: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Cancelled")]
    Cancelled,
}

/// Outcome of syncing one target
#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub key: WatermarkKey,
    /// Batches persisted
    pub batches: u32,
    pub records_persisted: u64,
    /// Malformed, foreign or already-persisted records dropped before persisting
    pub records_skipped: u64,
    pub terminal_reason: TerminalReason,
    /// Watermark when the loop ended
    pub watermark: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncResult {
    fn new(key: WatermarkKey) -> Self {
        Self {
            key,
            batches: 0,
            records_persisted: 0,
            records_skipped: 0,
            terminal_reason: TerminalReason::UpToDate,
            watermark: None,
            error: None,
        }
    }

    fn finish(mut self, reason: TerminalReason) -> Self {
        self.terminal_reason = reason;
        self
    }

    fn fail(mut self, err: SyncError) -> Self {
        if matches!(err, SyncError::Cancelled) {
            return self.finish(TerminalReason::Cancelled);
        }
        self.error = Some(err.to_string());
        self.finish(TerminalReason::Error)
    }
}

/// Synchronizes one target at a time from a provider into a gateway
pub struct PaginatingSyncer<P: FeedProvider, S: PersistenceGateway> {
    provider: Arc<P>,
    gateway: Arc<S>,
    windows: WindowCalculator,
    clock: Clock,
}

impl<P: FeedProvider, S: PersistenceGateway> Clone for PaginatingSyncer<P, S> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            gateway: Arc::clone(&self.gateway),
            windows: self.windows.clone(),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<P: FeedProvider, S: PersistenceGateway> PaginatingSyncer<P, S> {
    pub fn new(provider: Arc<P>, gateway: Arc<S>, windows: WindowCalculator) -> Self {
        Self {
            provider,
            gateway,
            windows,
            clock: Arc::new(Utc::now),
        }
    }

    /// Replace the wall clock
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn gateway(&self) -> &Arc<S> {
        &self.gateway
    }

    /// Sync one target until it is up to date, runs dry, stalls, fails or is cancelled
    ///
    /// Never returns an error: failures are reported in the result so sibling
    /// targets are unaffected.
    pub async fn sync(&self, target: &SyncTarget, cancel: &CancellationToken) -> SyncResult {
        let key = target.key();
        let span = info_span!("sync", target = %key);
        self.sync_inner(target, key, cancel).instrument(span).await
    }

    async fn sync_inner(&self, target: &SyncTarget, key: WatermarkKey, cancel: &CancellationToken) -> SyncResult {
        let mut result = SyncResult::new(key.clone());

        let watermark = tokio::select! {
            _ = cancel.cancelled() => return result.fail(SyncError::Cancelled),
            read = self.gateway.get_watermark(&key) => read,
        };
        let mut watermark = match watermark {
            Ok(watermark) => watermark,
            Err(e) => {
                warn!("Watermark read failed: {}", e);
                return result.fail(e.into());
            }
        };
        result.watermark = watermark;

        let now = (self.clock)();
        let table = match self.gateway.table_for(target.kind, target.interval) {
            Ok(table) => table,
            Err(e) => return result.fail(e.into()),
        };

        // Last window end handed out; the next window starts one period later
        let mut cursor = watermark;

        loop {
            if cancel.is_cancelled() {
                return result.fail(SyncError::Cancelled);
            }

            let Some(window) = self.windows.compute_window(target, cursor, now) else {
                debug!(batches = result.batches, "Up to date");
                return result.finish(TerminalReason::UpToDate);
            };

            let page = match self.fetch(target, &window, cancel).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(start = %window.start, end = %window.end, "Fetch failed: {}", e);
                    return result.fail(e);
                }
            };

            if page.is_empty() {
                info!(start = %window.start, end = %window.end, "No data returned");
                return result.finish(TerminalReason::NoData);
            }

            let (records, malformed) = normalize_page(&page, target.kind);
            let fetched = records.len();
            let (batch, foreign) = Self::retain_new(records, target, watermark);
            if foreign > 0 {
                warn!(
                    start = %window.start,
                    end = %window.end,
                    foreign,
                    fetched,
                    "Dropped records belonging to another source or entity"
                );
            }
            result.records_skipped += (malformed + fetched - batch.len()) as u64;

            if !batch.is_empty() {
                let persisted = tokio::select! {
                    _ = cancel.cancelled() => Err(SyncError::Cancelled),
                    written = self.gateway.batch_upsert(&batch, &table) => written.map_err(SyncError::from),
                };
                match persisted {
                    Ok(written) => {
                        let batch_max = batch.iter().map(|r| r.timestamp).max();
                        watermark = watermark.max(batch_max);
                        result.watermark = watermark;
                        result.batches += 1;
                        result.records_persisted += written;
                        debug!(
                            start = %window.start,
                            end = %window.end,
                            records = batch.len(),
                            written,
                            "Batch persisted"
                        );
                    }
                    Err(e) => {
                        warn!(start = %window.start, end = %window.end, "Persist failed: {}", e);
                        return result.fail(e);
                    }
                }
            }

            // Advance past this window even when nothing was kept
            let next_start = target.interval.advance(window.end, 1);
            if watermark.is_some_and(|w| next_start <= w) {
                warn!(
                    next_start = %next_start,
                    watermark = ?watermark,
                    "No forward progress past the watermark"
                );
                return result.finish(TerminalReason::Stalled);
            }
            cursor = Some(window.end);
        }
    }

    async fn fetch(
        &self,
        target: &SyncTarget,
        window: &FetchWindow,
        cancel: &CancellationToken,
    ) -> Result<Vec<serde_json::Value>, SyncError> {
        let request = PageRequest::for_window(target, window);
        tokio::select! {
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
            page = self.provider.fetch_page(&request) => Ok(page?),
        }
    }

    /// Keep records of this series strictly past the watermark
    ///
    /// Also returns how many records belonged to another series.
    fn retain_new(
        records: Vec<NormalizedRecord>,
        target: &SyncTarget,
        watermark: Option<DateTime<Utc>>,
    ) -> (Vec<NormalizedRecord>, usize) {
        let mut foreign = 0;
        let batch = records
            .into_iter()
            .filter(|r| {
                if r.source_id != target.source_id || r.entity_id != target.entity_id {
                    foreign += 1;
                    return false;
                }
                watermark.map_or(true, |w| r.timestamp > w)
            })
            .collect();
        (batch, foreign)
    }
}
