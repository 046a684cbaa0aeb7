//! # Feed Sync
//!
//! Incremental synchronization of market time series (futures OHLCV, funding
//! rate and open interest, spot OHLCV, index OHLCV) from a paginated HTTP
//! provider into PostgreSQL.
//!
//! ## Features
//!
//! - **Windowed pagination**: each series resumes from its persisted watermark
//!   and walks forward in provider-sized pages, clamped by lifecycle status
//! - **Idempotent bulk persistence**: CSV staging, `COPY` and replace-by-key
//! - **Bounded concurrency**: thousands of targets with a fixed number in
//!   flight, per-target failure isolation and a consecutive-failure circuit
//! - **Maintenance**: table compaction and gap audits, never on the hot path

pub mod cli;
pub mod config;
pub mod normalizer;
pub mod provider;
pub mod schema;
pub mod storage;
pub mod sync;
pub mod window;

// Re-export commonly used types
pub use config::Settings;
pub use normalizer::{normalize, normalize_page, MalformedRecordError};
pub use provider::{FeedProvider, PageRequest, ProviderError, ProviderInfo, ProviderResult};
pub use schema::{
    DataKind, FetchWindow, Interval, LifecycleStatus, NormalizedRecord, SyncTarget, WatermarkKey,
};
pub use storage::{GatewayError, MemoryGateway, PersistenceGateway, PgGateway};
pub use sync::{
    ExitStatus, PaginatingSyncer, RunSummary, SyncOrchestrator, SyncResult, TerminalReason,
};
pub use window::WindowCalculator;
