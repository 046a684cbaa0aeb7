//! Sync pipeline integration tests
//!
//! Drive the orchestrator end to end with the mock provider and the in-memory
//! gateway: no network, no database.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use feed_sync::config::PageLimits;
use feed_sync::provider::mock::MockProvider;
use feed_sync::provider::ProviderError;
use feed_sync::schema::{DataKind, Interval, LifecycleStatus, SyncTarget, COLLECTED_AT_COLUMN, KEY_COLUMNS};
use feed_sync::storage::{InjectedFailure, MemoryGateway, PersistenceGateway};
use feed_sync::sync::{
    ExitStatus, OrchestratorConfig, OutcomeClass, PaginatingSyncer, SkipReason, SyncOrchestrator,
    TerminalReason,
};
use feed_sync::window::WindowCalculator;

fn day(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()
}

fn target(entity: &str) -> SyncTarget {
    SyncTarget::new("binance", entity, DataKind::Ohlcv, Interval::Day, LifecycleStatus::Active)
        .with_first_available_at(day(1))
}

struct Harness {
    provider: Arc<MockProvider>,
    gateway: Arc<MemoryGateway>,
    now: Arc<Mutex<DateTime<Utc>>>,
    orchestrator: SyncOrchestrator<MockProvider, MemoryGateway>,
}

impl Harness {
    fn new(provider: MockProvider, gateway: MemoryGateway, page_limit: u32, config: OrchestratorConfig) -> Self {
        let provider = Arc::new(provider);
        let gateway = Arc::new(gateway);
        let now = Arc::new(Mutex::new(day(10)));

        let limits = PageLimits {
            day: page_limit,
            ..Default::default()
        };
        let clock_now = Arc::clone(&now);
        let syncer = PaginatingSyncer::new(
            Arc::clone(&provider),
            Arc::clone(&gateway),
            WindowCalculator::new(limits, None),
        )
        .with_clock(Arc::new(move || *clock_now.lock()));

        Self {
            provider,
            gateway,
            now,
            orchestrator: SyncOrchestrator::new(syncer, config),
        }
    }

    fn set_now(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }
}

#[tokio::test]
async fn test_failure_isolation() {
    let provider = MockProvider::new()
        .with_series("binance", "BTC", day(1), day(31))
        .with_series("binance", "BAD", day(1), day(31))
        .with_series("binance", "ETH", day(1), day(31))
        .with_failure("BAD", ProviderError::from_status(400, "unknown instrument"));
    let harness = Harness::new(provider, MemoryGateway::new(), 4, OrchestratorConfig::default());

    let summary = harness
        .orchestrator
        .run(vec![target("BTC"), target("BAD"), target("ETH")], 2, &CancellationToken::new())
        .await;

    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.records_persisted, 18);

    let bad = summary.outcome_for(&target("BAD").key()).unwrap();
    assert_eq!(bad.terminal_reason, Some(TerminalReason::Error));
    assert!(bad.error.is_some());

    for entity in ["BTC", "ETH"] {
        let outcome = summary.outcome_for(&target(entity).key()).unwrap();
        assert_eq!(outcome.terminal_reason, Some(TerminalReason::UpToDate));
        assert_eq!(outcome.watermark, Some(day(9)));
    }
    assert_eq!(summary.exit_status(), ExitStatus::PartialFailure);
}

#[tokio::test]
async fn test_persist_failure_leaves_watermark_for_next_run() {
    let provider = MockProvider::new().with_series("binance", "BTC", day(1), day(31));
    let gateway = MemoryGateway::new().with_failure("BTC", InjectedFailure::Transient);
    let harness = Harness::new(provider, gateway, 4, OrchestratorConfig::default());
    let cancel = CancellationToken::new();

    let first = harness.orchestrator.run(vec![target("BTC")], 1, &cancel).await;
    assert_eq!(first.failed, 1);
    assert_eq!(harness.gateway.get_watermark(&target("BTC").key()).await.unwrap(), None);

    harness.gateway.clear_failure("BTC");
    let second = harness.orchestrator.run(vec![target("BTC")], 1, &cancel).await;
    assert_eq!(second.succeeded, 1);
    assert_eq!(second.records_persisted, 9);
    assert_eq!(second.exit_status(), ExitStatus::Success);
}

#[tokio::test]
async fn test_resume_fetches_only_new_periods() {
    let provider = MockProvider::new().with_series("binance", "BTC", day(1), day(9));
    let harness = Harness::new(provider, MemoryGateway::new(), 100, OrchestratorConfig::default());
    let cancel = CancellationToken::new();

    let first = harness.orchestrator.run(vec![target("BTC")], 1, &cancel).await;
    assert_eq!(first.records_persisted, 9);

    harness.provider.extend_series("binance", "BTC", day(20));
    harness.set_now(day(15));

    let second = harness.orchestrator.run(vec![target("BTC")], 1, &cancel).await;
    assert_eq!(second.records_persisted, 5);

    let requests = harness.provider.requests_for("BTC");
    let last = requests.last().unwrap();
    assert_eq!(last.to_ts, day(14).timestamp());
    assert_eq!(last.limit, 5);

    let rows = harness.gateway.series_rows(&target("BTC").key()).unwrap();
    assert_eq!(rows.len(), 14);
    assert_eq!(rows.first().unwrap().timestamp, day(1));
    assert_eq!(rows.last().unwrap().timestamp, day(14));
}

#[tokio::test]
async fn test_replayed_batches_compact_to_one_row_per_key() {
    let provider = MockProvider::new().with_series("binance", "BTC", day(1), day(31));
    let harness = Harness::new(provider, MemoryGateway::new().append_only(), 4, OrchestratorConfig::default());
    let key = target("BTC").key();
    let table = harness.gateway.table_for(key.kind, key.interval).unwrap();

    harness
        .orchestrator
        .run(vec![target("BTC")], 1, &CancellationToken::new())
        .await;
    let rows = harness.gateway.rows(&table);
    assert_eq!(rows.len(), 9);

    // Re-deliver everything, as a replayed run would
    harness.gateway.batch_upsert(&rows, &table).await.unwrap();
    assert_eq!(harness.gateway.rows(&table).len(), 18);

    let stats = harness
        .gateway
        .compact(&table, &KEY_COLUMNS, COLLECTED_AT_COLUMN)
        .await
        .unwrap();
    assert_eq!(stats.rows_before, 18);
    assert_eq!(stats.rows_after, 9);

    let compacted = harness.gateway.rows(&table);
    let mut keys: Vec<_> = compacted.iter().map(|r| r.timestamp).collect();
    keys.dedup();
    assert_eq!(keys.len(), compacted.len());
    assert_eq!(compacted, rows);
}

#[tokio::test]
async fn test_circuit_opens_after_consecutive_errors() {
    let mut provider = MockProvider::new();
    let entities = ["A", "B", "C", "D", "E", "F"];
    for entity in entities {
        provider = provider
            .with_series("binance", entity, day(1), day(31))
            .with_failure(entity, ProviderError::from_status(503, "maintenance"));
    }
    let config = OrchestratorConfig {
        max_consecutive_failures: 3,
        continue_on_error: true,
    };
    let harness = Harness::new(provider, MemoryGateway::new(), 4, config);

    let summary = harness
        .orchestrator
        .run(entities.iter().map(|e| target(e)).collect(), 1, &CancellationToken::new())
        .await;

    assert!(summary.circuit_open);
    assert_eq!(summary.failed, 3);
    assert_eq!(summary.skipped, 3);
    assert_eq!(harness.provider.call_count(), 3);
    assert!(summary
        .outcomes
        .iter()
        .filter(|o| o.outcome == OutcomeClass::Skipped)
        .all(|o| o.skip_reason == Some(SkipReason::CircuitOpen)));
}

#[tokio::test]
async fn test_stalled_targets_fail_without_opening_circuit() {
    let mut provider = MockProvider::new();
    for entity in ["A", "B", "C"] {
        provider = provider
            .with_series("binance", entity, day(1), day(31))
            .with_overshoot("binance", entity, 3);
    }
    let provider = provider.with_series("binance", "OK", day(1), day(31));
    let config = OrchestratorConfig {
        max_consecutive_failures: 2,
        continue_on_error: true,
    };
    let harness = Harness::new(provider, MemoryGateway::new(), 4, config);

    let targets = ["A", "B", "C", "OK"].iter().map(|e| target(e)).collect();
    let summary = harness.orchestrator.run(targets, 1, &CancellationToken::new()).await;

    assert!(!summary.circuit_open);
    assert_eq!(summary.failed, 3);
    assert_eq!(summary.succeeded, 1);
    let stalled = summary.outcome_for(&target("A").key()).unwrap();
    assert_eq!(stalled.terminal_reason, Some(TerminalReason::Stalled));
}

#[tokio::test]
async fn test_stop_on_error_skips_remaining_targets() {
    let provider = MockProvider::new()
        .with_series("binance", "BTC", day(1), day(31))
        .with_failure("BAD", ProviderError::Authentication("invalid api key".to_string()));
    let config = OrchestratorConfig {
        max_consecutive_failures: 5,
        continue_on_error: false,
    };
    let harness = Harness::new(provider, MemoryGateway::new(), 4, config);

    let summary = harness
        .orchestrator
        .run(vec![target("BAD"), target("BTC")], 1, &CancellationToken::new())
        .await;

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.skipped, 1);
    let skipped = summary.outcome_for(&target("BTC").key()).unwrap();
    assert_eq!(skipped.skip_reason, Some(SkipReason::StopOnError));
    assert_eq!(harness.provider.requests_for("BTC").len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_stops_scheduling_and_in_flight_work() {
    let entities = ["A", "B", "C", "D", "E", "F"];
    let mut provider = MockProvider::new().with_latency(Duration::from_secs(10));
    for entity in entities {
        provider = provider.with_series("binance", entity, day(1), day(31));
    }
    let harness = Harness::new(provider, MemoryGateway::new(), 100, OrchestratorConfig::default());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(15)).await;
        trigger.cancel();
    });

    let targets = entities.iter().map(|e| target(e)).collect();
    let summary = harness.orchestrator.run(targets, 2, &cancel).await;

    assert!(summary.cancelled);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.skipped, 4);
    assert_eq!(summary.exit_status(), ExitStatus::PartialFailure);

    for entity in ["C", "D"] {
        let outcome = summary.outcome_for(&target(entity).key()).unwrap();
        assert_eq!(outcome.terminal_reason, Some(TerminalReason::Cancelled));
        assert_eq!(outcome.watermark, None);
    }
    for entity in ["E", "F"] {
        let outcome = summary.outcome_for(&target(entity).key()).unwrap();
        assert_eq!(outcome.skip_reason, Some(SkipReason::Cancelled));
    }
}

#[tokio::test]
async fn test_lifecycle_mix() {
    let provider = MockProvider::new()
        .with_series("binance", "LIVE", day(1), day(31))
        .with_series("binance", "GONE", day(1), day(31))
        .with_malformed_records("binance", "LIVE");
    let harness = Harness::new(provider, MemoryGateway::new(), 100, OrchestratorConfig::default());

    let retired = SyncTarget::new("binance", "GONE", DataKind::Ohlcv, Interval::Day, LifecycleStatus::Retired)
        .with_first_available_at(day(1))
        .with_last_activity_at(day(3));

    let summary = harness
        .orchestrator
        .run(vec![target("LIVE"), retired.clone()], 2, &CancellationToken::new())
        .await;

    assert_eq!(summary.succeeded, 2);
    let gone = summary.outcome_for(&retired.key()).unwrap();
    assert_eq!(gone.watermark, Some(day(3)));
    assert_eq!(gone.records_persisted, 3);

    let live = summary.outcome_for(&target("LIVE").key()).unwrap();
    assert_eq!(live.records_persisted, 9);
    assert_eq!(live.records_skipped, 1);
}
