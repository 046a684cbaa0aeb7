//! Bounded-concurrency sync of many targets
//!
//! Runs one [`PaginatingSyncer`] per target with at most `max_parallel` in
//! flight. Failures stay with their target; a run of consecutive errors opens
//! a circuit that stops new scheduling while in-flight targets finish.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;

use chrono::Utc;
use futures_util::FutureExt;
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::summary::{OutcomeClass, RunSummary, SkipReason, TargetOutcome};
use super::syncer::{PaginatingSyncer, SyncResult, TerminalReason};
use crate::config::SyncSettings;
use crate::provider::FeedProvider;
use crate::schema::{SyncTarget, WatermarkKey};
use crate::storage::PersistenceGateway;

/// Scheduling policy for a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Consecutive errored targets that open the circuit; 0 disables it
    pub max_consecutive_failures: u32,
    /// Keep scheduling after a target fails
    pub continue_on_error: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 5,
            continue_on_error: true,
        }
    }
}

impl From<&SyncSettings> for OrchestratorConfig {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            max_consecutive_failures: settings.max_consecutive_failures,
            continue_on_error: settings.continue_on_error,
        }
    }
}

type TaskOutput = Result<SyncResult, Box<dyn Any + Send>>;

/// Key of every spawned, not yet joined task
type InFlight = HashMap<Id, WatermarkKey>;

/// Consecutive-failure tracking across completed targets
#[derive(Debug)]
struct Breaker {
    consecutive: u32,
    threshold: u32,
}

impl Breaker {
    fn new(threshold: u32) -> Self {
        Self {
            consecutive: 0,
            threshold,
        }
    }

    /// Returns true when this outcome opens the circuit
    fn observe(&mut self, outcome: &TargetOutcome) -> bool {
        match (outcome.outcome, outcome.terminal_reason) {
            (OutcomeClass::Succeeded, _) => self.consecutive = 0,
            (_, Some(TerminalReason::Error)) => self.consecutive += 1,
            _ => {}
        }
        self.threshold > 0 && self.consecutive >= self.threshold
    }
}

/// Why scheduling stopped before the target list ran out
#[derive(Debug, Clone, Copy)]
enum Halt {
    CircuitOpen,
    Cancelled,
    StopOnError,
}

impl From<Halt> for SkipReason {
    fn from(halt: Halt) -> Self {
        match halt {
            Halt::CircuitOpen => SkipReason::CircuitOpen,
            Halt::Cancelled => SkipReason::Cancelled,
            Halt::StopOnError => SkipReason::StopOnError,
        }
    }
}

/// Drives a target list through a shared syncer
pub struct SyncOrchestrator<P: FeedProvider, S: PersistenceGateway> {
    syncer: PaginatingSyncer<P, S>,
    config: OrchestratorConfig,
}

impl<P, S> SyncOrchestrator<P, S>
where
    P: FeedProvider + 'static,
    S: PersistenceGateway + 'static,
{
    pub fn new(syncer: PaginatingSyncer<P, S>, config: OrchestratorConfig) -> Self {
        Self { syncer, config }
    }

    pub fn syncer(&self) -> &PaginatingSyncer<P, S> {
        &self.syncer
    }

    /// Sync every target, at most `max_parallel` at a time
    ///
    /// Always returns a summary. Cancelling `cancel` stops scheduling and is
    /// propagated to in-flight fetch and persist calls.
    pub async fn run(
        &self,
        targets: Vec<SyncTarget>,
        max_parallel: usize,
        cancel: &CancellationToken,
    ) -> RunSummary {
        let max_parallel = max_parallel.max(1);
        let mut summary = RunSummary::new(Utc::now());
        let mut breaker = Breaker::new(self.config.max_consecutive_failures);
        let mut tasks: JoinSet<TaskOutput> = JoinSet::new();
        let mut in_flight = InFlight::new();
        let mut halt: Option<Halt> = None;
        let total = targets.len();

        info!(targets = total, max_parallel, "Starting sync run");

        let mut pending = targets.into_iter();
        while halt.is_none() {
            if tasks.len() >= max_parallel {
                tokio::select! {
                    _ = cancel.cancelled() => halt = Some(Halt::Cancelled),
                    Some(joined) = tasks.join_next_with_id() => {
                        halt = self.complete(joined, &mut in_flight, &mut summary, &mut breaker);
                    }
                }
                continue;
            }

            if cancel.is_cancelled() {
                halt = Some(Halt::Cancelled);
                break;
            }

            let Some(target) = pending.next() else {
                break;
            };
            let id = self.spawn(&mut tasks, &target, cancel);
            in_flight.insert(id, target.key());
        }

        if let Some(reason) = halt {
            match reason {
                Halt::CircuitOpen => {
                    summary.circuit_open = true;
                    error!(
                        consecutive_failures = breaker.consecutive,
                        "Circuit open, no new targets will be scheduled"
                    );
                }
                Halt::Cancelled => {
                    summary.cancelled = true;
                    warn!("Run cancelled, no new targets will be scheduled");
                }
                Halt::StopOnError => warn!("Target failed, stopping on error"),
            }
            for target in pending {
                summary.record(TargetOutcome::not_started(target.key(), reason.into()));
            }
        }

        // In-flight targets always finish; the circuit does not cancel them
        while let Some(joined) = tasks.join_next_with_id().await {
            if let Some(Halt::CircuitOpen) = self.complete(joined, &mut in_flight, &mut summary, &mut breaker) {
                summary.circuit_open = true;
            }
        }
        if cancel.is_cancelled() {
            summary.cancelled = true;
        }

        summary.finished_at = Utc::now();
        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            records = summary.records_persisted,
            circuit_open = summary.circuit_open,
            cancelled = summary.cancelled,
            "Sync run complete"
        );
        summary
    }

    fn spawn(&self, tasks: &mut JoinSet<TaskOutput>, target: &SyncTarget, cancel: &CancellationToken) -> Id {
        let syncer = self.syncer.clone();
        let cancel = cancel.clone();
        let target = target.clone();
        tasks
            .spawn(async move {
                AssertUnwindSafe(syncer.sync(&target, &cancel))
                    .catch_unwind()
                    .await
            })
            .id()
    }

    /// Record a finished task; returns a halt reason when scheduling must stop
    fn complete(
        &self,
        joined: Result<(Id, TaskOutput), JoinError>,
        in_flight: &mut InFlight,
        summary: &mut RunSummary,
        breaker: &mut Breaker,
    ) -> Option<Halt> {
        let (id, joined) = match joined {
            Ok((id, output)) => (id, Ok(output)),
            Err(e) => (e.id(), Err(e)),
        };
        let Some(key) = in_flight.remove(&id) else {
            error!(task = %id, "Joined a sync task that was never scheduled");
            return None;
        };

        let outcome = match joined {
            Ok(Ok(result)) => TargetOutcome::finished(result),
            Ok(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                error!(target = %key, "Sync task panicked: {}", message);
                TargetOutcome::panicked(key, message)
            }
            // Aborted by the runtime shutting down, or a panic outside the sync future
            Err(e) => {
                error!(target = %key, "Sync task did not complete: {}", e);
                TargetOutcome::did_not_complete(key, &e)
            }
        };

        match outcome.outcome {
            OutcomeClass::Succeeded => info!(
                target = %outcome.key,
                reason = ?outcome.terminal_reason,
                records = outcome.records_persisted,
                "Target synced"
            ),
            OutcomeClass::Failed => warn!(
                target = %outcome.key,
                reason = ?outcome.terminal_reason,
                error = outcome.error.as_deref().unwrap_or(""),
                "Target failed"
            ),
            OutcomeClass::Skipped => info!(target = %outcome.key, "Target cancelled"),
        }

        let failed = outcome.outcome == OutcomeClass::Failed;
        let open = breaker.observe(&outcome);
        summary.record(outcome);

        if open {
            Some(Halt::CircuitOpen)
        } else if failed && !self.config.continue_on_error {
            Some(Halt::StopOnError)
        } else {
            None
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::PageLimits;
    use crate::provider::mock::MockProvider;
    use crate::schema::{DataKind, Interval};
    use crate::storage::MemoryGateway;
    use crate::sync::ExitStatus;
    use crate::window::WindowCalculator;

    fn outcome(reason: TerminalReason) -> TargetOutcome {
        let key = WatermarkKey {
            source_id: "binance".to_string(),
            entity_id: "BTC".to_string(),
            kind: DataKind::Ohlcv,
            interval: Interval::Day,
        };
        TargetOutcome::finished(SyncResult {
            key,
            batches: 0,
            records_persisted: 0,
            records_skipped: 0,
            terminal_reason: reason,
            watermark: None,
            error: None,
        })
    }

    #[test]
    fn test_breaker_counts_only_errors() {
        let mut breaker = Breaker::new(2);
        assert!(!breaker.observe(&outcome(TerminalReason::Error)));
        assert!(!breaker.observe(&outcome(TerminalReason::Stalled)));
        assert!(!breaker.observe(&outcome(TerminalReason::Cancelled)));
        assert!(breaker.observe(&outcome(TerminalReason::Error)));
    }

    #[test]
    fn test_breaker_resets_on_success() {
        let mut breaker = Breaker::new(2);
        assert!(!breaker.observe(&outcome(TerminalReason::Error)));
        assert!(!breaker.observe(&outcome(TerminalReason::NoData)));
        assert!(!breaker.observe(&outcome(TerminalReason::Error)));
    }

    #[test]
    fn test_breaker_disabled_at_zero() {
        let mut breaker = Breaker::new(0);
        for _ in 0..10 {
            assert!(!breaker.observe(&outcome(TerminalReason::Error)));
        }
    }

    fn orchestrator(max_consecutive_failures: u32) -> SyncOrchestrator<MockProvider, MemoryGateway> {
        let syncer = PaginatingSyncer::new(
            Arc::new(MockProvider::new()),
            Arc::new(MemoryGateway::new()),
            WindowCalculator::new(PageLimits::default(), None),
        );
        SyncOrchestrator::new(
            syncer,
            OrchestratorConfig {
                max_consecutive_failures,
                continue_on_error: true,
            },
        )
    }

    #[tokio::test]
    async fn test_aborted_task_counts_as_failed_target() {
        let orchestrator = orchestrator(1);
        let mut tasks: JoinSet<TaskOutput> = JoinSet::new();
        let handle = tasks.spawn(std::future::pending::<TaskOutput>());
        let key = outcome(TerminalReason::Error).key;
        let mut in_flight = InFlight::from([(handle.id(), key.clone())]);
        handle.abort();

        let joined = tasks.join_next_with_id().await.unwrap();
        assert!(joined.is_err());

        let mut summary = RunSummary::new(Utc::now());
        let mut breaker = Breaker::new(1);
        let halt = orchestrator.complete(joined, &mut in_flight, &mut summary, &mut breaker);

        assert!(matches!(halt, Some(Halt::CircuitOpen)));
        assert!(in_flight.is_empty());
        assert_eq!((summary.succeeded, summary.failed, summary.skipped), (0, 1, 0));
        let recorded = summary.outcome_for(&key).unwrap();
        assert_eq!(recorded.terminal_reason, Some(TerminalReason::Error));
        assert!(recorded.error.as_deref().unwrap().contains("did not complete"));
        assert_eq!(summary.exit_status(), ExitStatus::PartialFailure);
    }

    #[tokio::test]
    async fn test_completed_tasks_leave_no_key_in_flight() {
        let orchestrator = orchestrator(5);
        let mut tasks: JoinSet<TaskOutput> = JoinSet::new();
        let key = outcome(TerminalReason::UpToDate).key;
        let result = SyncResult {
            key: key.clone(),
            batches: 1,
            records_persisted: 2,
            records_skipped: 0,
            terminal_reason: TerminalReason::UpToDate,
            watermark: None,
            error: None,
        };
        let handle = tasks.spawn(async move { Ok(result) });
        let mut in_flight = InFlight::from([(handle.id(), key.clone())]);

        let joined = tasks.join_next_with_id().await.unwrap();
        let mut summary = RunSummary::new(Utc::now());
        let halt = orchestrator.complete(joined, &mut in_flight, &mut summary, &mut Breaker::new(5));

        assert!(halt.is_none());
        assert!(in_flight.is_empty());
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.records_persisted, 2);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
    }
}
