//! Run summary and process exit status

use std::process::ExitCode;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::syncer::{SyncResult, TerminalReason};
use crate::schema::WatermarkKey;
use crate::storage::CompactionStats;

/// How a target counts in the run totals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeClass {
    Succeeded,
    Failed,
    Skipped,
}

impl OutcomeClass {
    pub fn of(reason: TerminalReason) -> Self {
        match reason {
            TerminalReason::UpToDate | TerminalReason::NoData => OutcomeClass::Succeeded,
            TerminalReason::Error | TerminalReason::Stalled => OutcomeClass::Failed,
            TerminalReason::Cancelled => OutcomeClass::Skipped,
        }
    }
}

/// Why a target was never started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    CircuitOpen,
    Cancelled,
    StopOnError,
}

/// Per-target line of the summary
#[derive(Debug, Clone, Serialize)]
pub struct TargetOutcome {
    pub key: WatermarkKey,
    pub outcome: OutcomeClass,
    /// `None` when the target never started
    pub terminal_reason: Option<TerminalReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    pub batches: u32,
    pub records_persisted: u64,
    pub records_skipped: u64,
    pub watermark: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TargetOutcome {
    pub fn finished(result: SyncResult) -> Self {
        Self {
            outcome: OutcomeClass::of(result.terminal_reason),
            terminal_reason: Some(result.terminal_reason),
            skip_reason: None,
            batches: result.batches,
            records_persisted: result.records_persisted,
            records_skipped: result.records_skipped,
            watermark: result.watermark,
            error: result.error,
            key: result.key,
        }
    }

    pub fn not_started(key: WatermarkKey, reason: SkipReason) -> Self {
        Self {
            key,
            outcome: OutcomeClass::Skipped,
            terminal_reason: None,
            skip_reason: Some(reason),
            batches: 0,
            records_persisted: 0,
            records_skipped: 0,
            watermark: None,
            error: None,
        }
    }

    /// A task that panicked counts as an errored target
    pub fn panicked(key: WatermarkKey, message: String) -> Self {
        Self::errored(key, format!("sync task panicked: {}", message))
    }

    /// So does a task the runtime failed to join
    pub fn did_not_complete(key: WatermarkKey, err: &tokio::task::JoinError) -> Self {
        Self::errored(key, format!("sync task did not complete: {}", err))
    }

    fn errored(key: WatermarkKey, error: String) -> Self {
        Self {
            key,
            outcome: OutcomeClass::Failed,
            terminal_reason: Some(TerminalReason::Error),
            skip_reason: None,
            batches: 0,
            records_persisted: 0,
            records_skipped: 0,
            watermark: None,
            error: Some(error),
        }
    }
}

/// Process exit status derived from a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    Success,
    /// Startup failed; no run happened
    Failure,
    /// The run completed but some targets failed or were not synced
    PartialFailure,
}

impl ExitStatus {
    pub fn code(&self) -> u8 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Failure => 1,
            ExitStatus::PartialFailure => 2,
        }
    }
}

impl From<ExitStatus> for ExitCode {
    fn from(status: ExitStatus) -> Self {
        ExitCode::from(status.code())
    }
}

/// Machine-readable result of one orchestrator run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub records_persisted: u64,
    /// Scheduling stopped on consecutive failures
    pub circuit_open: bool,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Post-run compaction of the series table, when requested and it succeeded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compaction: Option<CompactionStats>,
    /// Post-run compaction failure; the synced data itself is intact
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compaction_error: Option<String>,
    pub outcomes: Vec<TargetOutcome>,
}

impl RunSummary {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            succeeded: 0,
            failed: 0,
            skipped: 0,
            records_persisted: 0,
            circuit_open: false,
            cancelled: false,
            started_at,
            finished_at: started_at,
            compaction: None,
            compaction_error: None,
            outcomes: Vec::new(),
        }
    }

    pub fn record(&mut self, outcome: TargetOutcome) {
        match outcome.outcome {
            OutcomeClass::Succeeded => self.succeeded += 1,
            OutcomeClass::Failed => self.failed += 1,
            OutcomeClass::Skipped => self.skipped += 1,
        }
        self.records_persisted += outcome.records_persisted;
        self.outcomes.push(outcome);
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.skipped
    }

    pub fn outcome_for(&self, key: &WatermarkKey) -> Option<&TargetOutcome> {
        self.outcomes.iter().find(|o| &o.key == key)
    }

    pub fn exit_status(&self) -> ExitStatus {
        if self.failed == 0
            && self.skipped == 0
            && !self.circuit_open
            && !self.cancelled
            && self.compaction_error.is_none()
        {
            ExitStatus::Success
        } else {
            ExitStatus::PartialFailure
        }
    }
}
