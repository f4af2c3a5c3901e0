//! Per-cycle reporting

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

use crate::reconcile::{ActionCounts, ActionKind};

/// How a cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleOutcome {
    /// Every action confirmed
    Success,
    /// Some actions failed; their records are Failed and retried next cycle
    Partial,
    /// Fetch or store failure; nothing was persisted
    Aborted,
    /// Another cycle was still running
    Skipped,
}

impl CycleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleOutcome::Success => "success",
            CycleOutcome::Partial => "partial",
            CycleOutcome::Aborted => "aborted",
            CycleOutcome::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(CycleOutcome::Success),
            "partial" => Some(CycleOutcome::Partial),
            "aborted" => Some(CycleOutcome::Aborted),
            "skipped" => Some(CycleOutcome::Skipped),
            _ => None,
        }
    }

    /// Process exit status for one-shot runs
    pub fn exit_code(&self) -> u8 {
        match self {
            CycleOutcome::Success | CycleOutcome::Skipped => 0,
            CycleOutcome::Aborted => 1,
            CycleOutcome::Partial => 2,
        }
    }
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cycle step currently running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CyclePhase {
    Idle,
    Fetching,
    Reconciling,
    Applying,
    Persisting,
}

/// One action that did not confirm
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionFailure {
    pub event_id: String,
    pub action: ActionKind,
    pub reason: String,
}

impl fmt::Display for ActionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.action, self.event_id, self.reason)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: CycleOutcome,
    /// Actions the reconciler emitted
    pub planned: ActionCounts,
    pub failures: Vec<ActionFailure>,
    /// Pending records whose job had vanished from the scheduler
    pub inconsistencies: Vec<String>,
    /// Reason of an aborted cycle
    pub error: Option<String>,
}

impl CycleReport {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            cycle_id: Uuid::now_v7(),
            started_at,
            finished_at: None,
            outcome: CycleOutcome::Success,
            planned: ActionCounts::default(),
            failures: Vec::new(),
            inconsistencies: Vec::new(),
            error: None,
        }
    }

    pub fn skipped(started_at: DateTime<Utc>) -> Self {
        let mut report = Self::new(started_at);
        report.outcome = CycleOutcome::Skipped;
        report.finished_at = Some(started_at);
        report
    }

    pub(crate) fn abort(mut self, error: impl fmt::Display, finished_at: DateTime<Utc>) -> Self {
        self.outcome = CycleOutcome::Aborted;
        self.error = Some(error.to_string());
        self.finished_at = Some(finished_at);
        self
    }

    pub(crate) fn record_failure(&mut self, event_id: &str, action: ActionKind, reason: String) {
        self.failures.push(ActionFailure {
            event_id: event_id.to_string(),
            action,
            reason,
        });
    }

    /// Outcome implied by the recorded failures
    pub(crate) fn settled_outcome(&self) -> CycleOutcome {
        if self.failures.is_empty() {
            CycleOutcome::Success
        } else {
            CycleOutcome::Partial
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == CycleOutcome::Success
    }
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cycle {} {}: {}", self.cycle_id, self.outcome, self.planned)?;
        if !self.failures.is_empty() {
            write!(f, ", {} failed", self.failures.len())?;
        }
        if let Some(error) = &self.error {
            write!(f, " ({error})")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(CycleOutcome::Success.exit_code(), 0);
        assert_eq!(CycleOutcome::Skipped.exit_code(), 0);
        assert_eq!(CycleOutcome::Aborted.exit_code(), 1);
        assert_eq!(CycleOutcome::Partial.exit_code(), 2);
    }

    #[test]
    fn test_outcome_parse() {
        for outcome in [
            CycleOutcome::Success,
            CycleOutcome::Partial,
            CycleOutcome::Aborted,
            CycleOutcome::Skipped,
        ] {
            assert_eq!(CycleOutcome::parse(outcome.as_str()), Some(outcome));
        }
        assert_eq!(CycleOutcome::parse("exploded"), None);
    }

    #[test]
    fn test_failures_make_cycle_partial() {
        let mut report = CycleReport::new(Utc::now());
        assert_eq!(report.settled_outcome(), CycleOutcome::Success);

        report.record_failure("E1", ActionKind::Cancel, "atrm exited with 1".into());
        assert_eq!(report.settled_outcome(), CycleOutcome::Partial);
        assert_eq!(report.failures[0].to_string(), "cancel E1: atrm exited with 1");
    }
}
