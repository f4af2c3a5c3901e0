//! Reconciliation of calendar events against job records
//!
//! [`reconcile`] is a pure function: it looks at the snapshot, the stored
//! records and the reference instant, and decides what has to happen to the
//! external scheduler. It performs no I/O.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::event::{Event, EventSnapshot};
use crate::record::{JobRecord, JobStatus, RecordMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Cancel,
    Schedule,
    Reschedule,
    NoOp,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Cancel => "cancel",
            ActionKind::Schedule => "schedule",
            ActionKind::Reschedule => "reschedule",
            ActionKind::NoOp => "noop",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step towards consistency between calendar and scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Submit a new job. `previous` is the Failed record being retried; its
    /// handle, if any, must be cancelled first.
    Schedule {
        event: Event,
        previous: Option<JobRecord>,
    },
    /// Replace the job of a changed event
    Reschedule { event: Event, previous: JobRecord },
    /// Remove the job of an event that is gone or already past
    Cancel { record: JobRecord },
    /// Record and event agree
    NoOp { event_id: String },
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Schedule { .. } => ActionKind::Schedule,
            Action::Reschedule { .. } => ActionKind::Reschedule,
            Action::Cancel { .. } => ActionKind::Cancel,
            Action::NoOp { .. } => ActionKind::NoOp,
        }
    }

    pub fn event_id(&self) -> &str {
        match self {
            Action::Schedule { event, .. } | Action::Reschedule { event, .. } => &event.event_id,
            Action::Cancel { record } => &record.event_id,
            Action::NoOp { event_id } => event_id,
        }
    }

    /// Instant the action is ordered by
    fn sort_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Action::Schedule { event, .. } | Action::Reschedule { event, .. } => {
                Some(event.start_time)
            }
            Action::Cancel { record } => Some(record.scheduled_time),
            Action::NoOp { .. } => None,
        }
    }

    fn rank(&self) -> u8 {
        match self.kind() {
            ActionKind::Cancel => 0,
            ActionKind::Schedule | ActionKind::Reschedule => 1,
            ActionKind::NoOp => 2,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sort_time() {
            Some(at) => write!(f, "{} {} @ {}", self.kind(), self.event_id(), at.to_rfc3339()),
            None => write!(f, "{} {}", self.kind(), self.event_id()),
        }
    }
}

/// Number of actions per kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ActionCounts {
    pub schedule: usize,
    pub reschedule: usize,
    pub cancel: usize,
    pub noop: usize,
}

impl ActionCounts {
    pub fn of(actions: &[Action]) -> Self {
        let mut counts = Self::default();
        for action in actions {
            counts.add(action.kind());
        }
        counts
    }

    pub fn add(&mut self, kind: ActionKind) {
        match kind {
            ActionKind::Schedule => self.schedule += 1,
            ActionKind::Reschedule => self.reschedule += 1,
            ActionKind::Cancel => self.cancel += 1,
            ActionKind::NoOp => self.noop += 1,
        }
    }

    /// Actions that need the external scheduler
    pub fn changes(&self) -> usize {
        self.schedule + self.reschedule + self.cancel
    }
}

impl fmt::Display for ActionCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} schedule, {} reschedule, {} cancel, {} unchanged",
            self.schedule, self.reschedule, self.cancel, self.noop
        )
    }
}

/// Compute the ordered actions that bring `records` in line with `snapshot`.
///
/// Every event and every orphaned record yields exactly one action. Events
/// at or before `now` are never scheduled; their records are cancelled.
pub fn reconcile(snapshot: &EventSnapshot, records: &RecordMap, now: DateTime<Utc>) -> Vec<Action> {
    let mut actions: Vec<Action> = snapshot
        .iter()
        .map(|event| decide(event, records.get(&event.event_id), now))
        .collect();

    actions.extend(
        records
            .values()
            .filter(|record| !snapshot.contains(&record.event_id))
            .map(|record| Action::Cancel {
                record: record.clone(),
            }),
    );

    actions.sort_by(|a, b| {
        a.rank()
            .cmp(&b.rank())
            .then_with(|| a.sort_time().cmp(&b.sort_time()))
            .then_with(|| a.event_id().cmp(b.event_id()))
    });

    actions
}

fn decide(event: &Event, record: Option<&JobRecord>, now: DateTime<Utc>) -> Action {
    if event.start_time <= now {
        return match record {
            Some(record) => Action::Cancel {
                record: record.clone(),
            },
            None => Action::NoOp {
                event_id: event.event_id.clone(),
            },
        };
    }

    match record {
        None => Action::Schedule {
            event: event.clone(),
            previous: None,
        },
        Some(record) if record.status == JobStatus::Failed => Action::Schedule {
            event: event.clone(),
            previous: Some(record.clone()),
        },
        Some(record) if record.revision_token == event.revision_token => Action::NoOp {
            event_id: event.event_id.clone(),
        },
        Some(record) => Action::Reschedule {
            event: event.clone(),
            previous: record.clone(),
        },
    }
}
