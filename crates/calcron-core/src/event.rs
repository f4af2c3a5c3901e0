//! Calendar events as seen by the reconciler
//!
//! An [`Event`] is one concrete action occurrence: a single instant plus the
//! payload to run at that instant. Events are produced by the snapshot
//! normalizer and never modified by the core.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::warn;

/// Opaque description of what to run. Passed through to the job scheduler
/// untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionSpec {
    pub command: String,
}

impl ActionSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

/// One occurrence of a calendar event that should trigger a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Stable identifier, unique per occurrence and action
    pub event_id: String,
    /// Instant the job should fire (UTC)
    pub start_time: DateTime<Utc>,
    /// Payload handed to the job scheduler
    pub action: ActionSpec,
    /// Changes whenever `start_time` or `action` change
    pub revision_token: String,
    /// Calendar last-modified stamp, used to pick between duplicates
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
}

impl Event {
    /// Create an event, deriving its revision token from its content
    pub fn new(event_id: impl Into<String>, start_time: DateTime<Utc>, action: ActionSpec) -> Self {
        let revision_token = revision_token(start_time, &action);
        Self {
            event_id: event_id.into(),
            start_time,
            action,
            revision_token,
            last_modified: None,
        }
    }

    pub fn with_last_modified(mut self, last_modified: Option<DateTime<Utc>>) -> Self {
        self.last_modified = last_modified;
        self
    }
}

/// Content digest of an event's schedule-relevant fields.
///
/// The token is stable across processes and releases, which matters because
/// it is persisted in the record store.
pub fn revision_token(start_time: DateTime<Utc>, action: &ActionSpec) -> String {
    let mut hasher = Sha256::new();
    hasher.update(start_time.to_rfc3339_opts(SecondsFormat::Secs, true).as_bytes());
    hasher.update([0u8]);
    hasher.update(action.command.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}

/// Immutable set of events relevant to one reconciliation cycle
#[derive(Debug, Clone)]
pub struct EventSnapshot {
    taken_at: DateTime<Utc>,
    events: BTreeMap<String, Event>,
}

impl EventSnapshot {
    /// Build a snapshot, keeping one event per id.
    ///
    /// When the source reports the same id twice the entry with the newest
    /// last-modified stamp wins.
    pub fn from_events(taken_at: DateTime<Utc>, events: impl IntoIterator<Item = Event>) -> Self {
        let mut by_id: BTreeMap<String, Event> = BTreeMap::new();

        for event in events {
            match by_id.get(&event.event_id) {
                Some(existing) => {
                    warn!(event_id = %event.event_id, "Duplicate event id in calendar snapshot");
                    if event.last_modified >= existing.last_modified {
                        by_id.insert(event.event_id.clone(), event);
                    }
                }
                None => {
                    by_id.insert(event.event_id.clone(), event);
                }
            }
        }

        Self {
            taken_at,
            events: by_id,
        }
    }

    pub fn empty(taken_at: DateTime<Utc>) -> Self {
        Self::from_events(taken_at, Vec::new())
    }

    /// Instant the snapshot was taken at
    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    pub fn get(&self, event_id: &str) -> Option<&Event> {
        self.events.get(event_id)
    }

    pub fn contains(&self, event_id: &str) -> bool {
        self.events.contains_key(event_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.values()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
