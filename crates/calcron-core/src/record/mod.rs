//! Job records: the engine's durable memory across cycles

mod store;

pub use store::SqliteRecordStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::driver::CycleOutcome;
use crate::Result;

/// Opaque identifier returned by the external scheduler
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobHandle(String);

impl JobHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Last known-good scheduling
    Pending,
    /// Last attempt did not confirm; retried next cycle
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling state of one event occurrence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub event_id: String,
    /// Instant the external scheduler was told to fire
    pub scheduled_time: DateTime<Utc>,
    /// Event revision this record was scheduled from
    pub revision_token: String,
    /// Absent when no job was ever confirmed by the scheduler
    pub job_handle: Option<JobHandle>,
    pub status: JobStatus,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn pending(
        event_id: impl Into<String>,
        scheduled_time: DateTime<Utc>,
        revision_token: impl Into<String>,
        job_handle: JobHandle,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            scheduled_time,
            revision_token: revision_token.into(),
            job_handle: Some(job_handle),
            status: JobStatus::Pending,
            updated_at: now,
        }
    }

    /// Same record, marked for retry
    pub fn into_failed(mut self, now: DateTime<Utc>) -> Self {
        self.status = JobStatus::Failed;
        self.updated_at = now;
        self
    }

    pub fn is_pending(&self) -> bool {
        self.status == JobStatus::Pending
    }

    pub fn is_failed(&self) -> bool {
        self.status == JobStatus::Failed
    }
}

/// All records, keyed by event id
pub type RecordMap = BTreeMap<String, JobRecord>;

/// Everything persisted between cycles
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreState {
    pub records: RecordMap,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_outcome: Option<CycleOutcome>,
}

impl StoreState {
    pub fn failed_count(&self) -> usize {
        self.records.values().filter(|r| r.is_failed()).count()
    }
}

/// Whole-state persistence with all-or-nothing saves
pub trait RecordStore: Send {
    fn load(&self) -> Result<StoreState>;

    /// Replace the persisted state. On error the previous state must remain
    /// readable unchanged.
    fn save(&mut self, state: &StoreState) -> Result<()>;
}
