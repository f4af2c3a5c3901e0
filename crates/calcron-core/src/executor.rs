//! Job executor adapter
//!
//! Applies reconciler [`Action`]s to an external one-shot [`JobScheduler`].
//! Every action either fully succeeds, yielding a fresh Pending record (or
//! the removal of one), or fails as a whole and yields a Failed record that
//! the next cycle retries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::event::{ActionSpec, Event};
use crate::reconcile::Action;
use crate::record::{JobHandle, JobRecord, JobStatus};
use crate::{Error, Result};

/// Result of asking the scheduler to drop a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    /// The scheduler does not know the handle (already ran or removed)
    NotFound,
}

/// External one-shot job scheduler
#[async_trait]
pub trait JobScheduler: Send + Sync {
    /// Submit a job firing `action` at `at`
    async fn submit(&self, at: DateTime<Utc>, action: &ActionSpec) -> Result<JobHandle>;

    /// Cancel a previously submitted job
    async fn cancel(&self, handle: &JobHandle) -> Result<CancelOutcome>;

    /// Handles of all jobs currently queued, or `None` if the backend cannot
    /// enumerate them
    async fn list_handles(&self) -> Result<Option<BTreeSet<JobHandle>>>;
}

/// What applying one action did to the record mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// Insert or replace this record
    Stored(JobRecord),
    /// Drop the record of this event
    Removed(String),
    /// Leave the record as it is
    Unchanged,
    /// Store this Failed record for retry
    Failed { record: JobRecord, reason: String },
}

/// Applies actions with a bounded timeout on every external call
pub struct Executor {
    scheduler: Arc<dyn JobScheduler>,
    timeout: Duration,
}

impl Executor {
    pub fn new(scheduler: Arc<dyn JobScheduler>, timeout: Duration) -> Self {
        Self { scheduler, timeout }
    }

    async fn call<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| Error::Timeout(self.timeout))?
    }

    pub async fn list_handles(&self) -> Result<Option<BTreeSet<JobHandle>>> {
        self.call(self.scheduler.list_handles()).await
    }

    /// Apply one action. Never returns an error: failures become
    /// [`ActionOutcome::Failed`].
    pub async fn apply(&self, action: Action, now: DateTime<Utc>) -> ActionOutcome {
        match action {
            Action::NoOp { .. } => ActionOutcome::Unchanged,

            Action::Cancel { record } => match self.retire(&record, now).await {
                Ok(()) => {
                    info!(event_id = %record.event_id, "Job cancelled");
                    ActionOutcome::Removed(record.event_id)
                }
                Err(e) => failed(record.into_failed(now), e),
            },

            Action::Schedule { event, previous } => {
                if let Some(previous) = previous {
                    if let Err(e) = self.retire(&previous, now).await {
                        return failed(previous.into_failed(now), e);
                    }
                }
                self.submit(event, now).await
            }

            Action::Reschedule { event, previous } => {
                if let Err(e) = self.retire(&previous, now).await {
                    return failed(previous.into_failed(now), e);
                }
                self.submit(event, now).await
            }
        }
    }

    /// Make sure the job behind `record` can no longer fire.
    ///
    /// Records without a handle, or whose instant has passed, need no
    /// external call.
    pub async fn retire(&self, record: &JobRecord, now: DateTime<Utc>) -> Result<()> {
        let Some(handle) = &record.job_handle else {
            debug!(event_id = %record.event_id, "No job handle, local cleanup only");
            return Ok(());
        };

        if record.scheduled_time <= now {
            debug!(
                event_id = %record.event_id,
                handle = %handle,
                "Job already fired, local cleanup only"
            );
            return Ok(());
        }

        match self.call(self.scheduler.cancel(handle)).await? {
            CancelOutcome::Cancelled => {}
            CancelOutcome::NotFound => {
                debug!(
                    event_id = %record.event_id,
                    handle = %handle,
                    "Job already gone from scheduler"
                );
            }
        }
        Ok(())
    }

    async fn submit(&self, event: Event, now: DateTime<Utc>) -> ActionOutcome {
        match self.call(self.scheduler.submit(event.start_time, &event.action)).await {
            Ok(handle) => {
                info!(
                    event_id = %event.event_id,
                    handle = %handle,
                    at = %event.start_time,
                    "Job scheduled"
                );
                ActionOutcome::Stored(JobRecord::pending(
                    event.event_id,
                    event.start_time,
                    event.revision_token,
                    handle,
                    now,
                ))
            }
            Err(e) => {
                let record = JobRecord {
                    event_id: event.event_id,
                    scheduled_time: event.start_time,
                    revision_token: event.revision_token,
                    job_handle: None,
                    status: JobStatus::Failed,
                    updated_at: now,
                };
                failed(record, e)
            }
        }
    }
}

fn failed(record: JobRecord, error: Error) -> ActionOutcome {
    warn!(event_id = %record.event_id, error = %error, "Action failed, will retry next cycle");
    ActionOutcome::Failed {
        record,
        reason: error.to_string(),
    }
}
