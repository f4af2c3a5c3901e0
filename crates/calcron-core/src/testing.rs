//! In-process fakes for the external collaborators

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::driver::EventSource;
use crate::event::ActionSpec;
use crate::executor::{CancelOutcome, JobScheduler};
use crate::record::{JobHandle, RecordStore, StoreState};
use crate::snapshot::{resolve, CalendarEntry, SyncWindow};
use crate::{Error, Result};

/// Scheduler keeping its queue in memory
#[derive(Default)]
pub struct FakeScheduler {
    jobs: Mutex<BTreeMap<JobHandle, (DateTime<Utc>, ActionSpec)>>,
    next_id: AtomicU64,
    submits: AtomicUsize,
    cancels: AtomicUsize,
    fail_submit: AtomicBool,
    fail_cancel: AtomicBool,
    delay: Option<Duration>,
}

impl FakeScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn fail_submits(&self, fail: bool) {
        self.fail_submit.store(fail, Ordering::SeqCst);
    }

    pub fn fail_cancels(&self, fail: bool) {
        self.fail_cancel.store(fail, Ordering::SeqCst);
    }

    /// Drop a job behind the engine's back
    pub fn forget(&self, handle: &JobHandle) {
        self.jobs.lock().unwrap().remove(handle);
    }

    pub fn job_count(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    pub fn submit_count(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl JobScheduler for FakeScheduler {
    async fn submit(&self, at: DateTime<Utc>, action: &ActionSpec) -> Result<JobHandle> {
        self.pause().await;
        self.submits.fetch_add(1, Ordering::SeqCst);
        if self.fail_submit.load(Ordering::SeqCst) {
            return Err(Error::Scheduler("submission rejected".into()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = JobHandle::new(id.to_string());
        self.jobs
            .lock()
            .unwrap()
            .insert(handle.clone(), (at, action.clone()));
        Ok(handle)
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<CancelOutcome> {
        self.pause().await;
        self.cancels.fetch_add(1, Ordering::SeqCst);
        if self.fail_cancel.load(Ordering::SeqCst) {
            return Err(Error::Scheduler("cancel rejected".into()));
        }
        match self.jobs.lock().unwrap().remove(handle) {
            Some(_) => Ok(CancelOutcome::Cancelled),
            None => Ok(CancelOutcome::NotFound),
        }
    }

    async fn list_handles(&self) -> Result<Option<BTreeSet<JobHandle>>> {
        Ok(Some(self.jobs.lock().unwrap().keys().cloned().collect()))
    }
}

/// Calendar returning a fixed, replaceable set of entries
pub struct FakeSource {
    entries: Mutex<Vec<CalendarEntry>>,
    last_window: Mutex<Option<SyncWindow>>,
    fail: AtomicBool,
    delay: Option<Duration>,
    windowed: bool,
}

impl FakeSource {
    pub fn new(entries: Vec<CalendarEntry>) -> Self {
        Self {
            entries: Mutex::new(entries),
            last_window: Mutex::new(None),
            fail: AtomicBool::new(false),
            delay: None,
            windowed: false,
        }
    }

    /// Only return entries overlapping the requested window, like a CalDAV
    /// time-range filter
    pub fn windowed(mut self) -> Self {
        self.windowed = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_entries(&self, entries: Vec<CalendarEntry>) {
        *self.entries.lock().unwrap() = entries;
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn last_window(&self) -> Option<SyncWindow> {
        *self.last_window.lock().unwrap()
    }
}

#[async_trait]
impl EventSource for FakeSource {
    async fn fetch(&self, window: SyncWindow) -> Result<Vec<CalendarEntry>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        *self.last_window.lock().unwrap() = Some(window);
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::SourceUnavailable("calendar returned 503".into()));
        }
        let entries = self.entries.lock().unwrap().clone();
        if !self.windowed {
            return Ok(entries);
        }
        Ok(entries
            .into_iter()
            .filter(|entry| {
                let start = resolve(&entry.start, chrono_tz::UTC);
                let end = entry
                    .end
                    .as_ref()
                    .map_or(start, |end| resolve(end, chrono_tz::UTC));
                start < window.end && end >= window.start
            })
            .collect())
    }
}

/// Record store whose state stays inspectable after being handed to a driver
#[derive(Clone, Default)]
pub struct SharedStore {
    state: Arc<Mutex<StoreState>>,
    fail: Arc<AtomicBool>,
}

impl SharedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StoreState {
        self.state.lock().unwrap().clone()
    }

    pub fn replace(&self, state: StoreState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl RecordStore for SharedStore {
    fn load(&self) -> Result<StoreState> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("disk full".into()));
        }
        Ok(self.snapshot())
    }

    fn save(&mut self, state: &StoreState) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("disk full".into()));
        }
        self.replace(state.clone());
        Ok(())
    }
}
