//! Sync driver
//!
//! Runs reconciliation cycles: fetch the calendar, load the records,
//! reconcile, apply the actions and persist the resulting records. Only one
//! cycle runs at a time; a cycle requested while another is in flight is
//! skipped rather than queued.

mod report;

pub use report::{ActionFailure, CycleOutcome, CyclePhase, CycleReport};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::Config;
use crate::event::EventSnapshot;
use crate::executor::{ActionOutcome, Executor, JobScheduler};
use crate::reconcile::{reconcile, Action, ActionCounts, ActionKind};
use crate::record::{JobStatus, RecordMap, RecordStore, SqliteRecordStore, StoreState};
use crate::snapshot::{normalize_within, CalendarEntry, NormalizeOptions, SyncWindow};
use crate::{Error, Result};

/// Source of raw calendar entries
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Entries overlapping `window`, recurring series expanded
    async fn fetch(&self, window: SyncWindow) -> Result<Vec<CalendarEntry>>;
}

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Cycle tuning
#[derive(Debug, Clone)]
pub struct DriverOptions {
    pub lookback: Duration,
    pub horizon: Duration,
    /// Maximum schedule/reschedule actions in flight
    pub parallelism: usize,
    /// Check Pending records against the scheduler's queue before reconciling
    pub verify_external: bool,
    pub action_timeout: std::time::Duration,
    pub normalize: NormalizeOptions,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            lookback: Duration::hours(24),
            horizon: Duration::hours(168),
            parallelism: 1,
            verify_external: true,
            action_timeout: std::time::Duration::from_secs(30),
            normalize: NormalizeOptions::default(),
        }
    }
}

impl DriverOptions {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            lookback: config.sync.lookback(),
            horizon: config.sync.horizon(),
            parallelism: config.sync.parallelism,
            verify_external: config.sync.verify_external,
            action_timeout: config.sync.action_timeout(),
            normalize: NormalizeOptions {
                timezone: config.sync.timezone()?,
                wrapper: config.action.wrapper.clone(),
                max_offset: config.sync.max_offset(),
            },
        })
    }
}

/// Orchestrates reconciliation cycles
pub struct SyncDriver {
    source: Arc<dyn EventSource>,
    executor: Executor,
    /// Held for the whole cycle; doubles as the single-cycle gate
    store: Mutex<Box<dyn RecordStore>>,
    phase: watch::Sender<CyclePhase>,
    options: DriverOptions,
    clock: Clock,
}

impl SyncDriver {
    pub fn new(
        source: Arc<dyn EventSource>,
        scheduler: Arc<dyn JobScheduler>,
        store: Box<dyn RecordStore>,
        options: DriverOptions,
    ) -> Self {
        let (phase, _) = watch::channel(CyclePhase::Idle);
        Self {
            source,
            executor: Executor::new(scheduler, options.action_timeout),
            store: Mutex::new(store),
            phase,
            options,
            clock: Arc::new(Utc::now),
        }
    }

    /// Build a driver with the SQLite store named in the configuration
    pub fn from_config(
        config: &Config,
        source: Arc<dyn EventSource>,
        scheduler: Arc<dyn JobScheduler>,
    ) -> Result<Self> {
        let store = SqliteRecordStore::open(&config.store.db_path)
            .map_err(|e| Error::StoreUnavailable(e.to_string()))?;
        let options = DriverOptions::from_config(config)?;
        Ok(Self::new(source, scheduler, Box::new(store), options))
    }

    /// Replace the wall clock (tests, replays)
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn phase(&self) -> CyclePhase {
        *self.phase.borrow()
    }

    /// Subscribe to phase changes
    pub fn watch_phase(&self) -> watch::Receiver<CyclePhase> {
        self.phase.subscribe()
    }

    fn enter(&self, phase: CyclePhase) {
        debug!(phase = ?phase, "Cycle phase");
        self.phase.send_replace(phase);
    }

    /// Run one reconciliation cycle
    pub async fn run_cycle(&self) -> CycleReport {
        let now = (self.clock)();
        let Ok(mut store) = self.store.try_lock() else {
            info!("Previous cycle still running, skipping");
            return CycleReport::skipped(now);
        };

        let report = CycleReport::new(now);
        let span = info_span!("cycle", cycle = %report.cycle_id);
        let report = self.cycle(&mut **store, report, now).instrument(span).await;
        self.enter(CyclePhase::Idle);

        match report.outcome {
            CycleOutcome::Success => info!(cycle = %report.cycle_id, "{}", report),
            CycleOutcome::Partial => warn!(cycle = %report.cycle_id, "{}", report),
            _ => error!(cycle = %report.cycle_id, "{}", report),
        }
        report
    }

    async fn cycle(
        &self,
        store: &mut dyn RecordStore,
        mut report: CycleReport,
        now: DateTime<Utc>,
    ) -> CycleReport {
        self.enter(CyclePhase::Fetching);
        let mut state = match load(store) {
            Ok(state) => state,
            Err(e) => return report.abort(e, (self.clock)()),
        };
        let snapshot = match self.fetch(now).await {
            Ok(snapshot) => snapshot,
            Err(e) => return report.abort(e, (self.clock)()),
        };

        self.enter(CyclePhase::Reconciling);
        let mut records = std::mem::take(&mut state.records);
        if self.options.verify_external {
            report.inconsistencies = self.verify_external(&mut records, now).await;
        }
        let actions = reconcile(&snapshot, &records, now);
        report.planned = ActionCounts::of(&actions);
        info!(
            events = snapshot.len(),
            records = records.len(),
            planned = %report.planned,
            "Reconciled"
        );

        self.enter(CyclePhase::Applying);
        self.apply(actions, &mut records, &mut report, now).await;

        self.enter(CyclePhase::Persisting);
        let outcome = report.settled_outcome();
        state.records = records;
        state.last_sync = Some(now);
        state.last_outcome = Some(outcome);
        if let Err(e) = save(store, &state) {
            return report.abort(e, (self.clock)());
        }

        report.outcome = outcome;
        report.finished_at = Some((self.clock)());
        report
    }

    async fn fetch(&self, now: DateTime<Utc>) -> Result<EventSnapshot> {
        let window = SyncWindow::around(now, self.options.lookback, self.options.horizon);
        // Entries are matched on their own times, directives fire up to
        // max_offset away from them.
        let query = window.widen(self.options.normalize.max_offset);
        debug!(start = %query.start, end = %query.end, "Fetching calendar");

        let entries = self.source.fetch(query).await.map_err(|e| match e {
            Error::SourceUnavailable(_) => e,
            other => Error::SourceUnavailable(other.to_string()),
        })?;

        Ok(normalize_within(entries, &window, now, &self.options.normalize))
    }

    /// Demote Pending future records whose job the scheduler no longer has.
    ///
    /// Returns the affected event ids.
    async fn verify_external(&self, records: &mut RecordMap, now: DateTime<Utc>) -> Vec<String> {
        let handles = match self.executor.list_handles().await {
            Ok(Some(handles)) => handles,
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!(error = %e, "Could not list scheduled jobs, skipping verification");
                return Vec::new();
            }
        };

        // A job due before the queue was read may simply have fired.
        let margin =
            Duration::from_std(self.options.action_timeout).unwrap_or_else(|_| Duration::zero());
        let settled = (self.clock)()
            .checked_add_signed(margin)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let mut missing = Vec::new();
        for record in records.values_mut() {
            if record.status != JobStatus::Pending || record.scheduled_time <= settled {
                continue;
            }
            let Some(handle) = &record.job_handle else {
                continue;
            };
            if handles.contains(handle) {
                continue;
            }

            warn!(
                event_id = %record.event_id,
                handle = %handle,
                "Job missing from scheduler, rescheduling"
            );
            record.status = JobStatus::Failed;
            record.job_handle = None;
            record.updated_at = now;
            missing.push(record.event_id.clone());
        }
        missing
    }

    async fn apply(
        &self,
        actions: Vec<Action>,
        records: &mut RecordMap,
        report: &mut CycleReport,
        now: DateTime<Utc>,
    ) {
        let (cancels, rest): (Vec<_>, Vec<_>) = actions
            .into_iter()
            .partition(|action| action.kind() == ActionKind::Cancel);

        for action in cancels {
            let event_id = action.event_id().to_string();
            let outcome = self.executor.apply(action, now).await;
            merge(records, report, &event_id, ActionKind::Cancel, outcome);
        }

        let executor = &self.executor;
        let results: Vec<_> = stream::iter(rest)
            .map(|action| async move {
                let event_id = action.event_id().to_string();
                let kind = action.kind();
                (event_id, kind, executor.apply(action, now).await)
            })
            .buffer_unordered(self.options.parallelism.max(1))
            .collect()
            .await;

        for (event_id, kind, outcome) in results {
            merge(records, report, &event_id, kind, outcome);
        }
    }

    /// Actions the next cycle would take, without touching anything
    pub async fn plan(&self) -> Result<Vec<Action>> {
        let now = (self.clock)();
        let state = {
            let store = self.store.lock().await;
            load(&**store)?
        };
        let snapshot = self.fetch(now).await?;
        Ok(reconcile(&snapshot, &state.records, now))
    }

    /// Cancel every stored job that has not fired yet and clear the store.
    ///
    /// Records whose cancellation fails are kept as Failed.
    pub async fn reset(&self) -> CycleReport {
        let now = (self.clock)();
        let Ok(mut store) = self.store.try_lock() else {
            info!("Cycle in progress, skipping reset");
            return CycleReport::skipped(now);
        };

        let mut report = CycleReport::new(now);
        let state = match load(&**store) {
            Ok(state) => state,
            Err(e) => return report.abort(e, (self.clock)()),
        };

        self.enter(CyclePhase::Applying);
        let mut kept = RecordMap::new();
        for (event_id, record) in state.records {
            report.planned.add(ActionKind::Cancel);
            if let Err(e) = self.executor.retire(&record, now).await {
                warn!(event_id = %event_id, error = %e, "Could not cancel job during reset");
                report.record_failure(&event_id, ActionKind::Cancel, e.to_string());
                kept.insert(event_id, record.into_failed(now));
            }
        }

        self.enter(CyclePhase::Persisting);
        let outcome = report.settled_outcome();
        let next = StoreState {
            records: kept,
            last_sync: state.last_sync,
            last_outcome: Some(outcome),
        };
        let saved = save(&mut **store, &next);
        self.enter(CyclePhase::Idle);
        if let Err(e) = saved {
            return report.abort(e, (self.clock)());
        }

        info!(
            cancelled = report.planned.cancel - report.failures.len(),
            kept = report.failures.len(),
            "Reset complete"
        );
        report.outcome = outcome;
        report.finished_at = Some((self.clock)());
        report
    }

    /// Stored records and the outcome of the last cycle
    pub async fn status(&self) -> Result<StoreState> {
        let store = self.store.lock().await;
        load(&**store)
    }
}

fn load(store: &dyn RecordStore) -> Result<StoreState> {
    store.load().map_err(store_error)
}

fn save(store: &mut dyn RecordStore, state: &StoreState) -> Result<()> {
    store.save(state).map_err(store_error)
}

fn store_error(e: Error) -> Error {
    match e {
        Error::StoreUnavailable(_) => e,
        other => Error::StoreUnavailable(other.to_string()),
    }
}

fn merge(
    records: &mut RecordMap,
    report: &mut CycleReport,
    event_id: &str,
    kind: ActionKind,
    outcome: ActionOutcome,
) {
    match outcome {
        ActionOutcome::Stored(record) => {
            records.insert(record.event_id.clone(), record);
        }
        ActionOutcome::Removed(id) => {
            records.remove(&id);
        }
        ActionOutcome::Unchanged => {}
        ActionOutcome::Failed { record, reason } => {
            report.record_failure(event_id, kind, reason);
            records.insert(record.event_id.clone(), record);
        }
    }
}
