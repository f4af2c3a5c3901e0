//! calcron-core: calendar to one-shot job reconciliation engine
//!
//! Keeps an external one-shot job scheduler in line with a calendar. The
//! calendar is read into an [`EventSnapshot`], compared against the durable
//! [`JobRecord`]s by [`reconcile`], and the resulting actions are applied by
//! the [`SyncDriver`] through a [`JobScheduler`].

pub mod config;
pub mod driver;
pub mod error;
pub mod event;
pub mod executor;
pub mod reconcile;
pub mod record;
pub mod snapshot;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{ActionConfig, AtConfig, CalendarConfig, Config, StoreConfig, SyncConfig};
pub use driver::{
    ActionFailure, CycleOutcome, CyclePhase, CycleReport, DriverOptions, EventSource, SyncDriver,
};
pub use error::{Error, Result};
pub use event::{ActionSpec, Event, EventSnapshot};
pub use executor::{ActionOutcome, CancelOutcome, Executor, JobScheduler};
pub use reconcile::{reconcile, Action, ActionCounts, ActionKind};
pub use record::{
    JobHandle, JobRecord, JobStatus, RecordMap, RecordStore, SqliteRecordStore, StoreState,
};
pub use snapshot::{
    CalendarEntry, EntryStatus, EventTime, InvalidDirective, NormalizeOptions, SyncWindow,
};
