//! Event snapshot production
//!
//! Turns raw calendar entries, as delivered by an event source, into the
//! normalized [`EventSnapshot`] the reconciler works on: cancelled entries are
//! dropped, wall-clock times are pinned to UTC and every description directive
//! becomes its own [`Event`].

mod directive;
mod timezone;

pub use directive::{parse_directives, Anchor, Directive, InvalidDirective};
pub use timezone::{localize, resolve};

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::event::{ActionSpec, Event, EventSnapshot};

/// A calendar time as written in the calendar, before normalization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventTime {
    /// Absolute instant (`...Z` in iCalendar)
    Utc(DateTime<Utc>),
    /// Wall-clock time in a named zone (`TZID=...`)
    Zoned { local: NaiveDateTime, tzid: String },
    /// Wall-clock time without a zone
    Floating(NaiveDateTime),
    /// All-day date
    Date(NaiveDate),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EntryStatus {
    #[default]
    Confirmed,
    Tentative,
    Cancelled,
}

/// One calendar occurrence as fetched from the source.
///
/// Recurring series are expected to arrive expanded, one entry per
/// occurrence carrying its `recurrence_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarEntry {
    pub uid: String,
    #[serde(default)]
    pub recurrence_id: Option<EventTime>,
    pub start: EventTime,
    #[serde(default)]
    pub end: Option<EventTime>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub status: EntryStatus,
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
}

impl CalendarEntry {
    pub fn new(uid: impl Into<String>, start: EventTime) -> Self {
        Self {
            uid: uid.into(),
            recurrence_id: None,
            start,
            end: None,
            summary: String::new(),
            description: None,
            location: None,
            status: EntryStatus::Confirmed,
            last_modified: None,
        }
    }

    pub fn with_end(mut self, end: EventTime) -> Self {
        self.end = Some(end);
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_status(mut self, status: EntryStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_recurrence_id(mut self, recurrence_id: EventTime) -> Self {
        self.recurrence_id = Some(recurrence_id);
        self
    }

    pub fn with_last_modified(mut self, last_modified: DateTime<Utc>) -> Self {
        self.last_modified = Some(last_modified);
        self
    }
}

/// Time range an event source is asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl SyncWindow {
    pub fn around(now: DateTime<Utc>, lookback: Duration, horizon: Duration) -> Self {
        Self {
            start: now - lookback,
            end: now + horizon,
        }
    }

    /// The same window grown by `margin` on both sides
    pub fn widen(&self, margin: Duration) -> Self {
        Self {
            start: self.start.checked_sub_signed(margin).unwrap_or(DateTime::<Utc>::MIN_UTC),
            end: self.end.checked_add_signed(margin).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at <= self.end
    }
}

/// Settings that shape how entries become events
#[derive(Debug, Clone)]
pub struct NormalizeOptions {
    /// Zone for floating times, dates and unknown TZIDs
    pub timezone: Tz,
    /// Optional script receiving the event context plus the command
    pub wrapper: Option<String>,
    /// Directives further than this from their anchor are dropped
    pub max_offset: Duration,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::UTC,
            wrapper: None,
            max_offset: Duration::hours(48),
        }
    }
}

/// Build the snapshot for one cycle.
pub fn normalize(
    entries: Vec<CalendarEntry>,
    taken_at: DateTime<Utc>,
    options: &NormalizeOptions,
) -> EventSnapshot {
    let events = entries
        .into_iter()
        .flat_map(|entry| entry_events(&entry, options))
        .collect::<Vec<_>>();

    EventSnapshot::from_events(taken_at, events)
}

/// Build the snapshot for one cycle, keeping only events that fire inside
/// `window`.
///
/// Entries are selected by their own times while events fire at an offset
/// from them, so sources are queried with a window widened by
/// [`NormalizeOptions::max_offset`] and trimmed back here.
pub fn normalize_within(
    entries: Vec<CalendarEntry>,
    window: &SyncWindow,
    taken_at: DateTime<Utc>,
    options: &NormalizeOptions,
) -> EventSnapshot {
    let events = entries
        .into_iter()
        .flat_map(|entry| entry_events(&entry, options))
        .filter(|event| window.contains(event.start_time))
        .collect::<Vec<_>>();

    EventSnapshot::from_events(taken_at, events)
}

/// Identity of one occurrence: the UID, plus the recurrence instant for
/// expanded series members.
pub fn occurrence_id(entry: &CalendarEntry, tz: Tz) -> String {
    match &entry.recurrence_id {
        Some(rid) => format!(
            "{}@{}",
            entry.uid,
            resolve(rid, tz).to_rfc3339_opts(SecondsFormat::Secs, true)
        ),
        None => entry.uid.clone(),
    }
}

fn entry_events(entry: &CalendarEntry, options: &NormalizeOptions) -> Vec<Event> {
    if entry.status == EntryStatus::Cancelled {
        debug!(uid = %entry.uid, "Skipping cancelled entry");
        return Vec::new();
    }

    let Some(description) = entry.description.as_deref().filter(|d| !d.trim().is_empty()) else {
        debug!(uid = %entry.uid, "Skipping entry without actions");
        return Vec::new();
    };

    let tz = options.timezone;
    let start = resolve(&entry.start, tz);
    let end = match &entry.end {
        Some(end) => resolve(end, tz),
        None if matches!(entry.start, EventTime::Date(_)) => {
            start.checked_add_signed(Duration::days(1)).unwrap_or(start)
        }
        None => start,
    };
    let occurrence = occurrence_id(entry, tz);

    parse_directives(description)
        .into_iter()
        .enumerate()
        .filter_map(|(index, parsed)| {
            let event_id = format!("{}#{}", occurrence, index);
            let directive = match parsed {
                Ok(directive) => directive,
                Err(e) => {
                    warn!(event_id = %event_id, error = %e, "Dropping directive");
                    return None;
                }
            };

            let anchor = match directive.anchor {
                Anchor::Start => start,
                Anchor::End => end,
            };
            let fire_at = Duration::try_minutes(directive.offset_minutes)
                .filter(|offset| offset.abs() <= options.max_offset)
                .and_then(|offset| anchor.checked_add_signed(offset));
            let Some(fire_at) = fire_at else {
                warn!(
                    event_id = %event_id,
                    offset_minutes = directive.offset_minutes,
                    max_offset_minutes = options.max_offset.num_minutes(),
                    "Dropping directive with offset beyond the allowed range"
                );
                return None;
            };

            let command = match &options.wrapper {
                Some(wrapper) => wrap_command(wrapper, entry, start, end, tz, &directive.command),
                None => directive.command,
            };

            Some(
                Event::new(event_id, fire_at, ActionSpec::new(command))
                    .with_last_modified(entry.last_modified),
            )
        })
        .collect()
}

fn wrap_command(
    wrapper: &str,
    entry: &CalendarEntry,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    tz: Tz,
    command: &str,
) -> String {
    let args = [
        start.with_timezone(&tz).to_rfc3339(),
        end.with_timezone(&tz).to_rfc3339(),
        entry.summary.clone(),
        entry.location.clone().unwrap_or_default(),
        command.to_string(),
    ];

    let quoted: Vec<String> = args.iter().map(|a| shell_quote(a)).collect();
    format!("{} {}", wrapper, quoted.join(" "))
}

/// Single-quote a string for POSIX shells.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
