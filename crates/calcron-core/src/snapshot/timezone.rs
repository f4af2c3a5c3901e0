//! Resolution of calendar wall-clock times to UTC instants

use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::warn;

use super::EventTime;

/// Resolve a calendar time to an absolute instant.
///
/// `default_tz` applies to floating times, all-day dates and zoned times
/// whose TZID is not a known IANA name.
pub fn resolve(time: &EventTime, default_tz: Tz) -> DateTime<Utc> {
    match time {
        EventTime::Utc(instant) => *instant,
        EventTime::Zoned { local, tzid } => localize(*local, lookup_tzid(tzid, default_tz)),
        EventTime::Floating(local) => localize(*local, default_tz),
        EventTime::Date(date) => localize(date.and_time(chrono::NaiveTime::MIN), default_tz),
    }
}

fn lookup_tzid(tzid: &str, default_tz: Tz) -> Tz {
    let tzid = tzid.trim_matches('"');
    if let Ok(tz) = tzid.parse::<Tz>() {
        return tz;
    }

    // Some servers prefix IANA names with a vendor path, e.g.
    // "/citadel.org/20190101_1/Europe/Paris".
    let segments: Vec<&str> = tzid.rsplit('/').take(2).collect();
    if segments.len() == 2 {
        let candidate = format!("{}/{}", segments[1], segments[0]);
        if let Ok(tz) = candidate.parse::<Tz>() {
            return tz;
        }
    }

    warn!(tzid = %tzid, fallback = %default_tz, "Unknown TZID, using default timezone");
    default_tz
}

/// Pin a wall-clock time to `tz`.
///
/// Ambiguous times (clocks going back) take the earlier instant. Times that
/// fall into a gap (clocks going forward) keep the offset in force before the
/// gap, which moves them forward by the gap length.
pub fn localize(local: NaiveDateTime, tz: Tz) -> DateTime<Utc> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => {
            let shifted = local
                .checked_sub_signed(Duration::hours(3))
                .and_then(|earlier| tz.from_local_datetime(&earlier).earliest())
                .and_then(|dt| {
                    let offset = Duration::seconds(i64::from(dt.offset().fix().local_minus_utc()));
                    local.checked_sub_signed(offset)
                });
            match shifted {
                Some(utc) => utc.and_utc(),
                None => {
                    warn!(local = %local, tz = %tz, "Unresolvable local time, reading it as UTC");
                    local.and_utc()
                }
            }
        }
    }
}
