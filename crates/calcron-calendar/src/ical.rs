//! iCalendar (RFC 5545) parsing
//!
//! Only what the engine needs is read: the identity, times, texts and status
//! of each `VEVENT`. Properties of nested components such as `VALARM` are
//! ignored.

use calcron_core::{CalendarEntry, EntryStatus, EventTime};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use tracing::warn;

use crate::error::{CalendarError, Result};

const DATE_TIME_FORMAT: &str = "%Y%m%dT%H%M%S";
const DATE_FORMAT: &str = "%Y%m%d";

/// One unfolded content line
#[derive(Debug, PartialEq, Eq)]
struct ContentLine {
    name: String,
    params: Vec<(String, String)>,
    value: String,
}

impl ContentLine {
    fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Parse every `VEVENT` of an iCalendar object.
///
/// A `VEVENT` that carries a UID but cannot be read fails the whole object:
/// dropping it would look like a deletion to the reconciler.
pub fn parse_calendar(text: &str) -> Result<Vec<CalendarEntry>> {
    let mut entries = Vec::new();
    let mut components: Vec<String> = Vec::new();
    let mut current: Option<EventBuilder> = None;

    for line in unfold(text) {
        let Some(line) = parse_content_line(&line) else {
            continue;
        };

        match line.name.as_str() {
            "BEGIN" => {
                let component = line.value.to_ascii_uppercase();
                if component == "VEVENT" {
                    current = Some(EventBuilder::default());
                }
                components.push(component);
            }
            "END" => {
                let component = line.value.to_ascii_uppercase();
                if components.last() == Some(&component) {
                    components.pop();
                }
                if component == "VEVENT" {
                    if let Some(builder) = current.take() {
                        if let Some(entry) = builder.build()? {
                            entries.push(entry);
                        }
                    }
                }
            }
            _ => {
                if components.last().map(String::as_str) == Some("VEVENT") {
                    if let Some(builder) = current.as_mut() {
                        builder.apply(line)?;
                    }
                }
            }
        }
    }

    Ok(entries)
}

#[derive(Default)]
struct EventBuilder {
    uid: Option<String>,
    recurrence_id: Option<EventTime>,
    start: Option<EventTime>,
    end: Option<EventTime>,
    duration: Option<Duration>,
    summary: Option<String>,
    description: Option<String>,
    location: Option<String>,
    status: EntryStatus,
    last_modified: Option<DateTime<Utc>>,
}

impl EventBuilder {
    fn apply(&mut self, line: ContentLine) -> Result<()> {
        match line.name.as_str() {
            "UID" => self.uid = Some(line.value),
            "DTSTART" => self.start = Some(parse_time(&line)?),
            "DTEND" => self.end = Some(parse_time(&line)?),
            "DURATION" => {
                let duration = parse_duration(&line.value).ok_or_else(|| {
                    CalendarError::ParseError(format!("invalid DURATION value '{}'", line.value))
                })?;
                self.duration = Some(duration);
            }
            "RECURRENCE-ID" => self.recurrence_id = Some(parse_time(&line)?),
            "SUMMARY" => self.summary = Some(unescape(&line.value)),
            "DESCRIPTION" => self.description = Some(unescape(&line.value)),
            "LOCATION" => self.location = Some(unescape(&line.value)),
            "STATUS" => {
                self.status = match line.value.to_ascii_uppercase().as_str() {
                    "CANCELLED" => EntryStatus::Cancelled,
                    "TENTATIVE" => EntryStatus::Tentative,
                    _ => EntryStatus::Confirmed,
                }
            }
            "LAST-MODIFIED" => {
                if let EventTime::Utc(at) = parse_time(&line)? {
                    self.last_modified = Some(at);
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// `None` for a VEVENT without UID, which nothing can refer to.
    fn build(self) -> Result<Option<CalendarEntry>> {
        let Some(uid) = self.uid else {
            warn!("Skipping VEVENT without UID");
            return Ok(None);
        };
        let start = self
            .start
            .ok_or_else(|| CalendarError::ParseError(format!("VEVENT {uid} without DTSTART")))?;

        let end = match (self.end, self.duration) {
            (Some(end), _) => Some(end),
            (None, Some(duration)) => Some(shift(&start, duration).ok_or_else(|| {
                CalendarError::ParseError(format!("VEVENT {uid} ends out of range"))
            })?),
            (None, None) => None,
        };

        let mut entry = CalendarEntry::new(uid, start)
            .with_summary(self.summary.unwrap_or_default())
            .with_status(self.status);
        entry.end = end;
        entry.recurrence_id = self.recurrence_id;
        entry.description = self.description;
        entry.location = self.location;
        entry.last_modified = self.last_modified;
        Ok(Some(entry))
    }
}

/// Join folded lines (continuations start with a space or tab).
fn unfold(text: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for raw in text.split('\n') {
        let raw = raw.strip_suffix('\r').unwrap_or(raw);
        if let Some(rest) = raw.strip_prefix([' ', '\t']) {
            if let Some(last) = lines.last_mut() {
                last.push_str(rest);
                continue;
            }
        }
        if !raw.is_empty() {
            lines.push(raw.to_string());
        }
    }
    lines
}

fn parse_content_line(line: &str) -> Option<ContentLine> {
    let mut in_quotes = false;
    let mut colon = None;
    for (i, c) in line.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ':' if !in_quotes => {
                colon = Some(i);
                break;
            }
            _ => {}
        }
    }
    let colon = colon?;
    let (head, value) = (&line[..colon], &line[colon + 1..]);

    let mut parts = split_unquoted(head, ';').into_iter();
    let name = parts.next()?.trim().to_ascii_uppercase();
    let params = parts
        .filter_map(|param| {
            let (key, value) = param.split_once('=')?;
            Some((key.trim().to_ascii_uppercase(), value.trim_matches('"').to_string()))
        })
        .collect();

    Some(ContentLine {
        name,
        params,
        value: value.to_string(),
    })
}

fn split_unquoted(text: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        if c == '"' {
            in_quotes = !in_quotes;
        } else if c == separator && !in_quotes {
            parts.push(&text[start..i]);
            start = i + c.len_utf8();
        }
    }
    parts.push(&text[start..]);
    parts
}

fn parse_time(line: &ContentLine) -> Result<EventTime> {
    let value = line.value.trim();
    let invalid = || CalendarError::ParseError(format!("invalid {} value '{}'", line.name, value));

    let is_date = line
        .param("VALUE")
        .is_some_and(|v| v.eq_ignore_ascii_case("DATE"))
        || (value.len() == 8 && value.bytes().all(|b| b.is_ascii_digit()));
    if is_date {
        return NaiveDate::parse_from_str(value, DATE_FORMAT)
            .map(EventTime::Date)
            .map_err(|_| invalid());
    }

    if let Some(utc) = value.strip_suffix(['Z', 'z']) {
        return NaiveDateTime::parse_from_str(utc, DATE_TIME_FORMAT)
            .map(|dt| EventTime::Utc(dt.and_utc()))
            .map_err(|_| invalid());
    }

    let local = NaiveDateTime::parse_from_str(value, DATE_TIME_FORMAT).map_err(|_| invalid())?;
    Ok(match line.param("TZID") {
        Some(tzid) => EventTime::Zoned {
            local,
            tzid: tzid.to_string(),
        },
        None => EventTime::Floating(local),
    })
}

/// Parse an RFC 5545 duration such as `PT1H30M`, `P1D` or `-PT15M`.
fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let (negative, value) = match value.as_bytes().first()? {
        b'-' => (true, &value[1..]),
        b'+' => (false, &value[1..]),
        _ => (false, value),
    };
    let mut rest = value.strip_prefix(['P', 'p'])?;

    let mut total = Duration::zero();
    let mut number = String::new();
    while let Some(c) = rest.chars().next() {
        rest = &rest[c.len_utf8()..];
        match c.to_ascii_uppercase() {
            'T' => {}
            d if d.is_ascii_digit() => number.push(d),
            unit => {
                let n: i64 = number.parse().ok()?;
                number.clear();
                let part = match unit {
                    'W' => Duration::try_weeks(n),
                    'D' => Duration::try_days(n),
                    'H' => Duration::try_hours(n),
                    'M' => Duration::try_minutes(n),
                    'S' => Duration::try_seconds(n),
                    _ => None,
                }?;
                total = total.checked_add(&part)?;
            }
        }
    }

    Some(if negative { -total } else { total })
}

fn shift(time: &EventTime, by: Duration) -> Option<EventTime> {
    Some(match time {
        EventTime::Utc(at) => EventTime::Utc(at.checked_add_signed(by)?),
        EventTime::Zoned { local, tzid } => EventTime::Zoned {
            local: local.checked_add_signed(by)?,
            tzid: tzid.clone(),
        },
        EventTime::Floating(local) => EventTime::Floating(local.checked_add_signed(by)?),
        EventTime::Date(date) => EventTime::Date(date.checked_add_signed(by)?),
    })
}

/// Undo RFC 5545 TEXT escaping.
fn unescape(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            result.push(c);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => result.push('\n'),
            Some(other) => result.push(other),
            None => result.push('\\'),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const TWO_EVENTS: &str = "BEGIN:VCALENDAR\r\n\
VERSION:2.0\r\n\
BEGIN:VTIMEZONE\r\n\
TZID:Europe/Paris\r\n\
BEGIN:STANDARD\r\n\
DTSTART:19701025T030000\r\n\
END:STANDARD\r\n\
END:VTIMEZONE\r\n\
BEGIN:VEVENT\r\n\
UID:olbia2urfm\r\n\
DTSTART;TZID=Europe/Paris:20260601T083000\r\n\
DTEND;TZID=Europe/Paris:20260601T090000\r\n\
SUMMARY:Wake up\\, now\r\n\
DESCRIPTION:-60: start_heating.py\\nturn_music_on.py\\nend +30: sto\r\n p_heating.py\r\n\
LAST-MODIFIED:20260520T101500Z\r\n\
BEGIN:VALARM\r\n\
ACTION:DISPLAY\r\n\
DESCRIPTION:Reminder\r\n\
END:VALARM\r\n\
END:VEVENT\r\n\
BEGIN:VEVENT\r\n\
UID:holiday\r\n\
DTSTART;VALUE=DATE:20260714\r\n\
SUMMARY:Bastille day\r\n\
STATUS:CANCELLED\r\n\
END:VEVENT\r\n\
END:VCALENDAR\r\n";

    #[test]
    fn test_parses_multiple_events() -> Result<()> {
        let entries = parse_calendar(TWO_EVENTS)?;
        assert_eq!(entries.len(), 2);

        let wake = &entries[0];
        assert_eq!(wake.uid, "olbia2urfm");
        assert_eq!(wake.summary, "Wake up, now");
        assert_eq!(
            wake.description.as_deref(),
            Some("-60: start_heating.py\nturn_music_on.py\nend +30: stop_heating.py")
        );
        assert_eq!(
            wake.start,
            EventTime::Zoned {
                local: NaiveDate::from_ymd_opt(2026, 6, 1).unwrap().and_hms_opt(8, 30, 0).unwrap(),
                tzid: "Europe/Paris".to_string(),
            }
        );
        assert_eq!(
            wake.last_modified,
            Some(Utc.with_ymd_and_hms(2026, 5, 20, 10, 15, 0).unwrap())
        );

        let holiday = &entries[1];
        assert_eq!(holiday.start, EventTime::Date(NaiveDate::from_ymd_opt(2026, 7, 14).unwrap()));
        assert_eq!(holiday.status, EntryStatus::Cancelled);
        assert!(holiday.description.is_none());
        Ok(())
    }

    #[test]
    fn test_recurrence_instance() -> Result<()> {
        let text = "BEGIN:VCALENDAR\nBEGIN:VEVENT\nUID:series\nRECURRENCE-ID:20260602T070000Z\n\
DTSTART:20260602T070000Z\nDURATION:PT1H30M\nDESCRIPTION:backup.sh\nEND:VEVENT\nEND:VCALENDAR\n";

        let entries = parse_calendar(text)?;
        let instance = &entries[0];
        let start = Utc.with_ymd_and_hms(2026, 6, 2, 7, 0, 0).unwrap();
        assert_eq!(instance.recurrence_id, Some(EventTime::Utc(start)));
        assert_eq!(instance.end, Some(EventTime::Utc(start + Duration::minutes(90))));
        Ok(())
    }

    #[test]
    fn test_floating_time() -> Result<()> {
        let text = "BEGIN:VEVENT\nUID:f\nDTSTART:20260602T070000\nEND:VEVENT\n";
        let entries = parse_calendar(text)?;
        assert!(matches!(entries[0].start, EventTime::Floating(_)));
        Ok(())
    }

    #[test]
    fn test_event_without_uid_is_skipped() -> Result<()> {
        let text = "BEGIN:VEVENT\nSUMMARY:x\nDTSTART:20260602T060000Z\nEND:VEVENT\n\
BEGIN:VEVENT\nUID:ok\nDTSTART:20260602T070000Z\nEND:VEVENT\n";
        let entries = parse_calendar(text)?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].uid, "ok");
        Ok(())
    }

    #[test]
    fn test_event_without_start_is_error() {
        let text = "BEGIN:VEVENT\nUID:broken\nSUMMARY:x\nEND:VEVENT\n\
BEGIN:VEVENT\nUID:ok\nDTSTART:20260602T070000Z\nEND:VEVENT\n";
        assert!(matches!(parse_calendar(text), Err(CalendarError::ParseError(_))));
    }

    #[test]
    fn test_out_of_range_duration_is_error() {
        for duration in ["P99999999999999W", "PT9223372036854775807S", "P100000000W"] {
            let text = format!(
                "BEGIN:VEVENT\nUID:d\nDTSTART:20260602T070000Z\nDURATION:{duration}\n\
DESCRIPTION:end: lights_off.sh\nEND:VEVENT\n"
            );
            assert!(
                matches!(parse_calendar(&text), Err(CalendarError::ParseError(_))),
                "{duration} was accepted"
            );
        }
    }

    #[test]
    fn test_invalid_start_is_error() {
        let text = "BEGIN:VEVENT\nUID:bad\nDTSTART:tomorrow\nEND:VEVENT\n";
        assert!(matches!(parse_calendar(text), Err(CalendarError::ParseError(_))));
    }

    #[test]
    fn test_quoted_parameter_with_colon() {
        let line = parse_content_line("DTSTART;TZID=\"America/New_York:x\":20260101T090000").unwrap();
        assert_eq!(line.name, "DTSTART");
        assert_eq!(line.param("tzid"), Some("America/New_York:x"));
        assert_eq!(line.value, "20260101T090000");
    }

    #[test]
    fn test_durations() {
        assert_eq!(parse_duration("PT15M"), Some(Duration::minutes(15)));
        assert_eq!(parse_duration("P1DT2H"), Some(Duration::hours(26)));
        assert_eq!(parse_duration("P2W"), Some(Duration::weeks(2)));
        assert_eq!(parse_duration("-PT5M"), Some(Duration::minutes(-5)));
        assert_eq!(parse_duration("1H"), None);
        assert_eq!(parse_duration("P99999999999999W"), None);
        assert_eq!(parse_duration("P9223372036854775807D"), None);
        assert_eq!(parse_duration("PT9300000000000000S"), None);
    }

    #[test]
    fn test_shift_out_of_range() {
        let day = EventTime::Date(NaiveDate::from_ymd_opt(2026, 6, 2).unwrap());
        assert_eq!(
            shift(&day, Duration::days(1)),
            Some(EventTime::Date(NaiveDate::from_ymd_opt(2026, 6, 3).unwrap()))
        );
        assert_eq!(shift(&day, Duration::weeks(100_000_000)), None);
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape(r"a\;b\,c\\d\Ne"), "a;b,c\\d\ne");
    }
}
