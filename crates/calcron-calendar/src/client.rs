//! CalDAV client implementation

use crate::error::{CalendarError, Result};
use crate::ical::parse_calendar;
use calcron_core::{CalendarConfig, CalendarEntry};
use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::{Client, Method, StatusCode};
use tracing::{debug, error, info, warn};

/// CalDAV client for calendar operations
pub struct CalendarClient {
    client: Client,
    config: CalendarConfig,
    calendar_url: String,
}

impl CalendarClient {
    /// Create a new CalDAV client
    pub fn new(config: CalendarConfig) -> Result<Self> {
        if config.server_url.trim().is_empty() {
            return Err(CalendarError::Configuration("CalDAV server URL is empty".into()));
        }

        let client = Client::builder()
            .danger_accept_invalid_certs(false)
            .build()
            .map_err(|e| CalendarError::Configuration(e.to_string()))?;

        let base_url = config.server_url.trim_end_matches('/');
        let calendar_url = match config.calendar_id.as_deref() {
            Some(id) if !id.is_empty() => format!("{}/{}/", base_url, id.trim_matches('/')),
            _ => format!("{}/", base_url),
        };

        info!("Calendar client initialized for: {}", calendar_url);

        Ok(Self {
            client,
            config,
            calendar_url,
        })
    }

    pub fn calendar_url(&self) -> &str {
        &self.calendar_url
    }

    /// Get calendar entries overlapping a time range.
    ///
    /// Recurring events are expanded by the server, one entry per occurrence.
    pub async fn get_entries(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CalendarEntry>> {
        let body = calendar_query(start, end);
        let method = Method::from_bytes(b"REPORT")
            .map_err(|e| CalendarError::Configuration(e.to_string()))?;

        debug!("Fetching events from: {}", self.calendar_url);

        let response = self
            .client
            .request(method, &self.calendar_url)
            .basic_auth(&self.config.username, Some(&self.config.password))
            .header("Content-Type", "application/xml; charset=utf-8")
            .header("Depth", "1")
            .body(body)
            .send()
            .await
            .map_err(|e| CalendarError::Connection(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(CalendarError::Authentication(format!(
                "{} rejected the credentials ({})",
                self.calendar_url, status
            )));
        }
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("CalDAV request failed: {} - {}", status, error_text);
            return Err(CalendarError::CaldavError(format!(
                "Request failed: {} - {}",
                status, error_text
            )));
        }

        let text = response
            .text()
            .await
            .map_err(|e| CalendarError::HttpError(e.to_string()))?;

        let entries = parse_report(&text)?;
        info!("Fetched {} calendar entries", entries.len());
        Ok(entries)
    }
}

/// Entries of every calendar object in a REPORT response.
///
/// One unreadable object fails the whole fetch; a partial result would make
/// the missing events look deleted.
fn parse_report(response: &str) -> Result<Vec<CalendarEntry>> {
    let mut entries = Vec::new();
    for data in parse_multistatus(response)? {
        let parsed = parse_calendar(&data).inspect_err(|e| {
            warn!(error = %e, "Unparsable calendar object, aborting fetch");
        })?;
        entries.extend(parsed);
    }
    Ok(entries)
}

/// REPORT body selecting VEVENTs in `[start, end)` with recurrences expanded
fn calendar_query(start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    let start_str = start.format("%Y%m%dT%H%M%SZ").to_string();
    let end_str = end.format("%Y%m%dT%H%M%SZ").to_string();

    format!(
        r#"<?xml version="1.0" encoding="utf-8" ?>
<C:calendar-query xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
    <D:prop>
        <D:getetag/>
        <C:calendar-data>
            <C:expand start="{start}" end="{end}"/>
        </C:calendar-data>
    </D:prop>
    <C:filter>
        <C:comp-filter name="VCALENDAR">
            <C:comp-filter name="VEVENT">
                <C:time-range start="{start}" end="{end}"/>
            </C:comp-filter>
        </C:comp-filter>
    </C:filter>
</C:calendar-query>"#,
        start = start_str,
        end = end_str
    )
}

/// Extract every `calendar-data` payload of a multistatus response
fn parse_multistatus(response: &str) -> Result<Vec<String>> {
    let mut objects = Vec::new();
    let mut reader = Reader::from_str(response);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut in_calendar_data = false;
    let mut current_calendar_data = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) if e.local_name().as_ref() == b"calendar-data" => {
                in_calendar_data = true;
                current_calendar_data.clear();
            }
            Ok(Event::End(ref e)) if e.local_name().as_ref() == b"calendar-data" => {
                in_calendar_data = false;
                if !current_calendar_data.trim().is_empty() {
                    objects.push(std::mem::take(&mut current_calendar_data));
                }
            }
            Ok(Event::Text(ref e)) if in_calendar_data => {
                let text = e
                    .unescape()
                    .map_err(|e| CalendarError::XmlParseError(e.to_string()))?;
                current_calendar_data.push_str(&text);
            }
            Ok(Event::CData(e)) if in_calendar_data => {
                current_calendar_data.push_str(&String::from_utf8_lossy(&e.into_inner()));
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(CalendarError::XmlParseError(e.to_string()));
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(objects)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const MULTISTATUS: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:multistatus xmlns:d="DAV:" xmlns:cal="urn:ietf:params:xml:ns:caldav">
  <d:response>
    <d:href>/calendars/alice/home/a.ics</d:href>
    <d:propstat>
      <d:prop>
        <d:getetag>"1"</d:getetag>
        <cal:calendar-data>BEGIN:VCALENDAR
BEGIN:VEVENT
UID:a
DTSTART:20260601T080000Z
DESCRIPTION:echo a &amp;&amp; echo b
END:VEVENT
END:VCALENDAR
</cal:calendar-data>
      </d:prop>
    </d:propstat>
  </d:response>
  <d:response>
    <d:href>/calendars/alice/home/b.ics</d:href>
    <d:propstat>
      <d:prop>
        <cal:calendar-data><![CDATA[BEGIN:VCALENDAR
BEGIN:VEVENT
UID:b
DTSTART:20260601T090000Z
END:VEVENT
END:VCALENDAR
]]></cal:calendar-data>
      </d:prop>
    </d:propstat>
  </d:response>
</d:multistatus>"#;

    #[test]
    fn test_parse_multistatus_with_prefixes_and_cdata() -> Result<()> {
        let objects = parse_multistatus(MULTISTATUS)?;
        assert_eq!(objects.len(), 2);

        let a = parse_calendar(&objects[0])?;
        assert_eq!(a[0].uid, "a");
        assert_eq!(a[0].description.as_deref(), Some("echo a && echo b"));

        let b = parse_calendar(&objects[1])?;
        assert_eq!(b[0].uid, "b");
        Ok(())
    }

    #[test]
    fn test_parse_report_collects_all_objects() -> Result<()> {
        let entries = parse_report(MULTISTATUS)?;
        let uids: Vec<_> = entries.iter().map(|e| e.uid.as_str()).collect();
        assert_eq!(uids, vec!["a", "b"]);
        Ok(())
    }

    #[test]
    fn test_unreadable_object_fails_fetch() {
        let broken = MULTISTATUS.replace("DTSTART:20260601T090000Z", "DTSTART:next tuesday");

        let err = parse_report(&broken).unwrap_err();

        assert!(matches!(err, CalendarError::ParseError(_)));
        let err: calcron_core::Error = err.into();
        assert!(matches!(err, calcron_core::Error::SourceUnavailable(_)));
    }

    #[test]
    fn test_malformed_xml_is_error() {
        assert!(matches!(
            parse_multistatus("<d:multistatus><d:response></d:multistatus>"),
            Err(CalendarError::XmlParseError(_))
        ));
    }

    #[test]
    fn test_calendar_query_expands_recurrences() {
        let start = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 6, 8, 0, 0, 0).unwrap();

        let body = calendar_query(start, end);
        assert!(body.contains(r#"<C:expand start="20260601T000000Z" end="20260608T000000Z"/>"#));
        assert!(body.contains(r#"<C:time-range start="20260601T000000Z" end="20260608T000000Z"/>"#));
    }

    #[test]
    fn test_calendar_url() -> Result<()> {
        let config = CalendarConfig::new("https://dav.example.com/", "alice", "secret")
            .with_calendar_id("/calendars/alice/home/");
        let client = CalendarClient::new(config)?;
        assert_eq!(client.calendar_url(), "https://dav.example.com/calendars/alice/home/");

        let bare =
            CalendarClient::new(CalendarConfig::new("https://dav.example.com/cal", "a", "b"))?;
        assert_eq!(bare.calendar_url(), "https://dav.example.com/cal/");
        Ok(())
    }

    #[test]
    fn test_empty_url_is_configuration_error() {
        assert!(matches!(
            CalendarClient::new(CalendarConfig::default()),
            Err(CalendarError::Configuration(_))
        ));
    }
}
