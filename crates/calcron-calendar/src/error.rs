//! Error types for calcron-calendar

use thiserror::Error;

/// calcron-calendar error type
#[derive(Error, Debug)]
pub enum CalendarError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("CalDAV error: {0}")]
    CaldavError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("XML parsing error: {0}")]
    XmlParseError(String),

    #[error("iCalendar parse error: {0}")]
    ParseError(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, CalendarError>;

impl From<CalendarError> for calcron_core::Error {
    fn from(err: CalendarError) -> Self {
        match err {
            CalendarError::Configuration(msg) => calcron_core::Error::Config(msg),
            other => calcron_core::Error::SourceUnavailable(other.to_string()),
        }
    }
}
