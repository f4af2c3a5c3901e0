//! calcron-calendar: CalDAV event source for calcron
//!
//! Fetches the events of one CalDAV calendar collection, with recurring
//! series expanded by the server, and parses them into
//! [`calcron_core::CalendarEntry`] values.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use calcron_calendar::CalendarClient;
//! use calcron_core::CalendarConfig;
//!
//! let config = CalendarConfig::new("https://caldav.example.com", "user", "password")
//!     .with_calendar_id("calendars/user/home");
//! let client = CalendarClient::new(config)?;
//!
//! let entries = client.get_entries(
//!     chrono::Utc::now() - chrono::Duration::days(1),
//!     chrono::Utc::now() + chrono::Duration::days(7),
//! ).await?;
//! ```

pub mod client;
pub mod error;
pub mod ical;
mod source;

pub use client::CalendarClient;
pub use error::{CalendarError, Result};
pub use ical::parse_calendar;
