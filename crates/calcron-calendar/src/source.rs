//! Event source backed by a CalDAV calendar

use async_trait::async_trait;
use calcron_core::{CalendarEntry, EventSource, SyncWindow};

use crate::client::CalendarClient;

#[async_trait]
impl EventSource for CalendarClient {
    async fn fetch(&self, window: SyncWindow) -> calcron_core::Result<Vec<CalendarEntry>> {
        Ok(self.get_entries(window.start, window.end).await?)
    }
}
