//! Record persistence using SQLite

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tracing::debug;

use super::{JobHandle, JobRecord, JobStatus, RecordStore, StoreState};
use crate::driver::CycleOutcome;
use crate::{Error, Result};

const META_LAST_SYNC: &str = "last_sync";
const META_LAST_OUTCOME: &str = "last_outcome";

/// SQLite-based record store
pub struct SqliteRecordStore {
    conn: Connection,
}

impl SqliteRecordStore {
    /// Open (or create) the store at the given path
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        debug!(path = %db_path.display(), journal_mode = %mode, "Opened record store");

        let store = Self { conn };
        store.init_tables()?;
        Ok(store)
    }

    /// Create an in-memory record store (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_tables()?;
        Ok(store)
    }

    fn init_tables(&self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS job_records (
                event_id TEXT PRIMARY KEY,
                scheduled_time TEXT NOT NULL,
                revision_token TEXT NOT NULL,
                job_handle TEXT,
                status TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS sync_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    fn meta(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM sync_meta WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }
}

fn parse_time(field: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::StoreUnavailable(format!("corrupt {field} '{value}': {e}")))
}

impl RecordStore for SqliteRecordStore {
    fn load(&self) -> Result<StoreState> {
        let mut stmt = self.conn.prepare(
            "SELECT event_id, scheduled_time, revision_token, job_handle, status, updated_at
             FROM job_records ORDER BY event_id",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut state = StoreState::default();
        for (event_id, scheduled_time, revision_token, job_handle, status, updated_at) in rows {
            let status = JobStatus::parse(&status).ok_or_else(|| {
                Error::StoreUnavailable(format!("unknown status '{status}' for {event_id}"))
            })?;

            let record = JobRecord {
                scheduled_time: parse_time("scheduled_time", &scheduled_time)?,
                revision_token,
                job_handle: job_handle.map(JobHandle::new),
                status,
                updated_at: parse_time("updated_at", &updated_at)?,
                event_id: event_id.clone(),
            };
            state.records.insert(event_id, record);
        }

        state.last_sync = self
            .meta(META_LAST_SYNC)?
            .map(|v| parse_time(META_LAST_SYNC, &v))
            .transpose()?;
        state.last_outcome = self
            .meta(META_LAST_OUTCOME)?
            .and_then(|v| CycleOutcome::parse(&v));

        Ok(state)
    }

    fn save(&mut self, state: &StoreState) -> Result<()> {
        let tx = self.conn.transaction()?;

        tx.execute("DELETE FROM job_records", [])?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO job_records
                 (event_id, scheduled_time, revision_token, job_handle, status, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for record in state.records.values() {
                insert.execute(params![
                    record.event_id,
                    record.scheduled_time.to_rfc3339(),
                    record.revision_token,
                    record.job_handle.as_ref().map(JobHandle::as_str),
                    record.status.as_str(),
                    record.updated_at.to_rfc3339(),
                ])?;
            }
        }

        tx.execute("DELETE FROM sync_meta", [])?;
        if let Some(last_sync) = state.last_sync {
            tx.execute(
                "INSERT INTO sync_meta (key, value) VALUES (?1, ?2)",
                params![META_LAST_SYNC, last_sync.to_rfc3339()],
            )?;
        }
        if let Some(outcome) = state.last_outcome {
            tx.execute(
                "INSERT INTO sync_meta (key, value) VALUES (?1, ?2)",
                params![META_LAST_OUTCOME, outcome.as_str()],
            )?;
        }

        tx.commit()?;
        debug!(records = state.records.len(), "Saved record store");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 2, hour, 0, 0).unwrap()
    }

    fn sample_state() -> StoreState {
        let mut state = StoreState::default();
        state.records.insert(
            "e1#0".to_string(),
            JobRecord::pending("e1#0", at(15), "aaaa", JobHandle::new("42"), at(9)),
        );
        state.records.insert(
            "e2#0".to_string(),
            JobRecord {
                event_id: "e2#0".to_string(),
                scheduled_time: at(16),
                revision_token: "bbbb".to_string(),
                job_handle: None,
                status: JobStatus::Failed,
                updated_at: at(9),
            },
        );
        state.last_sync = Some(at(9));
        state.last_outcome = Some(CycleOutcome::Partial);
        state
    }

    #[test]
    fn test_empty_store_loads_empty_state() -> Result<()> {
        let store = SqliteRecordStore::in_memory()?;
        assert_eq!(store.load()?, StoreState::default());
        Ok(())
    }

    #[test]
    fn test_save_and_load() -> Result<()> {
        let mut store = SqliteRecordStore::in_memory()?;
        let state = sample_state();

        store.save(&state)?;
        assert_eq!(store.load()?, state);
        Ok(())
    }

    #[test]
    fn test_save_replaces_whole_mapping() -> Result<()> {
        let mut store = SqliteRecordStore::in_memory()?;
        store.save(&sample_state())?;

        let mut next = StoreState::default();
        next.records.insert(
            "e3#0".to_string(),
            JobRecord::pending("e3#0", at(18), "cccc", JobHandle::new("43"), at(10)),
        );
        store.save(&next)?;

        let loaded = store.load()?;
        assert_eq!(loaded.records.keys().collect::<Vec<_>>(), vec!["e3#0"]);
        assert!(loaded.last_sync.is_none());
        assert!(loaded.last_outcome.is_none());
        Ok(())
    }

    #[test]
    fn test_persists_across_reopen() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("nested").join("calcron.db");

        {
            let mut store = SqliteRecordStore::open(&path)?;
            store.save(&sample_state())?;
        }

        let store = SqliteRecordStore::open(&path)?;
        assert_eq!(store.load()?, sample_state());
        Ok(())
    }

    #[test]
    fn test_corrupt_row_is_store_unavailable() -> Result<()> {
        let store = SqliteRecordStore::in_memory()?;
        store.conn.execute(
            "INSERT INTO job_records VALUES ('x', 'yesterday', 't', NULL, 'pending', 'now')",
            [],
        )?;

        assert!(matches!(store.load(), Err(Error::StoreUnavailable(_))));
        Ok(())
    }
}
