//! Error types for calcron-core

use std::time::Duration;
use thiserror::Error;

/// Main error type for calcron-core
#[derive(Error, Debug)]
pub enum Error {
    /// The calendar could not be fetched. The cycle aborts without side effects.
    #[error("Calendar source unavailable: {0}")]
    SourceUnavailable(String),

    /// The record store could not be loaded or saved.
    #[error("Record store unavailable: {0}")]
    StoreUnavailable(String),

    /// The external job scheduler rejected or failed a call.
    #[error("Job scheduler error: {0}")]
    Scheduler(String),

    #[error("Job scheduler call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error must abort the whole reconciliation cycle.
    ///
    /// Scheduler failures and timeouts are isolated to a single action.
    pub fn aborts_cycle(&self) -> bool {
        !matches!(self, Error::Scheduler(_) | Error::Timeout(_))
    }
}

/// Result type alias for calcron-core
pub type Result<T> = std::result::Result<T, Error>;
