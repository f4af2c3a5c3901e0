//! Error types for calcron-at

use thiserror::Error;

/// calcron-at error type
#[derive(Error, Debug)]
pub enum AtError {
    #[error("Failed to run {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("{command} exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Unexpected output from {command}: {output}")]
    UnexpectedOutput { command: String, output: String },

    #[error("Invalid at queue '{0}', expected a single letter")]
    InvalidQueue(char),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AtError>;

impl From<AtError> for calcron_core::Error {
    fn from(err: AtError) -> Self {
        match err {
            AtError::InvalidQueue(_) => calcron_core::Error::Config(err.to_string()),
            other => calcron_core::Error::Scheduler(other.to_string()),
        }
    }
}
