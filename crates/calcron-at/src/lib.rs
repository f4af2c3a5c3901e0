//! calcron-at: `at` daemon job scheduler
//!
//! Submits, cancels and lists one-shot jobs through the `at`, `atrm` and
//! `atq` commands.

mod error;
mod scheduler;

pub use error::{AtError, Result};
pub use scheduler::AtScheduler;
