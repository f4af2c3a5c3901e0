//! `at` backed job scheduler
//!
//! Jobs are submitted with `at -t`, which reads the command to run from
//! stdin and reports the new job number on stderr (`job 12 at ...`). Times
//! are handed over in the host's local time, the zone `atd` fires in.

use async_trait::async_trait;
use calcron_core::{ActionSpec, AtConfig, CancelOutcome, JobHandle, JobScheduler};
use chrono::{DateTime, Local, TimeZone, Utc};
use regex::Regex;
use std::collections::BTreeSet;
use std::fmt::Display;
use std::process::{Output, Stdio};
use std::sync::LazyLock;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{AtError, Result};

static JOB_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^job\s+(\d+)\s+at\b").expect("job line pattern is valid"));

/// Job scheduler driving the `at` command family
#[derive(Debug, Clone)]
pub struct AtScheduler {
    at_command: String,
    atrm_command: String,
    atq_command: String,
    queue: Option<char>,
}

impl AtScheduler {
    pub fn from_config(config: &AtConfig) -> Result<Self> {
        if let Some(queue) = config.queue {
            if !queue.is_ascii_alphabetic() {
                return Err(AtError::InvalidQueue(queue));
            }
        }

        Ok(Self {
            at_command: config.at_command.clone(),
            atrm_command: config.atrm_command.clone(),
            atq_command: config.atq_command.clone(),
            queue: config.queue,
        })
    }

    fn queue_args(&self) -> Vec<String> {
        match self.queue {
            Some(queue) => vec!["-q".to_string(), queue.to_string()],
            None => Vec::new(),
        }
    }

    async fn submit_job(&self, at: DateTime<Utc>, action: &ActionSpec) -> Result<JobHandle> {
        let timestamp = at_timestamp(at, &Local);
        debug!(at = %at, timestamp = %timestamp, "Submitting at job");

        let mut child = Command::new(&self.at_command)
            .args(self.queue_args())
            .arg("-t")
            .arg(&timestamp)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| AtError::Spawn {
                command: self.at_command.clone(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(action.command.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
        }

        let output = child.wait_with_output().await?;
        let output = check(&self.at_command, output)?;

        let text = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stderr),
            String::from_utf8_lossy(&output.stdout)
        );
        parse_job_id(&text).ok_or_else(|| AtError::UnexpectedOutput {
            command: self.at_command.clone(),
            output: text.trim().to_string(),
        })
    }

    async fn cancel_job(&self, handle: &JobHandle) -> Result<CancelOutcome> {
        debug!(handle = %handle, "Removing at job");

        let output = run(&self.atrm_command, &[handle.as_str().to_string()]).await?;

        // Some atrm builds exit 0 even when the job is unknown.
        if is_not_found(&String::from_utf8_lossy(&output.stderr)) {
            return Ok(CancelOutcome::NotFound);
        }
        check(&self.atrm_command, output).map(|_| CancelOutcome::Cancelled)
    }

    async fn list_jobs(&self) -> Result<BTreeSet<JobHandle>> {
        let output = run(&self.atq_command, &self.queue_args()).await?;
        let output = check(&self.atq_command, output)?;
        Ok(parse_atq(&String::from_utf8_lossy(&output.stdout)))
    }
}

#[async_trait]
impl JobScheduler for AtScheduler {
    async fn submit(
        &self,
        at: DateTime<Utc>,
        action: &ActionSpec,
    ) -> calcron_core::Result<JobHandle> {
        Ok(self.submit_job(at, action).await?)
    }

    async fn cancel(&self, handle: &JobHandle) -> calcron_core::Result<CancelOutcome> {
        Ok(self.cancel_job(handle).await?)
    }

    async fn list_handles(&self) -> calcron_core::Result<Option<BTreeSet<JobHandle>>> {
        Ok(Some(self.list_jobs().await?))
    }
}

async fn run(command: &str, args: &[String]) -> Result<Output> {
    Command::new(command)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| AtError::Spawn {
            command: command.to_string(),
            source,
        })
}

fn check(command: &str, output: Output) -> Result<Output> {
    if output.status.success() {
        return Ok(output);
    }
    Err(AtError::CommandFailed {
        command: command.to_string(),
        status: output.status.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

/// `at -t` timestamp (`CCYYMMDDhhmm.SS`) in the given zone
fn at_timestamp<Z: TimeZone>(at: DateTime<Utc>, zone: &Z) -> String
where
    Z::Offset: Display,
{
    at.with_timezone(zone).format("%Y%m%d%H%M.%S").to_string()
}

fn parse_job_id(output: &str) -> Option<JobHandle> {
    JOB_LINE
        .captures(output)
        .map(|caps| JobHandle::new(&caps[1]))
}

fn is_not_found(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    stderr.contains("cannot find jobid") || stderr.contains("cannot find job")
}

/// Job numbers from `atq` output (first column of each line)
fn parse_atq(stdout: &str) -> BTreeSet<JobHandle> {
    stdout
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter(|id| id.bytes().all(|b| b.is_ascii_digit()))
        .map(JobHandle::new)
        .collect()
}
