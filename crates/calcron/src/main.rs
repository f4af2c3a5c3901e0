//! calcron: keep `at` jobs in sync with a CalDAV calendar
//!
//! Usage:
//!   calcron [sync]        - Run one reconciliation cycle
//!   calcron daemon        - Run a cycle every interval until Ctrl+C
//!   calcron plan          - Show what the next cycle would do
//!   calcron status        - Show stored jobs and the last outcome
//!   calcron reset         - Cancel all pending jobs and clear the store

mod cli;

use calcron_at::AtScheduler;
use calcron_calendar::CalendarClient;
use calcron_core::{Config, SyncDriver};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing_subscriber::EnvFilter;

/// Run mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    /// One cycle, then exit
    Sync,
    /// Periodic cycles until Ctrl+C
    Daemon,
    /// Dry run
    Plan,
    Status,
    Reset,
    Help,
    Version,
}

#[derive(Debug)]
struct Args {
    mode: RunMode,
    config: Option<PathBuf>,
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = parse_args(std::env::args().skip(1))?;

    match args.mode {
        RunMode::Help => {
            print_help();
            return Ok(ExitCode::SUCCESS);
        }
        RunMode::Version => {
            println!("calcron {}", env!("CARGO_PKG_VERSION"));
            return Ok(ExitCode::SUCCESS);
        }
        _ => {}
    }

    // Load .env file (may carry RUST_LOG)
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(args.config.as_deref())
        .map_err(|e| anyhow::anyhow!("Config error: {}", e))?;

    let source = CalendarClient::new(config.calendar.clone())
        .map_err(|e| anyhow::anyhow!("Failed to create calendar client: {}", e))?;
    let scheduler = AtScheduler::from_config(&config.at)
        .map_err(|e| anyhow::anyhow!("Failed to set up at scheduler: {}", e))?;
    let driver = SyncDriver::from_config(&config, Arc::new(source), Arc::new(scheduler))
        .map_err(|e| anyhow::anyhow!("Failed to open record store: {}", e))?;

    match args.mode {
        RunMode::Sync => {
            let report = driver.run_cycle().await;
            cli::print_report(&report, args.json)?;
            Ok(ExitCode::from(report.outcome.exit_code()))
        }
        RunMode::Reset => {
            let report = driver.reset().await;
            cli::print_report(&report, args.json)?;
            Ok(ExitCode::from(report.outcome.exit_code()))
        }
        RunMode::Plan => {
            let actions = driver.plan().await?;
            cli::print_plan(&actions);
            Ok(ExitCode::SUCCESS)
        }
        RunMode::Status => {
            let state = driver.status().await?;
            cli::print_status(&state, args.json)?;
            Ok(ExitCode::SUCCESS)
        }
        RunMode::Daemon => {
            run_daemon(Arc::new(driver), config.sync.interval()).await?;
            Ok(ExitCode::SUCCESS)
        }
        RunMode::Help | RunMode::Version => Ok(ExitCode::SUCCESS),
    }
}

/// Parse command line arguments
fn parse_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<Args> {
    let mut parsed = Args {
        mode: RunMode::Sync,
        config: None,
        json: false,
    };

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "sync" => parsed.mode = RunMode::Sync,
            "daemon" => parsed.mode = RunMode::Daemon,
            "plan" => parsed.mode = RunMode::Plan,
            "status" => parsed.mode = RunMode::Status,
            "reset" => parsed.mode = RunMode::Reset,
            "--config" | "-c" => {
                let path = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--config needs a path"))?;
                parsed.config = Some(PathBuf::from(path));
            }
            "--json" => parsed.json = true,
            "--help" | "-h" => return Ok(Args { mode: RunMode::Help, ..parsed }),
            "--version" | "-V" => return Ok(Args { mode: RunMode::Version, ..parsed }),
            other => anyhow::bail!("Unknown argument: {} (see --help)", other),
        }
    }

    Ok(parsed)
}

/// Print help message
fn print_help() {
    println!("calcron - run calendar events as at jobs");
    println!();
    println!("Usage:");
    println!("  calcron [sync]        Run one reconciliation cycle (default)");
    println!("  calcron daemon        Run a cycle every sync.interval_secs until Ctrl+C");
    println!("  calcron plan          Show what the next cycle would do");
    println!("  calcron status        Show stored jobs and the last cycle outcome");
    println!("  calcron reset         Cancel every pending job and clear the store");
    println!();
    println!("Options:");
    println!("  -c, --config <path>   Configuration file (default: ./calcron.toml)");
    println!("      --json            Machine-readable output for sync, reset and status");
    println!("  -h, --help            Show this help message");
    println!("  -V, --version         Show version");
    println!();
    println!("Exit status: 0 success, 2 some actions failed, 1 cycle aborted");
    println!();
    println!("Environment Variables:");
    println!("  CALDAV_URL            Calendar collection URL (required without a config file)");
    println!("  CALDAV_USERNAME       CalDAV user");
    println!("  CALDAV_PASSWORD       CalDAV password");
    println!("  CALDAV_CALENDAR       Calendar path below CALDAV_URL");
    println!("  CALCRON_DB_PATH       Record store (default: data/calcron.db)");
    println!("  CALCRON_TIMEZONE      Zone for floating and all-day times (default: UTC)");
    println!("  CALCRON_HORIZON_HOURS How far ahead to schedule (default: 168)");
    println!("  CALCRON_INTERVAL_SECS Daemon interval (default: 300)");
    println!("  CALCRON_WRAPPER       Script wrapping every command");
    println!("  CALCRON_AT_QUEUE      Dedicated at queue letter");
    println!("  RUST_LOG              Log filter (default: info)");
}

/// Run cycles on a fixed interval until Ctrl+C.
///
/// Ticks are not delayed by slow cycles; a tick that finds the previous
/// cycle still running is skipped by the driver.
async fn run_daemon(driver: Arc<SyncDriver>, interval: Duration) -> anyhow::Result<()> {
    tracing::info!("Starting calcron daemon (every {:?})", interval);
    tracing::info!("Press Ctrl+C to exit");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut cycles: Vec<JoinHandle<()>> = Vec::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                cycles.retain(|handle| !handle.is_finished());
                let driver = Arc::clone(&driver);
                cycles.push(tokio::spawn(async move {
                    driver.run_cycle().await;
                }));
            }
            result = tokio::signal::ctrl_c() => {
                result?;
                tracing::info!("Shutting down...");
                break;
            }
        }
    }

    // Let a running cycle finish persisting
    join_cycles(cycles).await;
    Ok(())
}

/// Wait for spawned cycles, logging the ones that panicked or were
/// cancelled. Returns how many failed.
async fn join_cycles(cycles: Vec<JoinHandle<()>>) -> usize {
    let mut failed = 0;
    for handle in cycles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Sync cycle task failed");
            failed += 1;
        }
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> anyhow::Result<Args> {
        parse_args(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_default_is_sync() -> anyhow::Result<()> {
        let parsed = args(&[])?;
        assert_eq!(parsed.mode, RunMode::Sync);
        assert!(parsed.config.is_none());
        Ok(())
    }

    #[test]
    fn test_commands_and_options() -> anyhow::Result<()> {
        let parsed = args(&["status", "--config", "/etc/calcron.toml", "--json"])?;
        assert_eq!(parsed.mode, RunMode::Status);
        assert_eq!(parsed.config, Some(PathBuf::from("/etc/calcron.toml")));
        assert!(parsed.json);

        assert_eq!(args(&["daemon"])?.mode, RunMode::Daemon);
        assert_eq!(args(&["-c", "x.toml", "plan"])?.mode, RunMode::Plan);
        assert_eq!(args(&["reset", "--help"])?.mode, RunMode::Help);
        Ok(())
    }

    #[tokio::test]
    async fn test_join_cycles_reports_panicked_cycle() {
        let cycles = vec![
            tokio::spawn(async {}),
            tokio::spawn(async { panic!("cycle blew up") }),
        ];

        assert_eq!(join_cycles(cycles).await, 1);
    }

    #[test]
    fn test_bad_arguments() {
        assert!(args(&["--config"]).is_err());
        assert!(args(&["frobnicate"]).is_err());
    }
}
