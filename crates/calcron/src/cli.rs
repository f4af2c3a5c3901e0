//! Terminal output for the one-shot commands

use calcron_core::{Action, ActionCounts, CycleOutcome, CycleReport, JobStatus, StoreState};
use nu_ansi_term::{Color, Style};

fn outcome_style(outcome: CycleOutcome) -> Style {
    match outcome {
        CycleOutcome::Success => Color::Green.bold(),
        CycleOutcome::Partial => Color::Yellow.bold(),
        CycleOutcome::Aborted => Color::Red.bold(),
        CycleOutcome::Skipped => Style::new().dimmed(),
    }
}

/// Print a cycle report, as JSON when `json` is set
pub fn print_report(report: &CycleReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!(
        "{} {}",
        outcome_style(report.outcome).paint(report.outcome.as_str()),
        Style::new().dimmed().paint(report.cycle_id.to_string())
    );
    println!("  {}", report.planned);

    for event_id in &report.inconsistencies {
        println!("  {} {} (job vanished from scheduler)", Color::Yellow.paint("!"), event_id);
    }
    for failure in &report.failures {
        println!("  {} {}", Color::Red.paint("✗"), failure);
    }
    if let Some(error) = &report.error {
        println!("  {} {}", Color::Red.paint("error:"), error);
    }
    Ok(())
}

pub fn print_plan(actions: &[Action]) {
    let counts = ActionCounts::of(actions);
    if counts.changes() == 0 {
        println!("Nothing to do ({} unchanged)", counts.noop);
        return;
    }

    for action in actions.iter().filter(|a| !matches!(a, Action::NoOp { .. })) {
        let marker = match action {
            Action::Schedule { .. } => Color::Green.paint("+"),
            Action::Reschedule { .. } => Color::Cyan.paint("~"),
            _ => Color::Red.paint("-"),
        };
        println!("{} {}", marker, action);
    }
    println!("{}", "─".repeat(50));
    println!("{}", counts);
}

pub fn print_status(state: &StoreState, json: bool) -> anyhow::Result<()> {
    if json {
        let records: Vec<_> = state.records.values().collect();
        let value = serde_json::json!({
            "last_sync": state.last_sync,
            "last_outcome": state.last_outcome,
            "records": records,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    match (state.last_sync, state.last_outcome) {
        (Some(at), Some(outcome)) => println!(
            "Last sync {} ({})",
            at.to_rfc3339(),
            outcome_style(outcome).paint(outcome.as_str())
        ),
        (Some(at), None) => println!("Last sync {}", at.to_rfc3339()),
        _ => println!("Never synced"),
    }

    if state.records.is_empty() {
        println!("No scheduled jobs");
        return Ok(());
    }

    println!("{}", "─".repeat(50));
    for record in state.records.values() {
        let status = match record.status {
            JobStatus::Pending => Color::Green.paint("pending"),
            JobStatus::Failed => Color::Red.paint("failed"),
        };
        let handle = record
            .job_handle
            .as_ref()
            .map(|h| h.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<7} {:>6}  {}  {}",
            status,
            handle,
            record.scheduled_time.to_rfc3339(),
            record.event_id
        );
    }
    println!("{}", "─".repeat(50));
    println!("{} jobs, {} failed", state.records.len(), state.failed_count());
    Ok(())
}
