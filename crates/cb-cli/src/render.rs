//! Plain-text tables for the terminal.

use cb_core::models::{ExecutionRecord, Host, Outcome, Reachability, RunReport, StepStatus};
use cb_core::services::orchestrator::{PlannedStep, ResetReport};

pub fn report_table(report: &RunReport) -> String {
    let rows = report
        .entries
        .iter()
        .map(|e| {
            vec![
                e.phase.to_string(),
                e.host.clone(),
                e.step.clone(),
                outcome_cell(&e.outcome),
            ]
        })
        .collect();
    let mut out = table(&["PHASE", "HOST", "STEP", "OUTCOME"], rows);
    out.push('\n');
    out.push_str(&summary_line(report));
    if let Some(fatal) = &report.first_fatal {
        out.push_str(&format!("\nfatal: {fatal}"));
    }
    out
}

pub fn summary_line(report: &RunReport) -> String {
    let counts = report.counts();
    let mut line = format!(
        "{} applied, {} already satisfied, {} failed, {} skipped, {} cancelled",
        counts.success, counts.skipped, counts.failed, counts.skipped_dependency, counts.cancelled
    );
    if report.cancelled {
        line.push_str(" (interrupted)");
    }
    line
}

fn outcome_cell(outcome: &Outcome) -> String {
    let icon = match outcome {
        Outcome::Success => "✓",
        Outcome::SkippedAlreadySatisfied => "·",
        Outcome::Failed(_) => "✗",
        Outcome::SkippedDueToDependency(_) => "↷",
        Outcome::Cancelled => "⊘",
    };
    format!("{icon} {outcome}")
}

pub fn plan_table(plan: &[PlannedStep]) -> String {
    let rows = plan
        .iter()
        .map(|p| {
            vec![
                p.phase.to_string(),
                p.host.clone(),
                p.step.clone(),
                if p.satisfied { "done" } else { "pending" }.to_string(),
            ]
        })
        .collect();
    table(&["PHASE", "HOST", "STEP", "STATE"], rows)
}

pub fn status_table(records: &[ExecutionRecord]) -> String {
    let rows = records
        .iter()
        .map(|r| {
            vec![
                r.host.clone(),
                r.phase.to_string(),
                r.step.clone(),
                status_label(r.status).to_string(),
                r.attempts.to_string(),
                r.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                r.last_error.clone().unwrap_or_default(),
            ]
        })
        .collect();
    table(
        &["HOST", "PHASE", "STEP", "STATUS", "ATTEMPTS", "UPDATED", "ERROR"],
        rows,
    )
}

fn status_label(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Pending => "pending",
        StepStatus::Success => "success",
        StepStatus::Failed => "failed",
        StepStatus::Skipped => "skipped",
    }
}

pub fn probe_table(hosts: &[Host]) -> String {
    let rows = hosts
        .iter()
        .map(|h| {
            let state = match h.reachability {
                Reachability::Reachable => "✓ reachable",
                Reachability::Unreachable => "✗ unreachable",
                Reachability::Unknown => "? unknown",
            };
            vec![
                h.id().to_string(),
                h.address.clone(),
                h.role.to_string(),
                state.to_string(),
            ]
        })
        .collect();
    table(&["HOST", "ADDRESS", "ROLE", "SSH"], rows)
}

pub fn reset_summary(report: &ResetReport) -> String {
    let mut out = format!("removed {} record(s)", report.removed);
    for failure in &report.failed {
        out.push_str(&format!("\n✗ {}: {}", failure.host, failure.error));
    }
    out
}

/// Left-aligned columns separated by two spaces, trailing blanks trimmed.
fn table(headers: &[&str], rows: Vec<Vec<String>>) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let header_row: Vec<String> = headers.iter().map(|h| h.to_string()).collect();
    std::iter::once(&header_row)
        .chain(rows.iter())
        .map(|row| {
            let line = row
                .iter()
                .zip(&widths)
                .map(|(cell, width)| {
                    let pad = width - cell.chars().count();
                    format!("{cell}{}", " ".repeat(pad))
                })
                .collect::<Vec<_>>()
                .join("  ");
            line.trim_end().to_string()
        })
        .collect::<Vec<_>>()
        .join("\n")
}
