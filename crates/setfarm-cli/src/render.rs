//! Output rendering for the setfarm CLI.
//!
//! Formats runs, steps, stories and medic history for terminal display.

use chrono::{DateTime, Utc};
use setfarm_core::types::{Event, MedicCheck, Run, Step, Story};
use std::fmt::Write;

/// Print confirmation after creating a run.
pub fn print_run_created(run: &Run) {
    print!("{}", render_run_created(run));
}

/// Render run creation confirmation to string.
pub fn render_run_created(run: &Run) -> String {
    let mut out = String::new();
    writeln!(out, "Created run: {}", run.id).unwrap();
    writeln!(out, "  Workflow: {}", run.workflow_id).unwrap();
    writeln!(out, "  Task:     {}", truncate(&run.task, 60)).unwrap();
    writeln!(out, "  Status:   {}", run.status.as_str()).unwrap();
    out
}

/// Print a list of runs in tabular format.
pub fn print_run_list(runs: &[Run]) {
    print!("{}", render_run_list(runs));
}

/// Render run list to string.
pub fn render_run_list(runs: &[Run]) -> String {
    let mut out = String::new();

    if runs.is_empty() {
        writeln!(out, "No runs found.").unwrap();
        return out;
    }

    writeln!(
        out,
        "{:<36}  {:<16}  {:<8}  {:<20}  {}",
        "ID", "WORKFLOW", "STATUS", "CREATED", "TASK"
    )
    .unwrap();
    writeln!(out, "{}", "-".repeat(110)).unwrap();

    for run in runs {
        writeln!(
            out,
            "{:<36}  {:<16}  {:<8}  {:<20}  {}",
            run.id.0,
            truncate(&run.workflow_id, 16),
            run.status.as_str(),
            format_time(&run.created_at),
            truncate(&run.task, 30),
        )
        .unwrap();
    }
    out
}

/// Print full run details: steps, stories, recent events.
pub fn print_run_details(run: &Run, steps: &[Step], stories: &[Story], events: &[Event]) {
    print!("{}", render_run_details(run, steps, stories, events));
}

/// Render run details to string.
pub fn render_run_details(run: &Run, steps: &[Step], stories: &[Story], events: &[Event]) -> String {
    let mut out = String::new();
    writeln!(out, "Run {}", run.id).unwrap();
    writeln!(out, "  Workflow: {}", run.workflow_id).unwrap();
    writeln!(out, "  Task:     {}", run.task).unwrap();
    writeln!(out, "  Status:   {}", run.status.as_str()).unwrap();
    writeln!(out, "  Created:  {}", format_time(&run.created_at)).unwrap();
    if run.resume_count() > 0 {
        writeln!(out, "  Resumes:  {}", run.resume_count()).unwrap();
    }

    writeln!(out, "\nSteps:").unwrap();
    for step in steps {
        writeln!(
            out,
            "  [{}] {:<16} {:<10} {:<8} retries={} abandons={}",
            step.step_index,
            truncate(&step.step_id, 16),
            truncate(&step.agent_id, 10),
            step.status.as_str(),
            step.retry_count,
            step.abandoned_count,
        )
        .unwrap();
    }

    if !stories.is_empty() {
        writeln!(out, "\nStories:").unwrap();
        for story in stories {
            writeln!(
                out,
                "  [{}] {:<16} {:<10} retries={} abandons={}{}",
                story.story_index,
                truncate(&story.story_id, 16),
                story.status.as_str(),
                story.retry_count,
                story.abandoned_count,
                if story.needs_verify { " (verify)" } else { "" },
            )
            .unwrap();
        }
    }

    if !events.is_empty() {
        writeln!(out, "\nRecent events:").unwrap();
        for event in events {
            writeln!(
                out,
                "  {}  {:<16} {}",
                format_time(&event.ts),
                event.kind,
                truncate(&event.detail, 60),
            )
            .unwrap();
        }
    }
    out
}

/// Print medic history in tabular format.
pub fn print_medic_history(checks: &[MedicCheck]) {
    print!("{}", render_medic_history(checks));
}

/// Render medic history to string.
pub fn render_medic_history(checks: &[MedicCheck]) -> String {
    let mut out = String::new();

    if checks.is_empty() {
        writeln!(out, "No medic checks recorded.").unwrap();
        return out;
    }

    writeln!(
        out,
        "{:<20}  {:>6}  {:>7}  {}",
        "CHECKED", "ISSUES", "ACTIONS", "SUMMARY"
    )
    .unwrap();
    writeln!(out, "{}", "-".repeat(70)).unwrap();
    for check in checks {
        writeln!(
            out,
            "{:<20}  {:>6}  {:>7}  {}",
            format_time(&check.checked_at),
            check.issues_found,
            check.actions_taken,
            truncate(&check.summary, 40),
        )
        .unwrap();
    }
    out
}

fn format_time(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn truncate(s: &str, max: usize) -> String {
    let clean: String = s.chars().map(|c| if c == '\n' { ' ' } else { c }).collect();
    if clean.chars().count() <= max {
        clean
    } else {
        let cut: String = clean.chars().take(max.saturating_sub(1)).collect();
        format!("{cut}…")
    }
}
