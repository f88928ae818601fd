//! Terminal output
//!
//! Colored rendering of run events and records.

use colored::*;
use consort_core::domain::run::{Run, RunStatus};
use consort_core::dto::event::{ImageProgress, Notice, PullStatus, RunEvent, StateUpdate};
use tokio::sync::mpsc;

/// Prints events until every sender is gone
pub async fn print_events(mut events: mpsc::UnboundedReceiver<RunEvent>) {
    while let Some(event) = events.recv().await {
        print_event(&event);
    }
}

fn print_event(event: &RunEvent) {
    match event {
        RunEvent::Saved { run } => {
            println!("{} Run {} saved", "▸".cyan(), run.id.dimmed());
        }
        RunEvent::Progress { run_id, progress } => print_progress(run_id, progress),
        RunEvent::StateUpdate { run_id, update } => print_state(run_id, update),
        RunEvent::Terminal { run } => {
            println!(
                "{} Run {} ended: {}",
                "■".bold(),
                run.id.dimmed(),
                colorize_status(run.status)
            );
        }
        RunEvent::Notice { notice } => print_notice(notice),
    }
}

pub fn print_progress(run_id: &str, progress: &ImageProgress) {
    let prefix = if run_id.is_empty() {
        String::new()
    } else {
        format!("[{}] ", run_id)
    };
    match &progress.status {
        PullStatus::Downloading { detail } => println!(
            "  {}{} {}",
            prefix.dimmed(),
            progress.image.cyan(),
            detail.dimmed()
        ),
        PullStatus::Complete => println!(
            "  {}{} {}",
            prefix.dimmed(),
            progress.image.cyan(),
            "✓".green()
        ),
        PullStatus::Failed { message } => println!(
            "  {}{} {} {}",
            prefix.dimmed(),
            progress.image.cyan(),
            "✗".red(),
            message.red()
        ),
    }
}

fn print_state(run_id: &str, update: &StateUpdate) {
    let mut parts = Vec::new();
    if let Some(state) = &update.controller_state {
        parts.push(state.clone());
    }
    if let Some(step) = update.pipeline_step {
        parts.push(format!("step {}", step));
    }
    if let Some(iteration) = update.current_iteration {
        parts.push(format!("iteration {}", iteration));
    }
    println!("  [{}] {}", run_id.dimmed(), parts.join(", "));
}

fn print_notice(notice: &Notice) {
    match notice {
        Notice::Info { message } => println!("{} {}", "ℹ".blue(), message),
        Notice::Warning { message } => println!("{} {}", "⚠".yellow(), message.yellow()),
        Notice::Error(report) => {
            println!("{} {}", "✗".red(), report.message.red());
            if let Some(input) = &report.input {
                println!("    {} {}", "Input:".dimmed(), input);
            }
        }
    }
}

pub fn colorize_status(status: RunStatus) -> ColoredString {
    let label = status.to_string();
    match status {
        RunStatus::Complete => label.green(),
        RunStatus::Error => label.red(),
        RunStatus::Stopped | RunStatus::Suspended => label.yellow(),
        RunStatus::Running | RunStatus::DownloadingImages => label.cyan(),
        RunStatus::Queued => label.dimmed(),
    }
}

/// One-run summary used by listings
pub fn print_run_summary(run: &Run) {
    println!("  {} Run {}", "▸".cyan(), run.id.dimmed());
    println!("    Pipeline:   {}", run.pipeline_snapshot().name);
    println!("    Consortium: {}", run.consortium_id.dimmed());
    println!("    Status:     {}", colorize_status(run.status));
    println!(
        "    Started:    {}",
        run.start_date
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
            .dimmed()
    );
    if let Some(end) = run.end_date {
        println!("    Ended:      {}", end.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(error) = &run.error {
        println!("    Error:      {}", error.message.red());
    }
    println!();
}
