//! Command execution for the `autorepack` binary.
//!
//! Turns parsed [`Args`](crate::cli::Args) into an orchestrator run and renders
//! the result. The library itself never prints.

use crate::cli::{Args, Commands};
use crate::orchestrator::{PlannedRun, RepackOrchestrator, SummaryReport};
use crate::plan::ActionKind;
use crate::progress::{ProgressCallback, RepackEvent};
use crate::writer::RepackStatus;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

/// Runs the parsed command. `Ok(false)` means the run completed but at least
/// one action failed.
pub fn run_cli_app(args: Args) -> Result<bool, Box<dyn std::error::Error>> {
    match args.command {
        Commands::Run {
            roots,
            options,
            json,
            progress,
        } => {
            let config = options.to_config()?;
            let mut orchestrator = RepackOrchestrator::new(config);
            if progress {
                orchestrator = orchestrator.with_progress(create_cli_progress_callback());
            }
            let report = orchestrator.run(&roots)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_summary(&report);
            }
            Ok(!report.has_failures())
        }
        Commands::Plan {
            roots,
            options,
            json,
        } => {
            let config = options.to_config()?;
            let planned = RepackOrchestrator::new(config).plan_only(&roots)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&planned)?);
            } else {
                print_plans(&planned);
            }
            Ok(true)
        }
    }
}

fn describe(kind: &ActionKind) -> String {
    match kind {
        ActionKind::CompressAsIs => "compress".to_string(),
        ActionKind::Flatten => "flatten".to_string(),
        ActionKind::Selective => "selective".to_string(),
        ActionKind::Merge { sibling } => format!("merge with {}", sibling.display()),
        ActionKind::Skip(reason) => format!("skip ({reason:?})"),
    }
}

fn print_plans(planned: &PlannedRun) {
    for plan in &planned.plans {
        println!("{}", plan.root.display());
        for action in &plan.actions {
            let target = action
                .destination
                .as_ref()
                .map(|d| format!(" -> {}", d.display()))
                .unwrap_or_default();
            println!(
                "  [{}] {}: {} file(s){}",
                action.id,
                describe(&action.kind),
                action.sources.len(),
                target
            );
        }
        for dir in &plan.cleanup {
            println!("  remove empty folder {}", dir.display());
        }
    }
    for issue in &planned.classification_errors {
        println!("  unreadable: {issue}");
    }
    println!(
        "{} plan(s), {} action(s)",
        planned.plans.len(),
        planned.action_count()
    );
}

fn print_summary(report: &SummaryReport) {
    for result in &report.results {
        if result.status == RepackStatus::Failed {
            println!(
                "FAILED {}: {}",
                result.root.display(),
                result.error.as_deref().unwrap_or("unknown error")
            );
        }
    }
    for issue in &report.classification_errors {
        println!("UNREADABLE {issue}");
    }
    println!(
        "{} succeeded, {} failed, {} skipped | {:.2} MB in, {:.2} MB out | {:.2}s{}",
        report.succeeded,
        report.failed,
        report.skipped,
        report.bytes_processed as f64 / (1024.0 * 1024.0),
        report.bytes_written as f64 / (1024.0 * 1024.0),
        report.elapsed.as_secs_f64(),
        if report.cancelled { " (cancelled)" } else { "" }
    );
}

// --- utils for CLI progress -------------------------------------------------

fn create_cli_progress_callback() -> Arc<ProgressCallback> {
    let start_time = Instant::now();
    let last_update = Mutex::new(Instant::now());
    let prev_len = Mutex::new(0usize);
    let done = AtomicBool::new(false);

    Arc::new(move |event: RepackEvent| {
        if done.load(Ordering::Relaxed) {
            return;
        }
        let (state, finished) = match event {
            RepackEvent::ActionFinished { progress, .. } => (progress, false),
            RepackEvent::Finished { progress } => (progress, true),
            RepackEvent::PlanReady { .. } | RepackEvent::ActionStarted { .. } => return,
        };

        // Update every 100ms to avoid terminal spam, but always show completion
        let now = Instant::now();
        let should_update = finished || {
            let mut last = last_update.lock().unwrap_or_else(PoisonError::into_inner);
            if now.duration_since(*last).as_millis() >= 100 {
                *last = now;
                true
            } else {
                false
            }
        };
        if !should_update {
            return;
        }

        let term_width = term_size::dimensions().map(|(w, _)| w).unwrap_or(80);

        let build_status_line = |bw: usize| -> String {
            let filled = (((state.progress_percent / 100.0) * bw as f32) as usize).min(bw);
            let bar = format!("[{}{}]", "█".repeat(filled), "░".repeat(bw - filled));
            format!(
                "[REPACK] {} {:.1}% | {}/{} actions | {} failed | {:.1} MB/s | {:.1}s",
                bar,
                state.progress_percent,
                state.completed_actions,
                state.total_actions,
                state.failed_actions,
                state.speed_mbps,
                start_time.elapsed().as_secs_f32()
            )
        };

        // Shrink the bar until the line fits the terminal.
        let mut bar_len: usize = 40;
        let status_line = loop {
            let line = build_status_line(bar_len);
            if line.chars().count() <= term_width || bar_len <= 10 {
                break line;
            }
            bar_len -= 4;
        };

        // Print to stderr to avoid interfering with stdout
        let mut line_to_print = status_line;
        {
            let mut prev = prev_len.lock().unwrap_or_else(PoisonError::into_inner);
            let len = line_to_print.chars().count();
            if *prev > len {
                line_to_print.push_str(&" ".repeat(*prev - len));
            }
            *prev = len;
        }
        eprint!("\r\x1B[2K{}", line_to_print);
        io::stderr().flush().ok();

        if finished {
            eprintln!();
            done.store(true, Ordering::Relaxed);
        }
    })
}
