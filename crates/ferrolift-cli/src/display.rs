//! Result rendering for the terminal and for JSON consumers

use console::style;
use ferrolift_engine::Statistics;
use ferrolift_types::{ParentTask, TaskStatus, TopTask};
use serde_json::{json, Value};
use std::time::Duration;

/// Print a human-readable summary of a finished transfer
pub fn print_summary(top: &TopTask, parents: &[ParentTask], stats: &Statistics) {
    println!();
    println!("{}", style("Transfer Summary:").bold().underlined());
    println!("  Transfer: {}", style(top.id).cyan());
    println!("  Status: {}", styled_status(top.status));
    if let Some(error) = &top.error {
        println!("  Error: {}", style(error).red());
    }

    for parent in parents {
        let marker = if parent.optional { " (optional)" } else { "" };
        println!(
            "  {} {} -> {}{}",
            styled_status(parent.status),
            parent.source,
            parent.destination,
            marker
        );
        println!(
            "      {} files, {}",
            parent.child_count,
            format_bytes(parent.bytes_transferred)
        );
        if let Some(error) = &parent.error {
            println!("      {}", style(error).yellow());
        }
    }

    println!(
        "  Files: {} copied, {} failed, {} cancelled",
        style(stats.children_completed).green(),
        if stats.children_failed > 0 {
            style(stats.children_failed).red()
        } else {
            style(stats.children_failed).green()
        },
        style(stats.children_cancelled).yellow()
    );
    println!("  Retries: {}", style(stats.child_retries).yellow());
    println!(
        "  Bytes copied: {}",
        style(format_bytes(stats.bytes_transferred)).green()
    );
    println!("  Duration: {}", style(format_duration(stats.uptime)).blue());
    println!(
        "  Transfer rate: {}",
        style(format!("{}/s", format_bytes(stats.throughput() as u64))).blue()
    );
}

/// Machine-readable summary of a finished transfer
pub fn summary_json(top: &TopTask, parents: &[ParentTask], stats: &Statistics) -> Value {
    json!({
        "transfer": top,
        "parents": parents,
        "statistics": {
            "children_completed": stats.children_completed,
            "children_failed": stats.children_failed,
            "children_cancelled": stats.children_cancelled,
            "child_retries": stats.child_retries,
            "bytes_transferred": stats.bytes_transferred,
            "duration_ms": stats.uptime.as_millis() as u64,
            "success_rate": stats.success_rate(),
        },
    })
}

fn styled_status(status: TaskStatus) -> console::StyledObject<&'static str> {
    let label = status.as_str();
    match status {
        TaskStatus::Completed => style(label).green().bold(),
        TaskStatus::Failed => style(label).red().bold(),
        TaskStatus::Cancelled => style(label).yellow().bold(),
        _ => style(label).cyan(),
    }
}

/// Format bytes in human-readable format
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// Format a duration as seconds, minutes or hours
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{:.2}s", duration.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
