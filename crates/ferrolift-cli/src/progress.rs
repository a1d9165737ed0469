//! Transfer progress bar

use ferrolift_types::{ParentTask, TaskStatus, TopTask};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Byte-level progress over every parent of a transfer
pub struct TransferProgress {
    progress_bar: Option<ProgressBar>,
}

impl TransferProgress {
    /// Create a progress display; nothing is drawn in quiet mode
    pub fn new(quiet: bool) -> Self {
        let progress_bar = if quiet {
            None
        } else {
            let pb = ProgressBar::new_spinner();
            pb.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner:.green} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            pb.set_message("Staging...");
            pb.enable_steady_tick(Duration::from_millis(100));
            Some(pb)
        };
        Self { progress_bar }
    }

    /// Refresh from the latest task records
    pub fn update(&self, top: &TopTask, parents: &[ParentTask]) {
        let Some(pb) = &self.progress_bar else {
            return;
        };

        let (staged, total) = staged_total(parents);
        let transferred: u64 = parents.iter().map(|p| p.bytes_transferred).sum();
        if staged == parents.len() && total > 0 {
            if pb.length().is_none() {
                pb.set_style(
                    ProgressStyle::default_bar()
                        .template(
                            "{spinner:.green} {msg} [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
                        )
                        .unwrap_or_else(|_| ProgressStyle::default_bar())
                        .progress_chars("█▉▊▋▌▍▎▏  "),
                );
                pb.set_length(total);
            }
            pb.set_position(transferred.min(total));
        }

        let files: usize = parents.iter().map(|p| p.child_count).sum();
        pb.set_message(format!("{} ({} files)", top.status, files));
    }

    /// Show that a cancel was requested
    pub fn cancelling(&self) {
        if let Some(pb) = &self.progress_bar {
            pb.set_message("Cancelling...");
        }
    }

    /// Stop drawing
    pub fn finish(&self, top: &TopTask) {
        if let Some(pb) = &self.progress_bar {
            match top.status {
                TaskStatus::Completed => pb.finish_with_message("Transfer completed"),
                status => pb.abandon_with_message(format!("Transfer {}", status)),
            }
        }
    }
}

/// Parents with a known size, and the sum of those sizes
fn staged_total(parents: &[ParentTask]) -> (usize, u64) {
    parents
        .iter()
        .filter_map(|p| p.total_bytes)
        .fold((0, 0), |(count, sum), bytes| (count + 1, sum + bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staged_total_counts_known_sizes() {
        let top = TopTask::new("tenant-a", "alice");
        let mut first = ParentTask::new(&top, "file:///a", "file:///b", false);
        let second = ParentTask::new(&top, "file:///c", "file:///d", false);
        first.total_bytes = Some(20_480);

        assert_eq!(staged_total(&[first.clone(), second]), (1, 20_480));
        assert_eq!(staged_total(&[first]), (1, 20_480));
    }

    #[test]
    fn test_quiet_mode_draws_nothing() {
        let progress = TransferProgress::new(true);
        let top = TopTask::new("tenant-a", "alice");
        progress.update(&top, &[]);
        progress.finish(&top);
        assert!(progress.progress_bar.is_none());
    }
}
