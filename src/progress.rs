//! Progress accounting and narration. Keeps the teacher's `Progress`
//! accumulator (new/reused file and byte counts, `Display` impl) and adds
//! the per-stage completed/total/throughput/ETA line spec.md §7 calls for.

use std::{
    fmt::Display,
    ops::{Add, AddAssign},
    time::{Duration, Instant},
};

use crate::types::Stage;

/// How much data was newly fetched vs. re-used (already present and valid
/// on disk) during a stage.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub new: usize,
    pub new_bytes: usize,
    pub reused: usize,
}

impl Progress {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn record_fetched(&mut self, bytes: usize) {
        self.new += 1;
        self.new_bytes += bytes;
    }

    pub fn record_reused(&mut self) {
        self.reused += 1;
    }

    pub fn file_count(&self) -> usize {
        self.new + self.reused
    }
}

impl Add for Progress {
    type Output = Progress;

    fn add(self, rhs: Self) -> Self::Output {
        Progress {
            new: self.new + rhs.new,
            new_bytes: self.new_bytes + rhs.new_bytes,
            reused: self.reused + rhs.reused,
        }
    }
}

impl AddAssign for Progress {
    fn add_assign(&mut self, rhs: Self) {
        self.new += rhs.new;
        self.new_bytes += rhs.new_bytes;
        self.reused += rhs.reused;
    }
}

impl Display for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let total = self.new + self.reused;
        let percent = if total == 0 {
            100f64
        } else {
            self.reused as f64 * 100f64 / total as f64
        };

        write!(
            f,
            "{} new files ({}b), re-used {} existing files ({:.2}% re-used)",
            self.new, self.new_bytes, self.reused, percent
        )
    }
}

/// Tracks a single stage's progress against a known total, for the
/// completed/total/throughput/ETA narration line.
pub struct StageProgress {
    stage: Stage,
    total: usize,
    completed: usize,
    bytes: usize,
    started: Instant,
}

impl StageProgress {
    pub fn new(stage: Stage, total: usize) -> Self {
        StageProgress {
            stage,
            total,
            completed: 0,
            bytes: 0,
            started: Instant::now(),
        }
    }

    pub fn advance(&mut self, bytes: usize) {
        self.completed += 1;
        self.bytes += bytes;
    }

    fn throughput_bytes_per_sec(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            0.0
        } else {
            self.bytes as f64 / elapsed
        }
    }

    fn eta(&self) -> Option<Duration> {
        let throughput = self.throughput_bytes_per_sec();
        if self.completed == 0 || self.completed >= self.total || throughput <= 0.0 {
            return None;
        }
        let remaining = self.total - self.completed;
        let avg_bytes_per_item = self.bytes as f64 / self.completed as f64;
        Some(Duration::from_secs_f64(
            remaining as f64 * avg_bytes_per_item / throughput,
        ))
    }

    pub fn line(&self) -> String {
        match self.eta() {
            Some(eta) => format!(
                "[{}] {}/{} files, {:.1} KiB/s, ETA {}s",
                self.stage,
                self.completed,
                self.total,
                self.throughput_bytes_per_sec() / 1024.0,
                eta.as_secs()
            ),
            None => format!("[{}] {}/{} files", self.stage, self.completed, self.total),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_shows_reuse_percentage() {
        let mut progress = Progress::new();
        progress.record_fetched(100);
        progress.record_reused();
        progress.record_reused();
        assert_eq!(progress.file_count(), 3);
        assert!(progress.to_string().contains("66.67% re-used"));
    }

    #[test]
    fn stage_progress_line_without_eta_when_nothing_advanced() {
        let progress = StageProgress::new(Stage::Index, 10);
        assert_eq!(progress.line(), "[Index] 0/10 files");
    }
}
