//! Byte-level progress tracking for shard pipelines.
//!
//! Tracks plaintext bytes against an optional size estimate (`zfs get used`
//! is only an approximation of the send stream), with transfer speed and a
//! completion estimate. A resumed run starts from the already stored offset
//! but measures speed only over bytes it moved itself.

use std::time::{Duration, Instant};

/// Progress of a backup or restore run.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    /// Estimated total plaintext bytes, if known
    pub total_bytes: Option<u64>,

    /// Plaintext offset reached so far, including resumed bytes
    pub transferred_bytes: u64,

    /// Current transfer speed in bytes/second
    pub bytes_per_second: u64,

    /// Estimated time remaining (seconds), if the total is known
    pub eta_seconds: Option<u64>,

    /// Percentage complete (0-100), capped at 100 when the estimate is low
    pub percent_complete: Option<f64>,

    /// Shards finished in this run
    pub shards_done: u64,

    /// Shard currently being processed
    pub current_shard: Option<u64>,
}

impl TransferProgress {
    pub fn new(total_bytes: Option<u64>, resumed_from: u64) -> Self {
        let mut progress = Self {
            total_bytes,
            transferred_bytes: 0,
            bytes_per_second: 0,
            eta_seconds: None,
            percent_complete: None,
            shards_done: 0,
            current_shard: None,
        };
        progress.update(resumed_from);
        progress
    }

    pub fn update(&mut self, transferred_bytes: u64) {
        self.transferred_bytes = transferred_bytes;
        self.percent_complete = self.total_bytes.map(|total| {
            if total == 0 {
                100.0
            } else {
                (transferred_bytes as f64 / total as f64 * 100.0).min(100.0)
            }
        });
    }

    pub fn set_current_shard(&mut self, index: u64) {
        self.current_shard = Some(index);
    }

    pub fn finish_shard(&mut self) {
        self.shards_done += 1;
        self.current_shard = None;
    }
}

/// Progress tracker with time-based speed calculation
pub struct ProgressTracker {
    start_time: Instant,
    last_update_time: Instant,
    last_bytes: u64,
    resumed_from: u64,
    progress: TransferProgress,
}

impl ProgressTracker {
    pub fn new(total_bytes: Option<u64>, resumed_from: u64) -> Self {
        let now = Instant::now();
        Self {
            start_time: now,
            last_update_time: now,
            last_bytes: resumed_from,
            resumed_from,
            progress: TransferProgress::new(total_bytes, resumed_from),
        }
    }

    /// Update progress and calculate speed
    pub fn update(&mut self, transferred_bytes: u64) -> &TransferProgress {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update_time).as_secs_f64();

        if elapsed > 0.0 {
            let bytes_diff = transferred_bytes.saturating_sub(self.last_bytes);
            self.progress.bytes_per_second = (bytes_diff as f64 / elapsed) as u64;
        }

        let speed = self.progress.bytes_per_second;
        self.progress.eta_seconds = match self.progress.total_bytes {
            Some(total) if speed > 0 => Some(total.saturating_sub(transferred_bytes) / speed),
            _ => None,
        };

        self.progress.update(transferred_bytes);
        self.last_update_time = now;
        self.last_bytes = transferred_bytes;

        &self.progress
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Average speed over the bytes this run moved itself.
    pub fn average_speed(&self) -> u64 {
        let elapsed = self.elapsed().as_secs_f64();
        let moved = self.progress.transferred_bytes.saturating_sub(self.resumed_from);
        if elapsed > 0.0 {
            (moved as f64 / elapsed) as u64
        } else {
            0
        }
    }

    pub fn progress(&self) -> &TransferProgress {
        &self.progress
    }

    pub fn progress_mut(&mut self) -> &mut TransferProgress {
        &mut self.progress
    }

    /// One-line summary for log output, e.g. `1.00 GB of ~4.00 GB (25.0%), 80.00 MB/s, ETA 38s`.
    pub fn summary(&self) -> String {
        let p = &self.progress;
        let mut line = format_bytes(p.transferred_bytes);
        if let (Some(total), Some(percent)) = (p.total_bytes, p.percent_complete) {
            line.push_str(&format!(" of ~{} ({:.1}%)", format_bytes(total), percent));
        }
        line.push_str(&format!(", {}", format_speed(p.bytes_per_second)));
        if let Some(eta) = p.eta_seconds {
            line.push_str(&format!(", ETA {}", format_duration(eta)));
        }
        line
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed as human-readable string
pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

/// Format duration as human-readable string
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
