//! Progress tracking and the event contract for batch runs

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam::channel::Sender;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::TaskError;
use crate::processing::metadata::IngestedFile;
use crate::processing::{reduction_percentage, OptimizationResult};

/// Event stream of an optimization batch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BatchEvent {
    Started {
        total: usize,
    },
    TaskStarted {
        path: PathBuf,
    },
    TaskCompleted {
        result: OptimizationResult,
        current: usize,
        total: usize,
    },
    TaskFailed {
        error: TaskError,
        current: usize,
        total: usize,
    },
    Finished(BatchSummary),
}

/// Event stream of an ingestion run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum IngestEvent {
    Scanned {
        file: Box<IngestedFile>,
        current: usize,
        total: usize,
    },
    Rejected {
        path: PathBuf,
        error: TaskError,
        current: usize,
        total: usize,
    },
}

/// Point-in-time view of a running batch
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub completed: usize,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl BatchProgress {
    pub fn is_complete(&self) -> bool {
        self.completed >= self.total
    }

    pub fn completion_percentage(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.completed as f64 / self.total as f64 * 100.0
    }

    /// Get human-readable completion status
    pub fn status_text(&self) -> String {
        if self.is_complete() {
            "Completed".to_string()
        } else {
            format!("{}/{} files processed", self.completed, self.total)
        }
    }
}

/// Final record of a batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total_files: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Tasks that never started because the batch was cancelled
    pub cancelled: usize,
    pub total_original_kb: f64,
    pub total_optimized_kb: f64,
    /// Computed over the totals, not averaged per file
    pub average_reduction_percentage: f64,
    pub elapsed: Duration,
}

impl BatchSummary {
    pub fn files_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            (self.succeeded + self.failed) as f64 / secs
        } else {
            0.0
        }
    }

    /// Get processing speed as human-readable string
    pub fn speed_text(&self) -> String {
        let rate = self.files_per_second();
        if rate >= 1.0 {
            format!("{rate:.1} files/sec")
        } else if rate > 0.0 {
            format!("{:.1} sec/file", 1.0 / rate)
        } else {
            "Unknown".to_string()
        }
    }
}

#[derive(Default)]
struct SizeTotals {
    original_kb: f64,
    optimized_kb: f64,
}

/// Thread-safe reporter shared by all workers of one batch.
///
/// Every completion sends its event before the completed counter moves, so a
/// snapshot never counts a task whose event has not been sent yet.
pub struct ProgressReporter {
    total: usize,
    sender: Sender<BatchEvent>,
    start_time: Instant,

    sequence: AtomicUsize,
    completed: AtomicUsize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    sizes: Mutex<SizeTotals>,
}

impl ProgressReporter {
    pub fn new(total: usize, sender: Sender<BatchEvent>) -> Self {
        Self {
            total,
            sender,
            start_time: Instant::now(),
            sequence: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            succeeded: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            sizes: Mutex::new(SizeTotals::default()),
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn start(&self) {
        self.send(BatchEvent::Started { total: self.total });
        info!("Started batch of {} files", self.total);
    }

    pub fn task_started(&self, path: PathBuf) {
        debug!("Started processing file: {:?}", path);
        self.send(BatchEvent::TaskStarted { path });
    }

    /// Record the outcome of one task
    pub fn on_task_complete(&self, outcome: std::result::Result<OptimizationResult, TaskError>) {
        let current = self.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        let total = self.total;

        let event = match outcome {
            Ok(result) => {
                {
                    let mut sizes = self.sizes.lock();
                    sizes.original_kb += result.original_size_kb;
                    sizes.optimized_kb += result.optimized_size_kb;
                }
                self.succeeded.fetch_add(1, Ordering::Release);
                debug!("Completed {:?} ({}/{})", result.original_path, current, total);
                BatchEvent::TaskCompleted { result, current, total }
            }
            Err(error) => {
                self.failed.fetch_add(1, Ordering::Release);
                debug!("Failed {:?} ({}/{}): {}", error.path, current, total, error.message);
                BatchEvent::TaskFailed { error, current, total }
            }
        };

        self.send(event);
        self.completed.fetch_add(1, Ordering::Release);
    }

    pub fn snapshot_progress(&self) -> BatchProgress {
        BatchProgress {
            completed: self.completed.load(Ordering::Acquire),
            total: self.total,
            succeeded: self.succeeded.load(Ordering::Acquire),
            failed: self.failed.load(Ordering::Acquire),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Build the summary; tasks that never reported count as cancelled
    pub fn summary(&self) -> BatchSummary {
        let progress = self.snapshot_progress();
        let sizes = self.sizes.lock();

        let original_bytes = (sizes.original_kb * 1024.0).round() as u64;
        let optimized_bytes = (sizes.optimized_kb * 1024.0).round() as u64;

        BatchSummary {
            total_files: self.total,
            succeeded: progress.succeeded,
            failed: progress.failed,
            cancelled: self.total.saturating_sub(progress.completed),
            total_original_kb: sizes.original_kb,
            total_optimized_kb: sizes.optimized_kb,
            average_reduction_percentage: reduction_percentage(original_bytes, optimized_bytes),
            elapsed: self.elapsed(),
        }
    }

    /// Emit the final summary event and return it
    pub fn finish(&self) -> BatchSummary {
        let summary = self.summary();
        self.send(BatchEvent::Finished(summary.clone()));

        info!(
            "Batch completed: {}/{} succeeded, {} failed, {} cancelled in {:.2}s",
            summary.succeeded,
            summary.total_files,
            summary.failed,
            summary.cancelled,
            summary.elapsed.as_secs_f64()
        );
        summary
    }

    fn send(&self, event: BatchEvent) {
        // A dropped receiver means nobody is listening; the counters still move
        let _ = self.sender.send(event);
    }
}
