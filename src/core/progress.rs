//! Progress values, throttling and batch aggregation.
//!
//! Progress is ephemeral: it is recomputed on every update and only ever
//! delivered to the caller as [`TransferEvent`](crate::core::TransferEvent)s.
//! Nothing here is persisted.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Default minimum spacing between progress events.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Progress snapshot for a single file or checksum pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransferProgress {
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    /// 0.0 - 100.0
    pub percentage: f64,
    /// Bytes per second since the start of the current attempt
    pub speed: f64,
}

impl TransferProgress {
    pub fn new(bytes_transferred: u64, total_bytes: u64, elapsed: Duration) -> Self {
        Self {
            bytes_transferred,
            total_bytes,
            percentage: percentage(bytes_transferred, total_bytes),
            speed: speed(bytes_transferred, elapsed),
        }
    }
}

/// Aggregate progress across a batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub percentage: f64,
    pub speed: f64,
    pub files_completed: usize,
    pub files_total: usize,
}

fn percentage(bytes: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    ((bytes as f64 / total as f64) * 100.0).min(100.0)
}

fn speed(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 { bytes as f64 / secs } else { 0.0 }
}

/// Rate limiter for progress events.
///
/// Thread-safe; when several tasks race for the same slot only one wins.
pub struct ProgressThrottle {
    interval_ms: u64,
    /// Last emit time in ms since `start`, or NEVER_EMITTED
    last_emit_ms: AtomicU64,
    start: Instant,
}

const NEVER_EMITTED: u64 = u64::MAX;

impl Default for ProgressThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRESS_INTERVAL)
    }
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            last_emit_ms: AtomicU64::new(NEVER_EMITTED),
            start: Instant::now(),
        }
    }

    /// Returns true if enough time has passed since the last emitted event.
    pub fn should_emit(&self) -> bool {
        let now_ms = self.start.elapsed().as_millis() as u64;
        let last = self.last_emit_ms.load(Ordering::Relaxed);

        let should = last == NEVER_EMITTED || now_ms.saturating_sub(last) >= self.interval_ms;

        if should {
            self.last_emit_ms
                .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        } else {
            false
        }
    }

    /// Mark an event as emitted outside of `should_emit`, e.g. a forced final update.
    pub fn mark_emitted(&self) {
        let now_ms = self.start.elapsed().as_millis() as u64;
        self.last_emit_ms.store(now_ms, Ordering::Relaxed);
    }
}

/// Folds per-file progress into a batch-wide, monotonically non-decreasing total.
///
/// The denominator is fixed up front from the pre-fetched source sizes so it
/// does not depend on completion order.
pub(crate) struct BatchAggregator {
    total_bytes: u64,
    files_total: usize,
    files_completed: usize,
    completed_bytes: u64,
    /// High-water byte count per in-flight file; retries reset the file's own
    /// counter but never lower this
    active: HashMap<usize, u64>,
    last_reported: u64,
    started: Instant,
}

impl BatchAggregator {
    pub(crate) fn new(total_bytes: u64, files_total: usize) -> Self {
        Self {
            total_bytes,
            files_total,
            files_completed: 0,
            completed_bytes: 0,
            active: HashMap::new(),
            last_reported: 0,
            started: Instant::now(),
        }
    }

    pub(crate) fn update(&mut self, index: usize, bytes: u64) -> BatchProgress {
        let entry = self.active.entry(index).or_insert(0);
        *entry = (*entry).max(bytes);
        self.snapshot()
    }

    /// Settle a file. Successful files count at least their expected size so
    /// the batch can reach 100%; failed files keep only what was reported.
    pub(crate) fn complete(&mut self, index: usize, expected_bytes: u64, success: bool) -> BatchProgress {
        let reported = self.active.remove(&index).unwrap_or(0);
        self.completed_bytes += if success {
            reported.max(expected_bytes)
        } else {
            reported
        };
        self.files_completed += 1;
        self.snapshot()
    }

    fn snapshot(&mut self) -> BatchProgress {
        let current = self.completed_bytes + self.active.values().sum::<u64>();
        let bytes = current.max(self.last_reported);
        self.last_reported = bytes;
        let total = self.total_bytes.max(bytes);

        BatchProgress {
            bytes_transferred: bytes,
            total_bytes: total,
            percentage: percentage(bytes, total),
            speed: speed(bytes, self.started.elapsed()),
            files_completed: self.files_completed,
            files_total: self.files_total,
        }
    }
}
