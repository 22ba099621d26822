//! Per-call transfer options.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::core::progress::DEFAULT_PROGRESS_INTERVAL;
use crate::core::retry::RetryConfig;

/// 4 MiB read/write chunk.
pub const DEFAULT_BUFFER_SIZE: usize = 4 * 1024 * 1024;

pub const DEFAULT_MAX_CONCURRENCY: usize = 3;
pub const MIN_CONCURRENCY: usize = 1;
pub const MAX_CONCURRENCY: usize = 10;

/// What to do when the destination path already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnConflict {
    /// Fail validation without touching the existing file
    #[default]
    Error,
    /// Atomically replace the existing file
    Overwrite,
    /// Leave the existing file and report the transfer as skipped
    Skip,
}

/// Options for a single `transfer_file` or `transfer_files` call.
///
/// Immutable for the duration of the call.
#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub buffer_size: usize,
    pub verify_checksum: bool,
    pub on_conflict: OnConflict,
    /// Record failed files and keep going instead of aborting the batch
    pub continue_on_error: bool,
    /// Copy POSIX mode bits from the source (no-op on other platforms)
    pub preserve_permissions: bool,
    /// fsync the temp file before it is renamed into place
    pub fsync: bool,
    /// Batch concurrency limit, clamped to 1..=10
    pub max_concurrency: usize,
    pub retry: RetryConfig,
    /// Minimum spacing between throttled progress events
    pub progress_interval: Duration,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            verify_checksum: true,
            on_conflict: OnConflict::Error,
            continue_on_error: true,
            preserve_permissions: true,
            fsync: true,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            retry: RetryConfig::default(),
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

impl TransferOptions {
    pub fn concurrency_limit(&self) -> usize {
        self.max_concurrency.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY)
    }

    pub(crate) fn chunk_size(&self) -> usize {
        self.buffer_size.max(1)
    }
}
