pub mod checksum;
pub mod error;
pub mod models;
pub mod options;
pub mod progress;
pub mod retry;
pub mod sweeper;
pub mod transfer_engine;

pub use checksum::{StreamingChecksum, checksum_bytes, checksum_file, checksum_file_with_progress};
pub use error::{TransferError, TransferErrorKind, classify_io_error};
pub use models::{TransferEvent, TransferResult};
pub use options::{OnConflict, TransferOptions};
pub use progress::{BatchProgress, TransferProgress};
pub use retry::{RetryConfig, retry_with_backoff};
pub use sweeper::{DEFAULT_ORPHAN_MAX_AGE, cleanup_orphaned_temp_files, sweep_orphaned_temp_files};
pub use transfer_engine::{TEMP_SUFFIX, TransferEngine, temp_path_for};
