use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::error::{TransferError, TransferErrorKind};
use super::progress::{BatchProgress, TransferProgress};

/// Terminal outcome of one file transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferResult {
    pub success: bool,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub bytes_transferred: u64,
    pub checksum_verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_checksum: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest_checksum: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<TransferErrorKind>,
    pub skipped: bool,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl TransferResult {
    pub fn skipped(source: PathBuf, destination: PathBuf, duration: Duration) -> Self {
        Self {
            success: true,
            source,
            destination,
            bytes_transferred: 0,
            checksum_verified: false,
            source_checksum: None,
            dest_checksum: None,
            error: None,
            error_kind: None,
            skipped: true,
            duration,
        }
    }

    pub fn failed(
        source: PathBuf,
        destination: PathBuf,
        error: &TransferError,
        duration: Duration,
    ) -> Self {
        Self {
            success: false,
            source,
            destination,
            bytes_transferred: 0,
            checksum_verified: false,
            source_checksum: None,
            dest_checksum: None,
            error: Some(error.message.clone()),
            error_kind: Some(error.kind),
            skipped: false,
            duration,
        }
    }
}

/// Events emitted while transfers run.
///
/// `FileProgress` and `BatchProgress` are throttled; a file's final update
/// and the batch's final update are always delivered.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    FileProgress {
        index: usize,
        source: PathBuf,
        progress: TransferProgress,
    },
    BatchProgress(BatchProgress),
    ChecksumProgress {
        path: PathBuf,
        progress: TransferProgress,
    },
    /// Sent before sleeping ahead of retry `attempt`
    Retrying {
        index: usize,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    FileComplete {
        index: usize,
        result: TransferResult,
    },
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
