//! Transfer error taxonomy and OS error classification.
//!
//! Every failure surfaced by the engine is a [`TransferError`] carrying a
//! [`TransferErrorKind`] and a retryable flag. The flag is fixed by
//! classification, never by the caller, so the retry layer and any UI on top
//! of it can decide what to do without knowing engine internals.
//!
//! | OS code(s) | Kind | Retryable |
//! |---|---|---|
//! | `EACCES`, `EPERM` | `PermissionDenied` | no |
//! | `ENOSPC` | `InsufficientSpace` | no |
//! | `ENOENT`, `EIO`, `EROFS`, `ENXIO`, `ENODEV`, `ENOTCONN`, `ESHUTDOWN` | `DriveDisconnected` | yes |
//! | `ETIMEDOUT`, `ECONNRESET`, `EHOSTUNREACH` | `NetworkError` | yes |
//! | `EBUSY`, `EAGAIN` | `Unknown` | yes |
//! | anything else | `Unknown` | no |

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::Path;
use thiserror::Error;

/// Closed set of failure categories reported for a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferErrorKind {
    PermissionDenied,
    InsufficientSpace,
    DriveDisconnected,
    NetworkError,
    ChecksumMismatch,
    SourceNotFound,
    ValidationFailed,
    Cancelled,
    Unknown,
}

impl TransferErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::InsufficientSpace => "INSUFFICIENT_SPACE",
            Self::DriveDisconnected => "DRIVE_DISCONNECTED",
            Self::NetworkError => "NETWORK_ERROR",
            Self::ChecksumMismatch => "CHECKSUM_MISMATCH",
            Self::SourceNotFound => "SOURCE_NOT_FOUND",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for TransferErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified transfer failure.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct TransferError {
    pub kind: TransferErrorKind,
    pub message: String,
    pub retryable: bool,
    #[source]
    pub source: Option<io::Error>,
}

impl TransferError {
    pub fn new(kind: TransferErrorKind, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable,
            source: None,
        }
    }

    /// Classify an OS-level error, prefixing the message with what was being done.
    pub fn from_io(context: &str, error: io::Error) -> Self {
        let (kind, retryable) = classify_io_error(&error);
        Self {
            kind,
            message: format!("{}: {}", context, error),
            retryable,
            source: Some(error),
        }
    }

    pub fn source_not_found(path: &Path) -> Self {
        Self::new(
            TransferErrorKind::SourceNotFound,
            format!("Source file not found: {}", path.display()),
            false,
        )
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(TransferErrorKind::ValidationFailed, message, false)
    }

    /// Retryable: the next attempt re-copies from scratch.
    pub fn checksum_mismatch(source_checksum: &str, dest_checksum: &str) -> Self {
        Self::new(
            TransferErrorKind::ChecksumMismatch,
            format!(
                "Checksum mismatch: source {} != destination {}",
                source_checksum, dest_checksum
            ),
            true,
        )
    }

    pub fn insufficient_space(message: impl Into<String>) -> Self {
        Self::new(TransferErrorKind::InsufficientSpace, message, false)
    }

    pub fn cancelled() -> Self {
        Self::new(TransferErrorKind::Cancelled, "Transfer cancelled", false)
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == TransferErrorKind::Cancelled
    }
}

/// Map an OS error to its transfer error kind and retryability.
///
/// Raw OS codes win when present; otherwise the portable [`io::ErrorKind`]
/// is used so synthetic errors classify the same way.
pub fn classify_io_error(error: &io::Error) -> (TransferErrorKind, bool) {
    #[cfg(unix)]
    {
        if let Some(code) = error.raw_os_error() {
            return classify_os_code(code);
        }
    }

    match error.kind() {
        io::ErrorKind::PermissionDenied => (TransferErrorKind::PermissionDenied, false),
        io::ErrorKind::StorageFull => (TransferErrorKind::InsufficientSpace, false),
        io::ErrorKind::NotFound
        | io::ErrorKind::NotConnected
        | io::ErrorKind::ReadOnlyFilesystem => (TransferErrorKind::DriveDisconnected, true),
        io::ErrorKind::TimedOut
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::HostUnreachable => (TransferErrorKind::NetworkError, true),
        io::ErrorKind::ResourceBusy | io::ErrorKind::WouldBlock => {
            (TransferErrorKind::Unknown, true)
        }
        _ => (TransferErrorKind::Unknown, false),
    }
}

/// Classify a raw errno value.
#[cfg(unix)]
pub fn classify_os_code(code: i32) -> (TransferErrorKind, bool) {
    match code {
        libc::EACCES | libc::EPERM => (TransferErrorKind::PermissionDenied, false),
        libc::ENOSPC => (TransferErrorKind::InsufficientSpace, false),
        libc::ENOENT
        | libc::EIO
        | libc::EROFS
        | libc::ENXIO
        | libc::ENODEV
        | libc::ENOTCONN
        | libc::ESHUTDOWN => (TransferErrorKind::DriveDisconnected, true),
        libc::ETIMEDOUT | libc::ECONNRESET | libc::EHOSTUNREACH => {
            (TransferErrorKind::NetworkError, true)
        }
        // Transient, but no dedicated kind
        libc::EBUSY | libc::EAGAIN => (TransferErrorKind::Unknown, true),
        _ => (TransferErrorKind::Unknown, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(code: i32) -> (TransferErrorKind, bool) {
        classify_io_error(&io::Error::from_raw_os_error(code))
    }

    #[test]
    fn test_permission_errors_are_not_retryable() {
        assert_eq!(classify(libc::EACCES), (TransferErrorKind::PermissionDenied, false));
        assert_eq!(classify(libc::EPERM), (TransferErrorKind::PermissionDenied, false));
    }

    #[test]
    fn test_no_space_is_not_retryable() {
        assert_eq!(classify(libc::ENOSPC), (TransferErrorKind::InsufficientSpace, false));
    }

    #[test]
    fn test_device_errors_are_disconnections() {
        for code in [
            libc::ENOENT,
            libc::EIO,
            libc::EROFS,
            libc::ENXIO,
            libc::ENODEV,
            libc::ENOTCONN,
            libc::ESHUTDOWN,
        ] {
            assert_eq!(
                classify(code),
                (TransferErrorKind::DriveDisconnected, true),
                "errno {}",
                code
            );
        }
    }

    #[test]
    fn test_network_errors_are_retryable() {
        for code in [libc::ETIMEDOUT, libc::ECONNRESET, libc::EHOSTUNREACH] {
            assert_eq!(classify(code), (TransferErrorKind::NetworkError, true));
        }
    }

    #[test]
    fn test_busy_is_unknown_but_retryable() {
        assert_eq!(classify(libc::EBUSY), (TransferErrorKind::Unknown, true));
        assert_eq!(classify(libc::EAGAIN), (TransferErrorKind::Unknown, true));
    }

    #[test]
    fn test_other_codes_are_unknown() {
        assert_eq!(classify(libc::EINVAL), (TransferErrorKind::Unknown, false));
    }

    #[test]
    fn test_synthetic_errors_use_error_kind() {
        let error = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert_eq!(
            classify_io_error(&error),
            (TransferErrorKind::DriveDisconnected, true)
        );

        let error = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(
            classify_io_error(&error),
            (TransferErrorKind::PermissionDenied, false)
        );
    }

    #[test]
    fn test_from_io_keeps_source_and_context() {
        let err = TransferError::from_io("Failed to open source", io::Error::from_raw_os_error(libc::EIO));
        assert_eq!(err.kind, TransferErrorKind::DriveDisconnected);
        assert!(err.retryable);
        assert!(err.message.starts_with("Failed to open source: "));
        assert!(err.source.is_some());
    }

    #[test]
    fn test_dedicated_constructors() {
        let err = TransferError::checksum_mismatch("aa", "bb");
        assert_eq!(err.kind, TransferErrorKind::ChecksumMismatch);
        assert!(err.retryable);

        let err = TransferError::validation("bad");
        assert_eq!(err.kind, TransferErrorKind::ValidationFailed);
        assert!(!err.retryable);

        let err = TransferError::source_not_found(Path::new("/missing"));
        assert_eq!(err.kind, TransferErrorKind::SourceNotFound);
        assert!(!err.retryable);

        let err = TransferError::insufficient_space("Destination volume is full");
        assert_eq!(err.kind, TransferErrorKind::InsufficientSpace);
        assert!(!err.retryable);

        assert!(TransferError::cancelled().is_cancelled());
    }

    #[test]
    fn test_kind_serializes_screaming_snake_case() {
        let json = serde_json::to_string(&TransferErrorKind::DriveDisconnected).unwrap();
        assert_eq!(json, "\"DRIVE_DISCONNECTED\"");
        assert_eq!(TransferErrorKind::ChecksumMismatch.to_string(), "CHECKSUM_MISMATCH");
    }
}
