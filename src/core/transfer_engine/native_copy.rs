use std::ffi::OsString;
use std::fs::Metadata;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::TransferEngine;
use super::batch::BatchReporter;
use crate::core::checksum::StreamingChecksum;
use crate::core::error::{TransferError, TransferErrorKind, classify_io_error};
use crate::core::models::{TransferEvent, TransferResult};
use crate::core::options::{OnConflict, TransferOptions};
use crate::core::progress::{ProgressThrottle, TransferProgress};
use crate::core::retry::retry_with_backoff;

/// Appended to the destination path while a file is being written.
///
/// External tooling may rely on this marker to recognise in-progress or
/// interrupted transfers.
pub const TEMP_SUFFIX: &str = ".TBPART";

/// Sibling temp path for `destination`: the full path with `.TBPART` appended.
pub fn temp_path_for(destination: &Path) -> PathBuf {
    let mut path = OsString::from(destination.as_os_str());
    path.push(TEMP_SUFFIX);
    PathBuf::from(path)
}

/// Everything a single file transfer needs, borrowed from the caller.
pub(crate) struct FileContext<'a> {
    pub index: usize,
    pub source: &'a Path,
    pub destination: &'a Path,
    pub options: &'a TransferOptions,
    pub tx: &'a mpsc::Sender<TransferEvent>,
    pub batch: Option<&'a BatchReporter>,
}

/// Terminal state of one file: the result for its slot, plus the error that
/// ended it if it failed.
pub(crate) struct SettledFile {
    pub result: TransferResult,
    pub error: Option<TransferError>,
}

impl SettledFile {
    pub(crate) fn into_result(self) -> Result<TransferResult, TransferError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.result),
        }
    }
}

enum CopyOutcome {
    Copied {
        bytes: u64,
        checksums: Option<(String, String)>,
    },
    Skipped,
}

/// Run one file through validate -> copy to temp -> verify -> finalize,
/// retrying the whole body on retryable errors.
pub(crate) async fn transfer_single(
    engine: &TransferEngine,
    ctx: &FileContext<'_>,
) -> SettledFile {
    let started = Instant::now();
    let temp_path = temp_path_for(ctx.destination);

    let span = info_span!(
        "transfer_file",
        index = ctx.index,
        source = %ctx.source.display(),
        destination = %ctx.destination.display()
    );

    async {
        let outcome = match engine.begin_transfer(temp_path.clone()) {
            Ok(_active) => {
                let max_attempts = ctx.options.retry.max_attempts.max(1);
                retry_with_backoff(
                    &ctx.options.retry,
                    |e: &TransferError| e.retryable && !engine.is_stopping(),
                    |attempt| {
                        let temp_path = &temp_path;
                        async move {
                            let result = copy_attempt(engine, ctx, temp_path, attempt).await;
                            if let Err(e) = &result {
                                if e.retryable && attempt < max_attempts && !engine.is_stopping() {
                                    let _ = ctx
                                        .tx
                                        .send(TransferEvent::Retrying {
                                            index: ctx.index,
                                            attempt: attempt + 1,
                                            delay: ctx.options.retry.delay_for_retry(attempt),
                                            error: e.message.clone(),
                                        })
                                        .await;
                                }
                            }
                            result
                        }
                    },
                )
                .await
            }
            Err(e) => Err(e),
        };

        let duration = started.elapsed();
        let source = ctx.source.to_path_buf();
        let destination = ctx.destination.to_path_buf();

        let settled = match outcome {
            Ok(CopyOutcome::Copied { bytes, checksums }) => {
                info!(
                    bytes,
                    verified = checksums.is_some(),
                    duration_ms = duration.as_millis() as u64,
                    "File transfer complete"
                );
                let (source_checksum, dest_checksum) = match checksums {
                    Some((s, d)) => (Some(s), Some(d)),
                    None => (None, None),
                };
                SettledFile {
                    result: TransferResult {
                        success: true,
                        source,
                        destination,
                        bytes_transferred: bytes,
                        checksum_verified: source_checksum.is_some(),
                        source_checksum,
                        dest_checksum,
                        error: None,
                        error_kind: None,
                        skipped: false,
                        duration,
                    },
                    error: None,
                }
            }
            Ok(CopyOutcome::Skipped) => {
                info!("Destination exists, skipping");
                SettledFile {
                    result: TransferResult::skipped(source, destination, duration),
                    error: None,
                }
            }
            Err(e) => {
                error!(kind = %e.kind, error = %e.message, "File transfer failed");
                SettledFile {
                    result: TransferResult::failed(source, destination, &e, duration),
                    error: Some(e),
                }
            }
        };

        if let Some(batch) = ctx.batch {
            batch.complete(ctx.index, &settled.result).await;
        }
        let _ = ctx
            .tx
            .send(TransferEvent::FileComplete {
                index: ctx.index,
                result: settled.result.clone(),
            })
            .await;

        settled
    }
    .instrument(span)
    .await
}

async fn copy_attempt(
    engine: &TransferEngine,
    ctx: &FileContext<'_>,
    temp_path: &Path,
    attempt: u32,
) -> Result<CopyOutcome, TransferError> {
    debug!(attempt, "Starting copy attempt");

    // Validating
    engine.ensure_accepting()?;

    let source_metadata = match fs::metadata(ctx.source).await {
        Ok(m) => m,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(TransferError::source_not_found(ctx.source));
        }
        Err(e) => return Err(TransferError::from_io("Failed to read source metadata", e)),
    };
    if !source_metadata.is_file() {
        return Err(TransferError::validation(format!(
            "Source is not a regular file: {}",
            ctx.source.display()
        )));
    }

    match fs::symlink_metadata(ctx.destination).await {
        Ok(_) => match ctx.options.on_conflict {
            OnConflict::Error => {
                return Err(TransferError::validation(format!(
                    "Destination already exists: {}",
                    ctx.destination.display()
                )));
            }
            OnConflict::Skip => return Ok(CopyOutcome::Skipped),
            OnConflict::Overwrite => {}
        },
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(TransferError::from_io("Failed to check destination", e)),
    }

    if let Some(parent) = ctx.destination.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| TransferError::from_io("Failed to create destination directory", e))?;
        }
    }

    // Leftovers from a previous attempt or an earlier crash
    remove_temp_file(temp_path).await;

    engine.track_temp(temp_path);
    let result = copy_to_temp_and_finalize(engine, ctx, &source_metadata, temp_path).await;
    if result.is_err() {
        remove_temp_file(temp_path).await;
        engine.untrack_temp(temp_path);
    }
    result
}

async fn copy_to_temp_and_finalize(
    engine: &TransferEngine,
    ctx: &FileContext<'_>,
    source_metadata: &Metadata,
    temp_path: &Path,
) -> Result<CopyOutcome, TransferError> {
    let expected = source_metadata.len();
    let abort = engine.abort_token();
    let started = Instant::now();
    let throttle = ProgressThrottle::new(ctx.options.progress_interval);

    let mut reader = File::open(ctx.source)
        .await
        .map_err(|e| TransferError::from_io("Failed to open source file", e))?;
    let mut writer = File::create(temp_path)
        .await
        .map_err(|e| TransferError::from_io("Failed to create temp file", e))?;

    // Both sides see identical chunk boundaries, so verification costs no extra read pass
    let mut hashers = ctx
        .options
        .verify_checksum
        .then(|| (StreamingChecksum::new(), StreamingChecksum::new()));

    let mut buffer = vec![0u8; ctx.options.chunk_size()];
    let mut bytes_copied: u64 = 0;

    report_progress(ctx, 0, expected, started).await;
    throttle.mark_emitted();

    loop {
        let bytes_read = tokio::select! {
            biased;
            _ = abort.cancelled() => return Err(TransferError::cancelled()),
            read = reader.read(&mut buffer) => {
                read.map_err(|e| TransferError::from_io("Failed to read from source", e))?
            }
        };

        if bytes_read == 0 {
            break;
        }

        bytes_copied += bytes_read as u64;
        if bytes_copied > expected {
            return Err(TransferError::validation(format!(
                "Source grew during transfer: read {} bytes, expected {}",
                bytes_copied, expected
            )));
        }

        let chunk = &buffer[..bytes_read];
        if let Some((source_hasher, dest_hasher)) = hashers.as_mut() {
            source_hasher.update(chunk);
            dest_hasher.update(chunk);
        }

        tokio::select! {
            biased;
            _ = abort.cancelled() => return Err(TransferError::cancelled()),
            written = writer.write_all(chunk) => {
                written.map_err(|e| write_error("Failed to write to temp file", e, ctx.destination))?
            }
        }

        if throttle.should_emit() {
            report_progress(ctx, bytes_copied, expected, started).await;
        }
    }

    if bytes_copied < expected {
        return Err(TransferError::new(
            TransferErrorKind::DriveDisconnected,
            format!(
                "Source ended early: read {} of {} bytes",
                bytes_copied, expected
            ),
            true,
        ));
    }

    writer
        .flush()
        .await
        .map_err(|e| write_error("Failed to flush temp file", e, ctx.destination))?;
    if ctx.options.fsync {
        writer
            .sync_all()
            .await
            .map_err(|e| write_error("Failed to sync temp file", e, ctx.destination))?;
    }
    drop(writer);
    drop(reader);

    // The final update for a file is never throttled
    report_progress(ctx, bytes_copied, expected, started).await;

    // Verifying
    let checksums = match hashers {
        Some((source_hasher, dest_hasher)) => {
            let source_checksum = source_hasher.finalize();
            let dest_checksum = dest_hasher.finalize();
            verify_checksums(&source_checksum, &dest_checksum)?;
            debug!(checksum = %source_checksum, "Checksums match");
            Some((source_checksum, dest_checksum))
        }
        None => None,
    };

    // Finalizing
    if abort.is_cancelled() {
        return Err(TransferError::cancelled());
    }
    if ctx.options.preserve_permissions {
        preserve_permissions(source_metadata, temp_path).await;
    }
    preserve_timestamps(source_metadata, temp_path);

    fs::rename(temp_path, ctx.destination)
        .await
        .map_err(|e| TransferError::from_io("Failed to move temp file into place", e))?;
    engine.untrack_temp(temp_path);

    Ok(CopyOutcome::Copied {
        bytes: bytes_copied,
        checksums,
    })
}

fn verify_checksums(source_checksum: &str, dest_checksum: &str) -> Result<(), TransferError> {
    if source_checksum != dest_checksum {
        warn!(source_checksum, dest_checksum, "Checksum mismatch");
        return Err(TransferError::checksum_mismatch(source_checksum, dest_checksum));
    }
    Ok(())
}

/// Write-side failures; a full volume names the destination it was filling.
fn write_error(context: &str, error: io::Error, destination: &Path) -> TransferError {
    let (kind, _) = classify_io_error(&error);
    if kind != TransferErrorKind::InsufficientSpace {
        return TransferError::from_io(context, error);
    }
    let mut err = TransferError::insufficient_space(format!(
        "No space left on destination volume for {}: {}",
        destination.display(),
        error
    ));
    err.source = Some(error);
    err
}

async fn report_progress(ctx: &FileContext<'_>, bytes: u64, total: u64, started: Instant) {
    let progress = TransferProgress::new(bytes, total, started.elapsed());
    let _ = ctx
        .tx
        .send(TransferEvent::FileProgress {
            index: ctx.index,
            source: ctx.source.to_path_buf(),
            progress,
        })
        .await;
    if let Some(batch) = ctx.batch {
        batch.update(ctx.index, bytes).await;
    }
}

/// Best-effort delete; only failures other than "not found" are logged.
async fn remove_temp_file(temp_path: &Path) {
    match fs::remove_file(temp_path).await {
        Ok(()) => debug!(path = %temp_path.display(), "Removed temp file"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %temp_path.display(), error = %e, "Failed to remove temp file"),
    }
}

#[cfg(unix)]
async fn preserve_permissions(source_metadata: &Metadata, temp_path: &Path) {
    if let Err(e) = fs::set_permissions(temp_path, source_metadata.permissions()).await {
        // Some destination filesystems (exFAT, FAT32) reject mode changes
        debug!(path = %temp_path.display(), error = %e, "Failed to set file permissions");
    }
}

#[cfg(not(unix))]
async fn preserve_permissions(_source_metadata: &Metadata, _temp_path: &Path) {}

/// Preserve access and modification timestamps from source to destination
fn preserve_timestamps(source_metadata: &Metadata, temp_path: &Path) {
    let atime = filetime::FileTime::from_last_access_time(source_metadata);
    let mtime = filetime::FileTime::from_last_modification_time(source_metadata);

    if let Err(e) = filetime::set_file_times(temp_path, atime, mtime) {
        debug!(path = %temp_path.display(), error = %e, "Failed to preserve file timestamps");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::retry::RetryConfig;
    use std::time::Duration;
    use tempfile::tempdir;

    fn test_options() -> TransferOptions {
        TransferOptions {
            buffer_size: 1024,
            retry: RetryConfig {
                max_attempts: 2,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                backoff_multiplier: 2.0,
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_temp_path_appends_suffix() {
        assert_eq!(
            temp_path_for(Path::new("/ingest/A001C003.MOV")),
            PathBuf::from("/ingest/A001C003.MOV.TBPART")
        );
        assert_eq!(temp_path_for(Path::new("noext")), PathBuf::from("noext.TBPART"));
    }

    #[test]
    fn test_verify_checksums_mismatch_is_retryable() {
        let err = verify_checksums("0000000000000001", "0000000000000002").unwrap_err();
        assert_eq!(err.kind, TransferErrorKind::ChecksumMismatch);
        assert!(err.retryable);
        assert!(verify_checksums("abc", "abc").is_ok());
    }

    #[test]
    fn test_full_volume_names_destination() {
        let err = write_error(
            "Failed to write to temp file",
            io::Error::from_raw_os_error(libc::ENOSPC),
            Path::new("/ingest/A001C003.MOV"),
        );
        assert_eq!(err.kind, TransferErrorKind::InsufficientSpace);
        assert!(!err.retryable);
        assert!(err.message.contains("/ingest/A001C003.MOV"));
        assert!(err.source.is_some());

        let err = write_error(
            "Failed to write to temp file",
            io::Error::from_raw_os_error(libc::EIO),
            Path::new("/ingest/A001C003.MOV"),
        );
        assert_eq!(err.kind, TransferErrorKind::DriveDisconnected);
        assert!(err.message.starts_with("Failed to write to temp file: "));
    }

    #[tokio::test]
    async fn test_copy_preserves_content_and_mtime() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("source.bin");
        let dest = temp.path().join("out/nested/dest.bin");
        let content: Vec<u8> = (0..10_000u32).map(|i| (i % 256) as u8).collect();
        std::fs::write(&source, &content).unwrap();
        let mtime = filetime::FileTime::from_unix_time(1_600_000_000, 0);
        filetime::set_file_mtime(&source, mtime).unwrap();

        let engine = TransferEngine::new();
        let (tx, _rx) = mpsc::channel(1024);
        let result = engine
            .transfer_file(&source, &dest, &test_options(), &tx)
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.bytes_transferred, 10_000);
        assert!(result.checksum_verified);
        assert_eq!(result.source_checksum, result.dest_checksum);
        assert_eq!(std::fs::read(&dest).unwrap(), content);
        assert!(!temp_path_for(&dest).exists());

        let dest_meta = std::fs::metadata(&dest).unwrap();
        assert_eq!(filetime::FileTime::from_last_modification_time(&dest_meta), mtime);
        assert_eq!(engine.active_transfers(), 0);
        assert!(engine.tracked_temp_files().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_copy_preserves_mode_bits() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempdir().unwrap();
        let source = temp.path().join("script.sh");
        let dest = temp.path().join("copy.sh");
        std::fs::write(&source, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&source, std::fs::Permissions::from_mode(0o750)).unwrap();

        let engine = TransferEngine::new();
        let (tx, _rx) = mpsc::channel(64);
        engine
            .transfer_file(&source, &dest, &test_options(), &tx)
            .await
            .unwrap();

        let mode = std::fs::metadata(&dest).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o750);
    }

    #[tokio::test]
    async fn test_stale_temp_file_is_replaced() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("a.txt");
        let dest = temp.path().join("b.txt");
        std::fs::write(&source, b"fresh").unwrap();
        std::fs::write(temp_path_for(&dest), b"stale partial data from a crash").unwrap();

        let engine = TransferEngine::new();
        let (tx, _rx) = mpsc::channel(64);
        engine
            .transfer_file(&source, &dest, &test_options(), &tx)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"fresh");
        assert!(!temp_path_for(&dest).exists());
    }

    #[tokio::test]
    async fn test_directory_source_fails_validation() {
        let temp = tempdir().unwrap();
        let engine = TransferEngine::new();
        let (tx, _rx) = mpsc::channel(64);

        let err = engine
            .transfer_file(temp.path(), temp.path().join("x"), &test_options(), &tx)
            .await
            .unwrap_err();
        assert_eq!(err.kind, TransferErrorKind::ValidationFailed);
        assert_eq!(engine.active_transfers(), 0);
    }
}
