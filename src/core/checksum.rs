//! Streaming xxHash64 checksums.
//!
//! Digests are rendered as 16 lowercase hex characters. The hash is
//! incremental, so a digest is identical whether the bytes arrive as one
//! buffer or in arbitrary chunks. The copy path relies on this to hash the
//! source and destination sides from the same read buffer.

use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use xxhash_rust::xxh64::Xxh64;

use crate::core::error::TransferError;
use crate::core::models::TransferEvent;
use crate::core::progress::{ProgressThrottle, TransferProgress};

/// Seed shared by every hasher so digests are comparable across runs.
pub const CHECKSUM_SEED: u64 = 0;

/// Incremental 64-bit content hash.
#[derive(Clone)]
pub struct StreamingChecksum {
    hasher: Xxh64,
    bytes: u64,
}

impl Default for StreamingChecksum {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamingChecksum {
    pub fn new() -> Self {
        Self::with_seed(CHECKSUM_SEED)
    }

    fn with_seed(seed: u64) -> Self {
        Self {
            hasher: Xxh64::new(seed),
            bytes: 0,
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    /// Number of bytes hashed so far.
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes
    }

    pub fn finalize(&self) -> String {
        format_digest(self.hasher.digest())
    }
}

fn format_digest(digest: u64) -> String {
    format!("{:016x}", digest)
}

/// Hash an in-memory buffer.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut checksum = StreamingChecksum::new();
    checksum.update(data);
    checksum.finalize()
}

/// Hash a file by streaming it in `buffer_size` chunks.
pub async fn checksum_file(path: &Path, buffer_size: usize) -> Result<String, TransferError> {
    hash_file(path, buffer_size, None).await
}

/// Hash a file, reporting `ChecksumProgress` events while reading.
pub async fn checksum_file_with_progress(
    path: &Path,
    buffer_size: usize,
    tx: &mpsc::Sender<TransferEvent>,
) -> Result<String, TransferError> {
    hash_file(path, buffer_size, Some(tx)).await
}

async fn hash_file(
    path: &Path,
    buffer_size: usize,
    tx: Option<&mpsc::Sender<TransferEvent>>,
) -> Result<String, TransferError> {
    let total_bytes = match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(TransferError::source_not_found(path));
        }
        Err(e) => return Err(TransferError::from_io("Failed to read file metadata", e)),
    };

    let mut file = File::open(path)
        .await
        .map_err(|e| TransferError::from_io("Failed to open file for checksum", e))?;

    let mut checksum = StreamingChecksum::new();
    let mut buffer = vec![0u8; buffer_size.max(1)];
    let started = Instant::now();
    let throttle = ProgressThrottle::default();

    loop {
        let bytes_read = file
            .read(&mut buffer)
            .await
            .map_err(|e| TransferError::from_io("Failed to read file for checksum", e))?;
        if bytes_read == 0 {
            break;
        }
        checksum.update(&buffer[..bytes_read]);

        if let Some(tx) = tx {
            if throttle.should_emit() {
                send_progress(tx, path, checksum.bytes_hashed(), total_bytes, started).await;
            }
        }
    }

    if let Some(tx) = tx {
        send_progress(tx, path, checksum.bytes_hashed(), total_bytes, started).await;
    }

    Ok(checksum.finalize())
}

async fn send_progress(
    tx: &mpsc::Sender<TransferEvent>,
    path: &Path,
    bytes: u64,
    total: u64,
    started: Instant,
) {
    let _ = tx
        .send(TransferEvent::ChecksumProgress {
            path: PathBuf::from(path),
            progress: TransferProgress::new(bytes, total.max(bytes), started.elapsed()),
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_digest_is_sixteen_lowercase_hex_chars() {
        let digest = checksum_bytes(b"hello world");
        assert_eq!(digest.len(), 16);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_empty_input_matches_known_digest() {
        // xxh64("", 0)
        assert_eq!(checksum_bytes(b""), "ef46db3751d8e999");
    }

    #[test]
    fn test_chunking_does_not_change_digest() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i * 31 % 251) as u8).collect();
        let whole = checksum_bytes(&data);

        for chunk_size in [1, 7, 32, 4096, 65_537] {
            let mut checksum = StreamingChecksum::new();
            for chunk in data.chunks(chunk_size) {
                checksum.update(chunk);
            }
            assert_eq!(checksum.finalize(), whole, "chunk size {}", chunk_size);
            assert_eq!(checksum.bytes_hashed(), data.len() as u64);
        }
    }

    #[test]
    fn test_seed_changes_digest() {
        let mut seeded = StreamingChecksum::with_seed(42);
        seeded.update(b"abc");
        assert_ne!(seeded.finalize(), checksum_bytes(b"abc"));
    }

    #[tokio::test]
    async fn test_checksum_file_is_deterministic_and_content_sensitive() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("clip.mov");
        std::fs::write(&path, vec![0xAB; 300 * 1024]).unwrap();

        let first = checksum_file(&path, 64 * 1024).await.unwrap();
        let second = checksum_file(&path, 4096).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first, checksum_bytes(&vec![0xAB; 300 * 1024]));

        std::fs::write(&path, vec![0xAC; 300 * 1024]).unwrap();
        let modified = checksum_file(&path, 64 * 1024).await.unwrap();
        assert_ne!(first, modified);
    }

    #[tokio::test]
    async fn test_checksum_missing_file() {
        let temp = tempdir().unwrap();
        let err = checksum_file(&temp.path().join("nope"), 1024).await.unwrap_err();
        assert_eq!(err.kind, crate::core::error::TransferErrorKind::SourceNotFound);
    }

    #[tokio::test]
    async fn test_checksum_progress_ends_at_full_size() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("a.bin");
        std::fs::write(&path, vec![1u8; 10_000]).unwrap();

        let (tx, mut rx) = mpsc::channel(64);
        checksum_file_with_progress(&path, 1000, &tx).await.unwrap();
        drop(tx);

        let mut last = None;
        while let Some(event) = rx.recv().await {
            if let TransferEvent::ChecksumProgress { progress, .. } = event {
                last = Some(progress);
            }
        }
        let last = last.expect("no checksum progress");
        assert_eq!(last.bytes_transferred, 10_000);
        assert_eq!(last.percentage, 100.0);
    }
}
