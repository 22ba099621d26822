//! Length checks during streaming, exercised with Linux pseudo-files whose
//! stat size disagrees with what a read actually returns.
#![cfg(target_os = "linux")]

use std::path::Path;
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use transferbox::core::{
    RetryConfig, TransferEngine, TransferErrorKind, TransferEvent, TransferOptions, temp_path_for,
};

fn test_options(max_attempts: u32) -> TransferOptions {
    TransferOptions {
        buffer_size: 64 * 1024,
        fsync: false,
        retry: RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
        },
        ..Default::default()
    }
}

fn collect_events() -> (mpsc::Sender<TransferEvent>, JoinHandle<Vec<TransferEvent>>) {
    let (tx, mut rx) = mpsc::channel(100);
    let handle = tokio::spawn(async move {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    });
    (tx, handle)
}

fn retries(events: &[TransferEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, TransferEvent::Retrying { .. }))
        .count()
}

#[tokio::test]
async fn test_source_longer_than_stat_fails_validation_once() {
    // procfs reports size 0 but yields the process status text
    let source = Path::new("/proc/self/status");
    let temp = tempdir().unwrap();
    let destination = temp.path().join("status.txt");

    let engine = TransferEngine::new();
    let (tx, events) = collect_events();
    let err = engine
        .transfer_file(source, &destination, &test_options(3), &tx)
        .await
        .unwrap_err();
    drop(tx);
    let events = events.await.unwrap();

    assert_eq!(err.kind, TransferErrorKind::ValidationFailed);
    assert!(!err.retryable);
    assert_eq!(retries(&events), 0);
    assert!(!destination.exists());
    assert!(!temp_path_for(&destination).exists());
    assert!(engine.tracked_temp_files().is_empty());
}

#[tokio::test]
async fn test_truncated_source_is_retried_as_disconnect() {
    // sysfs attributes stat as one page but read back a few bytes
    let source = Path::new("/sys/devices/system/cpu/online");
    if !source.exists() {
        return;
    }
    let temp = tempdir().unwrap();
    let destination = temp.path().join("online.txt");
    let max_attempts = 3;

    let engine = TransferEngine::new();
    let (tx, events) = collect_events();
    let err = engine
        .transfer_file(source, &destination, &test_options(max_attempts), &tx)
        .await
        .unwrap_err();
    drop(tx);
    let events = events.await.unwrap();

    assert_eq!(err.kind, TransferErrorKind::DriveDisconnected);
    assert!(err.retryable);
    assert_eq!(retries(&events), (max_attempts - 1) as usize);

    let attempts: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            TransferEvent::Retrying { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec![2, 3]);

    assert!(!destination.exists());
    assert!(!temp_path_for(&destination).exists());
    assert!(matches!(
        events.last(),
        Some(TransferEvent::FileComplete { result, .. })
            if result.error_kind == Some(TransferErrorKind::DriveDisconnected)
    ));
}
