//! Bounded-concurrency batch transfers.
//!
//! Up to `max_concurrency` single-file transfers run as tasks in a
//! [`JoinSet`]; each completion frees a slot for the next input index.
//! Results are written into index-stable slots, so output order always
//! matches input order.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::TransferEngine;
use super::native_copy::{self, FileContext, SettledFile};
use crate::core::error::{TransferError, TransferErrorKind};
use crate::core::models::{TransferEvent, TransferResult};
use crate::core::options::TransferOptions;
use crate::core::progress::{BatchAggregator, ProgressThrottle};

/// Shared by every task of one batch to fold file progress into batch progress.
pub(crate) struct BatchReporter {
    aggregator: Mutex<BatchAggregator>,
    throttle: ProgressThrottle,
    sizes: Vec<u64>,
    tx: mpsc::Sender<TransferEvent>,
}

impl BatchReporter {
    fn new(sizes: Vec<u64>, options: &TransferOptions, tx: mpsc::Sender<TransferEvent>) -> Self {
        let total_bytes = sizes.iter().sum();
        Self {
            aggregator: Mutex::new(BatchAggregator::new(total_bytes, sizes.len())),
            throttle: ProgressThrottle::new(options.progress_interval),
            sizes,
            tx,
        }
    }

    pub(crate) async fn update(&self, index: usize, bytes: u64) {
        let snapshot = self
            .aggregator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .update(index, bytes);

        if self.throttle.should_emit() {
            let _ = self.tx.send(TransferEvent::BatchProgress(snapshot)).await;
        }
    }

    /// A settled file always produces an aggregate update, regardless of the throttle.
    pub(crate) async fn complete(&self, index: usize, result: &TransferResult) {
        let expected = self.sizes.get(index).copied().unwrap_or(0);
        let snapshot = self
            .aggregator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .complete(index, expected, result.success);

        self.throttle.mark_emitted();
        let _ = self.tx.send(TransferEvent::BatchProgress(snapshot)).await;
    }
}

impl TransferEngine {
    /// Transfer many `(source, destination)` pairs with bounded concurrency.
    ///
    /// With `continue_on_error`, failures become failed [`TransferResult`]s
    /// in their slot. Without it, the first failure stops any new transfer
    /// from being scheduled; transfers already running are allowed to settle
    /// before that error is returned. Call [`stop`](Self::stop) for prompt
    /// cancellation.
    pub async fn transfer_files(
        &self,
        files: &[(PathBuf, PathBuf)],
        options: &TransferOptions,
        tx: &mpsc::Sender<TransferEvent>,
    ) -> Result<Vec<TransferResult>, TransferError> {
        if files.is_empty() {
            return Ok(Vec::new());
        }
        self.ensure_accepting()?;

        let limit = options.concurrency_limit();
        let sizes = prefetch_sizes(files).await;
        let total_bytes: u64 = sizes.iter().sum();

        info!(
            session_id = %self.session_id(),
            files = files.len(),
            total_bytes,
            concurrency = limit,
            "Starting batch transfer"
        );

        let options = Arc::new(options.clone());
        let reporter = Arc::new(BatchReporter::new(sizes, &options, tx.clone()));

        let mut slots: Vec<Option<TransferResult>> = vec![None; files.len()];
        let mut tasks = JoinSet::new();
        let mut next = 0;
        let mut first_error: Option<TransferError> = None;

        while next < files.len().min(limit) {
            self.spawn_transfer(&mut tasks, next, &files[next], &options, tx, &reporter);
            next += 1;
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, settled)) => {
                    slots[index] = Some(settled.result);
                    if let Some(e) = settled.error {
                        if !options.continue_on_error && first_error.is_none() {
                            warn!(index, error = %e, "Batch stopped scheduling after failure");
                            first_error = Some(e);
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "Transfer task panicked");
                    if first_error.is_none() {
                        first_error = Some(TransferError::new(
                            TransferErrorKind::Unknown,
                            format!("Transfer task failed: {}", e),
                            false,
                        ));
                    }
                }
            }

            if first_error.is_none() && next < files.len() {
                self.spawn_transfer(&mut tasks, next, &files[next], &options, tx, &reporter);
                next += 1;
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        let results: Vec<TransferResult> = slots
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| {
                TransferError::new(TransferErrorKind::Unknown, "Batch ended with unsettled files", false)
            })?;

        let succeeded = results.iter().filter(|r| r.success && !r.skipped).count();
        let skipped = results.iter().filter(|r| r.skipped).count();
        let failed = results.iter().filter(|r| !r.success).count();
        info!(succeeded, skipped, failed, "Batch transfer complete");

        Ok(results)
    }

    fn spawn_transfer(
        &self,
        tasks: &mut JoinSet<(usize, SettledFile)>,
        index: usize,
        pair: &(PathBuf, PathBuf),
        options: &Arc<TransferOptions>,
        tx: &mpsc::Sender<TransferEvent>,
        reporter: &Arc<BatchReporter>,
    ) {
        let engine = self.clone();
        let (source, destination) = pair.clone();
        let options = Arc::clone(options);
        let tx = tx.clone();
        let reporter = Arc::clone(reporter);

        tasks.spawn(async move {
            let ctx = FileContext {
                index,
                source: &source,
                destination: &destination,
                options: options.as_ref(),
                tx: &tx,
                batch: Some(reporter.as_ref()),
            };
            let outcome = native_copy::transfer_single(&engine, &ctx).await;
            (index, outcome)
        });
    }
}

/// Stat every source once so the batch total does not depend on completion order.
async fn prefetch_sizes(files: &[(PathBuf, PathBuf)]) -> Vec<u64> {
    let mut sizes = Vec::with_capacity(files.len());
    for (source, _) in files {
        let size = match tokio::fs::metadata(source).await {
            Ok(metadata) => metadata.len(),
            Err(_) => 0,
        };
        sizes.push(size);
    }
    sizes
}
