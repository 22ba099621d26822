//! The transfer engine.
//!
//! A [`TransferEngine`] is created per ingest session. It owns the only state
//! shared between concurrently running transfers: the stop flags, the count
//! of active transfers, and the set of in-flight `.TBPART` temp files. All of
//! it lives behind a single mutex. Clones share the same session.

mod batch;
mod native_copy;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::error::TransferError;
use crate::core::models::{TransferEvent, TransferResult};
use crate::core::options::TransferOptions;

pub use native_copy::{TEMP_SUFFIX, temp_path_for};

/// Upper bound on how long `stop()` waits for active transfers.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Lets the last OS callbacks of aborted streams settle before `stop()` returns.
const STOP_GRACE_PERIOD: Duration = Duration::from_millis(100);

struct EngineState {
    session_id: Uuid,
    stopping: bool,
    stopped: bool,
    active: usize,
    temp_files: HashSet<PathBuf>,
    /// Abort hook for streaming copies; replaced on reset since tokens cannot be un-cancelled
    abort: CancellationToken,
}

impl EngineState {
    fn new() -> Self {
        Self {
            session_id: Uuid::now_v7(),
            stopping: false,
            stopped: false,
            active: 0,
            temp_files: HashSet::new(),
            abort: CancellationToken::new(),
        }
    }
}

struct EngineInner {
    state: Mutex<EngineState>,
    stop_timeout: Duration,
}

/// Atomic, verified, retrying file transfer engine.
#[derive(Clone)]
pub struct TransferEngine {
    inner: Arc<EngineInner>,
}

impl Default for TransferEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferEngine {
    pub fn new() -> Self {
        Self::with_stop_timeout(DEFAULT_STOP_TIMEOUT)
    }

    pub fn with_stop_timeout(stop_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                state: Mutex::new(EngineState::new()),
                stop_timeout,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session_id(&self) -> Uuid {
        self.state().session_id
    }

    pub fn is_stopping(&self) -> bool {
        self.state().stopping
    }

    pub fn is_stopped(&self) -> bool {
        self.state().stopped
    }

    pub fn active_transfers(&self) -> usize {
        self.state().active
    }

    /// Temp files currently owned by in-flight transfers.
    pub fn tracked_temp_files(&self) -> Vec<PathBuf> {
        self.state().temp_files.iter().cloned().collect()
    }

    /// Transfer one file atomically.
    ///
    /// Progress and the final `FileComplete` event (index 0) are sent on `tx`;
    /// a closed receiver is ignored.
    pub async fn transfer_file(
        &self,
        source: impl AsRef<Path>,
        destination: impl AsRef<Path>,
        options: &TransferOptions,
        tx: &mpsc::Sender<TransferEvent>,
    ) -> Result<TransferResult, TransferError> {
        let ctx = native_copy::FileContext {
            index: 0,
            source: source.as_ref(),
            destination: destination.as_ref(),
            options,
            tx,
            batch: None,
        };
        native_copy::transfer_single(self, &ctx).await.into_result()
    }

    /// Two-phase shutdown.
    ///
    /// New transfers are refused immediately, streaming copies are aborted,
    /// and active transfers are awaited for at most the stop timeout. Temp
    /// files still tracked afterwards are deleted. Calling it again is a no-op
    /// apart from re-running the (then empty) cleanup.
    pub async fn stop(&self) {
        let (session_id, abort, active) = {
            let mut state = self.state();
            state.stopping = true;
            (state.session_id, state.abort.clone(), state.active)
        };
        info!(%session_id, active, "Stopping transfer engine");

        abort.cancel();

        let deadline = Instant::now() + self.inner.stop_timeout;
        loop {
            let active = self.active_transfers();
            if active == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    %session_id,
                    active,
                    timeout_ms = self.inner.stop_timeout.as_millis() as u64,
                    "Timed out waiting for active transfers to stop"
                );
                break;
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }

        let leftovers: Vec<PathBuf> = {
            let mut state = self.state();
            state.stopped = true;
            state.temp_files.drain().collect()
        };

        for path in &leftovers {
            match tokio::fs::remove_file(path).await {
                Ok(()) => debug!(path = %path.display(), "Removed temp file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove temp file"),
            }
        }

        tokio::time::sleep(STOP_GRACE_PERIOD).await;
        info!(%session_id, cleaned_up = leftovers.len(), "Transfer engine stopped");
    }

    /// Clear the stop flags and temp-file set so the engine can run a new session.
    pub fn reset(&self) {
        let mut state = self.state();
        if state.active > 0 {
            warn!(active = state.active, "Resetting engine with transfers still active");
        }
        let previous = state.session_id;
        state.session_id = Uuid::now_v7();
        state.stopping = false;
        state.stopped = false;
        state.temp_files.clear();
        state.abort = CancellationToken::new();
        info!(previous = %previous, session_id = %state.session_id, "Transfer engine reset");
    }

    pub(crate) fn ensure_accepting(&self) -> Result<(), TransferError> {
        let state = self.state();
        if state.stopping || state.stopped {
            return Err(TransferError::cancelled());
        }
        Ok(())
    }

    /// Register a starting transfer, refusing if the engine is stopping.
    pub(crate) fn begin_transfer(&self, temp_path: PathBuf) -> Result<ActiveTransfer, TransferError> {
        let mut state = self.state();
        if state.stopping || state.stopped {
            return Err(TransferError::cancelled());
        }
        state.active += 1;
        Ok(ActiveTransfer {
            engine: self.clone(),
            temp_path,
        })
    }

    pub(crate) fn abort_token(&self) -> CancellationToken {
        self.state().abort.clone()
    }

    pub(crate) fn track_temp(&self, path: &Path) {
        self.state().temp_files.insert(path.to_path_buf());
    }

    pub(crate) fn untrack_temp(&self, path: &Path) -> bool {
        self.state().temp_files.remove(path)
    }
}

/// Keeps the active-transfer count accurate for as long as a transfer runs.
///
/// If the transfer future is dropped while its temp file is still tracked,
/// the temp file is removed here.
pub(crate) struct ActiveTransfer {
    engine: TransferEngine,
    temp_path: PathBuf,
}

impl Drop for ActiveTransfer {
    fn drop(&mut self) {
        let still_tracked = {
            let mut state = self.engine.state();
            state.active = state.active.saturating_sub(1);
            state.temp_files.remove(&self.temp_path)
        };
        if still_tracked {
            if let Err(e) = std::fs::remove_file(&self.temp_path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.temp_path.display(), error = %e, "Failed to remove temp file");
                }
            }
        }
    }
}
