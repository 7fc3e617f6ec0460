//! Progress reporting and cancellation.
//!
//! This module defines the TransferObserver trait, which decouples the engine
//! from any particular UI (CLI, GUI, etc.), plus the two pieces of state that
//! cross threads: the cancellation flag and the latest progress snapshot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::model::{ApplicationKind, CoordinatorState, TransferProgress, TransferResult};

/// Trait for receiving events from a running transfer.
///
/// All methods are called synchronously on the thread running the
/// coordinator. A UI is responsible for marshaling onto its own thread.
pub trait TransferObserver: Send {
    /// Called on every coordinator state transition.
    fn on_state_changed(&self, state: CoordinatorState);

    /// Called after each file and at the configured byte interval inside large files.
    fn on_progress(&self, progress: &TransferProgress);

    /// Asked when `kind` is running. Returning true allows the engine to close it,
    /// which may discard unsaved work in that application.
    fn confirm_terminate(&self, kind: ApplicationKind) -> bool;

    /// Called once with the terminal result.
    fn on_completed(&self, result: &TransferResult);
}

/// Cooperative cancellation flag shared between a caller and a running copy.
///
/// The copy checks it between files and between buffered chunks; it is never
/// preemptive.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Latest progress snapshot, readable from any thread.
///
/// Writers always replace the whole struct, so readers never observe a mix of
/// old and new fields.
#[derive(Debug, Clone)]
pub struct ProgressCell {
    inner: Arc<Mutex<Option<TransferProgress>>>,
}

impl ProgressCell {
    pub fn new() -> Self {
        ProgressCell {
            inner: Arc::new(Mutex::new(None)),
        }
    }

    pub fn publish(&self, progress: TransferProgress) {
        let mut slot = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(progress);
    }

    /// Copy of the most recent snapshot, if any has been published.
    pub fn snapshot(&self) -> Option<TransferProgress> {
        match self.inner.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Default for ProgressCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TransferPhase;

    #[test]
    fn test_cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn test_progress_cell_replaces_whole_snapshot() {
        let cell = ProgressCell::new();
        assert!(cell.snapshot().is_none());

        let mut first = TransferProgress::new(TransferPhase::Copying);
        first.bytes_copied = 10;
        first.current_file_name = "prefs.js".to_string();
        cell.publish(first);

        let mut second = TransferProgress::new(TransferPhase::Verifying);
        second.bytes_copied = 20;
        cell.clone().publish(second.clone());

        assert_eq!(cell.snapshot(), Some(second));
    }
}
