//! Run a transfer on a background thread.
//!
//! Observer callbacks are forwarded over a channel so a front end can render
//! progress from its own thread and cancel through the returned handle.

use std::any::Any;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::error;

use crate::coordinator::BackupCoordinator;
use crate::model::{
    ApplicationKind, CoordinatorState, TransferOutcome, TransferProgress, TransferRequest,
    TransferResult,
};
use crate::progress::{CancelToken, ProgressCell, TransferObserver};

#[derive(Debug, Clone)]
pub enum TransferEvent {
    StateChanged(CoordinatorState),
    Progress(TransferProgress),
    Completed(TransferResult),
}

/// Observer that sends every callback to a channel.
///
/// Closing the application is answered up front since the worker
/// cannot block on the front end for a decision.
pub struct ChannelObserver {
    sender: Sender<TransferEvent>,
    allow_terminate: bool,
}

impl ChannelObserver {
    pub fn new(sender: Sender<TransferEvent>, allow_terminate: bool) -> Self {
        ChannelObserver {
            sender,
            allow_terminate,
        }
    }
}

impl TransferObserver for ChannelObserver {
    fn on_state_changed(&self, state: CoordinatorState) {
        let _ = self.sender.send(TransferEvent::StateChanged(state));
    }

    fn on_progress(&self, progress: &TransferProgress) {
        let _ = self.sender.send(TransferEvent::Progress(progress.clone()));
    }

    fn confirm_terminate(&self, _kind: ApplicationKind) -> bool {
        self.allow_terminate
    }

    fn on_completed(&self, result: &TransferResult) {
        let _ = self.sender.send(TransferEvent::Completed(result.clone()));
    }
}

/// A transfer running on its own thread.
pub struct TransferHandle {
    events: Receiver<TransferEvent>,
    cancel: CancelToken,
    progress: ProgressCell,
    thread: JoinHandle<TransferResult>,
}

impl TransferHandle {
    pub fn events(&self) -> &Receiver<TransferEvent> {
        &self.events
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn progress(&self) -> Option<TransferProgress> {
        self.progress.snapshot()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Block until the transfer ends.
    pub fn wait(self) -> TransferResult {
        match self.thread.join() {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(%message, "transfer thread panicked");
                TransferResult {
                    outcome: TransferOutcome::Failed,
                    error_detail: Some(format!("Panicked: {}", message)),
                    bytes_copied: 0,
                    files_copied: 0,
                }
            }
        }
    }
}

/// Spawn a background thread running `request` on `coordinator`.
pub fn spawn_transfer(
    mut coordinator: BackupCoordinator,
    request: TransferRequest,
    allow_terminate: bool,
) -> TransferHandle {
    let (sender, events) = unbounded();
    let cancel = CancelToken::new();
    let progress = coordinator.progress();

    let thread_cancel = cancel.clone();
    let thread = thread::spawn(move || {
        let observer = ChannelObserver::new(sender, allow_terminate);
        coordinator.run(&request, &observer, &thread_cancel)
    });

    TransferHandle {
        events,
        cancel,
        progress,
        thread,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::fs_ops::tests::{tree_contents, write_file};
    use crate::model::ProfileDescriptor;
    use crate::platform::testing::{platform_with, FakeProcessTable};
    use crate::platform::StdFilesystem;
    use std::sync::Arc;

    fn coordinator(processes: FakeProcessTable) -> BackupCoordinator {
        let platform = platform_with(processes, Box::new(StdFilesystem));
        BackupCoordinator::new(Arc::new(platform), EngineConfig::default())
    }

    #[test]
    fn test_background_backup_streams_events() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let profile_dir = temp_dir.path().join("profile");
        write_file(&profile_dir.join("prefs.js"), b"user_pref");
        write_file(&profile_dir.join("cookies.sqlite"), &[1u8; 4096]);
        let destination = temp_dir.path().join("backup");

        let request = TransferRequest::backup(
            ProfileDescriptor::new(ApplicationKind::Firefox, &profile_dir),
            &destination,
        );
        let handle = spawn_transfer(coordinator(FakeProcessTable::default()), request, false);

        let events: Vec<TransferEvent> = handle.events().iter().collect();
        let result = handle.wait();

        assert!(result.is_success(), "{:?}", result);
        assert_eq!(tree_contents(&profile_dir), tree_contents(&destination));
        assert!(matches!(
            events.first(),
            Some(TransferEvent::StateChanged(CoordinatorState::Preparing))
        ));
        assert!(events.iter().any(|e| matches!(e, TransferEvent::Progress(_))));
        match events.last() {
            Some(TransferEvent::Completed(r)) => assert_eq!(r, &result),
            other => panic!("unexpected last event: {:?}", other),
        }
    }

    #[test]
    fn test_background_restore_without_consent() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let backup = temp_dir.path().join("backup");
        write_file(&backup.join("prefs.js"), b"user_pref");

        let request = TransferRequest::restore(
            &backup,
            ProfileDescriptor::new(ApplicationKind::Thunderbird, temp_dir.path().join("profile")),
        );
        let table = FakeProcessTable::with(&[(9, "thunderbird", false)]);
        let result = spawn_transfer(coordinator(table), request, false).wait();

        assert_eq!(result.outcome, TransferOutcome::Failed);
        assert_eq!(
            result.error_detail.as_deref(),
            Some("StillRunning: thunderbird is still running")
        );
    }

    #[test]
    fn test_panic_message_extracts_text() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
    }
}
