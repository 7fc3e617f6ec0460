//! Backup and restore orchestration.
//!
//! A `BackupCoordinator` runs exactly one `TransferRequest`:
//!
//! 1. **Preparing**: make sure the owning applications are closed (with the
//!    observer's consent), then validate every path.
//! 2. **Copying**: copy or archive with the `CopyEngine` and verify the
//!    result. Directory backups are written straight to their destination.
//!    Zip backups are written to a hidden sibling and renamed into place.
//!    Restores are staged in a sibling directory of the profile and swapped
//!    in by rename only after the staged copy is complete, so the existing
//!    profile is never touched until a full replacement is ready.
//! 3. **Completed / RolledBack / Failed**: terminal; a new request needs a
//!    new coordinator.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::archive::{archived_profiles, verify_archive};
use crate::checksums::verify_copy;
use crate::config::EngineConfig;
use crate::error::{CopyError, EngineError, PathError, ProcessError};
use crate::fs_ops::CopyEngine;
use crate::model::{
    BackupFormat, CoordinatorState, TransferMode, TransferPhase, TransferProgress, TransferRequest,
    TransferResult,
};
use crate::platform::Platform;
use crate::process_guard::ProcessGuard;
use crate::profiles::{check_no_overlap, validate_file, ProfileLocator};
use crate::progress::{CancelToken, ProgressCell, TransferObserver};

/// Marker in the names of temporary restore directories and archives.
const STAGING_MARKER: &str = "mozmover-staging";
/// Marker in the name the replaced profile is parked under during a swap.
const ASIDE_MARKER: &str = "mozmover-aside";
/// Marker in the name of a copy of the original made when it cannot be moved back.
const RECOVERY_MARKER: &str = "mozmover-recovery";

/// How a run failed.
enum Failure {
    /// Nothing was swapped; any temporary output has been removed
    Failed(EngineError),
    /// The swap failed and the original profile is back in place
    RolledBack(EngineError),
}

impl From<EngineError> for Failure {
    fn from(err: EngineError) -> Self {
        Failure::Failed(err)
    }
}

pub struct BackupCoordinator {
    platform: Arc<Platform>,
    config: EngineConfig,
    locator: ProfileLocator,
    state: CoordinatorState,
    progress: ProgressCell,
}

impl BackupCoordinator {
    pub fn new(platform: Arc<Platform>, config: EngineConfig) -> Self {
        let locator = ProfileLocator::new(platform.roots.clone());
        BackupCoordinator {
            platform,
            config,
            locator,
            state: CoordinatorState::Idle,
            progress: ProgressCell::new(),
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    /// Handle to the latest progress snapshot, readable from other threads.
    pub fn progress(&self) -> ProgressCell {
        self.progress.clone()
    }

    /// Run `request` to completion, cancellation or failure.
    ///
    /// Every outcome, including misuse, is reported through the returned
    /// `TransferResult` and `observer.on_completed`.
    pub fn run(
        &mut self,
        request: &TransferRequest,
        observer: &dyn TransferObserver,
        cancel: &CancelToken,
    ) -> TransferResult {
        if self.state != CoordinatorState::Idle {
            let err = EngineError::InvalidState { state: self.state };
            warn!(state = %self.state, "coordinator reused");
            let result = TransferResult::from_error(&err, 0, 0);
            observer.on_completed(&result);
            return result;
        }

        info!(
            mode = %request.mode,
            format = %request.format,
            kind = %request.profile.application_kind,
            source = %request.source_path.display(),
            destination = %request.destination_path.display(),
            profiles = request.sources().len(),
            "transfer started"
        );

        self.set_state(CoordinatorState::Preparing, observer);
        self.publish(TransferProgress::new(TransferPhase::Preparing), observer);
        if let Err(e) = self.prepare(request, observer) {
            return self.finish(Err(Failure::Failed(e)), observer);
        }

        self.set_state(CoordinatorState::Copying, observer);
        let outcome = match (request.mode, request.format) {
            (TransferMode::Backup, BackupFormat::Directory) => {
                self.run_backup(request, observer, cancel)
            }
            (TransferMode::Backup, BackupFormat::Zip) => {
                self.run_archive_backup(request, observer, cancel)
            }
            (TransferMode::Restore, BackupFormat::Directory) => {
                self.run_restore(request, observer, cancel)
            }
            (TransferMode::Restore, BackupFormat::Zip) => {
                self.run_archive_restore(request, observer, cancel)
            }
        };
        self.finish(outcome, observer)
    }

    fn set_state(&mut self, state: CoordinatorState, observer: &dyn TransferObserver) {
        self.state = state;
        observer.on_state_changed(state);
    }

    fn publish(&self, progress: TransferProgress, observer: &dyn TransferObserver) {
        observer.on_progress(&progress);
        self.progress.publish(progress);
    }

    /// Latest snapshot moved to `phase`.
    fn advance_phase(&self, phase: TransferPhase, observer: &dyn TransferObserver) {
        let mut snapshot = self
            .progress
            .snapshot()
            .unwrap_or_else(|| TransferProgress::new(phase));
        snapshot.phase = phase;
        self.publish(snapshot, observer);
    }

    fn prepare(&self, request: &TransferRequest, observer: &dyn TransferObserver) -> Result<(), EngineError> {
        let guard = ProcessGuard::new(self.platform.processes.as_ref(), self.config.poll_interval)
            .with_force_kill(self.config.force_kill_after_timeout);

        for kind in request.application_kinds() {
            if guard.is_running(kind) {
                if !observer.confirm_terminate(kind) {
                    info!(%kind, "closing the application was declined");
                    return Err(ProcessError::StillRunning { kind }.into());
                }
                guard.terminate(kind, self.config.termination_timeout)?;
            }
        }

        let destination = &request.destination_path;
        for source in request.sources() {
            match (request.mode, request.format) {
                (TransferMode::Restore, BackupFormat::Zip) => validate_file(source)?,
                _ => self.locator.validate(source)?,
            }
            check_no_overlap(source, destination)?;
        }

        self.locator.validate(parent_of(destination))?;

        if fs::symlink_metadata(destination).is_ok() {
            match (request.mode, request.format) {
                (TransferMode::Backup, BackupFormat::Zip) => {
                    return Err(PathError::AlreadyExists {
                        path: destination.clone(),
                    }
                    .into());
                }
                (TransferMode::Backup, BackupFormat::Directory) => {
                    self.locator.validate(destination)?;
                    if !is_empty_dir(destination)? {
                        return Err(PathError::DestinationNotEmpty {
                            path: destination.clone(),
                        }
                        .into());
                    }
                }
                (TransferMode::Restore, _) => self.locator.validate(destination)?,
            }
        }
        Ok(())
    }

    /// Forward a copy snapshot to the observer and the shared cell.
    fn forward<'a>(&'a self, observer: &'a dyn TransferObserver) -> impl FnMut(&TransferProgress) + 'a {
        let cell = &self.progress;
        move |p: &TransferProgress| {
            observer.on_progress(p);
            cell.publish(p.clone());
        }
    }

    /// Copy then verify, publishing every snapshot.
    fn copy_and_verify(
        &self,
        source: &Path,
        target: &Path,
        observer: &dyn TransferObserver,
        cancel: &CancelToken,
    ) -> Result<(), EngineError> {
        let engine = CopyEngine::new(&self.config);
        engine.copy_tree(source, target, &mut self.forward(observer), cancel)?;

        self.advance_phase(TransferPhase::Verifying, observer);
        verify_copy(source, target, self.config.verify, cancel)
    }

    fn run_backup(
        &self,
        request: &TransferRequest,
        observer: &dyn TransferObserver,
        cancel: &CancelToken,
    ) -> Result<(), Failure> {
        let destination = &request.destination_path;
        let existed = destination.exists();

        if let Err(e) = self.copy_and_verify(&request.source_path, destination, observer, cancel) {
            self.advance_phase(TransferPhase::Finalizing, observer);
            if existed {
                self.clear_dir_best_effort(destination);
            } else {
                self.remove_best_effort(destination);
            }
            return Err(e.into());
        }

        self.advance_phase(TransferPhase::Finalizing, observer);
        Ok(())
    }

    /// Write every profile into one zip next to the target, verify it, then rename it into place.
    fn run_archive_backup(
        &self,
        request: &TransferRequest,
        observer: &dyn TransferObserver,
        cancel: &CancelToken,
    ) -> Result<(), Failure> {
        let archive = &request.destination_path;
        let staged = sibling_path(archive, STAGING_MARKER, &new_tag());
        let sources = request.sources();

        let written = CopyEngine::new(&self.config)
            .write_archive(&sources, &staged, &mut self.forward(observer), cancel)
            .map_err(EngineError::from)
            .and_then(|_| {
                self.advance_phase(TransferPhase::Verifying, observer);
                verify_archive(&sources, &staged, self.config.verify, cancel)
            });

        self.advance_phase(TransferPhase::Finalizing, observer);
        if let Err(e) = written {
            self.remove_file_best_effort(&staged);
            return Err(e.into());
        }

        if let Err(e) = self.platform.filesystem.rename(&staged, archive) {
            self.remove_file_best_effort(&staged);
            return Err(swap_failed(&staged, archive, e).into());
        }
        Ok(())
    }

    fn run_restore(
        &self,
        request: &TransferRequest,
        observer: &dyn TransferObserver,
        cancel: &CancelToken,
    ) -> Result<(), Failure> {
        let destination = &request.destination_path;
        let tag = new_tag();
        let staged = sibling_path(destination, STAGING_MARKER, &tag);

        if let Err(e) = self.copy_and_verify(&request.source_path, &staged, observer, cancel) {
            self.advance_phase(TransferPhase::Finalizing, observer);
            self.remove_best_effort(&staged);
            return Err(e.into());
        }

        self.advance_phase(TransferPhase::Finalizing, observer);
        self.swap_into_place(&staged, &staged, destination, &tag)
    }

    /// Unpack the first profile of a zip next to the target and swap it in.
    fn run_archive_restore(
        &self,
        request: &TransferRequest,
        observer: &dyn TransferObserver,
        cancel: &CancelToken,
    ) -> Result<(), Failure> {
        let archive = &request.source_path;
        let destination = &request.destination_path;
        let tag = new_tag();
        let unpacked = sibling_path(destination, STAGING_MARKER, &tag);

        let staged = match self.unpack_first_profile(archive, &unpacked, observer, cancel) {
            Ok(staged) => staged,
            Err(e) => {
                self.advance_phase(TransferPhase::Finalizing, observer);
                self.remove_best_effort(&unpacked);
                return Err(e.into());
            }
        };

        self.advance_phase(TransferPhase::Finalizing, observer);
        self.swap_into_place(&staged, &unpacked, destination, &tag)
    }

    fn unpack_first_profile(
        &self,
        archive: &Path,
        unpacked: &Path,
        observer: &dyn TransferObserver,
        cancel: &CancelToken,
    ) -> Result<PathBuf, EngineError> {
        let Some(name) = archived_profiles(archive)?.into_iter().next() else {
            return Err(CopyError::InvalidArchive {
                path: archive.to_path_buf(),
                reason: "no profile directory inside".to_string(),
            }
            .into());
        };

        CopyEngine::new(&self.config).extract_archive(
            archive,
            unpacked,
            Some(name.as_str()),
            &mut self.forward(observer),
            cancel,
        )?;

        self.advance_phase(TransferPhase::Verifying, observer);
        let staged = unpacked.join(&name);
        if !staged.is_dir() {
            return Err(CopyError::InvalidArchive {
                path: archive.to_path_buf(),
                reason: format!("{} did not unpack to a directory", name),
            }
            .into());
        }
        Ok(staged)
    }

    /// Replace `destination` with `staged` by renames, then remove `scratch`.
    ///
    /// At every point either the original profile or the complete staged copy
    /// sits at `destination`. If the original cannot be renamed back after a
    /// failed swap, a verified copy of it is put there instead. Only when that
    /// fails too is the destination left empty; both directories are then
    /// kept and their locations reported.
    fn swap_into_place(
        &self,
        staged: &Path,
        scratch: &Path,
        destination: &Path,
        tag: &str,
    ) -> Result<(), Failure> {
        let filesystem = self.platform.filesystem.as_ref();

        if fs::symlink_metadata(destination).is_err() {
            let moved = filesystem.rename(staged, destination);
            self.remove_best_effort(scratch);
            return moved.map_err(|e| swap_failed(staged, destination, e).into());
        }

        let aside = sibling_path(destination, ASIDE_MARKER, tag);
        if let Err(e) = filesystem.rename(destination, &aside) {
            self.remove_best_effort(scratch);
            return Err(swap_failed(destination, &aside, e).into());
        }

        let Err(swap_err) = filesystem.rename(staged, destination) else {
            self.remove_best_effort(&aside);
            self.remove_best_effort(scratch);
            return Ok(());
        };

        let put_back = match filesystem.rename(&aside, destination) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(
                    original = %aside.display(),
                    error = %e,
                    "could not move the original profile back, copying it instead"
                );
                self.copy_back(&aside, destination, tag)
            }
        };

        match put_back {
            Ok(()) => {
                warn!(
                    destination = %destination.display(),
                    error = %swap_err,
                    "restore swap failed, original profile put back"
                );
                self.remove_best_effort(&aside);
                self.remove_best_effort(scratch);
                Err(Failure::RolledBack(swap_failed(staged, destination, swap_err)))
            }
            Err(copy_err) => {
                error!(
                    original = %aside.display(),
                    staged = %staged.display(),
                    error = %copy_err,
                    "restore swap and rollback both failed"
                );
                Err(Failure::Failed(EngineError::RollbackFailed {
                    original: aside,
                    staged: staged.to_path_buf(),
                    source: swap_err,
                }))
            }
        }
    }

    /// Put a verified copy of `original` at `destination` through a temporary sibling.
    ///
    /// Runs to the end even if the transfer was cancelled.
    fn copy_back(&self, original: &Path, destination: &Path, tag: &str) -> Result<(), EngineError> {
        let copy = sibling_path(destination, RECOVERY_MARKER, tag);
        let uncancelled = CancelToken::new();

        let result = CopyEngine::new(&self.config)
            .copy_tree(original, &copy, &mut |_: &TransferProgress| {}, &uncancelled)
            .map_err(EngineError::from)
            .and_then(|_| verify_copy(original, &copy, None, &uncancelled))
            .and_then(|()| {
                self.platform
                    .filesystem
                    .rename(&copy, destination)
                    .map_err(|e| swap_failed(&copy, destination, e))
            });

        if result.is_err() {
            self.remove_best_effort(&copy);
        }
        result
    }

    fn finish(&mut self, outcome: Result<(), Failure>, observer: &dyn TransferObserver) -> TransferResult {
        let (bytes, files) = self
            .progress
            .snapshot()
            .map(|p| (p.bytes_copied, p.files_copied))
            .unwrap_or((0, 0));

        let (state, result) = match outcome {
            Ok(()) => (CoordinatorState::Completed, TransferResult::success(bytes, files)),
            Err(Failure::RolledBack(e)) => (
                CoordinatorState::RolledBack,
                TransferResult::rolled_back(&e, bytes, files),
            ),
            Err(Failure::Failed(e)) => (
                CoordinatorState::Failed,
                TransferResult::from_error(&e, bytes, files),
            ),
        };

        match &result.error_detail {
            None => info!(bytes, files, "transfer completed"),
            Some(detail) => warn!(outcome = %result.outcome, detail = %detail, "transfer did not complete"),
        }

        self.set_state(state, observer);
        observer.on_completed(&result);
        result
    }

    fn remove_best_effort(&self, path: &Path) {
        match self.platform.filesystem.remove_dir_all(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "could not remove partial output"),
        }
    }

    fn remove_file_best_effort(&self, path: &Path) {
        match self.platform.filesystem.remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "could not remove partial archive"),
        }
    }

    /// Empty a directory that existed before the operation, keeping the directory itself.
    fn clear_dir_best_effort(&self, path: &Path) {
        let entries = match fs::read_dir(path) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not clean partial output");
                return;
            }
        };
        for entry in entries.flatten() {
            let child = entry.path();
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if is_dir {
                self.remove_best_effort(&child);
            } else if let Err(e) = fs::remove_file(&child) {
                warn!(path = %child.display(), error = %e, "could not remove partial output");
            }
        }
    }
}

fn new_tag() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Parent directory of `path`, `.` for bare relative names.
fn parent_of(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Hidden sibling of `path`: `<parent>/.<name>.<marker>-<tag>`.
fn sibling_path(path: &Path, marker: &str, tag: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "profile".to_string());
    parent_of(path).join(format!(".{}.{}-{}", name, marker, tag))
}

fn is_empty_dir(path: &Path) -> Result<bool, PathError> {
    let mut entries = fs::read_dir(path).map_err(|e| PathError::AccessDenied {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(entries.next().is_none())
}

fn swap_failed(from: &Path, to: &Path, source: io::Error) -> EngineError {
    EngineError::SwapFailed {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    }
}
