//! Core data model for profile transfers.
//!
//! This module defines the values that flow through the engine:
//! - ProfileDescriptor: one detected browser or mail profile
//! - TransferRequest: a single backup or restore operation, as a directory or a zip
//! - TransferProgress: the latest progress snapshot handed to observers
//! - TransferResult: the terminal value of an operation

use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

/// The application that owns a profile directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplicationKind {
    Firefox,
    Thunderbird,
}

impl ApplicationKind {
    /// Every supported application, in listing order.
    pub const ALL: [ApplicationKind; 2] = [ApplicationKind::Firefox, ApplicationKind::Thunderbird];

    /// Executable names (lowercase, without `.exe`) that identify a running instance.
    pub fn process_names(&self) -> &'static [&'static str] {
        match self {
            ApplicationKind::Firefox => &["firefox", "firefox-bin", "firefox-esr"],
            ApplicationKind::Thunderbird => &["thunderbird", "thunderbird-bin"],
        }
    }

    /// Parse from a user-facing name.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "firefox" | "ff" => Some(ApplicationKind::Firefox),
            "thunderbird" | "tb" => Some(ApplicationKind::Thunderbird),
            _ => None,
        }
    }
}

impl fmt::Display for ApplicationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplicationKind::Firefox => write!(f, "firefox"),
            ApplicationKind::Thunderbird => write!(f, "thunderbird"),
        }
    }
}

/// A profile directory found on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileDescriptor {
    /// Application that owns the profile
    pub application_kind: ApplicationKind,

    /// The profile directory itself
    pub root_path: PathBuf,

    /// Name from profiles.ini, or the directory name
    pub display_name: String,

    /// True if this is the profile the application opens by default
    pub is_default: bool,
}

impl ProfileDescriptor {
    /// Describe an arbitrary directory as a profile of `kind`.
    ///
    /// Used for restore targets that do not exist yet.
    pub fn new<P: AsRef<Path>>(kind: ApplicationKind, root_path: P) -> Self {
        let root_path = root_path.as_ref().to_path_buf();
        let display_name = root_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| root_path.display().to_string());
        ProfileDescriptor {
            application_kind: kind,
            root_path,
            display_name,
            is_default: false,
        }
    }
}

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferMode {
    /// Copy a live profile out to a backup location; the profile is never modified
    Backup,
    /// Replace (or create) a profile from a backup copy
    Restore,
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferMode::Backup => write!(f, "Backup"),
            TransferMode::Restore => write!(f, "Restore"),
        }
    }
}

/// On-disk shape of a backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupFormat {
    /// A plain copy of the profile directory
    #[default]
    Directory,
    /// A zip archive holding one top-level directory per profile
    Zip,
}

impl fmt::Display for BackupFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupFormat::Directory => write!(f, "directory"),
            BackupFormat::Zip => write!(f, "zip"),
        }
    }
}

/// One backup or restore operation, owned by a coordinator while it runs.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub mode: TransferMode,
    pub format: BackupFormat,
    pub source_path: PathBuf,
    pub destination_path: PathBuf,
    pub profile: ProfileDescriptor,

    /// Further profiles packed into the same archive (ignored unless this is a zip backup)
    pub additional_profiles: Vec<ProfileDescriptor>,
}

impl TransferRequest {
    /// Back up `profile` into the directory `destination`.
    pub fn backup<P: AsRef<Path>>(profile: ProfileDescriptor, destination: P) -> Self {
        TransferRequest {
            mode: TransferMode::Backup,
            format: BackupFormat::Directory,
            source_path: profile.root_path.clone(),
            destination_path: destination.as_ref().to_path_buf(),
            profile,
            additional_profiles: Vec::new(),
        }
    }

    /// Back up `profile` into a new zip file at `archive`.
    ///
    /// More profiles can be added with [`TransferRequest::with_profile`].
    pub fn backup_archive<P: AsRef<Path>>(profile: ProfileDescriptor, archive: P) -> Self {
        TransferRequest {
            format: BackupFormat::Zip,
            ..Self::backup(profile, archive)
        }
    }

    /// Add another profile to a zip backup.
    pub fn with_profile(mut self, profile: ProfileDescriptor) -> Self {
        self.additional_profiles.push(profile);
        self
    }

    /// Restore the backup directory at `source` over `profile`.
    pub fn restore<P: AsRef<Path>>(source: P, profile: ProfileDescriptor) -> Self {
        TransferRequest {
            mode: TransferMode::Restore,
            format: BackupFormat::Directory,
            source_path: source.as_ref().to_path_buf(),
            destination_path: profile.root_path.clone(),
            profile,
            additional_profiles: Vec::new(),
        }
    }

    /// Restore the first profile inside the zip file `archive` over `profile`.
    pub fn restore_archive<P: AsRef<Path>>(archive: P, profile: ProfileDescriptor) -> Self {
        TransferRequest {
            format: BackupFormat::Zip,
            ..Self::restore(archive, profile)
        }
    }

    /// Profiles beyond the first that take part in this request.
    fn extra_profiles(&self) -> &[ProfileDescriptor] {
        match (self.mode, self.format) {
            (TransferMode::Backup, BackupFormat::Zip) => &self.additional_profiles,
            _ => &[],
        }
    }

    /// Every tree or file read by this request.
    pub fn sources(&self) -> Vec<&Path> {
        let mut sources = vec![self.source_path.as_path()];
        sources.extend(self.extra_profiles().iter().map(|p| p.root_path.as_path()));
        sources
    }

    /// Applications whose profiles are involved, without repeats.
    pub fn application_kinds(&self) -> Vec<ApplicationKind> {
        let mut kinds = vec![self.profile.application_kind];
        for profile in self.extra_profiles() {
            if !kinds.contains(&profile.application_kind) {
                kinds.push(profile.application_kind);
            }
        }
        kinds
    }
}

/// Coarse step of a running transfer, reported inside progress snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferPhase {
    Preparing,
    Copying,
    Verifying,
    Finalizing,
}

impl fmt::Display for TransferPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferPhase::Preparing => write!(f, "Preparing"),
            TransferPhase::Copying => write!(f, "Copying"),
            TransferPhase::Verifying => write!(f, "Verifying"),
            TransferPhase::Finalizing => write!(f, "Finalizing"),
        }
    }
}

/// A read-only progress snapshot.
///
/// Snapshots are built whole and replaced whole; observers never see a
/// half-updated value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferProgress {
    /// Bytes written so far across all files
    pub bytes_copied: u64,

    /// Sum of all regular file sizes in the source tree
    pub total_bytes: u64,

    /// Regular files fully copied so far
    pub files_copied: usize,

    /// Regular files in the source tree
    pub total_files: usize,

    /// Path of the file being processed, relative to the tree root
    pub current_file_name: String,

    pub phase: TransferPhase,
}

impl TransferProgress {
    pub fn new(phase: TransferPhase) -> Self {
        TransferProgress {
            bytes_copied: 0,
            total_bytes: 0,
            files_copied: 0,
            total_files: 0,
            current_file_name: String::new(),
            phase,
        }
    }

    /// Completion in percent (0..=100). Empty trees count as complete.
    pub fn percent(&self) -> u32 {
        if self.total_bytes == 0 {
            return if self.files_copied >= self.total_files { 100 } else { 0 };
        }
        ((self.bytes_copied as f64 / self.total_bytes as f64) * 100.0).min(100.0) as u32
    }
}

/// How an operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferOutcome {
    Success,
    Cancelled,
    Failed,
    /// The restore swap failed and the original profile was put back
    RolledBack,
}

impl fmt::Display for TransferOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferOutcome::Success => write!(f, "Success"),
            TransferOutcome::Cancelled => write!(f, "Cancelled"),
            TransferOutcome::Failed => write!(f, "Failed"),
            TransferOutcome::RolledBack => write!(f, "RolledBack"),
        }
    }
}

/// Terminal value of one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferResult {
    pub outcome: TransferOutcome,

    /// `"<Code>: <message>"` for every non-success outcome
    pub error_detail: Option<String>,

    pub bytes_copied: u64,
    pub files_copied: usize,
}

impl TransferResult {
    pub fn success(bytes_copied: u64, files_copied: usize) -> Self {
        TransferResult {
            outcome: TransferOutcome::Success,
            error_detail: None,
            bytes_copied,
            files_copied,
        }
    }

    /// Build a result for a failed operation, classifying cancellation separately.
    pub fn from_error(err: &crate::error::EngineError, bytes_copied: u64, files_copied: usize) -> Self {
        let outcome = if err.is_cancelled() {
            TransferOutcome::Cancelled
        } else {
            TransferOutcome::Failed
        };
        TransferResult {
            outcome,
            error_detail: Some(format!("{}: {}", err.code(), err)),
            bytes_copied,
            files_copied,
        }
    }

    /// Build a result for a restore whose swap was undone.
    pub fn rolled_back(err: &crate::error::EngineError, bytes_copied: u64, files_copied: usize) -> Self {
        TransferResult {
            outcome: TransferOutcome::RolledBack,
            error_detail: Some(format!("{}: {}", err.code(), err)),
            bytes_copied,
            files_copied,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == TransferOutcome::Success
    }
}

/// Lifecycle of a coordinator.
///
/// `Idle -> Preparing -> Copying -> {Completed | RolledBack | Failed}`.
/// Cancellation ends in `Failed` with a `Cancelled` outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CoordinatorState {
    Idle,
    Preparing,
    Copying,
    Completed,
    RolledBack,
    Failed,
}

impl CoordinatorState {
    /// Returns true if this state is terminal (no further changes expected).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CoordinatorState::Completed | CoordinatorState::RolledBack | CoordinatorState::Failed
        )
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_application_kind_parse() {
        assert_eq!(ApplicationKind::parse("Firefox"), Some(ApplicationKind::Firefox));
        assert_eq!(ApplicationKind::parse("tb"), Some(ApplicationKind::Thunderbird));
        assert_eq!(ApplicationKind::parse("chrome"), None);
    }

    #[test]
    fn test_descriptor_name_from_directory() {
        let profile = ProfileDescriptor::new(ApplicationKind::Firefox, "/tmp/abcd.default-release");
        assert_eq!(profile.display_name, "abcd.default-release");
        assert!(!profile.is_default);
    }

    #[test]
    fn test_request_constructors_pick_direction() {
        let profile = ProfileDescriptor::new(ApplicationKind::Firefox, "/p/main");

        let backup = TransferRequest::backup(profile.clone(), "/b/main");
        assert_eq!(backup.source_path, PathBuf::from("/p/main"));
        assert_eq!(backup.destination_path, PathBuf::from("/b/main"));

        let restore = TransferRequest::restore("/b/main", profile);
        assert_eq!(restore.source_path, PathBuf::from("/b/main"));
        assert_eq!(restore.destination_path, PathBuf::from("/p/main"));
    }

    #[test]
    fn test_archive_request_collects_profiles() {
        let main = ProfileDescriptor::new(ApplicationKind::Firefox, "/p/main");
        let mail = ProfileDescriptor::new(ApplicationKind::Thunderbird, "/t/mail");
        let work = ProfileDescriptor::new(ApplicationKind::Firefox, "/p/work");

        let request = TransferRequest::backup_archive(main, "/b/all.zip")
            .with_profile(mail)
            .with_profile(work);

        assert_eq!(request.format, BackupFormat::Zip);
        assert_eq!(request.mode, TransferMode::Backup);
        assert_eq!(
            request.sources(),
            vec![Path::new("/p/main"), Path::new("/t/mail"), Path::new("/p/work")]
        );
        assert_eq!(
            request.application_kinds(),
            vec![ApplicationKind::Firefox, ApplicationKind::Thunderbird]
        );

        let single = ProfileDescriptor::new(ApplicationKind::Firefox, "/p/a");
        let plain = TransferRequest::backup(single, "/b/a")
            .with_profile(ProfileDescriptor::new(ApplicationKind::Thunderbird, "/t/b"));
        assert_eq!(plain.sources(), vec![Path::new("/p/a")]);
        assert_eq!(plain.application_kinds(), vec![ApplicationKind::Firefox]);
    }

    #[test]
    fn test_progress_percent() {
        let mut progress = TransferProgress::new(TransferPhase::Copying);
        assert_eq!(progress.percent(), 100);

        progress.total_bytes = 200;
        progress.total_files = 2;
        progress.bytes_copied = 50;
        assert_eq!(progress.percent(), 25);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!CoordinatorState::Idle.is_terminal());
        assert!(!CoordinatorState::Copying.is_terminal());
        assert!(CoordinatorState::RolledBack.is_terminal());
        assert!(CoordinatorState::Failed.is_terminal());
    }
}
