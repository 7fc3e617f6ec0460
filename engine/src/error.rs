//! Error types for the transfer engine.
//!
//! Each component has its own error enum. `EngineError` wraps all of them and
//! is what the coordinator turns into a `TransferResult`. None of these errors
//! is fatal to the hosting process.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::model::ApplicationKind;

/// Errors from stopping a running application.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The application did not exit (or the user declined to close it)
    #[error("{kind} is still running")]
    StillRunning { kind: ApplicationKind },
}

/// Errors from validating profile and backup paths.
#[derive(Debug, Error)]
pub enum PathError {
    #[error("path not found: {}", .path.display())]
    NotFound { path: PathBuf },

    #[error("not a directory: {}", .path.display())]
    NotADirectory { path: PathBuf },

    #[error("not a regular file: {}", .path.display())]
    NotAFile { path: PathBuf },

    #[error("path is not readable: {}", .path.display())]
    AccessDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Source and destination are the same tree or nested inside each other
    #[error("source {} and destination {} overlap", .source_path.display(), .destination.display())]
    Overlapping {
        source_path: PathBuf,
        destination: PathBuf,
    },

    #[error("destination is not empty: {}", .path.display())]
    DestinationNotEmpty { path: PathBuf },

    /// An archive would overwrite an existing file
    #[error("destination already exists: {}", .path.display())]
    AlreadyExists { path: PathBuf },
}

/// Errors from copying a directory tree.
#[derive(Debug, Error)]
pub enum CopyError {
    #[error("copy cancelled")]
    Cancelled,

    /// Any read, write or create failure; partial output is left in place
    #[error("I/O failure at {}: {source}", .path.display())]
    IoFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A zip file that cannot be read or does not hold a profile
    #[error("invalid archive {}: {reason}", .path.display())]
    InvalidArchive { path: PathBuf, reason: String },
}

impl CopyError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        CopyError::IoFailure {
            path: path.into(),
            source,
        }
    }
}

/// Any error that ends an operation.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    Copy(#[from] CopyError),

    /// The copy does not match its source
    #[error("verification failed for {}: {reason}", .path.display())]
    VerificationFailed { path: PathBuf, reason: String },

    /// Moving directories into place failed
    #[error("could not move {} to {}: {source}", .from.display(), .to.display())]
    SwapFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The restore swap failed and the original profile could not be moved back
    #[error(
        "could not move the restored profile into place and could not put the original back; \
         original profile kept at {}, restored copy at {}",
        .original.display(),
        .staged.display()
    )]
    RollbackFailed {
        original: PathBuf,
        staged: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A coordinator was asked to run outside its Idle state
    #[error("coordinator is {state}, expected Idle")]
    InvalidState {
        state: crate::model::CoordinatorState,
    },
}

impl EngineError {
    /// Short stable name of the error, used as the prefix of `TransferResult::error_detail`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Process(ProcessError::StillRunning { .. }) => "StillRunning",
            Self::Path(PathError::NotFound { .. }) => "NotFound",
            Self::Path(PathError::NotADirectory { .. }) => "NotADirectory",
            Self::Path(PathError::NotAFile { .. }) => "NotAFile",
            Self::Path(PathError::AccessDenied { .. }) => "AccessDenied",
            Self::Path(PathError::Overlapping { .. }) => "Overlapping",
            Self::Path(PathError::DestinationNotEmpty { .. }) => "DestinationNotEmpty",
            Self::Path(PathError::AlreadyExists { .. }) => "AlreadyExists",
            Self::Copy(CopyError::Cancelled) => "Cancelled",
            Self::Copy(CopyError::IoFailure { .. }) => "IoFailure",
            Self::Copy(CopyError::InvalidArchive { .. }) => "InvalidArchive",
            Self::VerificationFailed { .. } => "VerificationFailed",
            Self::SwapFailed { .. } => "SwapFailed",
            Self::RollbackFailed { .. } => "RollbackFailed",
            Self::InvalidState { .. } => "InvalidState",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Copy(CopyError::Cancelled))
    }

    /// Extract the OS error code from this error, if available.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Path(PathError::AccessDenied { source, .. })
            | Self::Copy(CopyError::IoFailure { source, .. })
            | Self::SwapFailed { source, .. }
            | Self::RollbackFailed { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}
