//! # MozMover Engine - Profile Backup Library
//!
//! A headless engine that backs up and restores Firefox and Thunderbird
//! profile directories. Designed as the foundation for multiple front ends
//! (CLI, GUI, automation).
//!
//! ## Overview
//!
//! The engine provides:
//! - Discovery of installed profiles from `profiles.ini` and the profile roots
//! - Closing a running Firefox/Thunderbird, only with the caller's consent
//! - Recursive copies that preserve timestamps and report progress
//! - Zip backups holding one or more profiles, and restores from them
//! - Restores staged next to the profile and swapped in by rename, with rollback
//! - Cooperative cancellation and optional checksum verification
//!
//! ## Basic Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use mozmover_engine::{
//!     ApplicationKind, BackupCoordinator, EngineConfig, Platform, ProfileLocator,
//!     TransferRequest, spawn_transfer,
//! };
//!
//! let platform = Arc::new(Platform::current());
//! let locator = ProfileLocator::new(platform.roots.clone());
//!
//! // Pick the default Firefox profile
//! let profiles = locator.list_profiles(ApplicationKind::Firefox);
//! let profile = profiles.into_iter().next().expect("no Firefox profile");
//!
//! // Back it up on a worker thread
//! let coordinator = BackupCoordinator::new(platform, EngineConfig::default());
//! let request = TransferRequest::backup(profile, "/backups/firefox");
//! let handle = spawn_transfer(coordinator, request, false);
//!
//! for event in handle.events() {
//!     println!("{:?}", event);
//! }
//! let result = handle.wait();
//! println!("{}: {:?}", result.outcome, result.error_detail);
//! ```
//!
//! ## Modules
//!
//! - **model**: Core data structures (requests, progress, results, states)
//! - **error**: Error types and handling
//! - **config**: Engine tunables
//! - **platform**: OS process table and filesystem capabilities
//! - **process_guard**: Detecting and closing running applications
//! - **profiles**: Profile discovery and path validation
//! - **fs_ops**: Tree enumeration and the copy engine
//! - **archive**: Writing, reading and verifying zip backups
//! - **checksums**: Checksum computation and copy verification
//! - **progress**: Observer trait, cancellation and progress snapshots
//! - **coordinator**: Backup/restore orchestration
//! - **worker**: Running a coordinator on a background thread

pub mod model;
pub mod error;
pub mod config;
pub mod platform;
pub mod process_guard;
pub mod profiles;
pub mod fs_ops;
pub mod archive;
pub mod checksums;
pub mod progress;
pub mod coordinator;
pub mod worker;

// Re-export main types and functions
pub use model::{
    ApplicationKind, BackupFormat, CoordinatorState, ProfileDescriptor, TransferMode,
    TransferOutcome, TransferPhase, TransferProgress, TransferRequest, TransferResult,
};
pub use error::{CopyError, EngineError, PathError, ProcessError};
pub use config::EngineConfig;
pub use platform::{Filesystem, Platform, ProcessEntry, ProcessTable};
pub use process_guard::ProcessGuard;
pub use profiles::{validate_file, ProfileLocator, ProfileRoots};
pub use fs_ops::CopyEngine;
pub use archive::{archived_profiles, verify_archive};
pub use checksums::{compute_file_checksum, ChecksumAlgorithm, ChecksumValue};
pub use progress::{CancelToken, ProgressCell, TransferObserver};
pub use coordinator::BackupCoordinator;
pub use worker::{spawn_transfer, TransferEvent, TransferHandle};
